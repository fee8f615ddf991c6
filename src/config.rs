//! Startup configuration, loaded once and shared read-only thereafter.

use anyhow::Context;

/// All tunables the service needs at startup. Constructed once via
/// [`Config::from_env`] and handed to every component as an `Arc<Config>`.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub bind_addr: String,

    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_max_tokens: u32,
    pub llm_temperature: f64,

    pub price_cache_ttl_secs: u64,
    pub analysis_cache_ttl_secs: u64,
    pub session_cache_ttl_secs: u64,
    pub cache_janitor_interval_secs: u64,

    pub bot_signature: String,

    pub admin_username: String,
    pub admin_password: String,
    pub admin_token_secret: String,
    pub admin_token_ttl_secs: i64,

    pub master_user_id: Option<i64>,

    pub gold_api_ninjas_key: Option<String>,
    pub metals_api_key: Option<String>,
    pub forex_api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "gold_nightmare.db".to_string());

        let bind_addr =
            std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8001".to_string());

        let llm_api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var("CLAUDE_API_KEY"))
            .context("LLM_API_KEY (or CLAUDE_API_KEY) missing")?;

        let llm_model = std::env::var("LLM_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());

        let llm_max_tokens = std::env::var("LLM_MAX_TOKENS")
            .unwrap_or_else(|_| "4000".to_string())
            .parse()
            .unwrap_or(4000);

        let llm_temperature = std::env::var("LLM_TEMPERATURE")
            .unwrap_or_else(|_| "0.7".to_string())
            .parse()
            .unwrap_or(0.7);

        let price_cache_ttl_secs = std::env::var("PRICE_CACHE_TTL")
            .unwrap_or_else(|_| "900".to_string())
            .parse()
            .unwrap_or(900);

        let analysis_cache_ttl_secs = std::env::var("ANALYSIS_CACHE_TTL")
            .unwrap_or_else(|_| "1800".to_string())
            .parse()
            .unwrap_or(1800);

        let session_cache_ttl_secs = std::env::var("SESSION_CACHE_TTL")
            .unwrap_or_else(|_| "86400".to_string())
            .parse()
            .unwrap_or(86400);

        let cache_janitor_interval_secs = std::env::var("CACHE_JANITOR_INTERVAL")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let bot_signature = std::env::var("BOT_SIGNATURE")
            .unwrap_or_else(|_| "Gold Nightmare \u{2013} \u{0639}\u{062f}\u{064a}".to_string());

        let admin_username =
            std::env::var("ADMIN_USERNAME").unwrap_or_else(|_| "admin".to_string());
        let admin_password =
            std::env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "GOLD_NIGHTMARE_205".to_string());
        let admin_token_secret = std::env::var("ADMIN_TOKEN_SECRET")
            .unwrap_or_else(|_| "dev-admin-secret-change-in-production".to_string());
        let admin_token_ttl_secs = std::env::var("ADMIN_TOKEN_TTL_SECS")
            .unwrap_or_else(|_| "43200".to_string())
            .parse()
            .unwrap_or(43200);

        let master_user_id = std::env::var("MASTER_USER_ID")
            .ok()
            .and_then(|s| s.parse().ok());

        let gold_api_ninjas_key = std::env::var("GOLD_API_TOKEN").ok();
        let metals_api_key = std::env::var("METALS_API_KEY").ok();
        let forex_api_key = std::env::var("FOREX_API_KEY").ok();

        Ok(Self {
            database_path,
            bind_addr,
            llm_api_key,
            llm_model,
            llm_max_tokens,
            llm_temperature,
            price_cache_ttl_secs,
            analysis_cache_ttl_secs,
            session_cache_ttl_secs,
            cache_janitor_interval_secs,
            bot_signature,
            admin_username,
            admin_password,
            admin_token_secret,
            admin_token_ttl_secs,
            master_user_id,
            gold_api_ninjas_key,
            metals_api_key,
            forex_api_key,
        })
    }
}
