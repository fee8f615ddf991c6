//! Gold Nightmare analysis backend entry point: loads configuration, opens
//! the store, wires the price aggregators, and serves the HTTP API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gold_nightmare_backend::cache::Cache;
use gold_nightmare_backend::clock::SystemClock;
use gold_nightmare_backend::http::{self, AppState, FOREX_PAIRS};
use gold_nightmare_backend::llm::LlmClient;
use gold_nightmare_backend::price::{
    parse_inverted_rate, parse_spot_price, parse_vendor_quote_list, PriceAggregator, Provider,
};
use gold_nightmare_backend::prompt::PromptComposer;
use gold_nightmare_backend::store::Store;
use gold_nightmare_backend::{audit, middleware as gn_middleware, Config};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gold_nightmare_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Built-in gold feeds, mirroring the source's provider priority list: a
/// dedicated gold API first, a metals-rate API second, a generic FX-style
/// inverted-rate fallback last.
fn gold_providers(config: &Config) -> Vec<Provider> {
    let mut providers = Vec::new();

    if let Some(key) = &config.gold_api_ninjas_key {
        providers.push(Provider {
            name: "goldapi-ninjas".to_string(),
            endpoint: "https://api.api-ninjas.com/v1/commodityprice?name=gold".to_string(),
            headers: vec![("X-Api-Key".to_string(), key.clone())],
            priority: 0,
            parse: parse_spot_price,
        });
    }
    if let Some(key) = &config.metals_api_key {
        providers.push(Provider {
            name: "metals-api".to_string(),
            endpoint: format!("https://metals-api.com/api/latest?access_key={key}&base=USD&symbols=XAU"),
            headers: vec![],
            priority: 1,
            parse: parse_inverted_rate,
        });
    }
    providers.push(Provider {
        name: "goldprice-org".to_string(),
        endpoint: "https://data-asg.goldprice.org/dbXRates/USD".to_string(),
        headers: vec![],
        priority: 2,
        parse: parse_spot_price,
    });

    providers
}

/// One feed per forex pair, reusing the vendor-quote-list shape (the same
/// quote endpoint shape a generic stock/FX ticker API returns) with the
/// pair's Yahoo-style symbol.
fn forex_provider(pair_code: &str, config: &Config) -> Vec<Provider> {
    let symbol = format!("{pair_code}=X");
    let mut providers = vec![Provider {
        name: "yahoo-quote".to_string(),
        endpoint: format!(
            "https://query1.finance.yahoo.com/v7/finance/quote?symbols={symbol}"
        ),
        headers: vec![],
        priority: 0,
        parse: parse_vendor_quote_list,
    }];

    if let Some(key) = &config.forex_api_key {
        providers.push(Provider {
            name: "exchangerate-host".to_string(),
            endpoint: format!("https://api.exchangerate.host/latest?access_key={key}&source=USD"),
            headers: vec![],
            priority: 1,
            parse: parse_spot_price,
        });
    }

    providers
}

/// Approximate mid-market fallback used only when every upstream provider
/// fails and nothing usable remains in the cache.
fn forex_fallback_price(pair_code: &str) -> f64 {
    match pair_code {
        "EURUSD" => 1.08,
        "GBPUSD" => 1.27,
        "USDJPY" => 155.0,
        "AUDUSD" => 0.66,
        "USDCAD" => 1.36,
        "USDCHF" => 0.88,
        "NZDUSD" => 0.61,
        _ => 1.0,
    }
}

const FOREX_VALID_RANGE: (f64, f64) = (0.0001, 1000.0);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = Arc::new(Config::from_env().context("loading configuration")?);
    info!("🏆 Gold Nightmare backend starting");

    let store = Arc::new(Store::new(&config.database_path).context("opening store")?);
    let cache = Cache::new();
    gold_nightmare_backend::cache::spawn_janitor(
        cache.clone(),
        Duration::from_secs(config.cache_janitor_interval_secs),
    );

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("building HTTP client")?;

    let gold = Arc::new(
        PriceAggregator::new_gold(
            http_client.clone(),
            cache.clone(),
            gold_nightmare_backend::cache::keys::gold_price(),
            Duration::from_secs(config.price_cache_ttl_secs),
            gold_providers(&config),
        )
        .context("building gold price aggregator")?,
    );

    let mut forex = HashMap::new();
    for (code, _name_ar) in FOREX_PAIRS {
        let aggregator = PriceAggregator::new(
            http_client.clone(),
            cache.clone(),
            gold_nightmare_backend::cache::keys::forex_price(code),
            Duration::from_secs(config.price_cache_ttl_secs),
            forex_provider(code, &config),
            FOREX_VALID_RANGE,
            forex_fallback_price(code),
        )
        .with_context(|| format!("building forex aggregator for {code}"))?;
        forex.insert(code.to_string(), Arc::new(aggregator));
    }

    let llm = Arc::new(LlmClient::new(http_client, config.llm_api_key.clone()));
    let composer = Arc::new(PromptComposer::new(config.bot_signature.clone()));
    let audit_handle = audit::spawn_recorder(store.clone());

    let state = AppState {
        store,
        cache,
        clock: Arc::new(SystemClock),
        composer,
        llm,
        audit: audit_handle,
        config: config.clone(),
        gold,
        forex: Arc::new(forex),
    };

    let app = http::build_router(state)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(gn_middleware::request_logging));

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!("🎯 API server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
