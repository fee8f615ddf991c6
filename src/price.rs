//! Multi-source price feed with priority-ordered fallback. Grounded in the
//! source's `gold_price.py` (aggregating candidate feeds with a fallback
//! placeholder) and structurally in the teacher's provider-wrapper shape
//! (`scrapers/chainlink_feed.rs`: a struct over `reqwest::Client` plus
//! cache, constructed via `from_env`, with an async `fetch` + validation
//! step).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::Cache;

pub const GOLD_PRICE_MIN: f64 = 1000.0;
pub const GOLD_PRICE_MAX: f64 = 5000.0;
pub const OUNCE_TO_GRAM: f64 = 31.1035;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price: f64,
    pub change: f64,
    pub change_pct: f64,
    pub ask: f64,
    pub bid: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub source: String,
    pub observed_at: DateTime<Utc>,
}

impl PriceQuote {
    /// Range validation is parameterised per [`PriceAggregator`] instance:
    /// `[1000, 5000]` for gold, a wider band for forex pairs whose spot
    /// prices sit well outside the gold range.
    fn validate(&self, range: (f64, f64)) -> bool {
        self.price.is_finite()
            && self.price >= range.0
            && self.price <= range.1
            && self.change.is_finite()
            && self.change_pct.is_finite()
    }

    /// Converts the per-ounce spot price into per-gram prices at the common
    /// karat purities, a supplemental feature the public endpoint exposes
    /// alongside the raw quote.
    pub fn gram_prices(&self) -> GramPrices {
        let per_gram_24k = self.price / OUNCE_TO_GRAM;
        GramPrices {
            k24: per_gram_24k,
            k22: per_gram_24k * 0.917,
            k21: per_gram_24k * 0.875,
            k18: per_gram_24k * 0.750,
            k14: per_gram_24k * 0.583,
            k10: per_gram_24k * 0.417,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GramPrices {
    #[serde(rename = "24k")]
    pub k24: f64,
    #[serde(rename = "22k")]
    pub k22: f64,
    #[serde(rename = "21k")]
    pub k21: f64,
    #[serde(rename = "18k")]
    pub k18: f64,
    #[serde(rename = "14k")]
    pub k14: f64,
    #[serde(rename = "10k")]
    pub k10: f64,
}

#[derive(Debug)]
enum ProviderError {
    InvalidCredentials(String),
    RateLimited(String),
    Forbidden(String),
    NotFound(String),
    Transport(String, u16),
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::InvalidCredentials(p) => write!(f, "{p}: invalid credentials"),
            ProviderError::RateLimited(p) => write!(f, "{p}: rate limited"),
            ProviderError::Forbidden(p) => write!(f, "{p}: forbidden"),
            ProviderError::NotFound(p) => write!(f, "{p}: not found"),
            ProviderError::Transport(p, code) => write!(f, "{p}: transport error ({code})"),
            ProviderError::Parse(p) => write!(f, "{p}: could not parse response"),
            ProviderError::Invalid(p) => write!(f, "{p}: quote failed validation"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// One upstream feed. `parse` turns a decoded JSON body into a quote,
/// accepting the three representative shapes the spot-price ecosystem
/// actually returns (plain spot object, inverted USD rate, vendor
/// quote-list).
pub struct Provider {
    pub name: String,
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub priority: u32,
    pub parse: fn(&Value) -> Option<RawQuote>,
}

/// Provider output before range validation and derived-field fill-in.
#[derive(Debug, Clone)]
pub struct RawQuote {
    pub price: f64,
    pub change: Option<f64>,
    pub change_pct: Option<f64>,
}

pub fn parse_spot_price(body: &Value) -> Option<RawQuote> {
    let price = body.get("price")?.as_f64()?;
    Some(RawQuote {
        price,
        change: body.get("change").and_then(Value::as_f64),
        change_pct: body.get("change_pct").and_then(Value::as_f64),
    })
}

pub fn parse_inverted_rate(body: &Value) -> Option<RawQuote> {
    if body.get("success").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    let x = body.get("rates")?.get("XAU")?.as_f64()?;
    if x <= 0.0 {
        return None;
    }
    Some(RawQuote {
        price: 1.0 / x,
        change: None,
        change_pct: None,
    })
}

pub fn parse_vendor_quote_list(body: &Value) -> Option<RawQuote> {
    let result = body
        .get("quoteResponse")?
        .get("result")?
        .as_array()?
        .first()?;
    let price = result.get("regularMarketPrice")?.as_f64()?;
    let prev_close = result.get("regularMarketPreviousClose").and_then(Value::as_f64);
    let change = prev_close.map(|p| price - p);
    let change_pct = match (change, prev_close) {
        (Some(c), Some(p)) if p != 0.0 => Some(c / p * 100.0),
        _ => None,
    };
    Some(RawQuote {
        price,
        change,
        change_pct,
    })
}

fn finish_quote(raw: RawQuote, source: &str) -> PriceQuote {
    let change = raw.change.unwrap_or(0.0);
    let change_pct = raw.change_pct.unwrap_or(0.0);
    PriceQuote {
        price: raw.price,
        change,
        change_pct,
        ask: raw.price + 2.0,
        bid: raw.price - 2.0,
        high_24h: raw.price + 15.0,
        low_24h: raw.price - 15.0,
        source: source.to_string(),
        observed_at: Utc::now(),
    }
}

/// Priority-ordered fetch with an in-memory cache. One instance serves one
/// logical symbol (gold, or a single forex pair).
pub struct PriceAggregator {
    http: Client,
    cache: Arc<Cache>,
    cache_key: String,
    ttl: Duration,
    providers: Vec<Provider>,
    valid_range: (f64, f64),
    fallback: PriceQuote,
}

impl PriceAggregator {
    /// `valid_range` and `fallback_price` let one aggregator implementation
    /// serve both the gold symbol (`[1000, 5000]`) and a forex pair (a much
    /// narrower band around its typical spot rate).
    pub fn new(
        http: Client,
        cache: Arc<Cache>,
        cache_key: impl Into<String>,
        ttl: Duration,
        mut providers: Vec<Provider>,
        valid_range: (f64, f64),
        fallback_price: f64,
    ) -> Result<Self> {
        if providers.is_empty() {
            anyhow::bail!("PriceAggregator requires at least one provider");
        }
        providers.sort_by_key(|p| p.priority);
        let fallback = finish_quote(
            RawQuote {
                price: fallback_price,
                change: Some(0.0),
                change_pct: Some(0.0),
            },
            "no-fresh-data",
        );
        Ok(Self {
            http,
            cache,
            cache_key: cache_key.into(),
            ttl,
            providers,
            valid_range,
            fallback,
        })
    }

    /// Convenience constructor for the gold symbol's canonical `[1000,
    /// 5000]` range and `$2000` placeholder, matching the source's default.
    pub fn new_gold(
        http: Client,
        cache: Arc<Cache>,
        cache_key: impl Into<String>,
        ttl: Duration,
        providers: Vec<Provider>,
    ) -> Result<Self> {
        Self::new(
            http,
            cache,
            cache_key,
            ttl,
            providers,
            (GOLD_PRICE_MIN, GOLD_PRICE_MAX),
            2000.0,
        )
    }

    pub async fn current(&self, use_cache: bool) -> PriceQuote {
        if use_cache {
            if let Some(cached) = self.cache.get::<PriceQuote>(&self.cache_key) {
                return cached;
            }
        }

        for provider in &self.providers {
            match self.fetch_one(provider).await {
                Ok(quote) => {
                    self.cache.set(&self.cache_key, &quote, self.ttl);
                    return quote;
                }
                Err(err) => {
                    debug!(provider = %provider.name, error = %err, "provider failed, trying next");
                }
            }
        }

        warn!("all price providers exhausted, falling back to stale cache or placeholder");
        if let Some(mut stale) = self.cache.get::<PriceQuote>(&self.cache_key) {
            stale.source = format!("stale-cache:{}", stale.source);
            return stale;
        }
        self.fallback.clone()
    }

    async fn fetch_one(&self, provider: &Provider) -> Result<PriceQuote, ProviderError> {
        let mut req = self.http.get(&provider.endpoint);
        for (k, v) in &provider.headers {
            req = req.header(k, v);
        }
        let resp = req
            .send()
            .await
            .map_err(|_| ProviderError::Transport(provider.name.clone(), 0))?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => {
                return Err(ProviderError::InvalidCredentials(provider.name.clone()))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(ProviderError::RateLimited(provider.name.clone()))
            }
            StatusCode::FORBIDDEN => return Err(ProviderError::Forbidden(provider.name.clone())),
            StatusCode::NOT_FOUND => return Err(ProviderError::NotFound(provider.name.clone())),
            other => {
                return Err(ProviderError::Transport(
                    provider.name.clone(),
                    other.as_u16(),
                ))
            }
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|_| ProviderError::Parse(provider.name.clone()))?;

        let raw = (provider.parse)(&body).ok_or_else(|| ProviderError::Parse(provider.name.clone()))?;
        let quote = finish_quote(raw, &provider.name);

        if !quote.validate(self.valid_range) {
            return Err(ProviderError::Invalid(provider.name.clone()));
        }

        Ok(quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_spot_price_fills_neutral_change_when_absent() {
        let body = json!({"price": 3300.0});
        let raw = parse_spot_price(&body).unwrap();
        assert_eq!(raw.price, 3300.0);
        assert!(raw.change.is_none());
    }

    #[test]
    fn parse_inverted_rate_computes_reciprocal() {
        let body = json!({"success": true, "rates": {"XAU": 0.0003}});
        let raw = parse_inverted_rate(&body).unwrap();
        assert!((raw.price - 1.0 / 0.0003).abs() < 1e-6);
    }

    #[test]
    fn parse_inverted_rate_rejects_unsuccessful_response() {
        let body = json!({"success": false});
        assert!(parse_inverted_rate(&body).is_none());
    }

    #[test]
    fn parse_vendor_quote_list_derives_change_from_previous_close() {
        let body = json!({
            "quoteResponse": {
                "result": [{"regularMarketPrice": 3310.0, "regularMarketPreviousClose": 3300.0}]
            }
        });
        let raw = parse_vendor_quote_list(&body).unwrap();
        assert_eq!(raw.price, 3310.0);
        assert_eq!(raw.change, Some(10.0));
    }

    #[test]
    fn finish_quote_derives_ask_bid_high_low_heuristics() {
        let raw = RawQuote {
            price: 3300.0,
            change: None,
            change_pct: None,
        };
        let q = finish_quote(raw, "test");
        assert_eq!(q.ask, 3302.0);
        assert_eq!(q.bid, 3298.0);
        assert_eq!(q.high_24h, 3315.0);
        assert_eq!(q.low_24h, 3285.0);
    }

    #[test]
    fn quote_out_of_range_fails_validation() {
        let q = finish_quote(
            RawQuote {
                price: 500.0,
                change: None,
                change_pct: None,
            },
            "test",
        );
        assert!(!q.validate((GOLD_PRICE_MIN, GOLD_PRICE_MAX)));
    }

    #[test]
    fn forex_range_accepts_prices_outside_gold_band() {
        let q = finish_quote(
            RawQuote {
                price: 1.08,
                change: None,
                change_pct: None,
            },
            "test",
        );
        assert!(q.validate((0.0001, 1000.0)));
        assert!(!q.validate((GOLD_PRICE_MIN, GOLD_PRICE_MAX)));
    }

    #[tokio::test]
    async fn current_falls_back_to_placeholder_when_no_providers_succeed() {
        let provider = Provider {
            name: "dead".to_string(),
            endpoint: "http://127.0.0.1:1/nope".to_string(),
            headers: vec![],
            priority: 0,
            parse: parse_spot_price,
        };
        let agg = PriceAggregator::new_gold(
            Client::new(),
            Cache::new(),
            "gold_price:test",
            Duration::from_secs(900),
            vec![provider],
        )
        .unwrap();

        let quote = agg.current(false).await;
        assert_eq!(quote.source, "no-fresh-data");
    }

    #[tokio::test]
    async fn current_prefers_second_provider_when_first_is_rate_limited() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/first"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/second"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"price": 3310.06})))
            .mount(&server)
            .await;

        let providers = vec![
            Provider {
                name: "first".to_string(),
                endpoint: format!("{}/first", server.uri()),
                headers: vec![],
                priority: 0,
                parse: parse_spot_price,
            },
            Provider {
                name: "second".to_string(),
                endpoint: format!("{}/second", server.uri()),
                headers: vec![],
                priority: 1,
                parse: parse_spot_price,
            },
        ];
        let agg = PriceAggregator::new_gold(
            Client::new(),
            Cache::new(),
            "gold_price:test2",
            Duration::from_secs(900),
            providers,
        )
        .unwrap();

        let quote = agg.current(false).await;
        assert_eq!(quote.price, 3310.06);
        assert_eq!(quote.source, "second");
    }

    #[test]
    fn gram_prices_applies_karat_purity_multipliers() {
        let q = finish_quote(
            RawQuote {
                price: 3110.35,
                change: None,
                change_pct: None,
            },
            "test",
        );
        let grams = q.gram_prices();
        assert!((grams.k24 - 100.0).abs() < 1e-6);
        assert!((grams.k22 - 91.7).abs() < 1e-6);
    }
}
