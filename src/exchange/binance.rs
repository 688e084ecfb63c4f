use super::{Exchange, MarketIndex, PRICE_KEYS};
use crate::error::ExchangeError;
use crate::filter_utils::matches_filters;
use crate::models::{Candle, MarketListing, Timeframe, match_price_keys, value_as_f64};
use async_trait::async_trait;
use chrono::DateTime;
use regex::Regex;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const BASE_URL: &str = "https://api.binance.com/api/v3";
const NAME: &str = "binance";
const MAX_LIMIT: usize = 1000;

#[derive(Deserialize, Debug)]
pub struct ExchangeInfo {
    #[serde(rename = "rateLimits", default)]
    pub rate_limits: Vec<RateLimit>,
    pub symbols: Vec<Map<String, Value>>,
}

#[derive(Deserialize, Debug)]
pub struct RateLimit {
    #[serde(rename = "rateLimitType")]
    pub limit_type: String,
    pub interval: String,
    pub limit: u32,
}

pub struct Binance {
    client: Client,
    base_url: String,
    market_filters: HashMap<String, String>,
    markets: OnceCell<MarketIndex>,
}

impl Binance {
    pub fn new(client: Client, market_filters: HashMap<String, String>) -> Self {
        Self {
            client,
            base_url: BASE_URL.to_string(),
            market_filters,
            markets: OnceCell::new(),
        }
    }

    async fn markets(&self) -> Result<&MarketIndex, ExchangeError> {
        self.markets.get_or_try_init(|| self.load_markets()).await
    }

    async fn load_markets(&self) -> Result<MarketIndex, ExchangeError> {
        let response = self
            .client
            .get(format!("{}/exchangeInfo", self.base_url))
            .send()
            .await?;
        let info: ExchangeInfo = check_status(response).await?.json().await?;

        if let Some(limit) = info
            .rate_limits
            .iter()
            .find(|r| r.limit_type == "REQUEST_WEIGHT" && r.interval == "MINUTE")
        {
            debug!("binance request weight limit: {}/min", limit.limit);
        }

        let index = MarketIndex::new(parse_markets(info.symbols, &self.market_filters));
        if index.is_empty() {
            warn!("No binance market passed the filters {:?}", self.market_filters);
        }
        info!("Loaded {} binance markets", index.len());
        Ok(index)
    }

    async fn fetch_prices(&self) -> Result<HashMap<String, Map<String, Value>>, ExchangeError> {
        let response = self
            .client
            .get(format!("{}/ticker/price", self.base_url))
            .send()
            .await?;
        let tickers: Vec<Map<String, Value>> = check_status(response).await?.json().await?;

        Ok(tickers
            .into_iter()
            .filter_map(|t| {
                let id = t.get("symbol")?.as_str()?.to_string();
                Some((id, t))
            })
            .collect())
    }
}

#[async_trait]
impl Exchange for Binance {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let id = self.markets().await?.require(NAME, symbol)?.to_string();
        let query = [
            ("symbol", id),
            ("interval", timeframe.as_str().to_string()),
            ("limit", limit.clamp(1, MAX_LIMIT).to_string()),
        ];

        debug!("GET binance klines {:?}", query);
        let response = self
            .client
            .get(format!("{}/klines", self.base_url))
            .query(&query)
            .send()
            .await?;
        let rows: Vec<Vec<Value>> = check_status(response).await?.json().await?;
        parse_klines(&rows)
    }

    async fn fetch_markets(&self) -> Result<Vec<MarketListing>, ExchangeError> {
        let mut listings = self.markets().await?.listings().to_vec();
        match self.fetch_prices().await {
            Ok(prices) => {
                for listing in &mut listings {
                    listing.price = prices
                        .get(&listing.id)
                        .and_then(|info| match_price_keys(info, PRICE_KEYS));
                }
            }
            Err(e) => warn!("binance prices unavailable: {}", e),
        }
        Ok(listings)
    }
}

/// Maps non-success responses onto [`ExchangeError`].
///
/// A 418/429 carrying a `-1003` ban waits out the ban before returning
/// `RateLimited`, so the next request starts from a clean slate.
async fn check_status(response: Response) -> Result<Response, ExchangeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();

    if status == StatusCode::IM_A_TEAPOT || status == StatusCode::TOO_MANY_REQUESTS {
        let wait_secs = ban_wait_secs(&text, now_millis()).unwrap_or(0.0);
        if wait_secs > 0.0 {
            warn!("binance ban in effect, sleeping {:.1}s", wait_secs);
            tokio::time::sleep(Duration::from_secs_f64(wait_secs)).await;
        }
        return Err(ExchangeError::RateLimited {
            exchange: NAME.to_string(),
            wait_secs,
        });
    }

    if status == StatusCode::BAD_REQUEST && text.contains("-1121") {
        return Err(ExchangeError::BadSymbol(text));
    }

    Err(ExchangeError::Network(format!("binance returned {}: {}", status, text)))
}

/// Seconds to wait for a `-1003 ... banned until <ms>` message, plus a 5s margin.
fn ban_wait_secs(text: &str, now_ms: u64) -> Option<f64> {
    if !text.contains("-1003") {
        return None;
    }
    let re = Regex::new(r"until\s+(\d+)").ok()?;
    let ban_until = re.captures(text)?.get(1)?.as_str().parse::<u64>().ok()?;
    if ban_until <= now_ms {
        return None;
    }
    Some((ban_until - now_ms) as f64 / 1000.0 + 5.0)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn parse_markets(
    symbols: Vec<Map<String, Value>>,
    filters: &HashMap<String, String>,
) -> Vec<MarketListing> {
    symbols
        .into_iter()
        .filter(|s| matches_filters(s, filters))
        .filter_map(|s| {
            let id = s.get("symbol")?.as_str()?.to_string();
            let base = s.get("baseAsset")?.as_str()?.to_string();
            let quote = s.get("quoteAsset")?.as_str()?.to_string();
            Some(MarketListing {
                symbol: format!("{}/{}", base, quote),
                base,
                quote,
                id,
                price: None,
                exchange_name: NAME.to_string(),
            })
        })
        .collect()
}

/// `[openTime, open, high, low, close, volume, closeTime, ...]`, prices as strings.
fn parse_klines(rows: &[Vec<Value>]) -> Result<Vec<Candle>, ExchangeError> {
    rows.iter()
        .map(|row| {
            let field = |i: usize| {
                row.get(i)
                    .and_then(value_as_f64)
                    .ok_or_else(|| ExchangeError::Parse(format!("kline field {} missing in {:?}", i, row)))
            };
            let open_time = row
                .first()
                .and_then(Value::as_i64)
                .and_then(DateTime::from_timestamp_millis)
                .ok_or_else(|| ExchangeError::Parse(format!("kline open time missing in {:?}", row)))?;

            Ok(Candle {
                timestamp: open_time,
                open: field(1)?,
                high: field(2)?,
                low: field(3)?,
                close: field(4)?,
                volume: field(5)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_klines() {
        let rows: Vec<Vec<Value>> = serde_json::from_value(json!([
            [1700000000000i64, "100.0", "101.5", "99.5", "101.0", "12.5", 1700000059999i64, "1262.5", 42, "6.0", "606.0", "0"],
            [1700000060000i64, "101.0", "102.0", "100.5", "101.5", "8", 1700000119999i64, "812.0", 17, "4.0", "406.0", "0"]
        ]))
        .unwrap();

        let candles = parse_klines(&rows).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(candles[0].high, 101.5);
        assert_eq!(candles[1].close, 101.5);
        assert_eq!(candles[1].volume, 8.0);
    }

    #[test]
    fn test_parse_klines_rejects_short_rows() {
        let rows: Vec<Vec<Value>> = serde_json::from_value(json!([[1700000000000i64, "1.0"]])).unwrap();
        assert!(matches!(parse_klines(&rows), Err(ExchangeError::Parse(_))));
    }

    #[test]
    fn test_parse_markets_applies_filters() {
        let info: ExchangeInfo = serde_json::from_value(json!({
            "rateLimits": [{"rateLimitType": "REQUEST_WEIGHT", "interval": "MINUTE", "intervalNum": 1, "limit": 6000}],
            "symbols": [
                {"symbol": "BTCUSDT", "status": "TRADING", "baseAsset": "BTC", "quoteAsset": "USDT"},
                {"symbol": "LUNAUSDT", "status": "BREAK", "baseAsset": "LUNA", "quoteAsset": "USDT"}
            ]
        }))
        .unwrap();
        let filters = HashMap::from([("status".to_string(), "TRADING".to_string())]);

        let listings = parse_markets(info.symbols, &filters);
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].symbol, "BTC/USDT");
        assert_eq!(listings[0].id, "BTCUSDT");
        assert_eq!(info.rate_limits[0].limit, 6000);

        let index = MarketIndex::new(listings);
        assert_eq!(index.market_id("BTC/USDT"), Some("BTCUSDT"));
        assert!(index.market_id("BTC-USDT").is_none());
    }

    #[test]
    fn test_ban_wait() {
        let text = r#"{"code":-1003,"msg":"Way too many requests; IP banned until 1700000010000."}"#;
        let wait = ban_wait_secs(text, 1_700_000_000_000).unwrap();
        assert!((wait - 15.0).abs() < 1e-9);
        assert!(ban_wait_secs(text, 1_700_000_020_000).is_none());
        assert!(ban_wait_secs("{\"code\":-1121}", 0).is_none());
    }
}
