use super::{Exchange, MarketIndex, PRICE_KEYS};
use crate::error::ExchangeError;
use crate::filter_utils::matches_filters;
use crate::models::{Candle, MarketListing, Timeframe, match_price_keys, value_as_f64};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const BASE_URL: &str = "https://api.exchange.coinbase.com";
const NAME: &str = "coinbase";
const MAX_LIMIT: usize = 300;

/// Coinbase Exchange public API. Product ids are dashed (`BTC-USD`).
pub struct Coinbase {
    client: Client,
    base_url: String,
    market_filters: HashMap<String, String>,
    markets: OnceCell<MarketIndex>,
}

impl Coinbase {
    pub fn new(client: Client, market_filters: HashMap<String, String>) -> Self {
        Self {
            client,
            base_url: BASE_URL.to_string(),
            market_filters,
            markets: OnceCell::new(),
        }
    }

    async fn markets(&self) -> Result<&MarketIndex, ExchangeError> {
        self.markets
            .get_or_try_init(|| async {
                let response = self
                    .client
                    .get(format!("{}/products", self.base_url))
                    .send()
                    .await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ExchangeError::Network(format!(
                        "coinbase returned {}: {}",
                        status, body
                    )));
                }
                let products: Vec<Map<String, Value>> = response.json().await?;
                let index = MarketIndex::new(parse_products(products, &self.market_filters));
                info!("Loaded {} coinbase markets", index.len());
                Ok(index)
            })
            .await
    }
}

/// Coinbase only serves these candle granularities.
fn granularity(timeframe: Timeframe) -> Result<i64, ExchangeError> {
    match timeframe {
        Timeframe::M1 | Timeframe::M5 | Timeframe::M15 | Timeframe::H1 | Timeframe::H6 | Timeframe::D1 => {
            Ok(timeframe.seconds())
        }
        other => Err(ExchangeError::NotSupported(format!(
            "coinbase has no {} candles",
            other
        ))),
    }
}

#[async_trait]
impl Exchange for Coinbase {
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
        let granularity = granularity(timeframe)?;
        let limit = limit.clamp(1, MAX_LIMIT);

        let end = Utc::now();
        let start = end - chrono::Duration::seconds(granularity * limit as i64);
        let query = [
            ("granularity", granularity.to_string()),
            ("start", start.to_rfc3339()),
            ("end", end.to_rfc3339()),
        ];

        debug!("GET coinbase candles {} {:?}", id, query);
        let response = self
            .client
            .get(format!("{}/products/{}/candles", self.base_url, id))
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ExchangeError::BadSymbol(format!("coinbase product {} not found", id)));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ExchangeError::RateLimited {
                exchange: NAME.to_string(),
                wait_secs: 1.0,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Network(format!("coinbase returned {}: {}", status, body)));
        }

        let rows: Vec<Vec<Value>> = response.json().await?;
        let mut candles = parse_candles(&rows)?;
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
        Ok(candles)
    }

    async fn fetch_markets(&self) -> Result<Vec<MarketListing>, ExchangeError> {
        Ok(self.markets().await?.listings().to_vec())
    }
}

fn parse_products(
    products: Vec<Map<String, Value>>,
    filters: &HashMap<String, String>,
) -> Vec<MarketListing> {
    products
        .into_iter()
        .filter(|p| matches_filters(p, filters))
        .filter_map(|p| {
            let id = p.get("id")?.as_str()?.to_string();
            let base = p.get("base_currency")?.as_str()?.to_string();
            let quote = p.get("quote_currency")?.as_str()?.to_string();
            Some(MarketListing {
                symbol: format!("{}/{}", base, quote),
                base,
                quote,
                id,
                price: match_price_keys(&p, PRICE_KEYS),
                exchange_name: NAME.to_string(),
            })
        })
        .collect()
}

/// `[time, low, high, open, close, volume]`, newest first, time in seconds.
fn parse_candles(rows: &[Vec<Value>]) -> Result<Vec<Candle>, ExchangeError> {
    let mut candles = rows
        .iter()
        .map(|row| {
            let field = |i: usize| {
                row.get(i)
                    .and_then(value_as_f64)
                    .ok_or_else(|| ExchangeError::Parse(format!("candle field {} missing in {:?}", i, row)))
            };
            let timestamp = row
                .first()
                .and_then(Value::as_i64)
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .ok_or_else(|| ExchangeError::Parse(format!("candle time missing in {:?}", row)))?;

            Ok(Candle {
                timestamp,
                low: field(1)?,
                high: field(2)?,
                open: field(3)?,
                close: field(4)?,
                volume: field(5)?,
            })
        })
        .collect::<Result<Vec<_>, ExchangeError>>()?;

    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}
