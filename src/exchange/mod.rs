//! HTTP clients for the candle sources.
//!
//! Every client takes ccxt-style unified symbols (`BTC/USDT`). A symbol is
//! looked up first as a unified symbol and then as the exchange-native id, so
//! `BTC-USD` resolves on Coinbase (whose ids are dashed) but not on Binance.
//! Anything the exchange does not list is a [`ExchangeError::BadSymbol`].

pub mod binance;
pub mod coinbase;
pub mod yahoo;

use crate::error::ExchangeError;
use crate::models::{Candle, MarketListing, Timeframe, strip_settlement};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Exchanges that serve OHLCV data without API credentials.
pub const SUPPORTED_EXCHANGES: &[&str] = &["binance", "coinbase", "yahoo"];

/// Keys that carry a last price inside a raw market record.
pub const PRICE_KEYS: &[&str] = &["price", "oraclePx"];

const USER_AGENT: &str = concat!("market-lens/", env!("CARGO_PKG_VERSION"));

#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    /// Oldest candle first.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn fetch_markets(&self) -> Result<Vec<MarketListing>, ExchangeError>;
}

/// Builds a client by id. Unknown ids are `NotSupported`.
///
/// `market_filters` are applied to the exchange's raw market records when the
/// market list is loaded (see [`crate::filter_utils::matches_filters`]).
pub fn build(
    name: &str,
    market_filters: HashMap<String, String>,
) -> Result<Arc<dyn Exchange>, ExchangeError> {
    let client = http_client()?;
    match name.trim().to_lowercase().as_str() {
        "binance" => Ok(Arc::new(binance::Binance::new(client, market_filters))),
        "coinbase" => Ok(Arc::new(coinbase::Coinbase::new(client, market_filters))),
        "yahoo" => Ok(Arc::new(yahoo::Yahoo::new(client))),
        other => Err(ExchangeError::NotSupported(format!("exchange '{}'", other))),
    }
}

/// Yahoo as its concrete type, which also serves option chains.
pub fn yahoo_client() -> Result<yahoo::Yahoo, ExchangeError> {
    Ok(yahoo::Yahoo::new(http_client()?))
}

fn http_client() -> Result<reqwest::Client, ExchangeError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(50)
        .build()
        .map_err(|e| ExchangeError::Network(format!("failed to create HTTP client: {}", e)))
}

/// Unified-symbol and native-id lookup over a loaded market list.
#[derive(Debug, Default)]
pub struct MarketIndex {
    by_symbol: HashMap<String, String>,
    by_id: HashMap<String, String>,
    listings: Vec<MarketListing>,
}

impl MarketIndex {
    pub fn new(listings: Vec<MarketListing>) -> Self {
        let mut by_symbol = HashMap::with_capacity(listings.len());
        let mut by_id = HashMap::with_capacity(listings.len());
        for listing in &listings {
            by_symbol.insert(listing.symbol.to_uppercase(), listing.id.clone());
            by_id.insert(listing.id.to_uppercase(), listing.id.clone());
        }
        Self {
            by_symbol,
            by_id,
            listings,
        }
    }

    /// Native market id for `symbol`, if the exchange lists it.
    pub fn market_id(&self, symbol: &str) -> Option<&str> {
        let key = strip_settlement(symbol.trim()).to_uppercase();
        self.by_symbol
            .get(&key)
            .or_else(|| self.by_id.get(&key))
            .map(String::as_str)
    }

    pub fn require(&self, exchange: &str, symbol: &str) -> Result<&str, ExchangeError> {
        self.market_id(symbol)
            .ok_or_else(|| ExchangeError::BadSymbol(format!("{} does not have market symbol {}", exchange, symbol)))
    }

    pub fn listings(&self) -> &[MarketListing] {
        &self.listings
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }
}
