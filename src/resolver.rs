//! Trial-and-error resolution of a ticker into an exchange symbol.
//!
//! Candidates are tried in a fixed order: every quote with `/`, then every
//! quote with `-`. The first symbol the exchange accepts wins. Nothing is
//! remembered between calls.

use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::models::{Candle, Delimiter, Symbol, Timeframe};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found { symbol: String, candles: Vec<Candle> },
    NotFound { attempted: Vec<String> },
}

impl Resolution {
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Resolution::Found { symbol, .. } => Some(symbol),
            Resolution::NotFound { .. } => None,
        }
    }

    /// The candles, or an empty series when nothing resolved.
    pub fn into_candles(self) -> Vec<Candle> {
        match self {
            Resolution::Found { candles, .. } => candles,
            Resolution::NotFound { .. } => Vec::new(),
        }
    }
}

/// Candidate symbols in trial order.
pub fn candidates(ticker: &str, quotes: &[String]) -> Vec<String> {
    [Delimiter::Slash, Delimiter::Dash]
        .iter()
        .flat_map(|delimiter| {
            quotes
                .iter()
                .map(move |quote| Symbol::new(ticker, quote).format(*delimiter))
        })
        .collect()
}

/// Fetches candles for the first candidate symbol `exchange` accepts.
///
/// Only `BadSymbol` moves on to the next candidate. Any other error aborts the
/// search and is returned as is.
pub async fn resolve_candles(
    exchange: &dyn Exchange,
    ticker: &str,
    quotes: &[String],
    timeframe: Timeframe,
    limit: usize,
) -> Result<Resolution, ExchangeError> {
    let mut attempted = Vec::new();

    for symbol in candidates(ticker, quotes) {
        match exchange.fetch_ohlcv(&symbol, timeframe, limit).await {
            Ok(candles) => {
                debug!("{} resolved {} as {}", exchange.name(), ticker, symbol);
                return Ok(Resolution::Found { symbol, candles });
            }
            Err(ExchangeError::BadSymbol(reason)) => {
                debug!("{} rejected {}: {}", exchange.name(), symbol, reason);
                attempted.push(symbol);
            }
            Err(e) => return Err(e),
        }
    }

    warn!(
        "{} has no market for {} (tried {})",
        exchange.name(),
        ticker,
        attempted.join(", ")
    );
    Ok(Resolution::NotFound { attempted })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::MarketListing;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Accepts a fixed set of symbols and records every request.
    pub(crate) struct MockExchange {
        pub name: String,
        pub accepted: HashSet<String>,
        pub unsupported: HashSet<String>,
        pub closes: Vec<f64>,
        pub calls: Mutex<Vec<String>>,
    }

    impl MockExchange {
        pub(crate) fn accepting(symbols: &[&str], closes: Vec<f64>) -> Self {
            Self {
                name: "mock".to_string(),
                accepted: symbols.iter().map(|s| s.to_string()).collect(),
                unsupported: HashSet::new(),
                closes,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    pub(crate) fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                timestamp: start + Duration::minutes(i as i64),
                open: close,
                high: close * 1.01,
                low: close * 0.99,
                close,
                volume: 10.0,
            })
            .collect()
    }

    #[async_trait]
    impl Exchange for MockExchange {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch_ohlcv(
            &self,
            symbol: &str,
            _timeframe: Timeframe,
            limit: usize,
        ) -> Result<Vec<Candle>, ExchangeError> {
            self.calls.lock().unwrap().push(symbol.to_string());
            if self.unsupported.contains(symbol) {
                return Err(ExchangeError::NotSupported(symbol.to_string()));
            }
            if !self.accepted.contains(symbol) {
                return Err(ExchangeError::BadSymbol(symbol.to_string()));
            }
            let mut candles = candles_from_closes(&self.closes);
            candles.truncate(limit);
            Ok(candles)
        }

        async fn fetch_markets(&self) -> Result<Vec<MarketListing>, ExchangeError> {
            Ok(self
                .accepted
                .iter()
                .filter_map(|s| Symbol::parse(s))
                .map(|s| MarketListing {
                    symbol: s.format(Delimiter::Slash),
                    id: s.format(Delimiter::Dash),
                    base: s.base,
                    quote: s.quote,
                    price: Some(1.0),
                    exchange_name: self.name.clone(),
                })
                .collect())
        }
    }

    fn stables() -> Vec<String> {
        ["USD", "USDC", "USDT", "DAI"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_candidate_order() {
        assert_eq!(
            candidates("btc", &stables()),
            vec![
                "BTC/USD", "BTC/USDC", "BTC/USDT", "BTC/DAI", "BTC-USD", "BTC-USDC", "BTC-USDT",
                "BTC-DAI"
            ]
        );
    }

    #[tokio::test]
    async fn test_falls_back_to_dash_after_exhausting_slash_quotes() {
        let exchange = MockExchange::accepting(&["BTC-USDT"], vec![1.0, 2.0, 3.0]);

        let resolution = resolve_candles(&exchange, "btc", &stables(), Timeframe::M1, 300)
            .await
            .unwrap();

        assert_eq!(resolution.symbol(), Some("BTC-USDT"));
        assert_eq!(
            exchange.calls(),
            vec!["BTC/USD", "BTC/USDC", "BTC/USDT", "BTC/DAI", "BTC-USD", "BTC-USDC", "BTC-USDT"]
        );
        assert_eq!(resolution.into_candles().len(), 3);
    }

    #[tokio::test]
    async fn test_first_accepted_candidate_wins() {
        let exchange = MockExchange::accepting(&["ETH/USDC", "ETH-USD"], vec![5.0]);

        let resolution = resolve_candles(&exchange, "ETH", &stables(), Timeframe::M1, 300)
            .await
            .unwrap();

        assert_eq!(resolution.symbol(), Some("ETH/USDC"));
        assert_eq!(exchange.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_explicit_market_tries_both_delimiters() {
        let exchange = MockExchange::accepting(&["SOL-EUR"], vec![5.0]);
        let quotes = vec!["EUR".to_string()];

        let resolution = resolve_candles(&exchange, "SOL", &quotes, Timeframe::M1, 300)
            .await
            .unwrap();

        assert_eq!(resolution.symbol(), Some("SOL-EUR"));
        assert_eq!(exchange.calls(), vec!["SOL/EUR", "SOL-EUR"]);
    }

    #[tokio::test]
    async fn test_not_found_lists_every_attempt() {
        let exchange = MockExchange::accepting(&[], vec![]);

        let resolution = resolve_candles(&exchange, "NOPE", &stables(), Timeframe::M1, 300)
            .await
            .unwrap();

        match &resolution {
            Resolution::NotFound { attempted } => assert_eq!(attempted.len(), 8),
            other => panic!("expected NotFound, got {:?}", other),
        }
        assert!(resolution.into_candles().is_empty());
    }

    #[tokio::test]
    async fn test_not_supported_aborts_the_search() {
        let mut exchange = MockExchange::accepting(&["BTC-USD"], vec![1.0]);
        exchange.unsupported.insert("BTC/USDC".to_string());

        let result = resolve_candles(&exchange, "BTC", &stables(), Timeframe::M1, 300).await;

        assert!(matches!(result, Err(ExchangeError::NotSupported(_))));
        assert_eq!(exchange.calls(), vec!["BTC/USD", "BTC/USDC"]);
    }
}
