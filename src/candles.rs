//! The candle pipeline: resolve the ticker, fetch OHLCV, append indicators.

use crate::config::AppConfig;
use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::indicators::{AugmentedCandle, Indicator, apply_indicators};
use crate::models::{Candle, Symbol, Delimiter, Timeframe};
use crate::resolver::resolve_candles;
use futures::future::try_join_all;
use serde::Serialize;
use tracing::{debug, info};

/// Augmented candles for one ticker on one exchange.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CandleTable {
    pub exchange: String,
    pub ticker: String,
    /// The symbol the exchange accepted, `None` when resolution failed.
    pub symbol: Option<String>,
    pub rows: Vec<AugmentedCandle>,
}

impl CandleTable {
    pub fn empty(exchange: &str, ticker: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            ticker: ticker.to_uppercase(),
            symbol: None,
            rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn series(&self, column: &str) -> Vec<Option<f64>> {
        self.rows.iter().map(|r| r.column(column)).collect()
    }

    pub fn last(&self, column: &str) -> Option<f64> {
        self.rows.last().and_then(|r| r.column(column))
    }

    /// File stem for exports: `binance_BTC-USDT`.
    pub fn file_stem(&self) -> String {
        let symbol = self
            .symbol
            .as_deref()
            .unwrap_or(&self.ticker)
            .replace(['/', ':'], "-");
        format!("{}_{}", self.exchange, symbol)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub ticker: String,
    /// Quote currency used when `stable_coin` is off.
    pub market: String,
    pub timeframe: Timeframe,
    pub limit: usize,
    /// Cycle through the configured stablecoins instead of `market`.
    pub stable_coin: bool,
    pub apply_indicators: bool,
    pub indicators: Vec<Indicator>,
}

impl FetchRequest {
    /// A full pair such as `ETH/EUR` pins the market instead of cycling stablecoins.
    pub fn new(ticker: &str, config: &AppConfig) -> Self {
        Self {
            ticker: String::new(),
            market: "USD".to_string(),
            timeframe: config.candles.timeframe,
            limit: config.candles.limit,
            stable_coin: true,
            apply_indicators: true,
            indicators: config.indicators.enabled.clone(),
        }
        .with_ticker(ticker)
    }

    /// This request for another ticker. A bare ticker keeps the quote
    /// settings, a full pair replaces them with its own quote.
    pub fn with_ticker(&self, ticker: &str) -> Self {
        let mut request = self.clone();
        match Symbol::parse(ticker) {
            Some(pair) => {
                request.ticker = pair.base;
                request.market = pair.quote;
                request.stable_coin = false;
            }
            None => request.ticker = ticker.to_string(),
        }
        request
    }

    /// Whether the quote currency came from the ticker itself.
    pub fn is_pair(ticker: &str) -> bool {
        Symbol::parse(ticker).is_some()
    }

    fn quotes(&self, stable_coins: &[String]) -> Vec<String> {
        if self.stable_coin {
            stable_coins.to_vec()
        } else {
            vec![self.market.clone()]
        }
    }
}

/// Fetches and augments candles for `request.ticker`.
///
/// An unresolved ticker yields an empty table; only non-symbol failures are errors.
pub async fn fetch_candles(
    exchange: &dyn Exchange,
    request: &FetchRequest,
    config: &AppConfig,
) -> Result<CandleTable, ExchangeError> {
    let quotes = request.quotes(&config.stable_coins);
    let resolution = resolve_candles(
        exchange,
        &request.ticker,
        &quotes,
        request.timeframe,
        request.limit,
    )
    .await?;

    let mut table = CandleTable::empty(exchange.name(), &request.ticker);
    let Some(symbol) = resolution.symbol().map(str::to_string) else {
        return Ok(table);
    };
    let candles = resolution.into_candles();

    let enabled: &[Indicator] = if request.apply_indicators {
        &request.indicators
    } else {
        &[]
    };
    debug!(
        "{} {}: {} candles, indicators {:?}",
        exchange.name(),
        symbol,
        candles.len(),
        enabled
    );
    table.rows = apply_indicators(candles, &config.indicators, enabled);
    table.symbol = Some(symbol);
    Ok(table)
}

/// Raw candles for `TICKER/MARKET` on every ticker at once.
///
/// Requests run concurrently and the first failure fails the whole batch.
pub async fn fetch_multiple_candles(
    exchange: &dyn Exchange,
    tickers: &[String],
    market: &str,
    timeframe: Timeframe,
    limit: usize,
) -> Result<Vec<Vec<Candle>>, ExchangeError> {
    let symbols: Vec<String> = tickers
        .iter()
        .map(|t| Symbol::new(t, market).format(Delimiter::Slash))
        .collect();
    info!("Fetching {} symbols from {}", symbols.len(), exchange.name());

    try_join_all(
        symbols
            .iter()
            .map(|symbol| exchange.fetch_ohlcv(symbol, timeframe, limit)),
    )
    .await
}

/// `(v[i] - v[i-w]) / v[i-w]`
pub fn trajectory(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    values
        .iter()
        .enumerate()
        .map(|(i, current)| {
            let previous = values.get(i.checked_sub(window)?).copied().flatten()?;
            let current = (*current)?;
            (previous != 0.0).then(|| (current - previous) / previous)
        })
        .collect()
}

/// Pointwise `1 - |b - c| / max(b)` over two change series.
///
/// `None` when the base series is empty or its maximum is zero.
pub fn similarity_scores(base: &[f64], compare: &[f64]) -> Option<Vec<f64>> {
    let max = base.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() || max == 0.0 {
        return None;
    }
    Some(
        base.iter()
            .zip(compare)
            .map(|(b, c)| 1.0 - (b - c).abs() / max)
            .collect(),
    )
}

/// Similarity of `compare_ticker`'s percent changes to `base_ticker`'s.
pub async fn compare_candles(
    exchange: &dyn Exchange,
    base_ticker: &str,
    compare_ticker: &str,
    config: &AppConfig,
) -> Result<Option<Vec<f64>>, ExchangeError> {
    let base = fetch_candles(exchange, &FetchRequest::new(base_ticker, config), config).await?;
    let compare = fetch_candles(exchange, &FetchRequest::new(compare_ticker, config), config).await?;

    let changes = |table: &CandleTable| -> Vec<f64> { table.series("change").into_iter().flatten().collect() };
    let (base_changes, compare_changes) = (changes(&base), changes(&compare));
    if base_changes.is_empty() || compare_changes.is_empty() {
        return Ok(None);
    }
    Ok(similarity_scores(&base_changes, &compare_changes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::tests::MockExchange;

    fn rising(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64 + (i % 3) as f64).collect()
    }

    #[tokio::test]
    async fn test_fetch_candles_augments_resolved_symbol() {
        let exchange = MockExchange::accepting(&["BTC/USDT"], rising(60));
        let config = AppConfig::default();

        let table = fetch_candles(&exchange, &FetchRequest::new("btc", &config), &config)
            .await
            .unwrap();

        assert_eq!(table.symbol.as_deref(), Some("BTC/USDT"));
        assert_eq!(table.rows.len(), 60);
        assert!(table.last("rsi").is_some());
        assert!(table.last("ema_20").is_some());
        assert!(table.last("ema_200").is_none());
        assert_eq!(table.file_stem(), "mock_BTC-USDT");
    }

    #[tokio::test]
    async fn test_fetch_candles_unresolved_is_empty() {
        let exchange = MockExchange::accepting(&[], vec![]);
        let config = AppConfig::default();

        let table = fetch_candles(&exchange, &FetchRequest::new("xyz", &config), &config)
            .await
            .unwrap();

        assert!(table.is_empty());
        assert_eq!(table.symbol, None);
        assert_eq!(table.file_stem(), "mock_XYZ");
    }

    #[tokio::test]
    async fn test_fetch_candles_without_indicators() {
        let exchange = MockExchange::accepting(&["ETH/EUR"], rising(40));
        let config = AppConfig::default();
        let mut request = FetchRequest::new("eth", &config);
        request.stable_coin = false;
        request.market = "eur".to_string();
        request.apply_indicators = false;

        let table = fetch_candles(&exchange, &request, &config).await.unwrap();

        assert_eq!(exchange.calls(), vec!["ETH/EUR"]);
        assert!(table.rows.iter().all(|r| r.rsi.is_none() && r.emas.is_empty()));
        assert!(table.last("change").is_some());
    }

    #[tokio::test]
    async fn test_pair_ticker_pins_market() {
        let exchange = MockExchange::accepting(&["ETH-EUR"], rising(10));
        let config = AppConfig::default();
        let request = FetchRequest::new("eth/eur", &config);

        assert_eq!(request.ticker, "ETH");
        assert!(!request.stable_coin);
        let table = fetch_candles(&exchange, &request, &config).await.unwrap();
        assert_eq!(exchange.calls(), vec!["ETH/EUR", "ETH-EUR"]);
        assert_eq!(table.ticker, "ETH");
    }

    #[test]
    fn test_with_ticker_keeps_template_settings() {
        let config = AppConfig::default();
        let mut template = FetchRequest::new("", &config);
        template.timeframe = Timeframe::H1;
        template.stable_coin = false;
        template.market = "EUR".to_string();

        let bare = template.with_ticker("sol");
        assert_eq!(bare.ticker, "sol");
        assert_eq!(bare.market, "EUR");
        assert_eq!(bare.timeframe, Timeframe::H1);

        let pair = FetchRequest::new("", &config).with_ticker("ETH/BTC");
        assert_eq!((pair.ticker.as_str(), pair.market.as_str()), ("ETH", "BTC"));
        assert!(!pair.stable_coin);
        assert!(FetchRequest::is_pair("eth-eur"));
        assert!(!FetchRequest::is_pair("eth"));
    }

    #[tokio::test]
    async fn test_fetch_multiple_fails_as_a_batch() {
        let exchange = MockExchange::accepting(&["BTC/USD", "ETH/USD"], rising(5));
        let tickers: Vec<String> = vec!["btc".into(), "eth".into()];

        let batch = fetch_multiple_candles(&exchange, &tickers, "usd", Timeframe::M1, 300)
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);

        let tickers: Vec<String> = vec!["btc".into(), "doge".into()];
        let result = fetch_multiple_candles(&exchange, &tickers, "USD", Timeframe::M1, 300).await;
        assert!(matches!(result, Err(ExchangeError::BadSymbol(_))));
    }

    #[test]
    fn test_trajectory() {
        let values = vec![Some(10.0), Some(20.0), None, Some(15.0), Some(40.0)];
        let traj = trajectory(&values, 2);
        assert_eq!(traj[0], None);
        assert_eq!(traj[1], None);
        assert_eq!(traj[2], None);
        assert_eq!(traj[3], Some(-0.25));
        assert_eq!(traj[4], None);
    }

    #[test]
    fn test_similarity_scores() {
        let scores = similarity_scores(&[1.0, 2.0, -1.0], &[1.0, 1.0, 1.0]).unwrap();
        assert_eq!(scores, vec![1.0, 0.5, 0.0]);
        assert!(similarity_scores(&[], &[1.0]).is_none());
        assert!(similarity_scores(&[0.0, -1.0], &[1.0, 1.0]).is_none());
    }

    #[tokio::test]
    async fn test_compare_candles_identical_series_scores_one() {
        let exchange = MockExchange::accepting(&["BTC/USD", "ETH/USD"], rising(20));
        let config = AppConfig::default();

        let scores = compare_candles(&exchange, "BTC", "ETH", &config)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(scores.len(), 19);
        assert!(scores.iter().all(|s| (s - 1.0).abs() < 1e-12));
    }

    #[tokio::test]
    async fn test_compare_candles_missing_series() {
        let exchange = MockExchange::accepting(&["BTC/USD"], rising(20));
        let config = AppConfig::default();

        let scores = compare_candles(&exchange, "BTC", "NOPE", &config).await.unwrap();
        assert!(scores.is_none());
    }
}
