//! Fans the candle pipeline out over several exchanges and tickers.

use crate::candles::{CandleTable, FetchRequest, compare_candles, fetch_candles, trajectory};
use crate::config::AppConfig;
use crate::error::ExchangeError;
use crate::exchange::{self, Exchange};
use crate::models::MarketListing;
use futures::future::join_all;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// One column of one ticker on one exchange.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ColumnSeries {
    pub ticker: String,
    pub column: String,
    pub exchange: String,
    pub values: Vec<Option<f64>>,
}

impl ColumnSeries {
    pub fn last(&self) -> Option<f64> {
        self.values.last().copied().flatten()
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SimilarityRow {
    pub exchange: String,
    pub ticker: String,
    /// Mean similarity to the base ticker; `None` when either series is missing.
    pub score: Option<f64>,
}

pub struct CexAggregator {
    exchanges: Vec<Arc<dyn Exchange>>,
    config: AppConfig,
}

impl CexAggregator {
    /// Builds a client for every exchange in `config.exchanges`.
    pub fn from_config(config: AppConfig) -> Result<Self, ExchangeError> {
        let exchanges = config
            .exchanges
            .iter()
            .map(|name| exchange::build(name, config.filters_for(name)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(exchanges, config))
    }

    pub fn new(exchanges: Vec<Arc<dyn Exchange>>, config: AppConfig) -> Self {
        Self { exchanges, config }
    }

    pub fn exchange_names(&self) -> Vec<&str> {
        self.exchanges.iter().map(|e| e.name()).collect()
    }

    /// Market listings from every exchange, merged. Exchanges without a listing
    /// are skipped. `base` keeps only markets for that asset.
    pub async fn get_last_price(&self, base: Option<&str>) -> Vec<MarketListing> {
        let results = join_all(self.exchanges.iter().map(|e| e.fetch_markets())).await;

        let mut markets = Vec::new();
        for (exchange, result) in self.exchanges.iter().zip(results) {
            match result {
                Ok(listings) => markets.extend(listings),
                Err(ExchangeError::NotSupported(reason)) => {
                    warn!("{} skipped: {}", exchange.name(), reason)
                }
                Err(e) => error!("{} markets failed: {}", exchange.name(), e),
            }
        }

        if let Some(base) = base {
            let base = base.to_uppercase();
            markets.retain(|m| m.base.eq_ignore_ascii_case(&base));
        }
        info!("Merged {} market listings", markets.len());
        markets
    }

    /// Candles for `ticker` from every exchange, in configured exchange order.
    /// A failing exchange contributes an empty table.
    pub async fn get_candles(&self, request: &FetchRequest) -> Vec<CandleTable> {
        let results = join_all(
            self.exchanges
                .iter()
                .map(|e| fetch_candles(e.as_ref(), request, &self.config)),
        )
        .await;

        self.exchanges
            .iter()
            .zip(results)
            .map(|(exchange, result)| {
                result.unwrap_or_else(|e| {
                    error!("{} {} failed: {}", exchange.name(), request.ticker, e);
                    CandleTable::empty(exchange.name(), &request.ticker)
                })
            })
            .collect()
    }

    /// Candles per ticker per exchange. Tickers are fetched one after another.
    pub async fn aggregate_candles(
        &self,
        tickers: &[String],
        template: &FetchRequest,
    ) -> BTreeMap<String, Vec<CandleTable>> {
        let mut candles = BTreeMap::new();
        for ticker in tickers {
            let request = template.with_ticker(ticker);
            candles.insert(ticker.to_uppercase(), self.get_candles(&request).await);
        }
        candles
    }

    /// Mean similarity of each ticker to `base_ticker`, per exchange, best first.
    pub async fn compare_candles(&self, tickers: &[String], base_ticker: &str) -> Vec<SimilarityRow> {
        let mut rows = Vec::new();
        for exchange in &self.exchanges {
            for ticker in tickers.iter().filter(|t| !t.eq_ignore_ascii_case(base_ticker)) {
                let score = match compare_candles(exchange.as_ref(), base_ticker, ticker, &self.config).await {
                    Ok(scores) => scores.and_then(|s| mean(&s)),
                    Err(e) => {
                        error!("{} compare {} failed: {}", exchange.name(), ticker, e);
                        None
                    }
                };
                rows.push(SimilarityRow {
                    exchange: exchange.name().to_string(),
                    ticker: ticker.to_uppercase(),
                    score,
                });
            }
        }
        sort_by_score(&mut rows);
        rows
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Descending by score, missing scores last.
fn sort_by_score(rows: &mut [SimilarityRow]) {
    rows.sort_by(|a, b| match (a.score, b.score) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

/// Collects `columns` from every non-empty table.
pub fn aggregate_columns(
    candles: &BTreeMap<String, Vec<CandleTable>>,
    columns: &[String],
) -> Vec<ColumnSeries> {
    let mut series = Vec::new();
    for (ticker, tables) in candles {
        for column in columns {
            for table in tables.iter().filter(|t| !t.is_empty()) {
                series.push(ColumnSeries {
                    ticker: ticker.clone(),
                    column: column.clone(),
                    exchange: table.exchange.clone(),
                    values: table.series(column),
                });
            }
        }
    }
    series
}

/// Last value of `column` per ticker. When several exchanges carry the
/// ticker, the later exchange in configured order wins.
fn last_values(series: &[ColumnSeries], column: &str) -> BTreeMap<String, f64> {
    let mut values = BTreeMap::new();
    for s in series.iter().filter(|s| s.column == column) {
        if let Some(last) = s.last() {
            values.insert(s.ticker.clone(), last);
        }
    }
    values
}

pub fn find_max_value(series: &[ColumnSeries], column: &str) -> Option<(String, f64)> {
    last_values(series, column)
        .into_iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
}

pub fn find_min_value(series: &[ColumnSeries], column: &str) -> Option<(String, f64)> {
    last_values(series, column)
        .into_iter()
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
}

/// Adds `traj_<column>` series for every `add_info` column of `tables`.
pub fn with_trajectories(tables: &[CandleTable], add_info: &[String], window: usize) -> Vec<ColumnSeries> {
    let mut series = Vec::new();
    for table in tables.iter().filter(|t| !t.is_empty()) {
        for column in add_info {
            let values = table.series(column);
            if values.iter().all(Option::is_none) {
                continue;
            }
            series.push(ColumnSeries {
                ticker: table.ticker.clone(),
                column: format!("traj_{}", column),
                exchange: table.exchange.clone(),
                values: trajectory(&values, window),
            });
            series.push(ColumnSeries {
                ticker: table.ticker.clone(),
                column: column.clone(),
                exchange: table.exchange.clone(),
                values,
            });
        }
    }
    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::tests::MockExchange;

    fn closes(n: usize, step: f64) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64 * step + (i % 4) as f64).collect()
    }

    fn aggregator(exchanges: Vec<MockExchange>) -> CexAggregator {
        let exchanges = exchanges
            .into_iter()
            .enumerate()
            .map(|(i, mut e)| {
                e.name = format!("mock{}", i);
                Arc::new(e) as Arc<dyn Exchange>
            })
            .collect();
        CexAggregator::new(exchanges, AppConfig::default())
    }

    fn series(ticker: &str, column: &str, exchange: &str, values: &[f64]) -> ColumnSeries {
        ColumnSeries {
            ticker: ticker.to_string(),
            column: column.to_string(),
            exchange: exchange.to_string(),
            values: values.iter().map(|v| Some(*v)).collect(),
        }
    }

    #[tokio::test]
    async fn test_get_candles_keeps_missing_exchanges_empty() {
        let agg = aggregator(vec![
            MockExchange::accepting(&["BTC/USD"], closes(30, 1.0)),
            MockExchange::accepting(&["ETH/USD"], closes(30, 1.0)),
        ]);
        let config = AppConfig::default();

        let tables = agg.get_candles(&FetchRequest::new("BTC", &config)).await;

        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].exchange, "mock0");
        assert_eq!(tables[0].rows.len(), 30);
        assert!(tables[1].is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_columns_skips_empty_tables() {
        let agg = aggregator(vec![
            MockExchange::accepting(&["BTC/USD", "ETH/USD"], closes(30, 1.0)),
            MockExchange::accepting(&["ETH-USDT"], closes(30, -1.0)),
        ]);
        let config = AppConfig::default();
        let tickers = vec!["btc".to_string(), "eth".to_string()];

        let candles = agg.aggregate_candles(&tickers, &FetchRequest::new("", &config)).await;
        let columns = vec!["close".to_string(), "rsi".to_string()];
        let series = aggregate_columns(&candles, &columns);

        assert_eq!(candles.keys().collect::<Vec<_>>(), vec!["BTC", "ETH"]);
        // BTC: 2 columns x 1 exchange, ETH: 2 columns x 2 exchanges
        assert_eq!(series.len(), 6);
        assert!(series.iter().all(|s| s.values.len() == 30));
    }

    #[tokio::test]
    async fn test_aggregate_candles_keeps_pair_quotes() {
        let agg = aggregator(vec![MockExchange::accepting(&["ETH/EUR", "BTC/USDT"], closes(20, 1.0))]);
        let config = AppConfig::default();
        let tickers = vec!["eth/eur".to_string(), "btc".to_string()];

        let candles = agg.aggregate_candles(&tickers, &FetchRequest::new("", &config)).await;

        assert_eq!(candles["ETH/EUR"][0].symbol.as_deref(), Some("ETH/EUR"));
        assert_eq!(candles["BTC"][0].symbol.as_deref(), Some("BTC/USDT"));
    }

    #[test]
    fn test_find_max_and_min_use_last_values() {
        let series = vec![
            series("BTC", "rsi", "a", &[50.0, 71.0]),
            series("ETH", "rsi", "a", &[80.0, 40.0]),
            series("SOL", "rsi", "a", &[10.0, 55.0]),
            series("SOL", "close", "a", &[1.0, 999.0]),
        ];

        assert_eq!(find_max_value(&series, "rsi"), Some(("BTC".to_string(), 71.0)));
        assert_eq!(find_min_value(&series, "rsi"), Some(("ETH".to_string(), 40.0)));
        assert_eq!(find_max_value(&series, "vwap"), None);
    }

    #[test]
    fn test_later_exchange_wins_per_ticker() {
        let series = vec![series("BTC", "rsi", "a", &[90.0]), series("BTC", "rsi", "b", &[20.0])];
        assert_eq!(find_max_value(&series, "rsi"), Some(("BTC".to_string(), 20.0)));
    }

    #[tokio::test]
    async fn test_compare_candles_ranks_scores() {
        let agg = aggregator(vec![MockExchange::accepting(
            &["BTC/USD", "ETH/USD"],
            closes(40, 0.5),
        )]);
        let tickers = vec!["BTC".to_string(), "ETH".to_string(), "NOPE".to_string()];

        let rows = agg.compare_candles(&tickers, "btc").await;

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ticker, "ETH");
        assert!((rows[0].score.unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(rows[1].ticker, "NOPE");
        assert_eq!(rows[1].score, None);
    }

    #[tokio::test]
    async fn test_get_last_price_filters_by_base() {
        let agg = aggregator(vec![
            MockExchange::accepting(&["BTC/USD", "ETH/USD"], vec![]),
            MockExchange::accepting(&["BTC/USDT"], vec![]),
        ]);

        let markets = agg.get_last_price(Some("btc")).await;

        assert_eq!(markets.len(), 2);
        assert!(markets.iter().all(|m| m.base == "BTC"));
        assert_eq!(agg.exchange_names(), vec!["mock0", "mock1"]);
    }

    #[tokio::test]
    async fn test_trajectory_series_and_leader() {
        let config = AppConfig::default();
        let btc = MockExchange::accepting(&["BTC/USD"], closes(40, 1.0));
        let eth = MockExchange::accepting(&["ETH/USD"], closes(40, -1.0));
        let tables = vec![
            fetch_candles(&btc, &FetchRequest::new("BTC", &config), &config).await.unwrap(),
            fetch_candles(&eth, &FetchRequest::new("ETH", &config), &config).await.unwrap(),
        ];

        let series = with_trajectories(&tables, &config.add_info, config.trajectory_window);

        assert!(series.iter().any(|s| s.column == "traj_rsi" && s.ticker == "BTC"));
        // spread_200 never fills on 40 candles
        assert!(!series.iter().any(|s| s.column == "spread_200"));
        assert!(find_max_value(&series, "traj_rsi").is_some());
    }
}
