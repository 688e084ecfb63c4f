use crate::config::{AppConfig, IndicatorConfig};
use crate::exchange::Exchange;
use crate::indicators::{AugmentedCandle, Indicator, apply_indicators};
use crate::models::Candle;
use crate::resolver::{Resolution, resolve_candles};
use crate::storage_utils::AsyncStorageManager;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const MOVERS_FILE: &str = "movers";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MoverResult {
    pub symbol: String,
    pub movement_pct: f64,
    pub last_close: f64,
    pub rsi: Option<f64>,
    pub relative_volume: Option<f64>,
    /// `(window, spread)` for every EMA window that has filled.
    pub ema_spreads: Vec<(usize, f64)>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MoversReport {
    /// Milliseconds since epoch of the newest candle in the report.
    pub last_updated_timestamp: i64,
    pub results: Vec<MoverResult>,
}

/// Percent change from the first to the last close, with the last candle's time.
fn cumulative_change(candles: &[Candle]) -> Option<(f64, i64)> {
    let first = candles.first()?;
    let last = candles.last()?;
    if first.close == 0.0 {
        return None;
    }
    let cumulative_return = ((last.close / first.close) - 1.0) * 100.0;
    Some((cumulative_return, last.timestamp.timestamp_millis()))
}

/// Movers compare traded quantity, not quote volume.
fn mover_indicators(config: &AppConfig) -> IndicatorConfig {
    IndicatorConfig {
        volume_window: config.movers.volume_window,
        quote_volume: false,
        ..config.indicators.clone()
    }
}

fn summarize(symbol: String, candles: Vec<Candle>, indicators: &IndicatorConfig) -> Option<(MoverResult, i64)> {
    let (movement_pct, last_close_time) = cumulative_change(&candles)?;
    let rows = apply_indicators(candles, indicators, &[Indicator::Rsi, Indicator::Ema]);
    let last: &AugmentedCandle = rows.last()?;

    Some((
        MoverResult {
            symbol,
            movement_pct,
            last_close: last.candle.close,
            rsi: last.rsi,
            relative_volume: last.relative_volume,
            ema_spreads: last
                .emas
                .iter()
                .filter_map(|e| Some((e.window, e.spread?)))
                .collect(),
        },
        last_close_time,
    ))
}

/// Ranks `tickers` by cumulative change over the configured window.
///
/// Crypto tickers are quoted as `TICKER-QUOTE`. Unresolved tickers are logged
/// and left out. The report is cached as `movers.json`.
pub async fn run(
    exchange: &dyn Exchange,
    tickers: &[String],
    is_crypto: bool,
    config: &AppConfig,
    storage: &AsyncStorageManager,
) -> Result<MoversReport> {
    let indicators = mover_indicators(config);
    let quotes = vec![config.movers.quote.clone()];

    let mut results = Vec::with_capacity(tickers.len());
    let mut max_close_time = 0;

    for ticker in tickers {
        let resolution = if is_crypto {
            resolve_candles(exchange, ticker, &quotes, config.movers.interval, config.movers.range_limit).await?
        } else {
            match exchange
                .fetch_ohlcv(ticker, config.movers.interval, config.movers.range_limit)
                .await
            {
                Ok(candles) => Resolution::Found {
                    symbol: ticker.to_uppercase(),
                    candles,
                },
                Err(e) => {
                    warn!("{} skipped: {}", ticker, e);
                    continue;
                }
            }
        };

        let Resolution::Found { symbol, candles } = resolution else {
            continue;
        };
        if let Some((result, last_close_time)) = summarize(symbol, candles, &indicators) {
            max_close_time = max_close_time.max(last_close_time);
            results.push(result);
        }
    }

    results.sort_unstable_by(|a, b| {
        b.movement_pct
            .partial_cmp(&a.movement_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let report = MoversReport {
        last_updated_timestamp: max_close_time,
        results,
    };
    if !report.results.is_empty() {
        storage.save(MOVERS_FILE, &report).await?;
        info!("Ranked {} movers", report.results.len());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::tests::{MockExchange, candles_from_closes};

    #[test]
    fn test_cumulative_change() {
        let candles = candles_from_closes(&[50.0, 80.0, 75.0]);
        let (pct, ts) = cumulative_change(&candles).unwrap();
        assert!((pct - 50.0).abs() < 1e-9);
        assert_eq!(ts, candles[2].timestamp.timestamp_millis());

        assert!(cumulative_change(&[]).is_none());
        assert!(cumulative_change(&candles_from_closes(&[0.0, 1.0])).is_none());
    }

    #[test]
    fn test_summarize_uses_mover_volume_window() {
        let mut config = AppConfig::default();
        config.movers.volume_window = 3;
        let indicators = mover_indicators(&config);
        let closes: Vec<f64> = (0..20).map(|i| 10.0 + i as f64).collect();

        let (result, _) = summarize("AAPL".to_string(), candles_from_closes(&closes), &indicators).unwrap();

        assert_eq!(result.last_close, 29.0);
        assert_eq!(result.rsi, Some(100.0));
        // Constant quantity on rising closes: 1.0 on quantity, above 1.0 on quote volume.
        assert_eq!(result.relative_volume, Some(1.0));
        assert_eq!(result.ema_spreads.iter().map(|(w, _)| *w).collect::<Vec<_>>(), vec![9, 20]);
    }

    #[tokio::test]
    async fn test_run_ranks_and_saves() {
        let dir = std::env::temp_dir().join(format!("market-lens-movers-{}", std::process::id()));
        let storage = AsyncStorageManager::new(&dir).await.unwrap();
        let config = AppConfig::default();
        let exchange = MockExchange::accepting(&["BTC-USD", "ETH-USD"], vec![10.0, 12.0, 15.0]);
        let tickers = vec!["btc".to_string(), "doge".to_string(), "eth".to_string()];

        let report = run(&exchange, &tickers, true, &config, &storage).await.unwrap();

        assert_eq!(report.results.len(), 2);
        assert!((report.results[0].movement_pct - 50.0).abs() < 1e-9);
        assert!(report.last_updated_timestamp > 0);
        let cached: MoversReport = storage.load(MOVERS_FILE).await.unwrap();
        assert_eq!(cached.results.len(), 2);
        assert_eq!(cached.last_updated_timestamp, report.last_updated_timestamp);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
