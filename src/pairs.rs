use crate::exchange::Exchange;
use crate::models::{Candle, Timeframe};
use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use statrs::statistics::Statistics;
use std::collections::BTreeMap;
use tracing::{info, warn};

fn closes_by_time(candles: &[Candle]) -> BTreeMap<DateTime<Utc>, f64> {
    candles.iter().map(|c| (c.timestamp, c.close)).collect()
}

/// Pearson correlation; `None` with fewer than two points or a flat series.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let denominator = x.population_std_dev() * y.population_std_dev();
    if denominator == 0.0 || !denominator.is_finite() {
        return None;
    }
    Some((x.population_covariance(y) / denominator).clamp(-1.0, 1.0))
}

/// Correlation of two close series on the timestamps they share.
pub fn aligned_correlation(a: &[Candle], b: &[Candle]) -> Option<f64> {
    let b_closes = closes_by_time(b);
    let (x, y): (Vec<f64>, Vec<f64>) = a
        .iter()
        .filter_map(|c| Some((c.close, *b_closes.get(&c.timestamp)?)))
        .unzip();
    pearson(&x, &y)
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrelationMatrix {
    pub tickers: Vec<String>,
    /// Row-major, `values[i][j]` pairs `tickers[i]` with `tickers[j]`.
    pub values: Vec<Vec<Option<f64>>>,
}

impl CorrelationMatrix {
    pub fn from_series(series: &[(String, Vec<Candle>)]) -> Self {
        let values = series
            .iter()
            .map(|(_, a)| series.iter().map(|(_, b)| aligned_correlation(a, b)).collect())
            .collect();
        Self {
            tickers: series.iter().map(|(t, _)| t.clone()).collect(),
            values,
        }
    }

    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.tickers.iter().position(|t| t == a)?;
        let j = self.tickers.iter().position(|t| t == b)?;
        self.values[i][j]
    }
}

/// Fetches every ticker concurrently and correlates their closes.
///
/// Tickers the exchange cannot serve are logged and left out of the matrix.
pub async fn correlation(
    exchange: &dyn Exchange,
    tickers: &[String],
    timeframe: Timeframe,
    limit: usize,
) -> CorrelationMatrix {
    let fetches = tickers.iter().map(|ticker| async move {
        let symbol = ticker.to_uppercase();
        (symbol.clone(), exchange.fetch_ohlcv(&symbol, timeframe, limit).await)
    });

    let mut series = Vec::with_capacity(tickers.len());
    for (ticker, result) in join_all(fetches).await {
        match result {
            Ok(candles) if !candles.is_empty() => series.push((ticker, candles)),
            Ok(_) => warn!("{}: no candles", ticker),
            Err(e) => warn!("{} skipped: {}", ticker, e),
        }
    }
    info!("Correlating {} of {} tickers", series.len(), tickers.len());
    CorrelationMatrix::from_series(&series)
}

/// Projects the compare ticker from the base ticker's move since the compare
/// series ended.
///
/// Over the compare window the base moved `b_change` and the compare moved
/// `c_change`. The base's later move is scaled by `c_change / b_change`.
#[derive(Debug, Clone, Serialize)]
pub struct PairTrade {
    pub base_ticker: String,
    pub compare_ticker: String,
    pub b_change: f64,
    pub c_change: f64,
    pub multiplier: f64,
    pub b_current_change: f64,
    pub expected_compare_change: f64,
    pub last_price: f64,
    pub expected_price: f64,
}

impl PairTrade {
    pub fn project(base_ticker: &str, compare_ticker: &str, base: &[Candle], compare: &[Candle]) -> Result<Self> {
        let (Some(compare_start), Some(compare_end)) = (compare.first(), compare.last()) else {
            bail!("no candles for {}", compare_ticker);
        };
        let Some(base_latest) = base.last() else {
            bail!("no candles for {}", base_ticker);
        };

        let base_closes = closes_by_time(base);
        let base_at = |ts: DateTime<Utc>| {
            base_closes
                .get(&ts)
                .copied()
                .ok_or_else(|| anyhow!("{} has no candle at {}", base_ticker, ts))
        };
        let ba = base_at(compare_start.timestamp)?;
        let be = base_at(compare_end.timestamp)?;

        let change = |from: f64, to: f64| (to - from) / from;
        let b_change = change(ba, be);
        let c_change = change(compare_start.close, compare_end.close);
        if b_change == 0.0 || !b_change.is_finite() || !c_change.is_finite() {
            bail!("{} did not move over the {} window", base_ticker, compare_ticker);
        }

        let multiplier = c_change / b_change;
        let b_current_change = change(be, base_latest.close);
        let expected_compare_change = b_current_change * multiplier;
        let last_price = compare_end.close;

        Ok(Self {
            base_ticker: base_ticker.to_uppercase(),
            compare_ticker: compare_ticker.to_uppercase(),
            b_change,
            c_change,
            multiplier,
            b_current_change,
            expected_compare_change,
            last_price,
            expected_price: last_price + last_price * expected_compare_change,
        })
    }
}

pub async fn pair_trade(
    exchange: &dyn Exchange,
    base_ticker: &str,
    compare_ticker: &str,
    timeframe: Timeframe,
    limit: usize,
) -> Result<PairTrade> {
    let base_symbol = base_ticker.to_uppercase();
    let compare_symbol = compare_ticker.to_uppercase();
    let (base, compare) = futures::join!(
        exchange.fetch_ohlcv(&base_symbol, timeframe, limit),
        exchange.fetch_ohlcv(&compare_symbol, timeframe, limit),
    );
    PairTrade::project(base_ticker, compare_ticker, &base?, &compare?)
}
