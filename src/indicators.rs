//! Rolling indicators over a candle series.
//!
//! Every function returns one entry per input row. `None` marks rows where the
//! window has not filled yet.

use crate::config::IndicatorConfig;
use crate::models::Candle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ta::Next;
use ta::indicators::{ExponentialMovingAverage, SimpleMovingAverage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Indicator {
    Rsi,
    Ema,
    Vwap,
}

impl FromStr for Indicator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rsi" => Ok(Indicator::Rsi),
            "ema" => Ok(Indicator::Ema),
            "vwap" => Ok(Indicator::Vwap),
            other => Err(format!("unknown indicator '{}'", other)),
        }
    }
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Indicator::Rsi => "rsi",
            Indicator::Ema => "ema",
            Indicator::Vwap => "vwap",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EmaPoint {
    pub window: usize,
    pub ema: Option<f64>,
    /// `(ema - close) / |close| * 100`
    pub spread: Option<f64>,
    pub above: Option<bool>,
}

/// A candle with its derived columns.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AugmentedCandle {
    pub candle: Candle,
    pub change: Option<f64>,
    /// Volume the averages run on: `volume_qty * close`, or `volume_qty` when
    /// quote volume is turned off.
    pub volume: f64,
    pub average_volume: Option<f64>,
    pub relative_volume: Option<f64>,
    pub rsi: Option<f64>,
    pub emas: Vec<EmaPoint>,
    pub vwap: Option<f64>,
    pub vwap_spread: Option<f64>,
}

impl AugmentedCandle {
    /// Named column access: `close`, `rsi`, `ema_20`, `spread_200`, `ema_9_over`, ...
    pub fn column(&self, name: &str) -> Option<f64> {
        let c = &self.candle;
        match name {
            "open" => Some(c.open),
            "high" => Some(c.high),
            "low" => Some(c.low),
            "close" => Some(c.close),
            "volume_qty" => Some(c.volume),
            "volume" => Some(self.volume),
            "change" => self.change,
            "average_volume" => self.average_volume,
            "relative_volume" => self.relative_volume,
            "rsi" => self.rsi,
            "vwap" => self.vwap,
            "vwap_spread" => self.vwap_spread,
            other => self.ema_column(other),
        }
    }

    fn ema_column(&self, name: &str) -> Option<f64> {
        if let Some(rest) = name.strip_prefix("spread_") {
            let window: usize = rest.parse().ok()?;
            return self.ema(window)?.spread;
        }
        let rest = name.strip_prefix("ema_")?;
        match rest.strip_suffix("_over") {
            Some(window) => {
                let above = self.ema(window.parse().ok()?)?.above?;
                Some(if above { 1.0 } else { 0.0 })
            }
            None => self.ema(rest.parse().ok()?)?.ema,
        }
    }

    fn ema(&self, window: usize) -> Option<&EmaPoint> {
        self.emas.iter().find(|e| e.window == window)
    }
}

/// Column names present on `rows`, in output order.
pub fn column_names(rows: &[AugmentedCandle]) -> Vec<String> {
    let mut names: Vec<String> = [
        "open",
        "high",
        "low",
        "close",
        "volume_qty",
        "change",
        "volume",
        "average_volume",
        "relative_volume",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let Some(first) = rows.first() else {
        return names;
    };
    if rows.iter().any(|r| r.rsi.is_some()) {
        names.push("rsi".to_string());
    }
    for ema in &first.emas {
        names.push(format!("ema_{}", ema.window));
        names.push(format!("spread_{}", ema.window));
        names.push(format!("ema_{}_over", ema.window));
    }
    if rows.iter().any(|r| r.vwap.is_some()) {
        names.push("vwap".to_string());
        names.push("vwap_spread".to_string());
    }
    names
}

// --- Series functions ---

/// `(v[i] / v[i-1] - 1) * 100`
pub fn pct_change(values: &[f64]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    for (i, &value) in values.iter().enumerate() {
        let change = i
            .checked_sub(1)
            .map(|prev| values[prev])
            .filter(|&prev| prev != 0.0)
            .map(|prev| (value / prev - 1.0) * 100.0);
        out.push(change);
    }
    out
}

pub fn rolling_mean(values: &[f64], window: usize) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; values.len()];
    }
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, &value) in values.iter().enumerate() {
        sum += value;
        if i >= window {
            sum -= values[i - window];
        }
        out.push(if i + 1 >= window {
            Some(sum / window as f64)
        } else {
            None
        });
    }
    out
}

/// `value / average`, `None` where the average is missing or zero.
pub fn relative(values: &[f64], averages: &[Option<f64>]) -> Vec<Option<f64>> {
    values
        .iter()
        .zip(averages)
        .map(|(&v, avg)| avg.filter(|&a| a != 0.0).map(|a| v / a))
        .collect()
}

/// RSI with Wilder's smoothing.
///
/// Wilder's average is an EMA with `alpha = 1/period`, which is a standard
/// EMA of length `2 * period - 1`. Both averages start from the mean of the
/// first `period` gains and losses, so the first `period` rows are `None`.
pub fn rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    let Some(length) = period.checked_mul(2).and_then(|p| p.checked_sub(1)) else {
        return out;
    };
    let (gains, losses): (Vec<f64>, Vec<f64>) = closes
        .windows(2)
        .map(|w| {
            let diff = w[1] - w[0];
            (diff.max(0.0), (-diff).max(0.0))
        })
        .unzip();

    let avg_gains = seeded_ema(&gains, period, length);
    let avg_losses = seeded_ema(&losses, period, length);
    for (i, (gain, loss)) in avg_gains.into_iter().zip(avg_losses).enumerate() {
        if let (Some(gain), Some(loss)) = (gain, loss) {
            out[i + 1] = Some(rsi_from_averages(gain, loss));
        }
    }
    out
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss <= 0.0 {
        return if avg_gain <= 0.0 { 50.0 } else { 100.0 };
    }
    let rs = avg_gain / avg_loss;
    (100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0)
}

/// EMA of `window` closes. The first value, at row `window - 1`, is the
/// simple mean of the first `window` closes.
pub fn ema(closes: &[f64], window: usize) -> Vec<Option<f64>> {
    seeded_ema(closes, window, window)
}

/// EMA of the given `length` started from the mean of the first `seed` values.
fn seeded_ema(values: &[f64], seed: usize, length: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if seed == 0 || values.len() < seed {
        return out;
    }
    let (Ok(mut mean), Ok(mut average)) = (SimpleMovingAverage::new(seed), ExponentialMovingAverage::new(length))
    else {
        return out;
    };

    let mut start = 0.0;
    for &value in &values[..seed] {
        start = mean.next(value);
    }
    out[seed - 1] = Some(average.next(start));
    for (i, &value) in values.iter().enumerate().skip(seed) {
        out[i] = Some(average.next(value));
    }
    out
}

/// `(reference - close) / |close| * 100`
pub fn spread(reference: &[Option<f64>], closes: &[f64]) -> Vec<Option<f64>> {
    reference
        .iter()
        .zip(closes)
        .map(|(r, &close)| {
            let r = (*r)?;
            (close != 0.0).then(|| (r - close) / close.abs() * 100.0)
        })
        .collect()
}

/// VWAP of the typical price `(h + l + c) / 3`, restarting every UTC day.
pub fn vwap(candles: &[Candle]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(candles.len());
    let mut session = None;
    let mut cum_pv = 0.0;
    let mut cum_volume = 0.0;

    for candle in candles {
        let day = candle.timestamp.date_naive();
        if session != Some(day) {
            session = Some(day);
            cum_pv = 0.0;
            cum_volume = 0.0;
        }
        let typical = (candle.high + candle.low + candle.close) / 3.0;
        cum_pv += typical * candle.volume;
        cum_volume += candle.volume;
        out.push((cum_volume > 0.0).then(|| cum_pv / cum_volume));
    }
    out
}

// --- Applicator ---

/// Adds change/volume columns and the `enabled` indicators to `candles`.
pub fn apply_indicators(
    candles: Vec<Candle>,
    config: &IndicatorConfig,
    enabled: &[Indicator],
) -> Vec<AugmentedCandle> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles
        .iter()
        .map(|c| if config.quote_volume { c.volume * c.close } else { c.volume })
        .collect();

    let changes = pct_change(&closes);
    let average_volumes = rolling_mean(&volumes, config.volume_window);
    let relative_volumes = relative(&volumes, &average_volumes);

    let rsis = if enabled.contains(&Indicator::Rsi) {
        rsi(&closes, config.rsi_period)
    } else {
        vec![None; candles.len()]
    };

    let ema_columns: Vec<(usize, Vec<Option<f64>>, Vec<Option<f64>>)> = if enabled.contains(&Indicator::Ema) {
        config
            .ema_windows
            .iter()
            .map(|&window| {
                let values = ema(&closes, window);
                let spreads = spread(&values, &closes);
                (window, values, spreads)
            })
            .collect()
    } else {
        Vec::new()
    };

    let (vwaps, vwap_spreads) = if enabled.contains(&Indicator::Vwap) {
        let values = vwap(&candles);
        let spreads = spread(&values, &closes);
        (values, spreads)
    } else {
        (vec![None; candles.len()], vec![None; candles.len()])
    };

    candles
        .into_iter()
        .enumerate()
        .map(|(i, candle)| {
            let emas = ema_columns
                .iter()
                .map(|(window, values, spreads)| EmaPoint {
                    window: *window,
                    ema: values[i],
                    spread: spreads[i],
                    above: values[i].map(|e| candle.close > e),
                })
                .collect();

            AugmentedCandle {
                change: changes[i],
                volume: volumes[i],
                average_volume: average_volumes[i],
                relative_volume: relative_volumes[i],
                rsi: rsis[i],
                emas,
                vwap: vwaps[i],
                vwap_spread: vwap_spreads[i],
                candle,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};

    fn candles(closes: &[f64], volume: f64) -> Vec<Candle> {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                timestamp: start + Duration::minutes(i as i64),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume,
            })
            .collect()
    }

    fn wavy(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0 + (i as f64 * 0.13).cos() * 3.0)
            .collect()
    }

    #[test]
    fn test_pct_change() {
        let changes = pct_change(&[100.0, 110.0, 99.0]);
        assert_eq!(changes[0], None);
        assert!((changes[1].unwrap() - 10.0).abs() < 1e-9);
        assert!((changes[2].unwrap() + 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_rolling_mean() {
        let means = rolling_mean(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(means, vec![None, None, Some(2.0), Some(3.0)]);
    }

    #[test]
    fn test_relative_volume_is_one_on_constant_volume() {
        let rows = apply_indicators(candles(&[10.0; 60], 5.0), &IndicatorConfig::default(), &[]);
        let window = IndicatorConfig::default().volume_window;

        assert!(rows[..window - 1].iter().all(|r| r.relative_volume.is_none()));
        for row in &rows[window - 1..] {
            assert!((row.relative_volume.unwrap() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_rsi_bounded_for_non_constant_series() {
        for n in [20, 50, 200] {
            for value in rsi(&wavy(n), 14).into_iter().flatten() {
                assert!((0.0..=100.0).contains(&value), "RSI out of range: {}", value);
            }
        }
        let falling: Vec<f64> = (0..40).map(|i| 100.0 - i as f64 * 0.5).collect();
        assert!(rsi(&falling, 14).into_iter().flatten().all(|v| (0.0..=100.0).contains(&v)));
    }

    #[test]
    fn test_rsi_warmup_and_extremes() {
        let rising: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let values = rsi(&rising, 14);
        assert!(values[..14].iter().all(Option::is_none));
        assert_eq!(values[14], Some(100.0));
        assert_eq!(rsi(&[5.0; 20], 14)[19], Some(50.0));
    }

    #[test]
    fn test_ema_warmup_and_convergence() {
        let values = ema(&[10.0; 25], 20);
        assert!(values[..19].iter().all(Option::is_none));
        assert!((values[24].unwrap() - 10.0).abs() < 1e-12);
        assert!(ema(&[1.0, 2.0], 0).iter().all(Option::is_none));
    }

    #[test]
    fn test_ema_starts_from_simple_mean() {
        let closes: Vec<f64> = (1..=20).map(f64::from).collect();
        let values = ema(&closes, 20);
        assert!((values[19].unwrap() - 10.5).abs() < 1e-12);

        let values = ema(&[2.0, 4.0, 6.0, 10.0], 3);
        assert!(values[..2].iter().all(Option::is_none));
        assert!((values[2].unwrap() - 4.0).abs() < 1e-12);
        // k = 2 / (3 + 1)
        assert!((values[3].unwrap() - 7.0).abs() < 1e-12);
        assert!(ema(&[1.0, 2.0], 3).iter().all(Option::is_none));
    }

    #[test]
    fn test_rsi_wilder_averages_start_from_simple_mean() {
        // diffs +2, -1, +2
        let values = rsi(&[10.0, 12.0, 11.0, 13.0], 2);
        assert!(values[..2].iter().all(Option::is_none));
        // gain 1.0, loss 0.5
        assert!((values[2].unwrap() - 200.0 / 3.0).abs() < 1e-9);
        // gain 1.5, loss 0.25
        assert!((values[3].unwrap() - 600.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_spread_sign() {
        let spreads = spread(&[Some(110.0), None], &[100.0, 100.0]);
        assert!((spreads[0].unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(spreads[1], None);
    }

    #[test]
    fn test_vwap_resets_each_day() {
        let start = DateTime::from_timestamp(1_700_006_400, 0).unwrap(); // 00:00 UTC
        let mk = |offset_h: i64, price: f64, volume: f64| Candle {
            timestamp: start + Duration::hours(offset_h),
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        };
        let series = vec![mk(1, 10.0, 1.0), mk(2, 20.0, 3.0), mk(25, 50.0, 2.0)];

        let values = vwap(&series);
        assert_eq!(values[0], Some(10.0));
        assert!((values[1].unwrap() - 17.5).abs() < 1e-9);
        assert_eq!(values[2], Some(50.0));
    }

    #[test]
    fn test_apply_indicators_columns() {
        let config = IndicatorConfig::default();
        let rows = apply_indicators(
            candles(&wavy(250), 2.0),
            &config,
            &[Indicator::Rsi, Indicator::Ema, Indicator::Vwap],
        );
        let last = rows.last().unwrap();

        assert_eq!(last.emas.len(), 3);
        assert!(last.column("rsi").is_some());
        assert!(last.column("ema_200").is_some());
        assert!(last.column("spread_9").is_some());
        assert!(matches!(last.column("ema_20_over"), Some(v) if v == 0.0 || v == 1.0));
        assert!(last.column("vwap_spread").is_some());
        assert_eq!(last.column("volume"), Some(last.candle.close * 2.0));
        assert_eq!(last.column("spread_50"), None);
        assert_eq!(rows[100].column("ema_200"), None);

        let names = column_names(&rows);
        assert!(names.contains(&"spread_200".to_string()));
        assert!(names.contains(&"vwap".to_string()));
    }

    #[test]
    fn test_disabled_indicators_leave_columns_empty() {
        let rows = apply_indicators(candles(&wavy(40), 1.0), &IndicatorConfig::default(), &[Indicator::Rsi]);
        assert!(rows.iter().all(|r| r.emas.is_empty() && r.vwap.is_none()));
        assert!(rows.last().unwrap().rsi.is_some());
        assert!(!column_names(&rows).contains(&"vwap".to_string()));
    }
}
