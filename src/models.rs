use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// --- Candles ---

/// One OHLCV record. `volume` is the base-asset quantity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    H6,
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::H6 => 21_600,
            Timeframe::D1 => 86_400,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" | "60m" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "6h" => Ok(Timeframe::H6),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!("unknown timeframe '{}'", other)),
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(value: Timeframe) -> Self {
        value.as_str().to_string()
    }
}

// --- Symbols ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Slash,
    Dash,
}

impl Delimiter {
    pub fn as_char(&self) -> char {
        match self {
            Delimiter::Slash => '/',
            Delimiter::Dash => '-',
        }
    }
}

/// A (base, quote) pair. Both sides are stored uppercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub base: String,
    pub quote: String,
}

impl Symbol {
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            base: base.trim().to_uppercase(),
            quote: quote.trim().to_uppercase(),
        }
    }

    pub fn format(&self, delimiter: Delimiter) -> String {
        format!("{}{}{}", self.base, delimiter.as_char(), self.quote)
    }

    /// Splits `BASE/QUOTE` or `BASE-QUOTE`. A `:SETTLE` suffix is ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = strip_settlement(raw);
        let (base, quote) = raw.split_once('/').or_else(|| raw.split_once('-'))?;
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        Some(Self::new(base, quote))
    }
}

/// `BTC/USDC:USDC` -> `BTC/USDC`
pub fn strip_settlement(symbol: &str) -> &str {
    symbol.split(':').next().unwrap_or(symbol)
}

// --- Markets ---

/// One exchange-reported market, merged across exchanges for price comparison.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MarketListing {
    pub base: String,
    pub quote: String,
    pub symbol: String,
    /// Exchange-native market id (`BTCUSDT`, `BTC-USD`, ...).
    pub id: String,
    pub price: Option<f64>,
    pub exchange_name: String,
}

/// Returns the first key of `keys` present in `info`, read as a number.
pub fn match_price_keys(info: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|key| info.get(*key))
        .and_then(value_as_f64)
}

pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse().ok(),
        _ => None,
    }
}
