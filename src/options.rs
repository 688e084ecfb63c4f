//! Black-Scholes pricing for European options.
//!
//! Call = S·e^(-qT)·N(d1) - K·e^(-rT)·N(d2)
//! Put  = K·e^(-rT)·N(-d2) - S·e^(-qT)·N(-d1)
//!
//! d1 = [ln(S/K) + (r - q + σ²/2)T] / (σ√T), d2 = d1 - σ√T

use crate::error::{ExchangeError, PricingError};
use crate::exchange::Exchange;
use crate::models::Timeframe;
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use statrs::statistics::Statistics;
use std::fmt;
use tracing::warn;

pub const TRADING_DAYS: f64 = 252.0;
pub const IV_LOWER: f64 = 0.01;
pub const IV_UPPER: f64 = 3.0;

/// 10-year Treasury yield index, quoted in percent.
pub const RATE_TICKER: &str = "^TNX";

const IV_TOLERANCE: f64 = 1e-8;
const IV_MAX_ITERATIONS: usize = 200;
/// Largest accepted price residual, relative to the market price.
const IV_MAX_RESIDUAL: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionType::Call => write!(f, "call"),
            OptionType::Put => write!(f, "put"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlackScholes {
    pub spot: f64,
    pub strike: f64,
    /// Years; 7 days is 7/365.
    pub time_to_expiry: f64,
    pub risk_free_rate: f64,
    pub volatility: f64,
    pub dividend_yield: f64,
    normal: Normal,
}

impl BlackScholes {
    /// Rejects inputs the closed form is undefined for instead of returning NaN.
    pub fn new(
        spot: f64,
        strike: f64,
        time_to_expiry: f64,
        risk_free_rate: f64,
        volatility: f64,
    ) -> Result<Self, PricingError> {
        let positive = [
            ("spot", spot),
            ("strike", strike),
            ("time to expiry", time_to_expiry),
            ("volatility", volatility),
        ];
        for (name, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(PricingError::InvalidInput(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        let normal = Normal::new(0.0, 1.0).map_err(|e| PricingError::InvalidInput(e.to_string()))?;

        Ok(Self {
            spot,
            strike,
            time_to_expiry,
            risk_free_rate,
            volatility,
            dividend_yield: 0.0,
            normal,
        })
    }

    pub fn with_dividend_yield(mut self, dividend_yield: f64) -> Self {
        self.dividend_yield = dividend_yield;
        self
    }

    fn d1(&self) -> f64 {
        let numerator = (self.spot / self.strike).ln()
            + (self.risk_free_rate - self.dividend_yield + self.volatility.powi(2) / 2.0)
                * self.time_to_expiry;
        numerator / (self.volatility * self.time_to_expiry.sqrt())
    }

    fn d2(&self) -> f64 {
        self.d1() - self.volatility * self.time_to_expiry.sqrt()
    }

    fn n(&self, x: f64) -> f64 {
        self.normal.cdf(x)
    }

    pub fn price(&self, option_type: OptionType) -> f64 {
        let (d1, d2) = (self.d1(), self.d2());
        let spot_discount = (-self.dividend_yield * self.time_to_expiry).exp();
        let strike_discount = (-self.risk_free_rate * self.time_to_expiry).exp();

        match option_type {
            OptionType::Call => {
                self.spot * spot_discount * self.n(d1) - self.strike * strike_discount * self.n(d2)
            }
            OptionType::Put => {
                self.strike * strike_discount * self.n(-d2) - self.spot * spot_discount * self.n(-d1)
            }
        }
    }

    /// Call delta lies in [0, 1], put delta in [-1, 0].
    pub fn delta(&self, option_type: OptionType) -> f64 {
        let spot_discount = (-self.dividend_yield * self.time_to_expiry).exp();
        match option_type {
            OptionType::Call => spot_discount * self.n(self.d1()),
            OptionType::Put => spot_discount * (self.n(self.d1()) - 1.0),
        }
    }

    fn with_volatility(&self, volatility: f64) -> Self {
        Self {
            volatility,
            ..self.clone()
        }
    }

    /// The σ in [`IV_LOWER`, `IV_UPPER`] whose model price best matches `market_price`.
    ///
    /// Golden-section search on the squared price error. The model price is
    /// monotone in σ, so the error has a single minimum on the bracket.
    pub fn implied_volatility(&self, option_type: OptionType, market_price: f64) -> Result<f64, PricingError> {
        if !(market_price > 0.0 && market_price.is_finite()) {
            return Err(PricingError::InvalidInput(format!(
                "market price must be positive, got {}",
                market_price
            )));
        }

        let error = |sigma: f64| {
            let diff = self.with_volatility(sigma).price(option_type) - market_price;
            diff * diff
        };

        let ratio = (5f64.sqrt() - 1.0) / 2.0;
        let (mut lo, mut hi) = (IV_LOWER, IV_UPPER);
        let mut x1 = hi - ratio * (hi - lo);
        let mut x2 = lo + ratio * (hi - lo);
        let (mut f1, mut f2) = (error(x1), error(x2));

        for _ in 0..IV_MAX_ITERATIONS {
            if hi - lo < IV_TOLERANCE {
                break;
            }
            if f1 < f2 {
                hi = x2;
                x2 = x1;
                f2 = f1;
                x1 = hi - ratio * (hi - lo);
                f1 = error(x1);
            } else {
                lo = x1;
                x1 = x2;
                f1 = f2;
                x2 = lo + ratio * (hi - lo);
                f2 = error(x2);
            }
        }

        let sigma = (lo + hi) / 2.0;
        if error(sigma).sqrt() > IV_MAX_RESIDUAL * market_price.max(1.0) {
            return Err(PricingError::NoConvergence(market_price));
        }
        Ok(sigma)
    }
}

/// Annualized volatility of daily closes: population std of log returns × √252.
pub fn historical_volatility(closes: &[f64]) -> Option<f64> {
    if closes.len() < 3 || closes.iter().any(|c| *c <= 0.0) {
        return None;
    }
    let log_returns: Vec<f64> = closes.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
    let daily_std = log_returns.population_std_dev();
    daily_std.is_finite().then(|| daily_std * TRADING_DAYS.sqrt())
}

/// An OCC-style contract symbol such as `AAPL250117C00150000`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionContract {
    pub symbol: String,
    pub ticker: String,
    pub expiration: NaiveDate,
    pub option_type: OptionType,
    /// Dollars; the symbol carries strike × 1000.
    pub strike: f64,
}

impl OptionContract {
    pub fn parse(symbol: &str) -> Result<Self, PricingError> {
        let invalid = || PricingError::InvalidInput(format!("bad contract symbol {}", symbol));
        let re = Regex::new(r"^(?P<ticker>[A-Z]+)(?P<date>\d{6})(?P<kind>[CP])(?P<strike>\d+)$")
            .map_err(|e| PricingError::InvalidInput(e.to_string()))?;
        let upper = symbol.trim().to_uppercase();
        let caps = re.captures(&upper).ok_or_else(invalid)?;

        let expiration = NaiveDate::parse_from_str(&format!("20{}", &caps["date"]), "%Y%m%d")
            .map_err(|_| invalid())?;
        let option_type = match &caps["kind"] {
            "C" => OptionType::Call,
            _ => OptionType::Put,
        };
        let strike = caps["strike"].parse::<f64>().map_err(|_| invalid())? / 1000.0;

        Ok(Self {
            ticker: caps["ticker"].to_string(),
            symbol: upper.clone(),
            expiration,
            option_type,
            strike,
        })
    }

    pub fn days_to_expiry(&self, today: NaiveDate) -> i64 {
        (self.expiration - today).num_days()
    }
}

/// One priced contract, as shown in the option table.
#[derive(Debug, Clone, Serialize)]
pub struct OptionRow {
    pub contract: OptionContract,
    pub spot: f64,
    pub market_price: f64,
    pub dte: i64,
    pub implied_volatility: Option<f64>,
    /// Volatility used for delta: the implied one when it solved, else the fallback.
    pub sigma: f64,
    pub delta: f64,
    pub theoretical_price: f64,
    pub intrinsic: f64,
    pub extrinsic: f64,
}

impl OptionRow {
    /// Prices `contract` as of `today`.
    ///
    /// `fallback_sigma` (usually historical volatility) is used when the
    /// implied volatility cannot be solved from `market_price`.
    pub fn evaluate(
        contract: OptionContract,
        spot: f64,
        market_price: f64,
        risk_free_rate: f64,
        dividend_yield: f64,
        fallback_sigma: f64,
        today: NaiveDate,
    ) -> Result<Self, PricingError> {
        let dte = contract.days_to_expiry(today);
        if dte <= 0 {
            return Err(PricingError::InvalidInput(format!(
                "{} expired on {}",
                contract.symbol, contract.expiration
            )));
        }
        let time_to_expiry = dte as f64 / 365.0;
        // The solver replaces σ, so any valid starting value checks S, K and T.
        let model = BlackScholes::new(spot, contract.strike, time_to_expiry, risk_free_rate, IV_UPPER)?
            .with_dividend_yield(dividend_yield);

        let implied_volatility = model.implied_volatility(contract.option_type, market_price).ok();
        let sigma = match implied_volatility {
            Some(iv) => iv,
            None if fallback_sigma > 0.0 && fallback_sigma.is_finite() => fallback_sigma,
            None => {
                return Err(PricingError::InvalidInput(format!(
                    "no implied volatility for {} and fallback sigma is {}",
                    contract.symbol, fallback_sigma
                )));
            }
        };
        let model = model.with_volatility(sigma);

        let intrinsic = match contract.option_type {
            OptionType::Call => (spot - contract.strike).max(0.0),
            OptionType::Put => (contract.strike - spot).max(0.0),
        };

        Ok(Self {
            spot,
            market_price,
            dte,
            implied_volatility,
            sigma,
            delta: model.delta(contract.option_type),
            theoretical_price: model.price(contract.option_type),
            intrinsic,
            extrinsic: market_price - intrinsic,
            contract,
        })
    }
}

/// One contract of a listed option chain.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptionQuote {
    pub contract_symbol: String,
    pub strike: f64,
    #[serde(default)]
    pub last_price: Option<f64>,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
}

impl OptionQuote {
    /// Last trade, or the bid/ask midpoint for contracts that have not traded.
    pub fn market_price(&self) -> Option<f64> {
        let positive = |p: Option<f64>| p.filter(|p| *p > 0.0 && p.is_finite());
        positive(self.last_price).or_else(|| match (positive(self.bid), positive(self.ask)) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionChain {
    pub ticker: String,
    pub underlying_price: Option<f64>,
    pub expirations: Vec<NaiveDate>,
    pub calls: Vec<OptionQuote>,
    pub puts: Vec<OptionQuote>,
}

impl OptionChain {
    /// Prices every call, then every put. Contracts without a price or with
    /// an unparseable symbol are skipped.
    pub fn evaluate(
        &self,
        spot: f64,
        risk_free_rate: f64,
        dividend_yield: f64,
        fallback_sigma: f64,
        today: NaiveDate,
    ) -> Vec<OptionRow> {
        self.calls
            .iter()
            .chain(&self.puts)
            .filter_map(|quote| {
                let Some(price) = quote.market_price() else {
                    warn!("{} has no price", quote.contract_symbol);
                    return None;
                };
                let row = OptionContract::parse(&quote.contract_symbol).and_then(|contract| {
                    OptionRow::evaluate(contract, spot, price, risk_free_rate, dividend_yield, fallback_sigma, today)
                });
                row.map_err(|e| warn!("Skipping {}: {}", quote.contract_symbol, e)).ok()
            })
            .collect()
    }
}

/// Latest [`RATE_TICKER`] close as a decimal rate (4.5 -> 0.045).
pub async fn fetch_risk_free_rate(exchange: &dyn Exchange) -> Result<f64, ExchangeError> {
    let candles = exchange.fetch_ohlcv(RATE_TICKER, Timeframe::D1, 5).await?;
    candles
        .last()
        .map(|c| c.close / 100.0)
        .ok_or_else(|| ExchangeError::BadSymbol(format!("no candles for {}", RATE_TICKER)))
}
