use thiserror::Error as ThisError;

/// Failure modes of an exchange request.
///
/// `BadSymbol` is the only variant the symbol resolver treats as "try the next
/// candidate". Everything else aborts the search.
#[derive(ThisError, Debug)]
pub enum ExchangeError {
    #[error("bad symbol: {0}")]
    BadSymbol(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("rate limited by {exchange}, banned for {wait_secs:.1}s")]
    RateLimited { exchange: String, wait_secs: f64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ExchangeError::Parse(err.to_string())
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::Parse(err.to_string())
    }
}

#[derive(ThisError, Debug, PartialEq)]
pub enum PricingError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("implied volatility did not converge for price {0}")]
    NoConvergence(f64),
}
