use super::Exchange;
use crate::error::ExchangeError;
use crate::models::{Candle, MarketListing, Timeframe};
use crate::options::{OptionChain, OptionQuote};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

const BASE_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const OPTIONS_URL: &str = "https://query2.finance.yahoo.com/v7/finance/options";
const NAME: &str = "yahoo";

/// Yahoo Finance chart API. Tickers are used verbatim (`AAPL`, `^TNX`, `BTC-USD`),
/// so slash-delimited pair symbols are rejected without a request.
pub struct Yahoo {
    client: Client,
    base_url: String,
    options_url: String,
}

#[derive(Deserialize, Debug)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Deserialize, Debug)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Deserialize, Debug)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Deserialize, Debug)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Deserialize, Debug)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Deserialize, Debug)]
struct OptionsResponse {
    #[serde(rename = "optionChain")]
    option_chain: OptionChainBody,
}

#[derive(Deserialize, Debug)]
struct OptionChainBody {
    result: Option<Vec<OptionChainResult>>,
    error: Option<ChartError>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct OptionChainResult {
    underlying_symbol: Option<String>,
    #[serde(default)]
    expiration_dates: Vec<i64>,
    quote: Option<UnderlyingQuote>,
    #[serde(default)]
    options: Vec<OptionSeries>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct UnderlyingQuote {
    regular_market_price: Option<f64>,
}

#[derive(Deserialize, Debug)]
struct OptionSeries {
    #[serde(default)]
    calls: Vec<OptionQuote>,
    #[serde(default)]
    puts: Vec<OptionQuote>,
}

#[derive(Deserialize, Debug, Default)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

impl Yahoo {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: BASE_URL.to_string(),
            options_url: OPTIONS_URL.to_string(),
        }
    }

    /// Listed contracts for `ticker`. Without `expiration` Yahoo returns the
    /// nearest expiry.
    pub async fn fetch_option_chain(
        &self,
        ticker: &str,
        expiration: Option<NaiveDate>,
    ) -> Result<OptionChain, ExchangeError> {
        let ticker = ticker.trim().to_uppercase();
        let mut request = self.client.get(format!("{}/{}", self.options_url, ticker));
        if let Some(date) = expiration {
            let midnight = date
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| ExchangeError::Parse(format!("bad expiration {}", date)))?;
            request = request.query(&[("date", midnight.and_utc().timestamp().to_string())]);
        }

        debug!("GET yahoo options {} {:?}", ticker, expiration);
        let parsed: OptionsResponse = self.get_json(request).await?;
        parse_option_chain(&ticker, parsed)
    }

    async fn get_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ExchangeError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        match serde_json::from_str(&body) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => {
                Err(ExchangeError::Network(format!("yahoo returned {}: {}", status, body)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn lookup_error(symbol: &str, error: ChartError) -> ExchangeError {
    if error.code == "Not Found" {
        ExchangeError::BadSymbol(format!("{}: {}", symbol, error.description))
    } else {
        ExchangeError::Network(format!("{}: {}", error.code, error.description))
    }
}

fn parse_option_chain(ticker: &str, response: OptionsResponse) -> Result<OptionChain, ExchangeError> {
    if let Some(error) = response.option_chain.error {
        return Err(lookup_error(ticker, error));
    }
    let result = response
        .option_chain
        .result
        .and_then(|mut results| results.pop())
        .ok_or_else(|| ExchangeError::BadSymbol(format!("no option chain for {}", ticker)))?;

    let mut chain = OptionChain {
        ticker: result.underlying_symbol.unwrap_or_else(|| ticker.to_string()),
        underlying_price: result.quote.and_then(|q| q.regular_market_price),
        expirations: result
            .expiration_dates
            .iter()
            .filter_map(|&ts| DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.date_naive())
            .collect(),
        ..Default::default()
    };
    for series in result.options {
        chain.calls.extend(series.calls);
        chain.puts.extend(series.puts);
    }
    Ok(chain)
}

fn interval(timeframe: Timeframe) -> Result<&'static str, ExchangeError> {
    match timeframe {
        Timeframe::M1 => Ok("1m"),
        Timeframe::M5 => Ok("5m"),
        Timeframe::M15 => Ok("15m"),
        Timeframe::M30 => Ok("30m"),
        Timeframe::H1 => Ok("60m"),
        Timeframe::D1 => Ok("1d"),
        other => Err(ExchangeError::NotSupported(format!("yahoo has no {} candles", other))),
    }
}

/// Seconds of history to request for `limit` candles. Daily bars skip weekends.
fn lookback_secs(timeframe: Timeframe, limit: usize) -> i64 {
    let bars = limit as i64;
    match timeframe {
        Timeframe::D1 => (bars * 7 / 5 + 5) * timeframe.seconds(),
        _ => bars * timeframe.seconds(),
    }
}

#[async_trait]
impl Exchange for Yahoo {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        if symbol.contains('/') || symbol.trim().is_empty() {
            return Err(ExchangeError::BadSymbol(format!("yahoo does not quote {}", symbol)));
        }
        let interval = interval(timeframe)?;
        let period2 = Utc::now().timestamp();
        let period1 = period2 - lookback_secs(timeframe, limit);
        let query = [
            ("interval", interval.to_string()),
            ("period1", period1.to_string()),
            ("period2", period2.to_string()),
            ("includePrePost", "true".to_string()),
        ];

        debug!("GET yahoo chart {} {:?}", symbol, query);
        let request = self
            .client
            .get(format!("{}/{}", self.base_url, symbol.trim().to_uppercase()))
            .query(&query);
        let parsed: ChartResponse = self.get_json(request).await?;

        let mut candles = parse_chart(symbol, parsed)?;
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
        Ok(candles)
    }

    async fn fetch_markets(&self) -> Result<Vec<MarketListing>, ExchangeError> {
        Err(ExchangeError::NotSupported("yahoo has no market listing".to_string()))
    }
}

/// Rows with any null OHLC field (halts, pre-market gaps) are dropped.
fn parse_chart(symbol: &str, response: ChartResponse) -> Result<Vec<Candle>, ExchangeError> {
    if let Some(error) = response.chart.error {
        return Err(lookup_error(symbol, error));
    }

    let result = response
        .chart
        .result
        .and_then(|mut results| results.pop())
        .ok_or_else(|| ExchangeError::BadSymbol(format!("no chart data for {}", symbol)))?;
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();

    let candles = result
        .timestamp
        .iter()
        .enumerate()
        .filter_map(|(i, &ts)| {
            Some(Candle {
                timestamp: DateTime::from_timestamp(ts, 0)?,
                open: at(&quote.open, i)?,
                high: at(&quote.high, i)?,
                low: at(&quote.low, i)?,
                close: at(&quote.close, i)?,
                volume: at(&quote.volume, i).unwrap_or(0.0),
            })
        })
        .collect();
    Ok(candles)
}

fn at(series: &[Option<f64>], i: usize) -> Option<f64> {
    series.get(i).copied().flatten()
}
