use crate::aggregator::{self, CexAggregator};
use crate::candles::{CandleTable, FetchRequest, fetch_candles, fetch_multiple_candles};
use crate::config::AppConfig;
use crate::exchange::{self, Exchange, SUPPORTED_EXCHANGES};
use crate::indicators::Indicator;
use crate::models::Timeframe;
use crate::movers;
use crate::options::{self, OptionContract, OptionRow};
use crate::pairs::{self, CorrelationMatrix};
use crate::storage_utils::AsyncStorageManager;
use crate::tables;
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

pub const MARKETS_FILE: &str = "markets";

#[derive(Parser)]
#[command(name = "market-lens")]
#[command(about = "Crypto and stock market screener", long_about = None)]
pub struct Cli {
    /// Debug logging (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Candles with indicators for one ticker
    Candles {
        ticker: String,
        /// Single exchange; every configured exchange when omitted
        #[arg(short, long)]
        exchange: Option<String>,
        #[command(flatten)]
        candle: CandleArgs,
        /// Write `<exchange>_<symbol>.csv` files to this directory
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Rows to print per table
        #[arg(long, default_value_t = 10)]
        rows: usize,
    },
    /// Last values and trajectories of columns across tickers and exchanges
    Aggregate {
        #[arg(required = true)]
        tickers: Vec<String>,
        #[arg(short, long, value_delimiter = ',')]
        columns: Option<Vec<String>>,
        #[command(flatten)]
        candle: CandleArgs,
    },
    /// Rank tickers by how closely their changes follow a base ticker
    Compare {
        #[arg(required = true)]
        tickers: Vec<String>,
        #[arg(short, long, default_value = "BTC")]
        base: String,
    },
    /// Merged market listings with last prices
    Markets {
        #[arg(short, long)]
        base: Option<String>,
    },
    /// Top movers from Yahoo Finance
    Movers {
        #[arg(required = true)]
        tickers: Vec<String>,
        /// Quote tickers as crypto (`BTC-USD`)
        #[arg(long)]
        crypto: bool,
    },
    /// Project the compare ticker from the base ticker's recent move
    Pair {
        base: String,
        compare: String,
        #[arg(short, long, default_value = "1d")]
        interval: Timeframe,
        #[arg(short, long, default_value_t = 365)]
        limit: usize,
    },
    /// Correlation matrix of daily closes
    Correlation {
        #[arg(required = true, num_args = 2..)]
        tickers: Vec<String>,
        /// Crypto exchange to batch-fetch `TICKER/MARKET` from; Yahoo when omitted
        #[arg(short, long)]
        exchange: Option<String>,
        #[arg(short, long, default_value = "USDT")]
        market: String,
        #[arg(short, long, default_value_t = 365)]
        limit: usize,
    },
    /// Black-Scholes IV, delta and value split for a contract
    #[command(name = "option")]
    PriceOption {
        /// OCC symbol, e.g. AAPL250117C00150000
        contract: String,
        /// Observed option price
        #[arg(short, long)]
        price: f64,
        /// Underlying price; latest daily close when omitted
        #[arg(short, long)]
        spot: Option<f64>,
        #[command(flatten)]
        pricing: PricingArgs,
    },
    /// Black-Scholes rows for every listed call and put of a ticker
    Options {
        ticker: String,
        /// Expiry date (YYYY-MM-DD); the nearest one when omitted
        #[arg(short, long)]
        expiration: Option<NaiveDate>,
        #[command(flatten)]
        pricing: PricingArgs,
    },
    /// Exchanges that serve OHLCV without API keys
    Exchanges,
}

/// Quote and indicator settings shared by the candle commands.
#[derive(Args, Debug, Clone)]
pub struct CandleArgs {
    /// Quote currency used with --no-stable; a pair such as ETH/EUR brings its own
    #[arg(short, long, default_value = "USD")]
    pub market: String,
    /// Quote in --market instead of cycling stablecoins
    #[arg(long)]
    pub no_stable: bool,
    #[arg(short, long)]
    pub timeframe: Option<Timeframe>,
    #[arg(short, long)]
    pub limit: Option<usize>,
    /// Comma separated: rsi,ema,vwap
    #[arg(short, long, value_delimiter = ',')]
    pub indicators: Option<Vec<Indicator>>,
}

impl CandleArgs {
    /// The request for `ticker`. Quote flags only apply to bare tickers.
    pub fn request(&self, ticker: &str, config: &AppConfig) -> FetchRequest {
        let mut request = FetchRequest::new(ticker, config);
        if !FetchRequest::is_pair(ticker) {
            request.market = self.market.to_uppercase();
            request.stable_coin = !self.no_stable;
        }
        if let Some(timeframe) = self.timeframe {
            request.timeframe = timeframe;
        }
        if let Some(limit) = self.limit {
            request.limit = limit;
        }
        if let Some(indicators) = &self.indicators {
            request.indicators = indicators.clone();
        }
        request
    }
}

#[derive(Args, Debug, Clone)]
pub struct PricingArgs {
    /// Risk-free rate; the 10-year Treasury yield (or the config value) when omitted
    #[arg(short, long)]
    pub rate: Option<f64>,
    /// Fallback volatility; one year of historical volatility when omitted
    #[arg(long)]
    pub sigma: Option<f64>,
    /// Continuous dividend yield
    #[arg(short, long, default_value_t = 0.0)]
    pub dividend: f64,
}

pub async fn run(cli: Cli) -> Result<()> {
    let storage = AsyncStorageManager::new_relative("storage").await?;
    let config = AppConfig::load_or_default(&storage).await?;

    match cli.command {
        Commands::Candles {
            ticker,
            exchange,
            candle,
            csv,
            rows,
        } => {
            let request = candle.request(&ticker, &config);
            candles(request, exchange, csv, rows, config).await
        }
        Commands::Aggregate {
            tickers,
            columns,
            candle,
        } => {
            let mut config = config;
            if let Some(columns) = columns {
                config.aggregate_columns = columns;
            }
            let template = candle.request("", &config);
            aggregate(&tickers, &template, config).await
        }
        Commands::Compare { tickers, base } => {
            let aggregator = CexAggregator::from_config(config)?;
            let rows = aggregator.compare_candles(&tickers, &base).await;
            println!("{}", tables::similarity_table(&base, &rows));
            Ok(())
        }
        Commands::Markets { base } => {
            let aggregator = CexAggregator::from_config(config)?;
            let markets = aggregator.get_last_price(base.as_deref()).await;
            storage.save(MARKETS_FILE, &markets).await?;
            println!("{}", tables::markets_table(&markets));
            Ok(())
        }
        Commands::Movers { tickers, crypto } => {
            let yahoo = exchange::build("yahoo", Default::default())?;
            let report = movers::run(yahoo.as_ref(), &tickers, crypto, &config, &storage).await?;
            if report.results.is_empty() {
                println!("No data found.");
                return Ok(());
            }
            println!(
                "{}",
                tables::movers_table(&report, config.movers.top, &config.indicators, config.display_utc_offset_hours)
            );
            Ok(())
        }
        Commands::Pair {
            base,
            compare,
            interval,
            limit,
        } => {
            let yahoo = exchange::build("yahoo", Default::default())?;
            let trade = pairs::pair_trade(yahoo.as_ref(), &base, &compare, interval, limit).await?;
            println!("{}", tables::pair_table(&trade));
            Ok(())
        }
        Commands::Correlation {
            tickers,
            exchange: exchange_name,
            market,
            limit,
        } => {
            let matrix = match exchange_name {
                Some(name) => {
                    let client = exchange::build(&name, config.filters_for(&name))?;
                    let batch = fetch_multiple_candles(client.as_ref(), &tickers, &market, Timeframe::D1, limit).await?;
                    let series: Vec<_> = tickers.iter().map(|t| t.to_uppercase()).zip(batch).collect();
                    CorrelationMatrix::from_series(&series)
                }
                None => {
                    let yahoo = exchange::build("yahoo", Default::default())?;
                    pairs::correlation(yahoo.as_ref(), &tickers, Timeframe::D1, limit).await
                }
            };
            println!("{}", tables::correlation_table(&matrix));
            Ok(())
        }
        Commands::PriceOption {
            contract,
            price,
            spot,
            pricing,
        } => price_option(&contract, price, spot, &pricing, &config).await,
        Commands::Options {
            ticker,
            expiration,
            pricing,
        } => option_chain(&ticker, expiration, &pricing, &config).await,
        Commands::Exchanges => {
            println!("{}", tables::exchanges_table(SUPPORTED_EXCHANGES));
            Ok(())
        }
    }
}

async fn candles(
    request: FetchRequest,
    exchange_name: Option<String>,
    csv: Option<PathBuf>,
    rows: usize,
    config: AppConfig,
) -> Result<()> {
    let candle_tables: Vec<CandleTable> = match exchange_name {
        Some(name) => {
            let client = exchange::build(&name, config.filters_for(&name))?;
            vec![fetch_candles(client.as_ref(), &request, &config).await?]
        }
        None => CexAggregator::from_config(config.clone())?.get_candles(&request).await,
    };

    let export = match csv {
        Some(dir) => Some(AsyncStorageManager::new(dir).await?),
        None => None,
    };

    for table in &candle_tables {
        if table.is_empty() {
            warn!("{}: no market for {}", table.exchange, table.ticker);
            continue;
        }
        println!(
            "{}",
            tables::candles_table(table, rows, &config.indicators, config.display_utc_offset_hours)
        );
        if let Some(storage) = &export {
            let path = storage
                .save_csv(&table.file_stem(), &table.rows, config.display_utc_offset_hours)
                .await?;
            info!("Saved {:?}", path);
        }
    }
    Ok(())
}

async fn aggregate(tickers: &[String], template: &FetchRequest, config: AppConfig) -> Result<()> {
    let aggregator = CexAggregator::from_config(config.clone())?;
    let candles = aggregator.aggregate_candles(tickers, template).await;

    let series = aggregator::aggregate_columns(&candles, &config.aggregate_columns);
    println!("{}", tables::columns_table(&series));
    for column in &config.aggregate_columns {
        let max = aggregator::find_max_value(&series, column);
        let min = aggregator::find_min_value(&series, column);
        if let (Some((max_ticker, max)), Some((min_ticker, min))) = (max, min) {
            println!("{}: max {} {:.4}, min {} {:.4}", column, max_ticker, max, min_ticker, min);
        }
    }

    // Trajectories are reported per exchange.
    for name in aggregator.exchange_names() {
        let exchange_tables: Vec<CandleTable> = candles
            .values()
            .flatten()
            .filter(|t| t.exchange == name)
            .cloned()
            .collect();
        let info = aggregator::with_trajectories(&exchange_tables, &config.add_info, config.trajectory_window);
        if info.is_empty() {
            continue;
        }
        println!("\n{}\n{}", name, tables::columns_table(&info));
        if let Some((ticker, traj)) = aggregator::find_max_value(&info, "traj_rsi") {
            println!("Highest RSI trajectory: {} ({:.4})", ticker, traj);
        }
    }
    Ok(())
}

/// `rate` when given, else the Treasury yield, else the configured rate.
async fn risk_free_rate(rate: Option<f64>, yahoo: &dyn Exchange, config: &AppConfig) -> f64 {
    if let Some(rate) = rate {
        return rate;
    }
    if !config.auto_risk_free_rate {
        return config.risk_free_rate;
    }
    match options::fetch_risk_free_rate(yahoo).await {
        Ok(rate) => {
            info!("Risk-free rate {:.4} from {}", rate, options::RATE_TICKER);
            rate
        }
        Err(e) => {
            warn!(
                "{} unavailable ({}), using configured rate {}",
                options::RATE_TICKER,
                e,
                config.risk_free_rate
            );
            config.risk_free_rate
        }
    }
}

/// Spot and fallback volatility for `ticker`. One year of daily closes is
/// fetched only when either is missing.
async fn underlying(
    yahoo: &dyn Exchange,
    ticker: &str,
    spot: Option<f64>,
    sigma: Option<f64>,
) -> Result<(f64, f64)> {
    let closes: Vec<f64> = if spot.is_none() || sigma.is_none() {
        let candles = yahoo
            .fetch_ohlcv(ticker, Timeframe::D1, options::TRADING_DAYS as usize)
            .await
            .with_context(|| format!("daily candles for {}", ticker))?;
        candles.iter().map(|c| c.close).collect()
    } else {
        Vec::new()
    };

    let spot = spot
        .or_else(|| closes.last().copied())
        .with_context(|| format!("no spot price for {}", ticker))?;
    let sigma = sigma
        .or_else(|| options::historical_volatility(&closes))
        .with_context(|| format!("not enough history for {} volatility", ticker))?;
    Ok((spot, sigma))
}

async fn price_option(
    contract: &str,
    price: f64,
    spot: Option<f64>,
    pricing: &PricingArgs,
    config: &AppConfig,
) -> Result<()> {
    let contract = OptionContract::parse(contract)?;
    let yahoo = exchange::yahoo_client()?;
    let (spot, sigma) = underlying(&yahoo, &contract.ticker, spot, pricing.sigma).await?;
    let rate = risk_free_rate(pricing.rate, &yahoo, config).await;

    let row = OptionRow::evaluate(
        contract,
        spot,
        price,
        rate,
        pricing.dividend,
        sigma,
        Utc::now().date_naive(),
    )?;
    if row.implied_volatility.is_none() {
        warn!(
            "Implied volatility did not solve for {}, using sigma {:.4}",
            row.contract.symbol, sigma
        );
    }
    println!("{}", tables::option_table(&[row]));
    Ok(())
}

async fn option_chain(
    ticker: &str,
    expiration: Option<NaiveDate>,
    pricing: &PricingArgs,
    config: &AppConfig,
) -> Result<()> {
    let yahoo = exchange::yahoo_client()?;
    let chain = yahoo
        .fetch_option_chain(ticker, expiration)
        .await
        .with_context(|| format!("option chain for {}", ticker))?;
    let (spot, sigma) = underlying(&yahoo, &chain.ticker, chain.underlying_price, pricing.sigma).await?;
    let rate = risk_free_rate(pricing.rate, &yahoo, config).await;

    let rows = chain.evaluate(spot, rate, pricing.dividend, sigma, Utc::now().date_naive());
    info!(
        "{}: {} of {} contracts priced, expiries {:?}",
        chain.ticker,
        rows.len(),
        chain.calls.len() + chain.puts.len(),
        chain.expirations
    );
    if rows.is_empty() {
        println!("No data found.");
        return Ok(());
    }
    println!("{}", tables::option_table(&rows));
    Ok(())
}
