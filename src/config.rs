use crate::indicators::Indicator;
use crate::models::Timeframe;
use crate::storage_utils::AsyncStorageManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

pub const CONFIG_FILE: &str = "config";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CandleConfig {
    pub timeframe: Timeframe,
    pub limit: usize,
}

impl Default for CandleConfig {
    fn default() -> Self {
        Self {
            timeframe: Timeframe::M1,
            limit: 300,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct IndicatorConfig {
    pub enabled: Vec<Indicator>,
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    /// fast, mid, slow
    pub ema_windows: Vec<usize>,
    pub volume_window: usize,
    /// Average and relative volume on `qty * close` instead of the raw quantity.
    pub quote_volume: bool,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            enabled: vec![Indicator::Rsi, Indicator::Ema],
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            ema_windows: vec![9, 20, 200],
            volume_window: 30,
            quote_volume: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MoversConfig {
    pub interval: Timeframe,
    /// Candles per ticker; 288 five-minute bars is one day.
    pub range_limit: usize,
    pub volume_window: usize,
    /// Appended as `-QUOTE` to crypto tickers.
    pub quote: String,
    pub top: usize,
}

impl Default for MoversConfig {
    fn default() -> Self {
        Self {
            interval: Timeframe::M5,
            range_limit: 288,
            volume_window: 15,
            quote: "USD".to_string(),
            top: 15,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub exchanges: Vec<String>,
    pub stable_coins: Vec<String>,
    pub candles: CandleConfig,
    pub indicators: IndicatorConfig,
    pub movers: MoversConfig,
    pub aggregate_columns: Vec<String>,
    pub add_info: Vec<String>,
    pub trajectory_window: usize,
    pub display_utc_offset_hours: i32,
    pub risk_free_rate: f64,
    /// Look the rate up from the 10-year Treasury yield when none is given.
    pub auto_risk_free_rate: bool,
    /// Per-exchange `key = value` filters on raw market records.
    pub market_filters: HashMap<String, HashMap<String, String>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            exchanges: strings(&["binance", "coinbase"]),
            stable_coins: strings(&["USD", "USDC", "USDT", "DAI"]),
            candles: CandleConfig::default(),
            indicators: IndicatorConfig::default(),
            movers: MoversConfig::default(),
            aggregate_columns: strings(&["close", "rsi", "vwap_spread", "spread_200"]),
            add_info: strings(&["rsi", "spread_9", "spread_20", "spread_200", "relative_volume"]),
            trajectory_window: 5,
            display_utc_offset_hours: -8,
            risk_free_rate: 0.0468,
            auto_risk_free_rate: true,
            market_filters: HashMap::from([
                (
                    "binance".to_string(),
                    HashMap::from([("status".to_string(), "TRADING".to_string())]),
                ),
                (
                    "coinbase".to_string(),
                    HashMap::from([("status".to_string(), "online".to_string())]),
                ),
            ]),
        }
    }
}

impl AppConfig {
    /// Loads `config.json`, writing the defaults back when the file is missing.
    /// A file that exists but does not parse is an error and is left untouched.
    pub async fn load_or_default(storage: &AsyncStorageManager) -> anyhow::Result<Self> {
        match storage.load::<AppConfig>(CONFIG_FILE).await {
            Ok(config) => {
                info!("Loaded configuration from {:?}", storage.base_dir);
                Ok(config)
            }
            Err(e) if is_not_found(&e) => {
                warn!("No configuration in {:?}, writing defaults", storage.base_dir);
                let config = AppConfig::default();
                storage.save(CONFIG_FILE, &config).await?;
                Ok(config)
            }
            Err(e) => Err(e.context(format!("{}.json", CONFIG_FILE))),
        }
    }

    pub fn filters_for(&self, exchange: &str) -> HashMap<String, String> {
        self.market_filters.get(exchange).cloned().unwrap_or_default()
    }
}

fn is_not_found(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<std::io::Error>()
        .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{"exchanges": ["coinbase"], "indicators": {"enabled": ["rsi", "vwap"], "rsi_period": 7}}"#,
        )
        .unwrap();

        assert_eq!(config.exchanges, vec!["coinbase"]);
        assert_eq!(config.indicators.enabled, vec![Indicator::Rsi, Indicator::Vwap]);
        assert_eq!(config.indicators.rsi_period, 7);
        assert_eq!(config.indicators.ema_windows, vec![9, 20, 200]);
        assert_eq!(config.stable_coins, vec!["USD", "USDC", "USDT", "DAI"]);
        assert_eq!(config.candles.timeframe, Timeframe::M1);
    }

    #[test]
    fn test_filters_for_unknown_exchange_is_empty() {
        let config = AppConfig::default();
        assert_eq!(config.filters_for("binance")["status"], "TRADING");
        assert!(config.filters_for("yahoo").is_empty());
    }

    #[tokio::test]
    async fn test_load_or_default_writes_defaults() {
        let dir = std::env::temp_dir().join(format!("market-lens-config-{}", std::process::id()));
        let storage = AsyncStorageManager::new(&dir).await.unwrap();

        let config = AppConfig::load_or_default(&storage).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(dir.join("config.json").exists());

        let reloaded: AppConfig = storage.load(CONFIG_FILE).await.unwrap();
        assert_eq!(reloaded.exchanges, config.exchanges);
        assert_eq!(reloaded.market_filters, config.market_filters);
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_config_is_not_overwritten() {
        let dir = std::env::temp_dir().join(format!("market-lens-bad-config-{}", std::process::id()));
        let storage = AsyncStorageManager::new(&dir).await.unwrap();
        let contents = r#"{"exchanges": ["coinbase"], "risk_free_rate": 0.05,}"#;
        tokio::fs::write(dir.join("config.json"), contents).await.unwrap();

        let err = AppConfig::load_or_default(&storage).await.unwrap_err();

        assert!(format!("{:#}", err).contains("config.json"));
        let on_disk = tokio::fs::read_to_string(dir.join("config.json")).await.unwrap();
        assert_eq!(on_disk, contents);
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
