use crate::indicators::{AugmentedCandle, column_names};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

// STORAGE MANAGER

pub struct AsyncStorageManager {
    // Absolute path to the storage directory (e.g., ".../target/debug/storage")
    pub base_dir: PathBuf,
}

impl AsyncStorageManager {
    /// Storage directory relative to the running executable.
    pub async fn new_relative<P: AsRef<Path>>(relative_path: P) -> anyhow::Result<Self> {
        let exe_path = std::env::current_exe()?;
        let base_dir = exe_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Could not find binary directory"))?
            .join(relative_path);

        Self::new(base_dir).await
    }

    /// Storage rooted at `base_dir`. The directory is created up front so
    /// saves never have to check for it.
    pub async fn new<P: AsRef<Path>>(base_dir: P) -> anyhow::Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir).await?;
        }
        Ok(Self { base_dir })
    }

    /// Serializes `data` to `<filename>.json`.
    pub async fn save<T: Serialize>(&self, filename: &str, data: &T) -> anyhow::Result<()> {
        let json_bytes = serde_json::to_vec_pretty(data)?;
        self.write_atomic(&format!("{}.json", filename), json_bytes).await
    }

    pub async fn load<T: DeserializeOwned>(&self, filename: &str) -> anyhow::Result<T> {
        let path = self.base_dir.join(format!("{}.json", filename));
        // serde_json validates UTF-8 while parsing, so skip read_to_string.
        let content = fs::read(path).await?;
        let data = serde_json::from_slice(&content)?;
        Ok(data)
    }

    /// Writes `rows` to `<filename>.csv` with timestamps shifted by `utc_offset_hours`.
    pub async fn save_csv(
        &self,
        filename: &str,
        rows: &[AugmentedCandle],
        utc_offset_hours: i32,
    ) -> anyhow::Result<PathBuf> {
        let bytes = candles_to_csv(rows, utc_offset_hours)?;
        let file_name = format!("{}.csv", filename);
        self.write_atomic(&file_name, bytes).await?;
        Ok(self.base_dir.join(file_name))
    }

    /// Writes to a `.tmp` sibling first, then renames over the target, so a
    /// crash mid-write leaves the previous file intact.
    async fn write_atomic(&self, file_name: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        let final_path = self.base_dir.join(file_name);
        let tmp_path = self.base_dir.join(format!("{}.tmp", file_name));

        fs::write(&tmp_path, bytes).await?;
        fs::rename(tmp_path, &final_path).await?;
        debug!("Wrote {:?}", final_path);
        Ok(())
    }
}

/// Out-of-range offsets fall back to UTC.
pub fn display_offset(utc_offset_hours: i32) -> FixedOffset {
    FixedOffset::east_opt(utc_offset_hours * 3600).unwrap_or(Utc.fix())
}

pub fn format_timestamp(ts: DateTime<Utc>, utc_offset_hours: i32) -> String {
    ts.with_timezone(&display_offset(utc_offset_hours))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn candles_to_csv(rows: &[AugmentedCandle], utc_offset_hours: i32) -> anyhow::Result<Vec<u8>> {
    let columns = column_names(rows);
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header = vec!["timestamp".to_string()];
    header.extend(columns.iter().cloned());
    writer.write_record(&header)?;

    for row in rows {
        let mut record = vec![format_timestamp(row.candle.timestamp, utc_offset_hours)];
        record.extend(
            columns
                .iter()
                .map(|name| row.column(name).map(|v| v.to_string()).unwrap_or_default()),
        );
        writer.write_record(&record)?;
    }

    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("failed to flush csv: {}", e.error()))
}
