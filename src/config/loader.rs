/// Settings loading: defaults -> TOML file -> BULKBARS_* environment
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{BulkError, Result};

/// Environment variable prefix, e.g. `BULKBARS_THREAD_COUNT=8`
pub const ENV_PREFIX: &str = "BULKBARS";

/// Bar file format for import/export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Csv,
    Json,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Json => "json",
        }
    }

    pub fn from_path(path: &Path) -> Option<FileFormat> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" | "txt" => Some(FileFormat::Csv),
            "json" => Some(FileFormat::Json),
            _ => None,
        }
    }
}

impl FromStr for FileFormat {
    type Err = BulkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(FileFormat::Csv),
            "json" => Ok(FileFormat::Json),
            other => Err(BulkError::InvalidParameter(format!("Unknown file format: {}", other))),
        }
    }
}

/// How multiple resolutions are laid out on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileLayout {
    /// `{dir}/{resolution}/{ticker}.{ext}`
    Directories,
    /// `{dir}/{ticker}_{resolution}.{ext}`
    Flat,
}

impl FromStr for FileLayout {
    type Err = BulkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "directories" | "dirs" | "nested" => Ok(FileLayout::Directories),
            "flat" => Ok(FileLayout::Flat),
            other => Err(BulkError::InvalidParameter(format!("Unknown file layout: {}", other))),
        }
    }
}

/// Bar store backend used by the binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Jsonl,
}

/// How incoming bars are written over existing ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePolicy {
    /// Upsert by timestamp
    #[default]
    Merge,
    /// Delete the covered range first
    ReplaceRange,
    /// Delete the whole series first
    ReplaceAll,
}

impl FromStr for ReplacePolicy {
    type Err = BulkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "merge" | "upsert" => Ok(ReplacePolicy::Merge),
            "replace_range" | "range" => Ok(ReplacePolicy::ReplaceRange),
            "replace_all" | "all" => Ok(ReplacePolicy::ReplaceAll),
            other => Err(BulkError::InvalidParameter(format!("Unknown replace policy: {}", other))),
        }
    }
}

impl fmt::Display for ReplacePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplacePolicy::Merge => "merge",
            ReplacePolicy::ReplaceRange => "replace_range",
            ReplacePolicy::ReplaceAll => "replace_all",
        };
        f.write_str(s)
    }
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Storage
    pub data_dir: PathBuf,
    pub store: StoreKind,

    // Scheduling
    pub thread_count: usize,
    pub retry_limit: u32,
    pub poll_interval_ms: u64,

    // Calendar
    pub timezone: String,

    // Files
    pub export_format: FileFormat,
    pub export_layout: FileLayout,
    pub export_batch_size: usize,

    // Logging
    pub log_level: String,
    pub log_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_dir: PathBuf::from("data"),
            store: StoreKind::Jsonl,
            thread_count: 4,
            retry_limit: 3,
            poll_interval_ms: 500,
            timezone: "UTC".to_string(),
            export_format: FileFormat::Csv,
            export_layout: FileLayout::Directories,
            export_batch_size: 5000,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Settings {
    /// Parsed exchange time zone for calendar bucketing
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| BulkError::ConfigError(format!("Unknown time zone: {}", self.timezone)))
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    /// Render effective settings as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| BulkError::ConfigError(format!("Failed to render settings: {}", e)))
    }
}

/// Load settings. A missing file is fine when `required` is false.
pub fn load_settings<P: AsRef<Path>>(path: Option<P>, required: bool) -> Result<Settings> {
    let defaults = Settings::default();

    let mut builder = config::Config::builder()
        .set_default("data_dir", defaults.data_dir.to_string_lossy().to_string())?
        .set_default("store", "jsonl")?
        .set_default("thread_count", defaults.thread_count as i64)?
        .set_default("retry_limit", defaults.retry_limit as i64)?
        .set_default("poll_interval_ms", defaults.poll_interval_ms as i64)?
        .set_default("timezone", defaults.timezone.clone())?
        .set_default("export_format", "csv")?
        .set_default("export_layout", "directories")?
        .set_default("export_batch_size", defaults.export_batch_size as i64)?
        .set_default("log_level", defaults.log_level.clone())?
        .set_default("log_json", defaults.log_json)?;

    if let Some(path) = path {
        let path = path.as_ref();
        if required && !path.exists() {
            return Err(BulkError::ConfigError(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(config::File::from(path).required(required));
    }

    let settings: Settings = builder
        .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
        .build()?
        .try_deserialize()?;

    validate_settings(&settings)?;

    Ok(settings)
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.thread_count == 0 {
        return Err(BulkError::ConfigError("thread_count must be >= 1".to_string()));
    }

    if settings.retry_limit == 0 {
        return Err(BulkError::ConfigError("retry_limit must be >= 1".to_string()));
    }

    if settings.poll_interval_ms == 0 {
        return Err(BulkError::ConfigError("poll_interval_ms must be > 0".to_string()));
    }

    if settings.export_batch_size == 0 {
        return Err(BulkError::ConfigError("export_batch_size must be > 0".to_string()));
    }

    settings.tz()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let settings = load_settings::<&Path>(None, false).unwrap();
        assert!(settings.thread_count >= 1);
        assert_eq!(settings.tz().unwrap(), Tz::UTC);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "thread_count = 9").unwrap();
        writeln!(file, "timezone = \"America/New_York\"").unwrap();
        writeln!(file, "export_layout = \"flat\"").unwrap();

        let settings = load_settings(Some(file.path()), true).unwrap();
        assert_eq!(settings.thread_count, 9);
        assert_eq!(settings.export_layout, FileLayout::Flat);
        assert_eq!(settings.tz().unwrap(), chrono_tz::America::New_York);
    }

    #[test]
    fn test_missing_required_file() {
        let err = load_settings(Some("does/not/exist.toml"), true).unwrap_err();
        assert_eq!(err.error_code(), "CFG_001");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.retry_limit = 0;
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.timezone = "Mars/Olympus".to_string();
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_replace_policy_parsing() {
        assert_eq!("replace-range".parse::<ReplacePolicy>().unwrap(), ReplacePolicy::ReplaceRange);
        assert_eq!("merge".parse::<ReplacePolicy>().unwrap(), ReplacePolicy::Merge);
        assert!("overwrite".parse::<ReplacePolicy>().is_err());
    }

    #[test]
    fn test_settings_render_to_toml() {
        let rendered = Settings::default().to_toml().unwrap();
        assert!(rendered.contains("thread_count = 4"));
    }
}
