/// Per-invocation operation context
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;

use super::loader::{FileFormat, FileLayout, ReplacePolicy, Settings};
use crate::error::{BulkError, Result};
use crate::types::{DateRange, Instrument, OperationKind, Resolution};

/// Everything one bulk operation needs. Read-only to workers.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Provider whose bar store is written (or read, for export)
    pub provider: String,
    /// Provider copied from; `None` means the target provider itself
    pub source_provider: Option<String>,
    pub instruments: Vec<Instrument>,
    pub resolutions: BTreeSet<Resolution>,
    pub thread_count: usize,
    /// Maximum attempts per download item
    pub retry_limit: u32,
    pub range: Option<DateRange>,
    pub replace: ReplacePolicy,
    /// Start downloads at the last stored bar
    pub incremental: bool,
    pub timezone: Tz,
    pub poll_interval: Duration,

    // Import/export files
    pub directory: Option<PathBuf>,
    pub file_format: FileFormat,
    pub layout: FileLayout,
    pub batch_size: usize,
}

impl OperationContext {
    pub fn new(provider: impl Into<String>, settings: &Settings) -> Result<Self> {
        Ok(OperationContext {
            provider: provider.into(),
            source_provider: None,
            instruments: Vec::new(),
            resolutions: BTreeSet::new(),
            thread_count: settings.thread_count,
            retry_limit: settings.retry_limit,
            range: None,
            replace: ReplacePolicy::default(),
            incremental: false,
            timezone: settings.tz()?,
            poll_interval: settings.poll_interval(),
            directory: None,
            file_format: settings.export_format,
            layout: settings.export_layout,
            batch_size: settings.export_batch_size,
        })
    }

    pub fn with_instruments<I, S>(mut self, tickers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instruments = tickers.into_iter().map(Instrument::new).collect();
        self
    }

    pub fn with_resolutions<I: IntoIterator<Item = Resolution>>(mut self, resolutions: I) -> Self {
        self.resolutions = resolutions.into_iter().collect();
        self
    }

    pub fn with_threads(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_range(mut self, range: Option<DateRange>) -> Self {
        self.range = range;
        self
    }

    pub fn with_replace(mut self, replace: ReplacePolicy) -> Self {
        self.replace = replace;
        self
    }

    pub fn with_source_provider(mut self, source: impl Into<String>) -> Self {
        self.source_provider = Some(source.into());
        self
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn is_enabled(&self, resolution: Resolution) -> bool {
        self.resolutions.contains(&resolution)
    }

    /// Provider bars are copied from
    pub fn source(&self) -> &str {
        self.source_provider.as_deref().unwrap_or(&self.provider)
    }

    pub fn copies_between_providers(&self) -> bool {
        self.source() != self.provider
    }

    /// Directory for file based operations
    pub fn require_directory(&self) -> Result<&PathBuf> {
        self.directory
            .as_ref()
            .ok_or_else(|| BulkError::InvalidContext("no directory given".to_string()))
    }

    /// Configuration checks done before any worker starts
    pub fn validate(&self, kind: OperationKind) -> Result<()> {
        if self.provider.trim().is_empty() {
            return Err(BulkError::InvalidContext("provider id is empty".to_string()));
        }

        if self.instruments.is_empty() {
            return Err(BulkError::EmptyInstrumentSet);
        }

        if self.resolutions.is_empty() {
            return Err(BulkError::NoResolutionEnabled);
        }

        if self.thread_count == 0 {
            return Err(BulkError::InvalidContext("thread count must be >= 1".to_string()));
        }

        if self.retry_limit == 0 {
            return Err(BulkError::InvalidContext("retry limit must be >= 1".to_string()));
        }

        if self.poll_interval.is_zero() {
            return Err(BulkError::InvalidContext("poll interval must be > 0".to_string()));
        }

        match kind {
            OperationKind::Import => {
                let dir = self.require_directory()?;
                if !dir.is_dir() {
                    return Err(BulkError::InvalidContext(format!(
                        "import directory does not exist: {}",
                        dir.display()
                    )));
                }
            }
            OperationKind::Export => {
                self.require_directory()?;
                if self.batch_size == 0 {
                    return Err(BulkError::InvalidContext("batch size must be > 0".to_string()));
                }
            }
            OperationKind::Download | OperationKind::Copy => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> OperationContext {
        OperationContext::new("local", &Settings::default())
            .unwrap()
            .with_instruments(["AAPL", "MSFT"])
            .with_resolutions([Resolution::Day])
    }

    #[test]
    fn test_valid_context() {
        assert!(context().validate(OperationKind::Copy).is_ok());
    }

    #[test]
    fn test_empty_instrument_set_is_configuration_error() {
        let ctx = context().with_instruments(Vec::<String>::new());
        let err = ctx.validate(OperationKind::Download).unwrap_err();
        assert!(matches!(err, BulkError::EmptyInstrumentSet));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let err = context().with_threads(0).validate(OperationKind::Copy).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_export_requires_directory() {
        assert!(context().validate(OperationKind::Export).is_err());
        let dir = tempfile::tempdir().unwrap();
        assert!(context().with_directory(dir.path()).validate(OperationKind::Export).is_ok());
    }

    #[test]
    fn test_source_defaults_to_target() {
        let ctx = context();
        assert_eq!(ctx.source(), "local");
        assert!(!ctx.copies_between_providers());
        assert!(ctx.with_source_provider("vendor").copies_between_providers());
    }
}
