/// Centralized error types for bulk bar operations
use thiserror::Error;

use crate::types::Resolution;

#[derive(Error, Debug)]
pub enum BulkError {
    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid operation context: {0}")]
    InvalidContext(String),

    #[error("Instrument set is empty")]
    EmptyInstrumentSet,

    #[error("No resolution enabled")]
    NoResolutionEnabled,

    // Provider Errors
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Provider not connected: {0}")]
    ProviderNotConnected(String),

    #[error("Request rejected by provider: {0}")]
    RequestRejected(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    // Data Errors
    #[error("Cannot aggregate {from} bars into {to} bars")]
    UnsupportedAggregation { from: Resolution, to: Resolution },

    #[error("Invalid bar data: {0}")]
    InvalidBarData(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    // File I/O Errors
    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    // Run Errors
    #[error("Worker panicked: {0}")]
    WorkerPanic(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, BulkError>;

impl BulkError {
    /// Errors detected before workers start; they fail the whole run
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BulkError::ConfigError(_)
                | BulkError::ConfigSource(_)
                | BulkError::InvalidParameter(_)
                | BulkError::InvalidContext(_)
                | BulkError::EmptyInstrumentSet
                | BulkError::NoResolutionEnabled
                | BulkError::ProviderNotFound(_)
                | BulkError::ProviderNotConnected(_)
        )
    }

    /// Errors worth another attempt on the Download retry path
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BulkError::RequestRejected(_)
                | BulkError::RequestFailed(_)
                | BulkError::ProviderNotConnected(_)
                | BulkError::StorageError(_)
                | BulkError::FileError(_)
        )
    }

    /// Get error code for logging
    pub fn error_code(&self) -> &str {
        match self {
            BulkError::ConfigError(_) => "CFG_001",
            BulkError::ConfigSource(_) => "CFG_002",
            BulkError::InvalidParameter(_) => "CFG_003",
            BulkError::InvalidContext(_) => "CFG_004",
            BulkError::EmptyInstrumentSet => "CFG_005",
            BulkError::NoResolutionEnabled => "CFG_006",
            BulkError::ProviderNotFound(_) => "PROV_001",
            BulkError::ProviderNotConnected(_) => "PROV_002",
            BulkError::RequestRejected(_) => "PROV_003",
            BulkError::RequestFailed(_) => "PROV_004",
            BulkError::UnsupportedAggregation { .. } => "DATA_001",
            BulkError::InvalidBarData(_) => "DATA_002",
            BulkError::StorageError(_) => "DATA_003",
            BulkError::FileError(_) => "FILE_001",
            BulkError::FileNotFound(_) => "FILE_002",
            BulkError::CsvError(_) => "FILE_003",
            BulkError::JsonError(_) => "FILE_004",
            BulkError::WorkerPanic(_) => "RUN_001",
            BulkError::InternalError(_) => "INT_001",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(BulkError::EmptyInstrumentSet.is_configuration());
        assert!(BulkError::ProviderNotConnected("x".into()).is_configuration());
        assert!(!BulkError::RequestRejected("x".into()).is_configuration());

        assert!(BulkError::RequestRejected("x".into()).is_retryable());
        assert!(!BulkError::InvalidBarData("x".into()).is_retryable());
    }

    #[test]
    fn test_unsupported_aggregation_message() {
        let err = BulkError::UnsupportedAggregation {
            from: Resolution::Week,
            to: Resolution::Month,
        };
        assert_eq!(err.to_string(), "Cannot aggregate week bars into month bars");
        assert_eq!(err.error_code(), "DATA_001");
    }
}
