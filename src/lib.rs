pub mod types;
pub mod error;
pub mod config;
pub mod data;
pub mod provider;
pub mod bulk;
pub mod strategies;

pub use types::*;
pub use error::{BulkError, Result};
