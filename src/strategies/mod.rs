/// Operation strategies plugged into the bulk scheduler
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ReplacePolicy;
use crate::data::BarStore;
use crate::error::Result;
use crate::types::{Bar, DateRange, SeriesKey};

pub mod copy;
pub mod download;
pub mod export;
pub mod import;

pub use copy::CopyStrategy;
pub use download::DownloadStrategy;
pub use export::ExportStrategy;
pub use import::ImportStrategy;

/// Bars removed and written by one store update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReport {
    pub deleted: usize,
    pub written: usize,
}

/// Write `bars` into `key` under `policy`.
///
/// `ReplaceRange` clears `requested` when given, otherwise the span the
/// incoming bars cover.
pub async fn write_bars(
    store: &dyn BarStore,
    key: &SeriesKey,
    bars: &[Bar],
    policy: ReplacePolicy,
    requested: Option<&DateRange>,
) -> Result<WriteReport> {
    let deleted = match policy {
        ReplacePolicy::Merge => 0,
        ReplacePolicy::ReplaceAll => store.delete_bars(key, None).await?,
        ReplacePolicy::ReplaceRange => match requested.copied().or_else(|| DateRange::covering(bars)) {
            Some(range) => store.delete_bars(key, Some(&range)).await?,
            None => 0,
        },
    };

    let written = store.upsert_bars(key, bars).await?;
    debug!("{}: {} deleted, {} written ({})", key, deleted, written, policy);

    Ok(WriteReport { deleted, written })
}
