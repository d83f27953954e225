/// Import: load bar files from a directory into the bar store
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::write_bars;
use crate::bulk::{OperationStrategy, RunHandle};
use crate::data::{find_import_file, read_bars, BarStore};
use crate::error::{BulkError, Result};
use crate::types::{OperationKind, WorkItem};

pub struct ImportStrategy {
    store: Arc<dyn BarStore>,
}

impl ImportStrategy {
    pub fn new(store: Arc<dyn BarStore>) -> Self {
        ImportStrategy { store }
    }
}

#[async_trait]
impl OperationStrategy for ImportStrategy {
    fn kind(&self) -> OperationKind {
        OperationKind::Import
    }

    async fn process_item(&self, item: &WorkItem, run: &RunHandle) -> Result<()> {
        let ctx = run.context();
        let dir = ctx.require_directory()?;
        let ticker = &item.instrument.ticker;

        let path = find_import_file(dir, ticker, item.resolution).ok_or_else(|| {
            BulkError::FileNotFound(format!("{} {} under {}", ticker, item.resolution, dir.display()))
        })?;
        debug!("Reading {}", path.display());

        let tz = ctx.timezone;
        let file = path.clone();
        let mut bars = tokio::task::spawn_blocking(move || read_bars(&file, tz))
            .await
            .map_err(|e| BulkError::InternalError(format!("file reader task failed: {}", e)))??;

        if let Some(range) = &item.range {
            bars.retain(|b| range.contains(b.timestamp));
        }

        let key = item.series(&ctx.provider);
        let report = write_bars(self.store.as_ref(), &key, &bars, ctx.replace, item.range.as_ref()).await?;

        info!(
            "📥 Imported {} {} bars for {} from {} ({} replaced)",
            report.written,
            item.resolution,
            ticker,
            path.display(),
            report.deleted
        );
        Ok(())
    }
}
