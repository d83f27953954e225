/// Copy: rebuild coarser series by aggregation, or transfer series between providers
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::bulk::{OperationStrategy, RunHandle};
use crate::data::{rebuild, BarStore};
use crate::error::Result;
use crate::types::{OperationKind, SeriesKey, WorkItem};

pub struct CopyStrategy {
    store: Arc<dyn BarStore>,
}

impl CopyStrategy {
    pub fn new(store: Arc<dyn BarStore>) -> Self {
        CopyStrategy { store }
    }

    /// Purge the target range and write the source bars unchanged
    async fn transfer(&self, source: &SeriesKey, target: &SeriesKey, item: &WorkItem) -> Result<()> {
        let bars = self.store.get_bars(source, item.range.as_ref()).await?;
        let purged = self.store.delete_bars(target, item.range.as_ref()).await?;
        let written = self.store.upsert_bars(target, &bars).await?;

        info!("📋 Copied {} bars {} -> {} ({} purged)", written, source, target, purged);
        Ok(())
    }
}

#[async_trait]
impl OperationStrategy for CopyStrategy {
    fn kind(&self) -> OperationKind {
        OperationKind::Copy
    }

    async fn process_item(&self, item: &WorkItem, run: &RunHandle) -> Result<()> {
        let ctx = run.context();
        let ticker = &item.instrument.ticker;
        let target = item.series(&ctx.provider);

        let Some(finer) = item.resolution.aggregation_source() else {
            // finest resolution: nothing to aggregate from
            return self.transfer(&item.series(ctx.source()), &target, item).await;
        };

        // the finer stage already ran on the target in this run
        let origin = if ctx.is_enabled(finer) { ctx.provider.as_str() } else { ctx.source() };
        let source = SeriesKey::new(origin, ticker.clone(), finer);

        if ctx.copies_between_providers() && self.store.count(&source, item.range.as_ref()).await? == 0 {
            debug!("No {} bars at {}, copying {} as stored", finer, origin, item.resolution);
            return self.transfer(&item.series(ctx.source()), &target, item).await;
        }

        let report = rebuild(self.store.as_ref(), &source, &target, item.range.as_ref(), ctx.timezone).await?;
        info!(
            "📋 Rebuilt {} from {} {} bars: {} written, {} purged",
            target, report.source_bars, finer, report.written, report.purged
        );
        Ok(())
    }
}
