/// Export: write stored series to CSV or JSON files
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::bulk::{OperationStrategy, RunHandle};
use crate::data::{export_path, BarFileWriter, BarStore};
use crate::error::{BulkError, Result};
use crate::types::{Bar, OperationKind, WorkItem};

pub struct ExportStrategy {
    store: Arc<dyn BarStore>,
}

impl ExportStrategy {
    pub fn new(store: Arc<dyn BarStore>) -> Self {
        ExportStrategy { store }
    }
}

#[async_trait]
impl OperationStrategy for ExportStrategy {
    fn kind(&self) -> OperationKind {
        OperationKind::Export
    }

    async fn prepare(&self, run: &RunHandle) -> Result<()> {
        let dir = run.context().require_directory()?;
        tokio::fs::create_dir_all(dir).await?;
        Ok(())
    }

    async fn process_item(&self, item: &WorkItem, run: &RunHandle) -> Result<()> {
        let ctx = run.context();
        let dir = ctx.require_directory()?;
        let key = item.series(&ctx.provider);

        let available = self.store.count(&key, item.range.as_ref()).await?;
        if available == 0 {
            debug!("Nothing stored for {}, skipping export", key);
            return Ok(());
        }

        let path = export_path(dir, &item.instrument.ticker, item.resolution, ctx.layout, ctx.file_format);
        let format = ctx.file_format;
        let target = path.clone();
        let mut writer = on_blocking_pool(move || BarFileWriter::create(&target, format)).await?;

        match &item.range {
            Some(range) => {
                let bars = self.store.get_bars(&key, Some(range)).await?;
                writer = write_page(writer, bars).await?;
            }
            None => {
                let batch = ctx.batch_size.max(1);
                let mut index = 0;
                loop {
                    let page = self.store.get_bars_page(&key, index, batch).await?;
                    if page.is_empty() {
                        break;
                    }
                    let fetched = page.len();
                    writer = write_page(writer, page).await?;
                    index += fetched;
                    if fetched < batch {
                        break;
                    }
                }
            }
        }

        let written = on_blocking_pool(move || writer.finish()).await?;
        info!("📤 Exported {} {} bars to {}", written, key, path.display());
        Ok(())
    }
}

/// File writes stay off the async workers
async fn on_blocking_pool<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BulkError::InternalError(format!("file writer task failed: {}", e)))?
}

async fn write_page(mut writer: BarFileWriter, bars: Vec<Bar>) -> Result<BarFileWriter> {
    on_blocking_pool(move || {
        writer.write_bars(&bars)?;
        Ok(writer)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::{run_operation, CancelToken, TracingProgress};
    use crate::config::{FileFormat, FileLayout, OperationContext, Settings};
    use crate::data::{read_bars, MemoryBarStore};
    use crate::types::{DateRange, Resolution, SeriesKey};
    use chrono::{Duration, TimeZone, Utc};
    use chrono_tz::Tz;
    use std::path::Path;

    async fn seeded_store() -> Arc<MemoryBarStore> {
        let store = Arc::new(MemoryBarStore::new());
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let bars: Vec<Bar> = (0..12)
            .map(|i| Bar::new(start + Duration::days(i), 10.0, 11.0, 9.0, 10.0 + i as f64, 100.0))
            .collect();
        store
            .upsert_bars(&SeriesKey::new("local", "AAPL", Resolution::Day), &bars)
            .await
            .unwrap();
        store
    }

    fn context(dir: &Path) -> OperationContext {
        let mut ctx = OperationContext::new("local", &Settings::default())
            .unwrap()
            .with_instruments(["AAPL", "EMPTY"])
            .with_resolutions([Resolution::Day])
            .with_directory(dir);
        ctx.batch_size = 5;
        ctx
    }

    fn sink() -> Arc<TracingProgress> {
        Arc::new(TracingProgress::new(CancelToken::new()))
    }

    #[tokio::test]
    async fn test_paged_export_writes_every_bar() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store().await;

        let summary = run_operation(context(dir.path()), Arc::new(ExportStrategy::new(store)), sink()).await;
        assert!(summary.is_clean());

        let path = dir.path().join("day").join("AAPL.csv");
        let bars = read_bars(&path, Tz::UTC).unwrap();
        assert_eq!(bars.len(), 12);
        assert_eq!(bars.last().unwrap().close, 21.0);

        // empty series produce no file
        assert!(!dir.path().join("day").join("EMPTY.csv").exists());
    }

    #[tokio::test]
    async fn test_flat_json_export_with_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store().await;
        let range = DateRange::new(
            Utc.with_ymd_and_hms(2024, 2, 3, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 5, 0, 0, 0).unwrap(),
        )
        .unwrap();

        let mut ctx = context(dir.path()).with_range(Some(range));
        ctx.file_format = FileFormat::Json;
        ctx.layout = FileLayout::Flat;

        let summary = run_operation(ctx, Arc::new(ExportStrategy::new(store)), sink()).await;
        assert!(summary.is_clean());

        let bars = read_bars(&dir.path().join("AAPL_day.json"), Tz::UTC).unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].timestamp, range.from);
    }

    #[tokio::test]
    async fn test_file_writes_run_off_the_async_worker() {
        let caller = std::thread::current().id();
        let writer_thread = on_blocking_pool(|| Ok(std::thread::current().id())).await.unwrap();
        assert_ne!(caller, writer_thread);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AAPL.csv");
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let bars: Vec<Bar> = (0..3)
            .map(|i| Bar::new(start + Duration::days(i), 1.0, 2.0, 0.5, 1.5, 10.0))
            .collect();

        let target = path.clone();
        let writer = on_blocking_pool(move || BarFileWriter::create(&target, FileFormat::Csv))
            .await
            .unwrap();
        let writer = write_page(writer, bars.clone()).await.unwrap();
        let written = on_blocking_pool(move || writer.finish()).await.unwrap();

        assert_eq!(written, 3);
        assert_eq!(read_bars(&path, Tz::UTC).unwrap(), bars);
    }
}
