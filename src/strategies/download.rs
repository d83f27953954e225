/// Download: request bars from a remote provider and store the answers
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::write_bars;
use crate::bulk::{OperationStrategy, RunHandle};
use crate::data::BarStore;
use crate::error::{BulkError, Result};
use crate::provider::{ProviderEvent, ProviderRegistry, RemoteProvider};
use crate::types::{DateRange, OperationKind, WorkItem};

pub struct DownloadStrategy {
    registry: ProviderRegistry,
    store: Arc<dyn BarStore>,
    provider: OnceLock<Arc<dyn RemoteProvider>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadStrategy {
    pub fn new(registry: ProviderRegistry, store: Arc<dyn BarStore>) -> Self {
        DownloadStrategy {
            registry,
            store,
            provider: OnceLock::new(),
            listener: Mutex::new(None),
        }
    }

    fn provider(&self) -> Result<&Arc<dyn RemoteProvider>> {
        self.provider
            .get()
            .ok_or_else(|| BulkError::InternalError("download provider not prepared".to_string()))
    }

    /// Range to request, or `None` when the stored series is already current
    async fn request_range(&self, item: &WorkItem, run: &RunHandle) -> Result<Option<DateRange>> {
        let ctx = run.context();
        let range = item
            .range
            .ok_or_else(|| BulkError::InvalidContext(format!("download of {} has no date range", item.key())))?;

        if !ctx.incremental {
            return Ok(Some(range));
        }

        let last = self.store.last_bar(&item.series(&ctx.provider)).await?;
        match last {
            // re-fetch the last stored bar, it may have been partial
            Some(bar) if bar.timestamp > range.from => {
                if bar.timestamp > range.to {
                    return Ok(None);
                }
                Ok(Some(DateRange {
                    from: bar.timestamp,
                    to: range.to,
                }))
            }
            _ => Ok(Some(range)),
        }
    }
}

#[async_trait]
impl OperationStrategy for DownloadStrategy {
    fn kind(&self) -> OperationKind {
        OperationKind::Download
    }

    async fn prepare(&self, run: &RunHandle) -> Result<()> {
        let ctx = run.context();
        let provider = self.registry.get(&ctx.provider)?;
        if !provider.is_connected() {
            return Err(BulkError::ProviderNotConnected(ctx.provider.clone()));
        }

        // subscribe before the first request goes out
        let events = provider.subscribe();
        let handle = tokio::spawn(listen(events, run.clone(), Arc::clone(&self.store)));
        *self.listener.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        let _ = self.provider.set(provider);
        info!("🔌 Downloading from provider {}", ctx.provider);
        Ok(())
    }

    async fn process_item(&self, item: &WorkItem, run: &RunHandle) -> Result<()> {
        let provider = self.provider()?;

        let Some(range) = self.request_range(item, run).await? else {
            info!("{} {} already up to date", item.instrument, item.resolution);
            return Ok(());
        };

        let requested = WorkItem::new(item.resolution, item.instrument.clone(), Some(range));
        run.expect_response(&requested).await;

        match provider.request_bars(&item.instrument, item.resolution, &range).await {
            Ok(true) => {
                debug!("Requested {} {} {}", item.instrument, item.resolution, range);
                Ok(())
            }
            Ok(false) => {
                run.forget_response(&item.key()).await;
                Err(BulkError::RequestRejected(format!(
                    "{} {} {}",
                    item.instrument, item.resolution, range
                )))
            }
            Err(e) => {
                run.forget_response(&item.key()).await;
                Err(e)
            }
        }
    }

    async fn finish(&self, _run: &RunHandle) {
        if let Some(handle) = self.listener.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }

    fn connection(&self) -> Option<Arc<dyn RemoteProvider>> {
        self.provider.get().cloned()
    }

    fn retries_failures(&self) -> bool {
        true
    }

    fn awaits_responses(&self) -> bool {
        true
    }
}

/// Route provider events to the run until the channel closes
async fn listen(mut events: broadcast::Receiver<ProviderEvent>, run: RunHandle, store: Arc<dyn BarStore>) {
    loop {
        match events.recv().await {
            Ok(event) => handle_event(event, &run, store.as_ref()).await,
            Err(RecvError::Lagged(n)) => {
                // lost answers would leave their requests pending forever
                let failed = run.fail_pending(&format!("{} provider events lost", n)).await;
                warn!(
                    "Download listener lagged, {} provider events lost; {} pending requests sent back for retry",
                    n, failed
                );
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Download listener stopped");
}

async fn handle_event(event: ProviderEvent, run: &RunHandle, store: &dyn BarStore) {
    if let ProviderEvent::ConnectionChanged { connected } = event {
        debug!("Provider connectivity changed: connected={}", connected);
        run.connectivity_changed();
        return;
    }
    let Some(key) = event.item_key() else {
        return;
    };

    match event {
        ProviderEvent::DownloadComplete {
            instrument,
            resolution,
            count,
            first,
            last,
            bars,
        } => {
            let Some(item) = run.pending_item(&key).await else {
                debug!("Ignoring unsolicited download of {}", key);
                return;
            };

            let ctx = run.context();
            let series = item.series(&ctx.provider);
            match write_bars(store, &series, &bars, ctx.replace, item.range.as_ref()).await {
                Ok(report) => {
                    let span = match (first, last) {
                        (Some(f), Some(l)) => format!("{} -> {}", f.format("%Y-%m-%d %H:%M"), l.format("%Y-%m-%d %H:%M")),
                        _ => "no bars".to_string(),
                    };
                    info!(
                        "📥 {} {}: {} bars received ({}), {} stored",
                        instrument, resolution, count, span, report.written
                    );
                    run.response_succeeded(&key).await;
                }
                Err(e) => {
                    run.response_failed(&key, e).await;
                }
            }
        }
        ProviderEvent::RequestError { message, .. } => {
            run.response_failed(&key, BulkError::RequestFailed(message)).await;
        }
        ProviderEvent::ConnectionChanged { .. } => {}
    }
}
