/// Remote data providers consumed by the download strategy
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::error::{BulkError, Result};
use crate::types::{Bar, DateRange, Instrument, Resolution, WorkItemKey};

pub mod replay;

pub use replay::{ReplayBehavior, ReplayProvider};

/// Asynchronous notifications delivered by a provider
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    DownloadComplete {
        instrument: Instrument,
        resolution: Resolution,
        count: usize,
        first: Option<DateTime<Utc>>,
        last: Option<DateTime<Utc>>,
        bars: Arc<Vec<Bar>>,
    },
    /// Out-of-band rejection of a request that was already accepted
    RequestError {
        instrument: Instrument,
        resolution: Resolution,
        message: String,
    },
    ConnectionChanged {
        connected: bool,
    },
}

impl ProviderEvent {
    pub fn download_complete(instrument: Instrument, resolution: Resolution, bars: Vec<Bar>) -> Self {
        let range = DateRange::covering(&bars);
        ProviderEvent::DownloadComplete {
            instrument,
            resolution,
            count: bars.len(),
            first: range.map(|r| r.from),
            last: range.map(|r| r.to),
            bars: Arc::new(bars),
        }
    }

    /// Work item this event answers, if any
    pub fn item_key(&self) -> Option<WorkItemKey> {
        match self {
            ProviderEvent::DownloadComplete {
                instrument, resolution, ..
            }
            | ProviderEvent::RequestError {
                instrument, resolution, ..
            } => Some(WorkItemKey {
                ticker: instrument.ticker.clone(),
                resolution: *resolution,
            }),
            ProviderEvent::ConnectionChanged { .. } => None,
        }
    }
}

/// Remote source of bars
#[async_trait]
pub trait RemoteProvider: Send + Sync {
    fn id(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Ask for bars. `Ok(true)` means accepted; the answer arrives as a
    /// `ProviderEvent`. `Ok(false)` means rejected synchronously.
    async fn request_bars(
        &self,
        instrument: &Instrument,
        resolution: Resolution,
        range: &DateRange,
    ) -> Result<bool>;

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;
}

/// Providers by id
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn RemoteProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn RemoteProvider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn RemoteProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| BulkError::ProviderNotFound(format!("{} (registered: {})", id, self.ids().join(", "))))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }
}
