/// Replay provider (simulated remote) serving bars from a bar store
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use super::{ProviderEvent, RemoteProvider};
use crate::data::BarStore;
use crate::error::{BulkError, Result};
use crate::types::{DateRange, Instrument, Resolution, SeriesKey};

const EVENT_CAPACITY: usize = 4096;

/// Scripted behaviour for one ticker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayBehavior {
    /// Reject the request synchronously
    Reject,
    /// Accept, then report a request error
    Error,
    /// Accept, then error this many times before answering normally
    FailTimes(usize),
    /// Accept and never answer
    Silent,
}

/// Serves `source` bars stored under `source_provider` as if they were remote
pub struct ReplayProvider {
    id: String,
    source: Arc<dyn BarStore>,
    source_provider: String,
    connected: Arc<AtomicBool>,
    latency: Duration,
    behaviors: RwLock<HashMap<String, ReplayBehavior>>,
    failures: RwLock<HashMap<String, usize>>,
    requests: AtomicUsize,
    tx: broadcast::Sender<ProviderEvent>,
}

impl ReplayProvider {
    pub fn new(id: impl Into<String>, source: Arc<dyn BarStore>, source_provider: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        ReplayProvider {
            id: id.into(),
            source,
            source_provider: source_provider.into(),
            connected: Arc::new(AtomicBool::new(true)),
            latency: Duration::from_millis(5),
            behaviors: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            requests: AtomicUsize::new(0),
            tx,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn set_behavior(&self, ticker: &str, behavior: ReplayBehavior) {
        let mut behaviors = self.behaviors.write().await;
        behaviors.insert(ticker.to_string(), behavior);
    }

    /// Flip connectivity, announcing changes to subscribers
    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was != connected {
            info!("Replay provider {} connected={}", self.id, connected);
            let _ = self.tx.send(ProviderEvent::ConnectionChanged { connected });
        }
    }

    /// Requests received so far, accepted or not
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    async fn behavior_for(&self, ticker: &str) -> Option<ReplayBehavior> {
        let behaviors = self.behaviors.read().await;
        behaviors.get(ticker).copied()
    }

    /// Whether a `FailTimes` ticker should still fail this time
    async fn should_fail(&self, ticker: &str, times: usize) -> bool {
        let mut failures = self.failures.write().await;
        let seen = failures.entry(ticker.to_string()).or_insert(0);
        if *seen < times {
            *seen += 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl RemoteProvider for ReplayProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request_bars(
        &self,
        instrument: &Instrument,
        resolution: Resolution,
        range: &DateRange,
    ) -> Result<bool> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        if !self.is_connected() {
            return Err(BulkError::ProviderNotConnected(self.id.clone()));
        }

        let fail = match self.behavior_for(&instrument.ticker).await {
            Some(ReplayBehavior::Reject) => {
                debug!("Replay provider rejecting {} {}", instrument, resolution);
                return Ok(false);
            }
            Some(ReplayBehavior::Silent) => return Ok(true),
            Some(ReplayBehavior::Error) => true,
            Some(ReplayBehavior::FailTimes(n)) => self.should_fail(&instrument.ticker, n).await,
            None => false,
        };

        let tx = self.tx.clone();
        let source = Arc::clone(&self.source);
        let key = SeriesKey::new(self.source_provider.clone(), instrument.ticker.clone(), resolution);
        let instrument = instrument.clone();
        let range = *range;
        let latency = self.latency;

        tokio::spawn(async move {
            tokio::time::sleep(latency).await;

            let event = if fail {
                ProviderEvent::RequestError {
                    instrument,
                    resolution,
                    message: "simulated provider error".to_string(),
                }
            } else {
                match source.get_bars(&key, Some(&range)).await {
                    Ok(bars) => ProviderEvent::download_complete(instrument, resolution, bars),
                    Err(e) => ProviderEvent::RequestError {
                        instrument,
                        resolution,
                        message: e.to_string(),
                    },
                }
            };

            if tx.send(event).is_err() {
                warn!("Replay response for {} dropped: no subscribers", key);
            }
        });

        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.tx.subscribe()
    }
}
