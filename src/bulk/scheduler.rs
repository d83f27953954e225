/// Bulk operation scheduler: staged worker pools over a shared work queue
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::catalog::{Stage, WorkCatalog};
use super::progress::{ProgressSink, ProgressTracker};
use super::queue::WorkQueue;
use super::retry::{RetryDecision, RetryRecord};
use super::stats::{OperationSummary, RunState, RunStats};
use crate::config::OperationContext;
use crate::error::{BulkError, Result};
use crate::provider::RemoteProvider;
use crate::types::{OperationKind, WorkItem, WorkItemKey};

/// Operation-specific behaviour plugged into the scheduler
#[async_trait]
pub trait OperationStrategy: Send + Sync {
    fn kind(&self) -> OperationKind;

    /// Setup run once before any worker starts. An error fails the run.
    async fn prepare(&self, _run: &RunHandle) -> Result<()> {
        Ok(())
    }

    async fn process_item(&self, item: &WorkItem, run: &RunHandle) -> Result<()>;

    /// Teardown, also called after a failed `prepare`
    async fn finish(&self, _run: &RunHandle) {}

    /// Provider whose connectivity gates every dispatch
    fn connection(&self) -> Option<Arc<dyn RemoteProvider>> {
        None
    }

    /// Failed items go back on the stage queue until the retry limit
    fn retries_failures(&self) -> bool {
        false
    }

    /// Items are answered asynchronously; stages wait for the answers
    fn awaits_responses(&self) -> bool {
        false
    }
}

enum ResponseWait {
    Settled,
    Requeued,
    Cancelled,
}

struct RunShared {
    run_id: Uuid,
    kind: OperationKind,
    ctx: Arc<OperationContext>,
    progress: ProgressTracker,
    queue: WorkQueue,
    retries: RetryRecord,
    retry_failures: bool,
    stats: RunStats,
    /// Accepted requests awaiting their answer
    pending: Mutex<HashMap<WorkItemKey, WorkItem>>,
    permanent_failures: Mutex<Vec<WorkItemKey>>,
    /// Queue pushes, answers and connectivity changes
    activity: Notify,
    disconnected: AtomicBool,
    cancelled: AtomicBool,
}

/// State shared by the scheduler, its workers and the strategy for one run
#[derive(Clone)]
pub struct RunHandle {
    inner: Arc<RunShared>,
}

impl RunHandle {
    pub fn new(
        kind: OperationKind,
        ctx: Arc<OperationContext>,
        sink: Arc<dyn ProgressSink>,
        retry_failures: bool,
    ) -> Self {
        RunHandle {
            inner: Arc::new(RunShared {
                run_id: Uuid::new_v4(),
                kind,
                ctx,
                progress: ProgressTracker::new(sink),
                queue: WorkQueue::new(),
                retries: RetryRecord::new(),
                retry_failures,
                stats: RunStats::default(),
                pending: Mutex::new(HashMap::new()),
                permanent_failures: Mutex::new(Vec::new()),
                activity: Notify::new(),
                disconnected: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    pub fn kind(&self) -> OperationKind {
        self.inner.kind
    }

    pub fn context(&self) -> &OperationContext {
        &self.inner.ctx
    }

    pub fn sink(&self) -> &Arc<dyn ProgressSink> {
        self.inner.progress.sink()
    }

    pub fn stats(&self) -> &RunStats {
        &self.inner.stats
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.inner.progress
    }

    /// Checks the sink and latches the first observed cancellation
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        if self.sink().is_cancellation_requested() {
            if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
                warn!("🛑 Cancellation requested, no new {} work will be dispatched", self.inner.kind);
                self.sink().log_warning("Cancellation requested");
                self.inner.activity.notify_waiters();
            }
            return true;
        }
        false
    }

    /// Cancellation seen during the run, without polling the sink again
    pub fn was_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn begin_stage(&self, stage: &Stage) {
        self.inner.queue.reset(stage.items.iter().cloned());
        self.inner.progress.reset(stage.len() as u64);
    }

    fn poll_interval(&self) -> Duration {
        self.inner.ctx.poll_interval
    }

    /// Register an item as awaiting an asynchronous answer. Call before sending the request.
    pub async fn expect_response(&self, item: &WorkItem) {
        let mut pending = self.inner.pending.lock().await;
        pending.insert(item.key(), item.clone());
    }

    /// Withdraw an expectation for a request that was never accepted
    pub async fn forget_response(&self, key: &WorkItemKey) {
        let mut pending = self.inner.pending.lock().await;
        pending.remove(key);
    }

    /// The awaiting item for `key`, left in place until answered
    pub async fn pending_item(&self, key: &WorkItemKey) -> Option<WorkItem> {
        let pending = self.inner.pending.lock().await;
        pending.get(key).cloned()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Requests still waiting for an answer, sorted
    pub async fn unanswered(&self) -> Vec<WorkItemKey> {
        let pending = self.inner.pending.lock().await;
        let mut keys: Vec<WorkItemKey> = pending.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Mark a pending request answered. Returns false for unsolicited answers.
    pub async fn response_succeeded(&self, key: &WorkItemKey) -> bool {
        let answered = {
            let mut pending = self.inner.pending.lock().await;
            pending.remove(key).is_some()
        };
        if !answered {
            debug!("Ignoring unsolicited response for {}", key);
            return false;
        }

        self.inner.stats.responses.attempted.increment().await;
        self.inner.stats.responses.succeeded.increment().await;
        self.inner.activity.notify_waiters();
        true
    }

    /// An accepted request failed out of band; takes the same path as a dispatch failure
    pub async fn response_failed(&self, key: &WorkItemKey, error: BulkError) -> bool {
        // hold the pending lock until the retry is queued so the stage never looks settled in between
        let mut pending = self.inner.pending.lock().await;
        let Some(item) = pending.remove(key) else {
            debug!("Ignoring error for {} with no pending request: {}", key, error);
            return false;
        };

        self.inner.stats.responses.attempted.increment().await;
        self.inner.stats.responses.failed.increment().await;
        self.item_failed(&item, error, None).await;
        drop(pending);

        self.inner.activity.notify_waiters();
        true
    }

    /// Fail every request still awaiting an answer, e.g. after its answer was lost.
    /// Returns how many were failed.
    pub async fn fail_pending(&self, reason: &str) -> usize {
        let mut failed = 0;
        for key in self.unanswered().await {
            if self.response_failed(&key, BulkError::RequestFailed(reason.to_string())).await {
                failed += 1;
            }
        }
        failed
    }

    /// Wake anything waiting on connectivity
    pub fn connectivity_changed(&self) {
        self.inner.activity.notify_waiters();
    }

    pub async fn permanent_failures(&self) -> Vec<WorkItemKey> {
        self.inner.permanent_failures.lock().await.clone()
    }

    /// Retry or permanently fail `item`
    pub async fn item_failed(&self, item: &WorkItem, error: BulkError, worker: Option<usize>) {
        let key = item.key();
        let origin = match worker {
            Some(w) => format!("worker {}", w),
            None => "response".to_string(),
        };

        if !(self.inner.retry_failures && error.is_retryable()) {
            self.record_permanent_failure(key, &error, &origin, 1).await;
            return;
        }

        let limit = self.inner.ctx.retry_limit;
        match self.inner.retries.record_failure(&key, limit).await {
            RetryDecision::Retry { attempt } => {
                let message = format!(
                    "{} {} failed on {} (attempt {}/{}), retrying: {}",
                    item.instrument, item.resolution, origin, attempt, limit, error
                );
                warn!("⚠️  {}", message);
                self.sink().log_warning(&message);

                if self.inner.queue.push_unique(item.clone()) {
                    self.inner.progress.extend(1);
                }
                self.inner.activity.notify_waiters();
            }
            RetryDecision::GiveUp { attempts } => {
                self.record_permanent_failure(key, &error, &origin, attempts).await;
            }
        }
    }

    async fn record_permanent_failure(&self, key: WorkItemKey, error: &BulkError, origin: &str, attempts: u32) {
        let message = format!(
            "{} {} failed on {} after {} attempt(s) [{}]: {}",
            key.ticker,
            key.resolution,
            origin,
            attempts,
            error.error_code(),
            error
        );
        error!("❌ {}", message);
        self.sink().log_error(&message);

        let mut failures = self.inner.permanent_failures.lock().await;
        failures.push(key);
    }

    /// Block until `provider` is connected. Returns false if cancelled first.
    pub async fn wait_for_connection(&self, provider: &dyn RemoteProvider, worker: usize) -> bool {
        loop {
            let notified = self.inner.activity.notified();

            if provider.is_connected() {
                if self.inner.disconnected.swap(false, Ordering::SeqCst) {
                    let message = format!("Provider {} reconnected, resuming", provider.id());
                    info!("🔌 {}", message);
                    self.sink().log_info(&message);
                }
                return true;
            }

            if self.is_cancelled() {
                return false;
            }

            if !self.inner.disconnected.swap(true, Ordering::SeqCst) {
                let message = format!(
                    "Provider {} disconnected, worker {} waiting for reconnection",
                    provider.id(),
                    worker
                );
                warn!("⚠️  {}", message);
                self.sink().log_warning(&message);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.poll_interval()) => {}
            }
        }
    }

    /// Wait for outstanding answers after the stage queue drained
    async fn wait_for_responses(&self) -> ResponseWait {
        let mut announced = false;
        loop {
            let notified = self.inner.activity.notified();

            if self.is_cancelled() {
                return ResponseWait::Cancelled;
            }
            let outstanding = {
                let pending = self.inner.pending.lock().await;
                if !self.inner.queue.is_empty() {
                    return ResponseWait::Requeued;
                }
                pending.len()
            };
            if outstanding == 0 {
                return ResponseWait::Settled;
            }
            if !announced {
                info!("⏳ Waiting for {} outstanding responses", outstanding);
                announced = true;
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.poll_interval()) => {}
            }
        }
    }

    async fn dispatch(&self, strategy: &dyn OperationStrategy, item: &WorkItem, worker: usize) {
        debug!("Worker {} processing {} {}", worker, item.instrument, item.resolution);
        self.inner.stats.requests.attempted.increment().await;

        let outcome = AssertUnwindSafe(strategy.process_item(item, self))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                self.inner.stats.requests.succeeded.increment().await;
            }
            Ok(Err(e)) => {
                self.inner.stats.requests.failed.increment().await;
                self.item_failed(item, e, Some(worker)).await;
            }
            Err(payload) => {
                self.inner.stats.requests.failed.increment().await;
                let e = BulkError::WorkerPanic(panic_message(payload.as_ref()));
                self.item_failed(item, e, Some(worker)).await;
            }
        }

        self.inner.progress.advance();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn worker_loop(strategy: Arc<dyn OperationStrategy>, run: RunHandle, worker: usize) {
    debug!("Worker {} started", worker);
    let connection = strategy.connection();

    loop {
        if run.is_cancelled() {
            break;
        }

        let Some(item) = run.inner.queue.pop() else {
            break;
        };

        if let Some(provider) = &connection {
            if !run.wait_for_connection(provider.as_ref(), worker).await {
                run.inner.queue.push_unique(item);
                break;
            }
        }

        run.dispatch(strategy.as_ref(), &item, worker).await;
    }

    debug!("Worker {} finished", worker);
}

/// Runs one operation. A scheduler instance runs exactly once.
pub struct BulkScheduler {
    state: StdMutex<RunState>,
}

impl Default for BulkScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl BulkScheduler {
    pub fn new() -> Self {
        BulkScheduler {
            state: StdMutex::new(RunState::NotStarted),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Run to completion. Always returns a summary; configuration errors yield `Failed`.
    pub async fn run(
        &self,
        ctx: OperationContext,
        strategy: Arc<dyn OperationStrategy>,
        sink: Arc<dyn ProgressSink>,
    ) -> OperationSummary {
        let kind = strategy.kind();
        let clock = Instant::now();
        let run = RunHandle::new(kind, Arc::new(ctx), Arc::clone(&sink), strategy.retries_failures());
        let mut summary = OperationSummary::new(run.run_id(), kind, Utc::now());

        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if *state != RunState::NotStarted {
                let e = BulkError::InternalError(format!("scheduler already {}", *state));
                drop(state);
                return fail(summary, &sink, e, clock);
            }
            *state = RunState::Running;
        }
        summary.state = RunState::Running;

        info!("🚀 Starting {} run {}", kind, run.run_id());

        let catalog = match run
            .context()
            .validate(kind)
            .and_then(|_| WorkCatalog::build(kind, run.context()))
        {
            Ok(catalog) => catalog,
            Err(e) => {
                self.set_state(RunState::Failed);
                return fail(summary, &sink, e, clock);
            }
        };
        summary.stages_total = catalog.stages().len();
        info!(
            "   {} instruments, {} stages, {} items, {} workers",
            catalog.stages().first().map(Stage::len).unwrap_or(0),
            catalog.stages().len(),
            catalog.total_items(),
            run.context().thread_count
        );

        let prepared = AssertUnwindSafe(strategy.prepare(&run))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(BulkError::InternalError(panic_message(payload.as_ref()))));
        if let Err(e) = prepared {
            strategy.finish(&run).await;
            self.set_state(RunState::Failed);
            return fail(summary, &sink, e, clock);
        }

        let stage_count = catalog.stages().len();
        for (idx, stage) in catalog.stages().iter().enumerate() {
            if run.is_cancelled() {
                break;
            }

            let status = format!(
                "📊 [{}/{}] {} {} stage: {} items",
                idx + 1,
                stage_count,
                kind,
                stage.resolution,
                stage.len()
            );
            sink.set_status(&status);

            if run_stage(&run, &strategy, stage).await {
                summary.stages_completed += 1;
            }
        }

        strategy.finish(&run).await;

        summary.requests = run.stats().requests.snapshot().await;
        if strategy.awaits_responses() {
            summary.responses = Some(run.stats().responses.snapshot().await);
        }
        summary.permanent_failures = run.permanent_failures().await;
        summary.unanswered = run.unanswered().await;
        summary.cancelled = run.was_cancelled();
        summary.state = RunState::Completed;
        summary.duration_ms = clock.elapsed().as_millis() as u64;
        self.set_state(RunState::Completed);

        if summary.cancelled {
            warn!("✅ {} run {} stopped after cancellation", kind, run.run_id());
        } else {
            info!("✅ {} run {} complete", kind, run.run_id());
        }
        for line in summary.to_string().lines() {
            info!("{}", line);
        }
        if summary.is_clean() {
            sink.log_info(&summary.to_string());
        } else {
            sink.log_warning(&summary.to_string());
        }

        summary
    }
}

fn fail(mut summary: OperationSummary, sink: &Arc<dyn ProgressSink>, e: BulkError, clock: Instant) -> OperationSummary {
    let message = format!("{} run failed [{}]: {}", summary.kind, e.error_code(), e);
    error!("❌ {}", message);
    sink.log_error(&message);

    summary.state = RunState::Failed;
    summary.error = Some(e.to_string());
    summary.duration_ms = clock.elapsed().as_millis() as u64;
    summary
}

/// Run one stage to completion. Returns false when cut short by cancellation.
async fn run_stage(run: &RunHandle, strategy: &Arc<dyn OperationStrategy>, stage: &Stage) -> bool {
    run.begin_stage(stage);
    let threads = run.context().thread_count;

    loop {
        let mut workers = JoinSet::new();
        for worker in 0..threads {
            workers.spawn(worker_loop(Arc::clone(strategy), run.clone(), worker));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task ended abnormally: {}", e);
            }
        }

        if run.is_cancelled() {
            break;
        }
        if !strategy.awaits_responses() {
            return true;
        }

        match run.wait_for_responses().await {
            ResponseWait::Settled => return true,
            ResponseWait::Requeued => continue,
            ResponseWait::Cancelled => break,
        }
    }

    let left = run.inner.queue.drain();
    if !left.is_empty() {
        warn!("{} {} items were not dispatched", left.len(), stage.resolution);
    }
    false
}

/// Convenience wrapper for a single run
pub async fn run_operation(
    ctx: OperationContext,
    strategy: Arc<dyn OperationStrategy>,
    sink: Arc<dyn ProgressSink>,
) -> OperationSummary {
    BulkScheduler::new().run(ctx, strategy, sink).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::progress::{CancelToken, TracingProgress};
    use crate::config::Settings;
    use crate::data::MemoryBarStore;
    use crate::provider::ReplayProvider;
    use crate::types::Resolution;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    fn context(tickers: &[&str], resolutions: &[Resolution]) -> OperationContext {
        OperationContext::new("local", &Settings::default())
            .unwrap()
            .with_instruments(tickers.iter().copied())
            .with_resolutions(resolutions.iter().copied())
            .with_threads(3)
            .with_retry_limit(3)
            .with_poll_interval(Duration::from_millis(10))
    }

    fn sink() -> (Arc<TracingProgress>, CancelToken) {
        let token = CancelToken::new();
        (Arc::new(TracingProgress::new(token.clone())), token)
    }

    /// Records a global sequence number as each item starts
    #[derive(Default)]
    struct SequenceStrategy {
        seq: AtomicUsize,
        started: StdMutex<Vec<(Resolution, usize)>>,
    }

    #[async_trait]
    impl OperationStrategy for SequenceStrategy {
        fn kind(&self) -> OperationKind {
            OperationKind::Export
        }

        async fn process_item(&self, item: &WorkItem, _run: &RunHandle) -> Result<()> {
            let n = self.seq.fetch_add(1, Ordering::SeqCst);
            self.started.lock().unwrap().push((item.resolution, n));
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(())
        }
    }

    /// Fails (or panics on) chosen tickers and counts attempts
    struct FlakyStrategy {
        failing: HashSet<String>,
        panicking: HashSet<String>,
        retries: bool,
        attempts: StdMutex<HashMap<String, u32>>,
    }

    impl FlakyStrategy {
        fn new(failing: &[&str], panicking: &[&str], retries: bool) -> Self {
            FlakyStrategy {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                panicking: panicking.iter().map(|s| s.to_string()).collect(),
                retries,
                attempts: StdMutex::new(HashMap::new()),
            }
        }

        fn attempts(&self, ticker: &str) -> u32 {
            self.attempts.lock().unwrap().get(ticker).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl OperationStrategy for FlakyStrategy {
        fn kind(&self) -> OperationKind {
            if self.retries {
                OperationKind::Download
            } else {
                OperationKind::Import
            }
        }

        async fn process_item(&self, item: &WorkItem, _run: &RunHandle) -> Result<()> {
            let ticker = item.instrument.ticker.clone();
            *self.attempts.lock().unwrap().entry(ticker.clone()).or_insert(0) += 1;

            if self.panicking.contains(&ticker) {
                panic!("bad data for {}", ticker);
            }
            if self.failing.contains(&ticker) {
                return Err(BulkError::RequestFailed(format!("{} unavailable", ticker)));
            }
            Ok(())
        }

        fn retries_failures(&self) -> bool {
            self.retries
        }
    }

    struct SlowStrategy;

    #[async_trait]
    impl OperationStrategy for SlowStrategy {
        fn kind(&self) -> OperationKind {
            OperationKind::Copy
        }

        async fn process_item(&self, _item: &WorkItem, _run: &RunHandle) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        }
    }

    struct BrokenSetup;

    #[async_trait]
    impl OperationStrategy for BrokenSetup {
        fn kind(&self) -> OperationKind {
            OperationKind::Download
        }

        async fn prepare(&self, _run: &RunHandle) -> Result<()> {
            Err(BulkError::ProviderNotFound("nowhere".to_string()))
        }

        async fn process_item(&self, _item: &WorkItem, _run: &RunHandle) -> Result<()> {
            panic!("must not be called");
        }
    }

    #[tokio::test]
    async fn test_stage_ordering() {
        let tickers = ["A", "B", "C", "D", "E", "F", "G"];
        let ctx = context(&tickers, &[Resolution::Day, Resolution::Minute, Resolution::Hour]);
        let strategy = Arc::new(SequenceStrategy::default());
        let (sink, _) = sink();

        let summary = run_operation(ctx, strategy.clone(), sink).await;
        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.stages_completed, 3);
        assert_eq!(summary.requests.succeeded, 21);

        let started = strategy.started.lock().unwrap().clone();
        let max_of = |r: Resolution| started.iter().filter(|(res, _)| *res == r).map(|(_, n)| *n).max().unwrap();
        let min_of = |r: Resolution| started.iter().filter(|(res, _)| *res == r).map(|(_, n)| *n).min().unwrap();

        assert!(max_of(Resolution::Minute) < min_of(Resolution::Hour));
        assert!(max_of(Resolution::Hour) < min_of(Resolution::Day));
    }

    #[tokio::test]
    async fn test_retry_bound_is_exact() {
        let ctx = context(&["GOOD", "BAD"], &[Resolution::Day]).with_retry_limit(4);
        let strategy = Arc::new(FlakyStrategy::new(&["BAD"], &[], true));
        let (sink, _) = sink();

        let summary = run_operation(ctx, strategy.clone(), sink.clone()).await;

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(strategy.attempts("BAD"), 4);
        assert_eq!(strategy.attempts("GOOD"), 1);
        assert_eq!(
            summary.permanent_failures,
            vec![WorkItemKey {
                ticker: "BAD".to_string(),
                resolution: Resolution::Day
            }]
        );
        assert_eq!(summary.requests.attempted, 5);
        assert_eq!(summary.requests.failed, 4);

        // 2 items plus 3 re-enqueued attempts
        let position = sink.position();
        assert_eq!(position.max, 5);
        assert_eq!(position.current, 5);
    }

    #[tokio::test]
    async fn test_non_download_failures_are_permanent_at_once() {
        let ctx = context(&["GOOD", "BAD"], &[Resolution::Day]);
        let strategy = Arc::new(FlakyStrategy::new(&["BAD"], &[], false));
        let (sink, _) = sink();

        let summary = run_operation(ctx, strategy.clone(), sink).await;

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(strategy.attempts("BAD"), 1);
        assert_eq!(summary.permanent_failures.len(), 1);
        assert_eq!(summary.requests.succeeded, 1);
    }

    #[tokio::test]
    async fn test_panicking_item_is_contained() {
        let ctx = context(&["A", "BOOM", "C"], &[Resolution::Hour, Resolution::Day]);
        let strategy = Arc::new(FlakyStrategy::new(&[], &["BOOM"], false));
        let (sink, _) = sink();

        let summary = run_operation(ctx, strategy, sink).await;

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.stages_completed, 2);
        assert_eq!(summary.requests.succeeded, 4);
        assert_eq!(summary.requests.failed, 2);
        assert!(summary.permanent_failures.iter().all(|k| k.ticker == "BOOM"));
    }

    #[tokio::test]
    async fn test_cancellation_still_produces_summary() {
        let tickers: Vec<String> = (0..50).map(|i| format!("T{}", i)).collect();
        let ctx = context(&[], &[Resolution::Hour, Resolution::Day])
            .with_instruments(tickers)
            .with_threads(2);
        let (sink, token) = sink();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            token.cancel();
        });

        let started = Instant::now();
        let summary = run_operation(ctx, Arc::new(SlowStrategy), sink).await;
        canceller.await.unwrap();

        assert_eq!(summary.state, RunState::Completed);
        assert!(summary.cancelled);
        assert!(summary.requests.attempted < 100);
        assert_eq!(summary.stages_completed, 0);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(summary.to_string().contains("Cancelled"));
    }

    #[tokio::test]
    async fn test_configuration_error_fails_before_workers() {
        let ctx = context(&[], &[Resolution::Day]);
        let strategy = Arc::new(FlakyStrategy::new(&[], &[], false));
        let (sink, _) = sink();
        let scheduler = BulkScheduler::new();

        let summary = scheduler.run(ctx, strategy.clone(), sink).await;

        assert_eq!(summary.state, RunState::Failed);
        assert_eq!(scheduler.state(), RunState::Failed);
        assert!(summary.error.is_some());
        assert_eq!(summary.requests.attempted, 0);
        assert!(strategy.attempts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_prepare_fails_run() {
        let ctx = context(&["A"], &[Resolution::Day]);
        let (sink, _) = sink();
        let summary = run_operation(ctx, Arc::new(BrokenSetup), sink).await;

        assert_eq!(summary.state, RunState::Failed);
        assert!(summary.error.unwrap().contains("nowhere"));
    }

    #[tokio::test]
    async fn test_scheduler_runs_once() {
        let scheduler = BulkScheduler::new();
        let (sink, _) = sink();
        let first = scheduler
            .run(context(&["A"], &[Resolution::Day]), Arc::new(SlowStrategy), sink.clone())
            .await;
        assert_eq!(first.state, RunState::Completed);

        let second = scheduler
            .run(context(&["A"], &[Resolution::Day]), Arc::new(SlowStrategy), sink)
            .await;
        assert_eq!(second.state, RunState::Failed);
        assert_eq!(scheduler.state(), RunState::Completed);
    }

    fn handle(sink: Arc<TracingProgress>) -> RunHandle {
        let ctx = context(&["A"], &[Resolution::Day]);
        RunHandle::new(OperationKind::Download, Arc::new(ctx), sink, true)
    }

    #[tokio::test]
    async fn test_connection_wait_resumes_on_reconnect() {
        let provider = Arc::new(ReplayProvider::new("remote", Arc::new(MemoryBarStore::new()), "vendor"));
        provider.set_connected(false);
        let (sink, _) = sink();
        let run = handle(sink);

        let reconnect = {
            let provider = Arc::clone(&provider);
            let run = run.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                provider.set_connected(true);
                run.connectivity_changed();
            })
        };

        let connected = tokio::time::timeout(Duration::from_secs(1), run.wait_for_connection(provider.as_ref(), 0))
            .await
            .expect("wait should end on reconnect");
        reconnect.await.unwrap();

        assert!(connected);
        assert!(!run.inner.disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_connection_wait_exits_on_cancel() {
        let provider = ReplayProvider::new("remote", Arc::new(MemoryBarStore::new()), "vendor");
        provider.set_connected(false);
        let (sink, token) = sink();
        let run = handle(sink);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        });

        let connected = tokio::time::timeout(Duration::from_secs(1), run.wait_for_connection(&provider, 0))
            .await
            .expect("wait should end on cancel");
        assert!(!connected);
        assert!(run.was_cancelled());
    }

    #[tokio::test]
    async fn test_out_of_band_error_takes_retry_path() {
        let (sink, _) = sink();
        let run = handle(sink);
        let item = WorkItem::new(Resolution::Day, crate::types::Instrument::new("A"), None);

        run.expect_response(&item).await;
        assert!(run.response_failed(&item.key(), BulkError::RequestFailed("later".to_string())).await);

        // re-enqueued for another attempt
        assert_eq!(run.inner.queue.len(), 1);
        assert_eq!(run.pending_count().await, 0);
        assert!(run.permanent_failures().await.is_empty());

        // stray answers are ignored
        assert!(!run.response_succeeded(&item.key()).await);
    }
}
