/// Run counters and the summary reported when a run ends
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::types::{OperationKind, WorkItemKey};

/// A single counter with its own lock
#[derive(Debug, Default)]
pub struct Counter {
    value: Mutex<u64>,
}

impl Counter {
    pub async fn increment(&self) {
        let mut value = self.value.lock().await;
        *value += 1;
    }

    pub async fn get(&self) -> u64 {
        *self.value.lock().await
    }
}

/// attempted / succeeded / failed
#[derive(Debug, Default)]
pub struct CounterSet {
    pub attempted: Counter,
    pub succeeded: Counter,
    pub failed: Counter,
}

impl CounterSet {
    pub async fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            attempted: self.attempted.get().await,
            succeeded: self.succeeded.get().await,
            failed: self.failed.get().await,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Counters shared by all workers of a run
#[derive(Debug, Default)]
pub struct RunStats {
    /// Work items dispatched by workers
    pub requests: CounterSet,
    /// Asynchronous provider answers
    pub responses: CounterSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::NotStarted => "not started",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one bulk operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSummary {
    pub run_id: Uuid,
    pub kind: OperationKind,
    pub state: RunState,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stages_completed: usize,
    pub stages_total: usize,
    pub requests: CounterSnapshot,
    /// Only present for operations answered asynchronously
    pub responses: Option<CounterSnapshot>,
    pub permanent_failures: Vec<WorkItemKey>,
    /// Requests accepted but never answered
    pub unanswered: Vec<WorkItemKey>,
    pub error: Option<String>,
}

impl OperationSummary {
    pub fn new(run_id: Uuid, kind: OperationKind, started_at: DateTime<Utc>) -> Self {
        OperationSummary {
            run_id,
            kind,
            state: RunState::NotStarted,
            cancelled: false,
            started_at,
            duration_ms: 0,
            stages_completed: 0,
            stages_total: 0,
            requests: CounterSnapshot::default(),
            responses: None,
            permanent_failures: Vec::new(),
            unanswered: Vec::new(),
            error: None,
        }
    }

    /// Completed, not cancelled, nothing failed or left unanswered
    pub fn is_clean(&self) -> bool {
        self.state == RunState::Completed
            && !self.cancelled
            && self.permanent_failures.is_empty()
            && self.unanswered.is_empty()
    }

    /// Items that finished successfully. An accepted request only counts once it is answered.
    pub fn items_succeeded(&self) -> u64 {
        let failed_answers = self.responses.map(|r| r.failed).unwrap_or(0);
        self.requests
            .succeeded
            .saturating_sub(failed_answers)
            .saturating_sub(self.unanswered.len() as u64)
    }

    pub fn success_rate(&self) -> f64 {
        let succeeded = self.items_succeeded();
        let finished = succeeded + self.permanent_failures.len() as u64 + self.unanswered.len() as u64;
        if finished == 0 {
            return 100.0;
        }
        (succeeded as f64 / finished as f64) * 100.0
    }
}

impl fmt::Display for OperationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "📊 {} run {} {}", self.kind, self.run_id, self.state)?;
        if self.cancelled {
            writeln!(f, "   Cancelled before completion")?;
        }
        writeln!(f, "   Duration: {:.1}s", self.duration_ms as f64 / 1000.0)?;
        writeln!(f, "   Stages: {}/{}", self.stages_completed, self.stages_total)?;
        writeln!(
            f,
            "   Requests: {} attempted, {} succeeded, {} failed",
            self.requests.attempted, self.requests.succeeded, self.requests.failed
        )?;
        if let Some(responses) = &self.responses {
            writeln!(
                f,
                "   Responses: {} succeeded, {} failed",
                responses.succeeded, responses.failed
            )?;
        }
        writeln!(
            f,
            "   Items: {} succeeded, {} failed",
            self.items_succeeded(),
            self.permanent_failures.len()
        )?;
        if !self.permanent_failures.is_empty() {
            let keys: Vec<String> = self.permanent_failures.iter().map(|k| k.to_string()).collect();
            writeln!(f, "   Permanent failures: {}", keys.join(", "))?;
        }
        if !self.unanswered.is_empty() {
            let keys: Vec<String> = self.unanswered.iter().map(|k| k.to_string()).collect();
            writeln!(f, "   Unanswered: {}", keys.join(", "))?;
        }
        if let Some(error) = &self.error {
            writeln!(f, "   Error: {}", error)?;
        }
        write!(f, "   Success rate: {:.1}%", self.success_rate())
    }
}
