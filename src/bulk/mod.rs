pub mod catalog;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod stats;

pub use catalog::{Stage, WorkCatalog};
pub use progress::{CancelToken, ProgressPosition, ProgressSink, ProgressTracker, TracingProgress};
pub use scheduler::{run_operation, BulkScheduler, OperationStrategy, RunHandle};
pub use stats::{CounterSnapshot, OperationSummary, RunState};
