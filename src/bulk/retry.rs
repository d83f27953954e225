/// Per-item failure counts for retrying download requests
use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::types::WorkItemKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Attempt again; `attempt` failures so far
    Retry { attempt: u32 },
    /// Limit reached after `attempts` failures
    GiveUp { attempts: u32 },
}

/// Failure counts keyed by (ticker, resolution)
#[derive(Default)]
pub struct RetryRecord {
    failures: Mutex<HashMap<WorkItemKey, u32>>,
}

impl RetryRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one failed attempt. `limit` is the total number of attempts allowed.
    pub async fn record_failure(&self, key: &WorkItemKey, limit: u32) -> RetryDecision {
        let mut failures = self.failures.lock().await;
        let count = failures.entry(key.clone()).or_insert(0);
        *count += 1;

        if *count < limit {
            RetryDecision::Retry { attempt: *count }
        } else {
            RetryDecision::GiveUp { attempts: *count }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Resolution;

    fn key(ticker: &str, resolution: Resolution) -> WorkItemKey {
        WorkItemKey {
            ticker: ticker.to_string(),
            resolution,
        }
    }

    #[tokio::test]
    async fn test_gives_up_at_limit() {
        let record = RetryRecord::new();
        let k = key("AAPL", Resolution::Day);

        assert_eq!(record.record_failure(&k, 3).await, RetryDecision::Retry { attempt: 1 });
        assert_eq!(record.record_failure(&k, 3).await, RetryDecision::Retry { attempt: 2 });
        assert_eq!(record.record_failure(&k, 3).await, RetryDecision::GiveUp { attempts: 3 });
    }

    #[tokio::test]
    async fn test_limit_of_one_never_retries() {
        let record = RetryRecord::new();
        let k = key("AAPL", Resolution::Day);
        assert_eq!(record.record_failure(&k, 1).await, RetryDecision::GiveUp { attempts: 1 });
    }

    #[tokio::test]
    async fn test_keys_are_compared_by_value() {
        let record = RetryRecord::new();
        record.record_failure(&key("AAPL", Resolution::Day), 5).await;

        // A separately built key for the same item shares the count
        assert_eq!(
            record.record_failure(&key("AAPL", Resolution::Day), 5).await,
            RetryDecision::Retry { attempt: 2 }
        );
        assert_eq!(
            record.record_failure(&key("AAPL", Resolution::Hour), 5).await,
            RetryDecision::Retry { attempt: 1 }
        );
    }
}
