/// Concurrent FIFO of pending work items for the active stage
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::WorkItem;

#[derive(Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<WorkItem>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the contents with a fresh stage
    pub fn reset(&self, items: impl IntoIterator<Item = WorkItem>) {
        let mut queue = self.lock();
        queue.clear();
        queue.extend(items);
    }

    pub fn pop(&self) -> Option<WorkItem> {
        self.lock().pop_front()
    }

    /// Enqueue unless an item with the same key is already waiting
    pub fn push_unique(&self, item: WorkItem) -> bool {
        let mut queue = self.lock();
        let key = item.key();
        if queue.iter().any(|queued| queued.key() == key) {
            return false;
        }
        queue.push_back(item);
        true
    }

    /// Drop everything still queued, returning what was dropped
    pub fn drain(&self) -> Vec<WorkItem> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Instrument, Resolution};
    use std::sync::Arc;

    fn item(ticker: &str) -> WorkItem {
        WorkItem::new(Resolution::Day, Instrument::new(ticker), None)
    }

    #[test]
    fn test_fifo_order_and_dedup() {
        let queue = WorkQueue::new();
        queue.reset([item("A"), item("B")]);

        assert!(!queue.push_unique(item("B")));
        assert!(queue.push_unique(item("C")));
        assert_eq!(queue.len(), 3);

        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|i| i.instrument.ticker)
            .collect();
        assert_eq!(order, vec!["A", "B", "C"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_pops_take_each_item_once() {
        let queue = Arc::new(WorkQueue::new());
        queue.reset((0..200).map(|i| item(&format!("T{}", i))));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut taken = 0;
                while queue.pop().is_some() {
                    taken += 1;
                    tokio::task::yield_now().await;
                }
                taken
            }));
        }

        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, 200);
    }
}
