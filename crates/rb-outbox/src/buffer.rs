//! Global buffer.
//!
//! Bounded FIFO between the poller and the group distributor, decoupling the
//! poll rate from the processing rate. Offers are non-blocking: when the
//! buffer is full the poller's rows are refused, stay IN_PROGRESS in the
//! database and are rewound by the recovery loop. Rejection is backpressure
//! reporting, never data loss.

use std::fmt;

use rb_common::OutboxItem;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Error returned when the buffer refuses an item.
///
/// The row remains IN_PROGRESS and is recovered after the processing
/// timeout.
#[derive(Debug, Clone)]
pub struct BufferFullError {
    pub item_id: String,
}

impl fmt::Display for BufferFullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Global buffer full, item {} refused (stays IN_PROGRESS until recovery)",
            self.item_id
        )
    }
}

impl std::error::Error for BufferFullError {}

/// Global buffer configuration.
#[derive(Debug, Clone)]
pub struct GlobalBufferConfig {
    /// Maximum buffered items.
    pub capacity: usize,
}

impl Default for GlobalBufferConfig {
    fn default() -> Self {
        Self { capacity: 2000 }
    }
}

/// Sending half of the buffer. The receiving half goes to the single
/// drainer, which hands items to the distributor one at a time.
pub struct GlobalBuffer {
    tx: mpsc::Sender<OutboxItem>,
    capacity: usize,
}

impl GlobalBuffer {
    pub fn new(config: GlobalBufferConfig) -> (Self, mpsc::Receiver<OutboxItem>) {
        let (tx, rx) = mpsc::channel(config.capacity);
        (
            Self {
                tx,
                capacity: config.capacity,
            },
            rx,
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Offer one item without blocking.
    pub fn offer(&self, item: OutboxItem) -> Result<(), BufferFullError> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) => Err(BufferFullError { item_id: item.id }),
            // A closed channel means shutdown; refusing has the same
            // recovery semantics as a full buffer.
            Err(TrySendError::Closed(item)) => Err(BufferFullError { item_id: item.id }),
        }
    }

    /// Offer every item, returning how many were refused.
    pub fn add_all(&self, items: Vec<OutboxItem>) -> usize {
        let mut rejected = 0;
        for item in items {
            if let Err(e) = self.offer(item) {
                warn!(item_id = %e.item_id, "Global buffer refused item");
                rejected += 1;
            }
        }
        rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rb_common::{OutboxItemType, OutboxStatus};

    fn item(id: &str) -> OutboxItem {
        OutboxItem {
            id: id.to_string(),
            item_type: OutboxItemType::Event,
            message_group: None,
            payload: "{}".to_string(),
            status: OutboxStatus::InProgress,
            retry_count: 0,
            created_at: chrono::Utc::now(),
            updated_at: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn preserves_fifo_order() {
        let (buffer, mut rx) = GlobalBuffer::new(GlobalBufferConfig { capacity: 10 });

        for i in 0..5 {
            buffer.offer(item(&format!("item-{}", i))).unwrap();
        }

        for i in 0..5 {
            let received = rx.recv().await.unwrap();
            assert_eq!(received.id, format!("item-{}", i));
        }
    }

    #[tokio::test]
    async fn refuses_when_full() {
        let (buffer, _rx) = GlobalBuffer::new(GlobalBufferConfig { capacity: 4 });

        for i in 0..4 {
            buffer.offer(item(&format!("item-{}", i))).unwrap();
        }

        let err = buffer.offer(item("overflow")).unwrap_err();
        assert_eq!(err.item_id, "overflow");
    }

    #[tokio::test]
    async fn add_all_reports_rejection_count() {
        let (buffer, mut rx) = GlobalBuffer::new(GlobalBufferConfig { capacity: 4 });

        let items: Vec<OutboxItem> = (0..10).map(|i| item(&format!("item-{}", i))).collect();
        let rejected = buffer.add_all(items);
        assert_eq!(rejected, 6);

        // The accepted prefix is intact and ordered.
        for i in 0..4 {
            let received = rx.recv().await.unwrap();
            assert_eq!(received.id, format!("item-{}", i));
        }
    }

    #[tokio::test]
    async fn refuses_after_receiver_dropped() {
        let (buffer, rx) = GlobalBuffer::new(GlobalBufferConfig { capacity: 4 });
        drop(rx);
        assert!(buffer.offer(item("late")).is_err());
    }
}
