//! Mutation events emitted by storage on each write commit.
//!
//! The bus is a bounded multi-producer channel: emitters never block the
//! write path. When the channel is full the event is dropped and counted,
//! and the consumer (the weaver) detects the drops and runs a backfill scan
//! over the affected database instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::database_type::DatabaseKind;

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    NodeInserted,
    NodeDeleted,
    EdgeInserted,
    EdgeDeleted,
    EmbeddingInserted,
    EmbeddingDeleted,
}

/// One committed mutation.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    /// The logical database the write landed in.
    pub db: DatabaseKind,
    /// What kind of mutation committed.
    pub kind: MutationKind,
    /// Id of the affected record.
    pub id: String,
    /// Node type name for node mutations (event routing key).
    pub node_type: Option<&'static str>,
}

/// Bounded multi-producer event bus.
#[derive(Clone)]
pub struct EventBus {
    sender: mpsc::Sender<MutationEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Creates a bus with the given capacity; returns the bus and the single
    /// consumer receiver.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MutationEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    /// Emits an event without blocking. A full channel drops the event and
    /// bumps the drop counter.
    pub fn emit(&self, event: MutationEvent) {
        if let Err(err) = self.sender.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("mutation event dropped: {err}");
        }
    }

    /// Returns and resets the dropped-event counter.
    ///
    /// A non-zero value tells the consumer its view has gaps and a backfill
    /// scan is needed.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> MutationEvent {
        MutationEvent {
            db: DatabaseKind::Conversations,
            kind: MutationKind::NodeInserted,
            id: id.to_string(),
            node_type: Some("Message"),
        }
    }

    #[tokio::test]
    async fn test_emit_and_receive() {
        let (bus, mut receiver) = EventBus::new(8);
        bus.emit(event("msg_1"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.id, "msg_1");
        assert_eq!(received.kind, MutationKind::NodeInserted);
        assert_eq!(bus.take_dropped(), 0);
    }

    #[tokio::test]
    async fn test_full_channel_drops_and_counts() {
        let (bus, mut receiver) = EventBus::new(2);
        bus.emit(event("a"));
        bus.emit(event("b"));
        bus.emit(event("c")); // dropped

        assert_eq!(bus.take_dropped(), 1);
        assert_eq!(bus.take_dropped(), 0);

        assert_eq!(receiver.recv().await.unwrap().id, "a");
        assert_eq!(receiver.recv().await.unwrap().id, "b");
    }
}
