use chrono::Utc;
use tokio::sync::broadcast;

use crate::models::{ChangeOperation, GroupId, HierarchyChange};

pub trait ChangeSink: Send + Sync {
    fn publish(&self, change: HierarchyChange);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ChangeSink for NoopSink {
    fn publish(&self, _change: HierarchyChange) {}
}

/// Fans events out over a tokio broadcast channel. Slow subscribers lag and lose events rather
/// than holding up writers.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<HierarchyChange>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HierarchyChange> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ChangeSink for BroadcastSink {
    fn publish(&self, change: HierarchyChange) {
        // No subscribers is fine.
        let _ = self.tx.send(change);
    }
}

pub fn change(operation: ChangeOperation, affected_ids: Vec<GroupId>) -> HierarchyChange {
    HierarchyChange {
        operation,
        affected_ids,
        committed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_sink_delivers_to_every_subscriber() {
        let sink = BroadcastSink::new(8);
        let mut first = sink.subscribe();
        let mut second = sink.subscribe();
        let id = GroupId::new_v4();

        sink.publish(change(ChangeOperation::GroupCreated, vec![id]));

        for rx in [&mut first, &mut second] {
            let received = rx.recv().await.expect("event");
            assert_eq!(received.operation, ChangeOperation::GroupCreated);
            assert_eq!(received.affected_ids, vec![id]);
        }
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        BroadcastSink::default().publish(change(ChangeOperation::ChildDetached, vec![]));
        NoopSink.publish(change(ChangeOperation::GroupDeleted, vec![]));
    }
}
