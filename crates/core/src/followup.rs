//! Followup queue — messages that arrive while a session's turn is running.
//!
//! Items carry a live 1-based position that is re-derived on every
//! mutation and pushed back to the originating channel (e.g. a reaction
//! showing "#2 in queue").  When the in-flight turn completes, the
//! orchestration layer drains the whole queue into one follow-up turn
//! rather than running one turn per item.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use swb_domain::config::FollowupConfig;
use swb_domain::{Error, Result};

/// One buffered message.
#[derive(Debug, Clone)]
pub struct FollowupItem {
    /// Stable identifier the channel adapter uses to update its indicator.
    pub id: String,
    pub text: String,
    pub queued_at: DateTime<Utc>,
    /// 1-based position at the time of the last mutation.
    pub position: usize,
}

/// Receives position updates for queued items.  Implemented by channel
/// adapters; `position = None` retracts a previously shown indicator.
pub trait PositionNotifier: Send + Sync {
    fn position_changed(&self, session_key: &str, item_id: &str, position: Option<usize>);
}

/// No-op notifier for callers that don't surface queue positions.
pub struct NullNotifier;

impl PositionNotifier for NullNotifier {
    fn position_changed(&self, _session_key: &str, _item_id: &str, _position: Option<usize>) {}
}

/// Per-session FIFO of followup messages with live position reporting.
pub struct FollowupQueue {
    config: FollowupConfig,
    queues: Mutex<HashMap<String, Vec<FollowupItem>>>,
    notifier: Box<dyn PositionNotifier>,
}

impl FollowupQueue {
    pub fn new(config: FollowupConfig, notifier: Box<dyn PositionNotifier>) -> Self {
        Self {
            config,
            queues: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    /// Append a message; returns the enqueued item with its position.
    pub fn enqueue(&self, session_key: &str, text: impl Into<String>) -> Result<FollowupItem> {
        let mut queues = self.queues.lock();
        let queue = queues.entry(session_key.to_owned()).or_default();

        if queue.len() >= self.config.max_queued {
            return Err(Error::FollowupQueueFull {
                max: self.config.max_queued,
            });
        }

        let item = FollowupItem {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            queued_at: Utc::now(),
            position: queue.len() + 1,
        };
        queue.push(item.clone());

        self.notifier
            .position_changed(session_key, &item.id, Some(item.position));
        tracing::debug!(
            session_key,
            position = item.position,
            "followup queued"
        );
        Ok(item)
    }

    /// Pop the oldest item and renumber the rest.
    pub fn dequeue(&self, session_key: &str) -> Option<FollowupItem> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(session_key)?;
        if queue.is_empty() {
            return None;
        }
        let item = queue.remove(0);
        self.renumber(session_key, queue);
        if queue.is_empty() {
            queues.remove(session_key);
        }
        Some(item)
    }

    /// Drop all queued items, retracting every shown position indicator.
    /// Returns how many were dropped.
    pub fn clear(&self, session_key: &str) -> usize {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.remove(session_key) else {
            return 0;
        };
        for item in &queue {
            self.notifier.position_changed(session_key, &item.id, None);
        }
        queue.len()
    }

    /// Take everything at once for folding into a single follow-up turn.
    /// Indicators are retracted, not renumbered.
    pub fn drain(&self, session_key: &str) -> Vec<FollowupItem> {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.remove(session_key) else {
            return Vec::new();
        };
        for item in &queue {
            self.notifier.position_changed(session_key, &item.id, None);
        }
        queue
    }

    /// Fold all pending texts into one follow-up body.  `None` when empty.
    pub fn drain_folded(&self, session_key: &str) -> Option<String> {
        let items = self.drain(session_key);
        if items.is_empty() {
            return None;
        }
        Some(
            items
                .iter()
                .map(|i| i.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    /// Authoritative ordered snapshot; positions are always contiguous.
    pub fn positions(&self, session_key: &str) -> Vec<FollowupItem> {
        self.queues
            .lock()
            .get(session_key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self, session_key: &str) -> usize {
        self.queues
            .lock()
            .get(session_key)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, session_key: &str) -> bool {
        self.len(session_key) == 0
    }

    fn renumber(&self, session_key: &str, queue: &mut [FollowupItem]) {
        for (i, item) in queue.iter_mut().enumerate() {
            let pos = i + 1;
            if item.position != pos {
                item.position = pos;
                self.notifier
                    .position_changed(session_key, &item.id, Some(pos));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Records every notification for assertion.
    struct RecordingNotifier {
        events: Arc<Mutex<Vec<(String, Option<usize>)>>>,
    }

    impl PositionNotifier for RecordingNotifier {
        fn position_changed(&self, _key: &str, item_id: &str, position: Option<usize>) {
            self.events.lock().push((item_id.to_owned(), position));
        }
    }

    fn queue_with_recorder() -> (FollowupQueue, Arc<Mutex<Vec<(String, Option<usize>)>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let q = FollowupQueue::new(
            FollowupConfig::default(),
            Box::new(RecordingNotifier {
                events: events.clone(),
            }),
        );
        (q, events)
    }

    #[test]
    fn positions_contiguous_after_dequeue() {
        let (q, _) = queue_with_recorder();
        q.enqueue("s", "one").unwrap();
        q.enqueue("s", "two").unwrap();
        q.enqueue("s", "three").unwrap();

        let pos: Vec<usize> = q.positions("s").iter().map(|i| i.position).collect();
        assert_eq!(pos, vec![1, 2, 3]);

        let first = q.dequeue("s").unwrap();
        assert_eq!(first.text, "one");

        let pos: Vec<usize> = q.positions("s").iter().map(|i| i.position).collect();
        assert_eq!(pos, vec![1, 2]);
    }

    #[test]
    fn renumber_notifies_moved_items() {
        let (q, events) = queue_with_recorder();
        let a = q.enqueue("s", "a").unwrap();
        let b = q.enqueue("s", "b").unwrap();
        events.lock().clear();

        q.dequeue("s");
        let ev = events.lock().clone();
        // Only "b" moved (2 → 1); "a" left the queue without a retraction
        // (the dequeued item is about to run, not cancelled).
        assert_eq!(ev, vec![(b.id.clone(), Some(1))]);
        let _ = a;
    }

    #[test]
    fn clear_retracts_indicators() {
        let (q, events) = queue_with_recorder();
        let a = q.enqueue("s", "a").unwrap();
        let b = q.enqueue("s", "b").unwrap();
        events.lock().clear();

        assert_eq!(q.clear("s"), 2);
        let ev = events.lock().clone();
        assert!(ev.contains(&(a.id.clone(), None)));
        assert!(ev.contains(&(b.id.clone(), None)));
        assert!(q.is_empty("s"));
        assert_eq!(q.clear("s"), 0);
    }

    #[test]
    fn drain_folds_in_order() {
        let (q, _) = queue_with_recorder();
        q.enqueue("s", "first").unwrap();
        q.enqueue("s", "second").unwrap();
        assert_eq!(q.drain_folded("s").unwrap(), "first\nsecond");
        assert!(q.drain_folded("s").is_none());
    }

    #[test]
    fn overflow_rejected() {
        let q = FollowupQueue::new(
            FollowupConfig { max_queued: 2 },
            Box::new(NullNotifier),
        );
        q.enqueue("s", "1").unwrap();
        q.enqueue("s", "2").unwrap();
        let err = q.enqueue("s", "3").unwrap_err();
        assert!(matches!(err, Error::FollowupQueueFull { max: 2 }));
        assert_eq!(q.len("s"), 2);
    }

    #[test]
    fn sessions_isolated() {
        let (q, _) = queue_with_recorder();
        q.enqueue("a", "x").unwrap();
        q.enqueue("b", "y").unwrap();
        assert_eq!(q.len("a"), 1);
        q.clear("a");
        assert_eq!(q.len("b"), 1);
    }
}
