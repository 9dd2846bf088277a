//! Priority queue keyed by `(priority desc, enqueue-order asc)` (spec §4.6).
//!
//! The teacher's `RequestQueue` (scheduler/queue.rs) keeps a per-model-key
//! `VecDeque` and does a linear `max_by` scan to find the next candidate,
//! which fits a queue partitioned by routing key. This Scheduler has one
//! global queue, so a `BinaryHeap` ordered on `(priority, Reverse(seq))` is
//! the more natural fit for the same FIFO-within-priority guarantee, with
//! cancellation handled by lazy deletion (a `cancelled` set checked on pop)
//! since `BinaryHeap` offers no arbitrary removal.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::CoreError;
use crate::handle::Modality;
use crate::scheduler::TaskOutcome;

/// Relative scheduling priority. Derived `Ord` follows declaration order,
/// so `High > Normal > Low` matches the numeric ranking the spec requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
}

pub type TaskPayload = Pin<Box<dyn Future<Output = Result<Box<dyn std::any::Any + Send>, CoreError>> + Send>>;

pub struct QueueEntry {
    pub id: Uuid,
    pub priority: Priority,
    pub workload_tag: Modality,
    pub deadline: Option<Instant>,
    pub payload: TaskPayload,
    pub outcome_tx: oneshot::Sender<TaskOutcome>,
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority must compare greater,
        // and within equal priority, the *smaller* seq (enqueued earlier)
        // must compare greater so it pops first (FIFO within priority).
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<QueueEntry>,
    cancelled: HashSet<Uuid>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        id: Uuid,
        priority: Priority,
        workload_tag: Modality,
        deadline: Option<Instant>,
        payload: TaskPayload,
        outcome_tx: oneshot::Sender<TaskOutcome>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry { id, priority, workload_tag, deadline, payload, outcome_tx, seq });
    }

    /// Pops the highest-priority, earliest-enqueued entry, silently
    /// discarding (and resolving to `Cancelled`) any entries removed via
    /// `cancel` in the meantime.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        while let Some(entry) = self.heap.pop() {
            if self.cancelled.remove(&entry.id) {
                let _ = entry.outcome_tx.send(TaskOutcome::Cancelled);
                continue;
            }
            return Some(entry);
        }
        None
    }

    /// Marks a still-queued task cancelled. Returns `true` if the task was
    /// found queued (it will resolve to `Cancelled` the next time the heap
    /// is popped past it); `false` if it was not queued — either already
    /// dispatched, or never existed — since only `Queued` tasks may be
    /// cancelled (spec §4.6).
    pub fn cancel(&mut self, id: Uuid) -> bool {
        if self.heap.iter().any(|e| e.id == id) {
            self.cancelled.insert(id);
            true
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.len() == self.cancelled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_payload() -> (TaskPayload, oneshot::Receiver<TaskOutcome>) {
        let (tx, rx) = oneshot::channel();
        let fut: TaskPayload = Box::pin(async { Ok(Box::new(()) as Box<dyn std::any::Any + Send>) });
        (fut, rx)
    }

    #[test]
    fn fifo_within_same_priority() {
        let mut q = PriorityQueue::new();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            let (payload, _rx) = entry_payload();
            q.push(*id, Priority::Normal, Modality::Text, None, payload, oneshot::channel().0);
        }
        let popped: Vec<Uuid> = std::iter::from_fn(|| q.pop().map(|e| e.id)).collect();
        assert_eq!(popped, ids);
    }

    #[test]
    fn high_priority_preempts_lower_at_dispatch_boundary() {
        let mut q = PriorityQueue::new();
        let low_id = Uuid::new_v4();
        let high_id = Uuid::new_v4();
        let (low_payload, _) = entry_payload();
        let (high_payload, _) = entry_payload();
        q.push(low_id, Priority::Low, Modality::Text, None, low_payload, oneshot::channel().0);
        q.push(high_id, Priority::High, Modality::Text, None, high_payload, oneshot::channel().0);
        let first = q.pop().unwrap();
        assert_eq!(first.id, high_id);
    }

    #[tokio::test]
    async fn cancelling_a_queued_task_yields_cancelled_with_no_dispatch() {
        let mut q = PriorityQueue::new();
        let id = Uuid::new_v4();
        let (payload, _) = entry_payload();
        let (tx, rx) = oneshot::channel();
        q.push(id, Priority::Normal, Modality::Text, None, payload, tx);
        assert!(q.cancel(id));
        assert!(q.pop().is_none());
        assert!(matches!(rx.await.unwrap(), TaskOutcome::Cancelled));
    }

    #[test]
    fn cancel_of_unknown_id_returns_false() {
        let mut q = PriorityQueue::new();
        assert!(!q.cancel(Uuid::new_v4()));
    }
}
