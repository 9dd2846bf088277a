//! Single-slot drop-newest backpressure queue for streaming vision (C8, spec §4.8).
//!
//! Not concurrent-safe by design — intended to be driven from a single
//! cooperative task or main loop, same as a teacher `RequestQueue` but with
//! one slot instead of a per-key `VecDeque`.

/// A decoded video frame awaiting a Worker pull.
#[derive(Debug, Clone)]
pub struct Frame {
    pub rgb_bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Default)]
struct FrameSlot {
    frame: Option<Frame>,
}

/// Single-capacity cell holding at most one pending frame.
pub struct FrameQueue {
    slot: FrameSlot,
    in_progress: bool,
    dropped_count: u64,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            slot: FrameSlot::default(),
            in_progress: false,
            dropped_count: 0,
        }
    }

    /// Drop-newest policy: if a consumer is mid-flight and the slot is
    /// already occupied, the slot is overwritten with the incoming frame —
    /// the previously pending one is lost — and `false` is returned to
    /// signal the drop. Otherwise the frame is placed and `true` is
    /// returned.
    pub fn enqueue(&mut self, frame: Frame) -> bool {
        if self.in_progress && self.slot.frame.is_some() {
            self.slot.frame = Some(frame);
            self.dropped_count += 1;
            return false;
        }
        self.slot.frame = Some(frame);
        true
    }

    /// Returns `None` while a consumer is already mid-flight or the slot is
    /// empty; otherwise takes the frame and marks the queue in-progress.
    pub fn dequeue(&mut self) -> Option<Frame> {
        if self.in_progress {
            return None;
        }
        let frame = self.slot.frame.take()?;
        self.in_progress = true;
        Some(frame)
    }

    pub fn mark_done(&mut self) {
        self.in_progress = false;
    }

    /// Clears the slot and the in-progress flag but preserves
    /// `dropped_count` — it is cumulative, for trace analysis.
    pub fn reset(&mut self) {
        self.slot.frame = None;
        self.in_progress = false;
    }

    pub fn reset_counters(&mut self) {
        self.dropped_count = 0;
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> Frame {
        Frame { rgb_bytes: vec![tag; 3], width: 1, height: 1 }
    }

    #[test]
    fn dequeue_on_empty_slot_returns_none() {
        let mut q = FrameQueue::new();
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn dequeue_while_in_progress_returns_none() {
        let mut q = FrameQueue::new();
        q.enqueue(frame(1));
        assert!(q.dequeue().is_some());
        q.enqueue(frame(2));
        assert!(q.in_progress());
        // still in progress even though a new frame landed in the slot
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn backpressure_scenario_drops_nine_keeps_the_tenth_frame() {
        let mut q = FrameQueue::new();
        q.enqueue(frame(0));
        q.dequeue();
        assert!(q.in_progress());
        for i in 1..=10u8 {
            q.enqueue(frame(i));
        }
        assert_eq!(q.dropped_count(), 9);
        q.mark_done();
        let last = q.dequeue().unwrap();
        assert_eq!(last.rgb_bytes, vec![10u8; 3]);
    }

    #[test]
    fn reset_preserves_dropped_count_reset_counters_clears_it() {
        let mut q = FrameQueue::new();
        q.enqueue(frame(0));
        q.dequeue();
        q.enqueue(frame(1));
        q.enqueue(frame(2));
        q.reset();
        assert_eq!(q.dropped_count(), 1);
        assert!(!q.in_progress());
        q.reset_counters();
        assert_eq!(q.dropped_count(), 0);
    }
}
