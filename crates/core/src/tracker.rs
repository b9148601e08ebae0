//! Transfer completion tracking shared between the foreground and the
//! UART completion callbacks.
//!
//! Each direction holds a requested length and a cumulative completed count.
//! Callbacks store counts with `Release`; the foreground loads with
//! `Acquire`, so a count written from interrupt context is never cached
//! across a wait.

use crate::transfer::Direction;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("{direction} transfer still in flight ({completed}/{requested} bytes)")]
    Busy {
        direction: Direction,
        completed: usize,
        requested: usize,
    },
}

/// Point-in-time view of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionState {
    pub completed: usize,
    pub requested: usize,
    pub done: bool,
}

#[derive(Debug, Default)]
struct Counter {
    completed: AtomicUsize,
    requested: AtomicUsize,
}

impl Counter {
    fn state(&self) -> CompletionState {
        let requested = self.requested.load(Ordering::Acquire);
        let completed = self.completed.load(Ordering::Acquire);
        CompletionState {
            completed,
            requested,
            done: completed >= requested,
        }
    }
}

/// Completion counters for the send and receive directions.
///
/// Starts with both directions done, as nothing has been requested yet.
#[derive(Debug, Default)]
pub struct TransferTracker {
    send: Counter,
    receive: Counter,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, direction: Direction) -> &Counter {
        match direction {
            Direction::Send => &self.send,
            Direction::Receive => &self.receive,
        }
    }

    /// Record the cumulative byte count reported for the active transfer.
    /// Called from interrupt context only; never blocks or allocates.
    pub fn on_bytes_progressed(&self, direction: Direction, new_count: usize) {
        self.counter(direction).completed.store(new_count, Ordering::Release);
    }

    pub fn is_done(&self, direction: Direction) -> bool {
        self.counter(direction).state().done
    }

    /// Arm a direction for a new transfer of `requested_length` bytes.
    pub fn reset(&self, direction: Direction, requested_length: usize) {
        let counter = self.counter(direction);
        counter.completed.store(0, Ordering::Release);
        counter.requested.store(requested_length, Ordering::Release);
    }

    /// `reset`, refusing to overlap a transfer that has not completed.
    pub fn begin(&self, direction: Direction, requested_length: usize) -> Result<(), TrackerError> {
        let state = self.state(direction);
        if !state.done {
            return Err(TrackerError::Busy {
                direction,
                completed: state.completed,
                requested: state.requested,
            });
        }
        self.reset(direction, requested_length);
        Ok(())
    }

    pub fn completed_count(&self, direction: Direction) -> usize {
        self.counter(direction).completed.load(Ordering::Acquire)
    }

    pub fn requested_length(&self, direction: Direction) -> usize {
        self.counter(direction).requested.load(Ordering::Acquire)
    }

    pub fn state(&self, direction: Direction) -> CompletionState {
        self.counter(direction).state()
    }

    /// Callback suitable for `UartLiteDriver::set_send_handler` /
    /// `set_recv_handler`.
    pub fn completion_handler(
        self: &Arc<Self>,
        direction: Direction,
    ) -> impl FnMut(usize) + Send + 'static {
        let tracker = Arc::clone(self);
        move |count| tracker.on_bytes_progressed(direction, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initially_done() {
        let tracker = TransferTracker::new();
        assert!(tracker.is_done(Direction::Send));
        assert!(tracker.is_done(Direction::Receive));
    }

    #[test]
    fn test_progress_sets_done_iff_complete() {
        let tracker = TransferTracker::new();
        let len = 7;
        for n in 0..=len {
            tracker.reset(Direction::Send, len);
            tracker.on_bytes_progressed(Direction::Send, n);
            assert_eq!(tracker.is_done(Direction::Send), n >= len, "n = {}", n);
        }
    }

    #[test]
    fn test_reset_zeroes_count() {
        let tracker = TransferTracker::new();
        tracker.reset(Direction::Receive, 3);
        tracker.on_bytes_progressed(Direction::Receive, 3);
        tracker.reset(Direction::Receive, 4);
        assert_eq!(tracker.completed_count(Direction::Receive), 0);
        assert_eq!(tracker.requested_length(Direction::Receive), 4);
        assert!(!tracker.is_done(Direction::Receive));

        tracker.reset(Direction::Receive, 0);
        assert!(tracker.is_done(Direction::Receive));
    }

    #[test]
    fn test_repeated_progress_is_idempotent() {
        let tracker = TransferTracker::new();
        tracker.reset(Direction::Send, 5);
        tracker.on_bytes_progressed(Direction::Send, 2);
        let once = tracker.state(Direction::Send);
        tracker.on_bytes_progressed(Direction::Send, 2);
        assert_eq!(tracker.state(Direction::Send), once);
    }

    #[test]
    fn test_partial_then_complete() {
        let tracker = TransferTracker::new();
        tracker.reset(Direction::Send, 5);
        tracker.on_bytes_progressed(Direction::Send, 3);
        assert!(!tracker.is_done(Direction::Send));
        tracker.on_bytes_progressed(Direction::Send, 5);
        assert!(tracker.is_done(Direction::Send));
    }

    #[test]
    fn test_armed_receive_not_done() {
        let tracker = TransferTracker::new();
        tracker.reset(Direction::Receive, 5);
        assert!(!tracker.is_done(Direction::Receive));
    }

    #[test]
    fn test_directions_independent() {
        let tracker = TransferTracker::new();
        tracker.reset(Direction::Send, 5);
        tracker.reset(Direction::Receive, 5);
        tracker.on_bytes_progressed(Direction::Send, 5);
        assert!(tracker.is_done(Direction::Send));
        assert!(!tracker.is_done(Direction::Receive));
        assert_eq!(tracker.completed_count(Direction::Receive), 0);
    }

    #[test]
    fn test_zero_length_done_immediately() {
        let tracker = TransferTracker::new();
        tracker.reset(Direction::Send, 0);
        tracker.on_bytes_progressed(Direction::Send, 0);
        assert!(tracker.is_done(Direction::Send));
    }

    #[test]
    fn test_begin_rejects_overlap() {
        let tracker = TransferTracker::new();
        tracker.begin(Direction::Send, 5).unwrap();
        tracker.on_bytes_progressed(Direction::Send, 2);
        let err = tracker.begin(Direction::Send, 5).unwrap_err();
        assert_eq!(
            err,
            TrackerError::Busy {
                direction: Direction::Send,
                completed: 2,
                requested: 5,
            }
        );
        // Other direction is unaffected.
        tracker.begin(Direction::Receive, 5).unwrap();

        tracker.on_bytes_progressed(Direction::Send, 5);
        tracker.begin(Direction::Send, 1).unwrap();
    }

    #[test]
    fn test_completion_handler_from_another_thread() {
        let tracker = Arc::new(TransferTracker::new());
        tracker.reset(Direction::Receive, 4);
        let mut handler = tracker.completion_handler(Direction::Receive);
        std::thread::spawn(move || {
            handler(1);
            handler(4);
        })
        .join()
        .unwrap();
        assert!(tracker.is_done(Direction::Receive));
        assert!(tracker.is_done(Direction::Send));
    }
}
