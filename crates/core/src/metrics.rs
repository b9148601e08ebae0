use crate::{BoardObserver, StopReason};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

const TRACKED_LINES: usize = 32;

#[derive(Debug)]
pub struct BoardMetrics {
    step_count: AtomicU64,
    run_count: AtomicU64,
    interrupts: [AtomicU64; TRACKED_LINES],
    start_time: Instant,
}

/// Serializable copy of the counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub steps: u64,
    pub runs: u64,
    pub interrupts: u64,
    /// `(line, count)` for every line that fired.
    pub per_line: Vec<(u32, u64)>,
    pub steps_per_second: f64,
}

impl Default for BoardMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BoardMetrics {
    pub fn new() -> Self {
        Self {
            step_count: AtomicU64::new(0),
            run_count: AtomicU64::new(0),
            interrupts: std::array::from_fn(|_| AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn reset(&self) {
        self.step_count.store(0, Ordering::SeqCst);
        self.run_count.store(0, Ordering::SeqCst);
        for counter in &self.interrupts {
            counter.store(0, Ordering::SeqCst);
        }
    }

    pub fn get_steps(&self) -> u64 {
        self.step_count.load(Ordering::SeqCst)
    }

    pub fn get_interrupts(&self, line: u32) -> u64 {
        self.interrupts
            .get(line as usize)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn get_total_interrupts(&self) -> u64 {
        self.interrupts
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .sum()
    }

    pub fn get_steps_per_second(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.get_steps() as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let per_line = (0..TRACKED_LINES as u32)
            .map(|line| (line, self.get_interrupts(line)))
            .filter(|(_, count)| *count > 0)
            .collect();
        MetricsSummary {
            steps: self.get_steps(),
            runs: self.run_count.load(Ordering::SeqCst),
            interrupts: self.get_total_interrupts(),
            per_line,
            steps_per_second: self.get_steps_per_second(),
        }
    }
}

impl BoardObserver for BoardMetrics {
    fn on_run_stop(&self, _reason: StopReason) {
        self.run_count.fetch_add(1, Ordering::SeqCst);
    }

    fn on_step(&self, _step: u64) {
        self.step_count.fetch_add(1, Ordering::SeqCst);
    }

    fn on_interrupt(&self, line: u32) {
        if let Some(counter) = self.interrupts.get(line as usize) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}
