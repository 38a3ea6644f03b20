//! Bounded delay history used by the trigger fallback estimator
//!
//! Keeps the most recent samples in arrival order and drops the oldest once
//! capacity is reached. The median is preferred over the mean so a single
//! jammed package does not drag the estimate outside the normal travel time.

use std::collections::VecDeque;
use std::time::Duration;

/// Default number of samples kept per history
pub const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct DelayHistory {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl DelayHistory {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { samples: VecDeque::with_capacity(capacity), capacity: capacity.max(1) }
    }

    /// Append a sample, evicting the oldest when full
    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn median(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2)
        } else {
            Some(sorted[mid])
        }
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl Default for DelayHistory {
    fn default() -> Self {
        Self::new()
    }
}
