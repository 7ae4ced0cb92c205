use std::collections::VecDeque;

pub const DEFAULT_WINDOW_DEPTH: usize = 4;

/// Sliding window over the last `capacity` `(seconds, steps)` pairs. The step
/// sum is kept incrementally; the seconds sum is recomputed from the entries
/// on eviction so float error cannot accumulate over a long run.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    entries: VecDeque<(f64, u64)>,
    seconds: f64,
    steps: u64,
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_DEPTH)
    }
}

impl RollingWindow {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            seconds: 0.0,
            steps: 0,
        }
    }

    pub fn append(&mut self, seconds: f64, steps: u64) {
        let evicted = match self.entries.len() == self.capacity {
            true => self.entries.pop_front(),
            false => None,
        };
        self.entries.push_back((seconds, steps));
        self.steps += steps;
        match evicted {
            Some((_, old_steps)) => {
                self.steps -= old_steps;
                self.seconds = self.entries.iter().map(|&(s, _)| s).sum();
            }
            None => self.seconds += seconds,
        }
    }

    /// Steps per second over the window, or `0.0` when there is no elapsed time.
    pub fn rate(&self) -> f64 {
        match self.seconds > 0.0 {
            true => self.steps as f64 / self.seconds,
            false => 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
