use std::collections::VecDeque;

pub const DEFAULT_WINDOW_SIZE: usize = 20;
pub const DEFAULT_STALL_THRESHOLD: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StallAlert {
    pub oldest: f64,
    pub newest: f64,
    /// `oldest - newest`.
    pub delta: f64,
    /// 1-based count of numeric insertions into the window, including this one.
    pub insertion: u64,
}

/// Fixed-capacity ring of the most recent numeric readings for one channel.
///
/// Once the ring is full every insertion compares the oldest retained value with the newest
/// one; a difference smaller than the threshold is a stall. A long plateau therefore alerts on
/// every insertion, not once.
#[derive(Debug)]
pub struct StallWindow {
    capacity: usize,
    threshold: f64,
    values: VecDeque<f64>,
    insertions: u64,
}

impl StallWindow {
    pub fn new(capacity: usize, threshold: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            threshold,
            values: VecDeque::with_capacity(capacity),
            insertions: 0,
        }
    }

    pub fn insert(&mut self, value: f64) -> Option<StallAlert> {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
        self.insertions += 1;

        if self.values.len() < self.capacity {
            return None;
        }

        let oldest = *self.values.front()?;
        let newest = *self.values.back()?;
        let delta = oldest - newest;
        if delta.abs() < self.threshold {
            Some(StallAlert {
                oldest,
                newest,
                delta,
                insertion: self.insertions,
            })
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn insertions(&self) -> u64 {
        self.insertions
    }

    /// Oldest first.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }
}

impl Default for StallWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE, DEFAULT_STALL_THRESHOLD)
    }
}
