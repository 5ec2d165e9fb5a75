//! Fixed-capacity request history.
//!
//! A `History` always holds exactly `capacity` timestamps, oldest first.
//! Slots that have never been written hold [`Timestamp::BEGINNING_OF_TIME`].
//!
//! ```text
//!   slots = [t3, t1, t2]     head = 1
//!
//!   oldest => slots[head]
//!   newest => slots[(head + capacity - 1) % capacity]
//!   push   => slots[head] = t, head = (head + 1) % capacity
//! ```

use super::timestamp::Timestamp;

/// Ring buffer of the most recent accepted timestamps for one entity.
#[derive(Debug, Clone)]
pub struct History {
    slots: Box<[Timestamp]>,
    /// Index of the oldest entry.
    head: usize,
}

/// Returned by [`History::push`] when the timestamp is older than the newest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfOrder {
    pub latest: Timestamp,
}

impl History {
    /// Create a history filled with sentinels.
    ///
    /// `capacity` must be non-zero; the limiter validates this at construction.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "history capacity must be non-zero");
        Self {
            slots: vec![Timestamp::BEGINNING_OF_TIME; capacity].into_boxed_slice(),
            head: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The oldest retained timestamp, or the sentinel if fewer than
    /// `capacity` requests were ever recorded.
    pub fn oldest(&self) -> Timestamp {
        self.slots[self.head]
    }

    /// The most recently recorded timestamp, or the sentinel if none.
    pub fn newest(&self) -> Timestamp {
        let cap = self.slots.len();
        self.slots[(self.head + cap - 1) % cap]
    }

    /// Append `timestamp`, evicting the oldest entry.
    ///
    /// Leaves the history untouched if `timestamp` is older than [`newest`](Self::newest).
    pub fn push(&mut self, timestamp: Timestamp) -> Result<Timestamp, OutOfOrder> {
        let latest = self.newest();
        if timestamp < latest {
            return Err(OutOfOrder { latest });
        }

        self.slots[self.head] = timestamp;
        self.head = (self.head + 1) % self.slots.len();
        Ok(timestamp)
    }

    /// Iterate from oldest to newest, sentinels included.
    pub fn iter(&self) -> impl Iterator<Item = Timestamp> + '_ {
        let (wrapped, front) = self.slots.split_at(self.head);
        front.iter().chain(wrapped.iter()).copied()
    }

    pub fn to_vec(&self) -> Vec<Timestamp> {
        self.iter().collect()
    }
}
