//! Bounded in-process journal of connection-level events.
//!
//! A [`Journal`] is created once by the embedding application, shared through an
//! [`Arc`](std::sync::Arc), and handed to the connection via
//! [`Config::journal`](crate::ws::config::Config::journal). The connection appends lines
//! for connects, handshakes, syncs, disconnects and receive-loop errors. Command layers
//! can show the tail to an operator with [`Journal::recent`]. On teardown call
//! [`Journal::drain`] to take whatever is left.
//!
//! ```
//! use std::sync::Arc;
//!
//! use max_client_sdk::journal::Journal;
//!
//! let journal = Arc::new(Journal::new(2));
//! journal.record("[connection] connected");
//! journal.record("[connection] synced");
//! journal.record("[connection] closed");
//!
//! let lines: Vec<_> = journal.recent(10).into_iter().map(|e| e.line).collect();
//! assert_eq!(lines, ["[connection] synced", "[connection] closed"]);
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

/// Default number of lines retained.
pub const DEFAULT_CAPACITY: usize = 500;

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub at: DateTime<Utc>,
    pub line: String,
}

#[derive(Debug)]
pub struct Journal {
    capacity: usize,
    entries: Mutex<VecDeque<Entry>>,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Journal {
    /// Create a journal keeping at most `capacity` lines (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a line, evicting the oldest one when full.
    pub fn record<S: Into<String>>(&self, line: S) {
        // Entries are plain values, so a poisoned lock holds nothing half-written
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(Entry {
            at: Utc::now(),
            line: line.into(),
        });
    }

    /// The newest `limit` entries, oldest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<Entry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every retained entry.
    pub fn drain(&self) -> Vec<Entry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}
