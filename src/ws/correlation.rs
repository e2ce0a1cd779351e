//! Outstanding-request table for one connection generation.
//!
//! The table is owned by the dispatch loop task and never shared. Callers reach it
//! only through commands sent to that task. Every waiter carries a deadline in a
//! [`DelayQueue`], so an entry leaves the table through exactly one of: resolution,
//! expiry, cancellation or generation teardown.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::poll_fn;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;

use super::envelope::{Envelope, Opcode};
use crate::Result;
use crate::error::Error;

/// Furthest deadline the table schedules. The timer wheel behind [`DelayQueue`] only
/// spans about two years; waiters asked to wait longer expire after a year.
pub(crate) const MAX_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Result slot handed back to the caller of `send_request`.
pub(crate) type Reply = oneshot::Sender<Result<Envelope>>;

struct Waiter {
    opcode: Opcode,
    timeout: Duration,
    deadline: Key,
    reply: Reply,
}

/// Outcome of offering a reply frame to the table.
#[derive(Debug)]
pub(crate) enum Resolution {
    /// A waiter was found and settled
    Resolved { abandoned: bool },
    /// No waiter for this seq in this generation
    Unmatched(Envelope),
}

pub(crate) struct CorrelationTable {
    generation: u64,
    capacity: usize,
    waiters: HashMap<u64, Waiter>,
    deadlines: DelayQueue<u64>,
}

impl CorrelationTable {
    pub(crate) fn new(generation: u64, capacity: usize) -> Self {
        Self {
            generation,
            capacity,
            waiters: HashMap::new(),
            deadlines: DelayQueue::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Register a waiter for `seq` that expires at `deadline`.
    ///
    /// When the table is full or `seq` is already taken, the reply is settled with an
    /// error immediately and `false` is returned.
    pub(crate) fn register(
        &mut self,
        seq: u64,
        opcode: Opcode,
        deadline: Instant,
        timeout: Duration,
        reply: Reply,
    ) -> bool {
        if self.waiters.len() >= self.capacity {
            _ = reply.send(Err(Error::validation(format!(
                "too many pending requests ({})",
                self.capacity
            ))));
            return false;
        }

        match self.waiters.entry(seq) {
            Entry::Occupied(_) => {
                _ = reply.send(Err(Error::validation(format!(
                    "sequence number {seq} is already pending"
                ))));
                false
            }
            Entry::Vacant(slot) => {
                let deadline = deadline.min(Instant::now() + MAX_DEADLINE);
                let key = self.deadlines.insert_at(seq, deadline);
                slot.insert(Waiter {
                    opcode,
                    timeout,
                    deadline: key,
                    reply,
                });
                true
            }
        }
    }

    /// Settle the waiter matching `envelope.seq`, at most once.
    ///
    /// An error payload settles the waiter with a [`Kind::Protocol`](crate::error::Kind::Protocol)
    /// error instead of the frame.
    pub(crate) fn resolve(&mut self, envelope: Envelope) -> Resolution {
        let Some(waiter) = self.waiters.remove(&envelope.seq) else {
            return Resolution::Unmatched(envelope);
        };
        self.deadlines.remove(&waiter.deadline);

        let outcome = match envelope.server_error() {
            Some(error) => Err(error.into()),
            None => Ok(envelope),
        };
        let abandoned = waiter.reply.send(outcome).is_err();

        Resolution::Resolved { abandoned }
    }

    /// Drop the waiter for `seq` without settling it. Returns whether it was present.
    pub(crate) fn cancel(&mut self, seq: u64) -> bool {
        match self.waiters.remove(&seq) {
            Some(waiter) => {
                self.deadlines.remove(&waiter.deadline);
                true
            }
            None => false,
        }
    }

    /// Wait for the next deadline to pass.
    ///
    /// Resolves to `None` immediately when nothing is pending, which disables the
    /// corresponding `select!` branch until the next loop iteration.
    pub(crate) async fn next_expired(&mut self) -> Option<u64> {
        poll_fn(|cx| self.deadlines.poll_expired(cx))
            .await
            .map(|expired| expired.into_inner())
    }

    /// Fail the waiter whose deadline fired with a timeout error.
    pub(crate) fn expire(&mut self, seq: u64) -> bool {
        // The deadline entry was already yielded by the queue
        let Some(waiter) = self.waiters.remove(&seq) else {
            return false;
        };
        _ = waiter
            .reply
            .send(Err(Error::timeout(seq, waiter.opcode, waiter.timeout)));
        true
    }

    /// Settle every waiter with the error produced by `make` and empty the table.
    pub(crate) fn fail_all<F: Fn(u64) -> Error>(&mut self, make: F) -> usize {
        self.deadlines.clear();
        let count = self.waiters.len();
        for (seq, waiter) in self.waiters.drain() {
            _ = waiter.reply.send(Err(make(seq)));
        }
        count
    }
}
