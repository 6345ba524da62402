//! Two-tier command queue: in-flight pending entries and locally buffered
//! waiting entries.
//!
//! Pending entries have been written to the connection and await replies in
//! submission order. Waiting entries were admitted while the client was
//! throttled or disconnected and are promoted FIFO. Persistent entries
//! (subscribe family, MONITOR) receive many replies and are excluded from
//! `pending_count`.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::time::Instant;

use crate::core::error::CommandError;
use crate::core::value::Reply;

/// Continuation invoked with each command outcome.
pub(crate) type ReplyCallback = Box<dyn FnMut(Result<Reply, CommandError>)>;

/// An in-flight command awaiting one or more replies.
pub(crate) struct PendingEntry {
    /// Stable identity; replaces queue positions, which shift under
    /// re-entrant mutation.
    pub id: u64,
    /// Taken out while the continuation executes, and permanently once the
    /// entry is skipped or finished.
    pub cb: Option<ReplyCallback>,
    /// Subscription-style entry receiving many replies
    pub persist: bool,
    /// Remaining subscription slots; 0 for MONITOR, which only ends on
    /// disconnect or cancellation
    pub sub_count: usize,
    /// Cancelled; future replies are absorbed without invoking anything
    pub skipped: bool,
    /// Whether this entry is currently included in `pending_count`
    pub counted: bool,
    /// When the command was written out, for the command timeout
    pub sent_at: Instant,
}

/// A locally buffered command that has not been sent yet.
pub(crate) struct WaitingEntry {
    /// Owned copy of the command arguments
    pub args: Vec<Bytes>,
    pub cb: ReplyCallback,
    pub persist: bool,
    pub sub_count: usize,
    /// Admission timestamp; monotonically non-decreasing in queue order
    pub queued_at: Instant,
}

#[derive(Default)]
pub(crate) struct CommandQueue {
    pub pending: VecDeque<PendingEntry>,
    pub waiting: VecDeque<WaitingEntry>,
    /// Number of counted (non-persistent, non-cancelled) pending entries
    pub pending_count: usize,
    next_id: u64,
}

impl CommandQueue {
    pub fn push_pending(&mut self, cb: ReplyCallback, persist: bool, sub_count: usize) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        if !persist {
            self.pending_count += 1;
        }
        self.pending.push_back(PendingEntry {
            id,
            cb: Some(cb),
            persist,
            sub_count,
            skipped: false,
            counted: !persist,
            sent_at: Instant::now(),
        });
        id
    }

    pub fn push_waiting(
        &mut self,
        args: Vec<Bytes>,
        cb: ReplyCallback,
        persist: bool,
        sub_count: usize,
    ) {
        self.waiting.push_back(WaitingEntry {
            args,
            cb,
            persist,
            sub_count,
            queued_at: Instant::now(),
        });
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn find(&mut self, id: u64) -> Option<&mut PendingEntry> {
        self.pending.iter_mut().find(|e| e.id == id)
    }

    /// Remove a pending entry and keep `pending_count` consistent.
    pub fn remove(&mut self, id: u64) -> Option<PendingEntry> {
        let idx = self.pending.iter().position(|e| e.id == id)?;
        let entry = self.pending.remove(idx)?;
        if entry.counted {
            self.pending_count -= 1;
        }
        Some(entry)
    }

    /// Drop an entry from `pending_count` without removing it, as
    /// cancellation does: the entry stays queued to absorb its replies.
    pub fn uncount(&mut self, id: u64) {
        if let Some(entry) = self.find(id) {
            if entry.counted {
                entry.counted = false;
                self.pending_count -= 1;
            }
        }
    }

    /// Pick the entry a decoded reply belongs to.
    ///
    /// Subscription traffic goes to the front-most persistent entry. Other
    /// replies go to the front-most non-persistent entry, falling back to
    /// the queue front so a lone MONITOR entry receives its `+OK` and
    /// traced lines.
    pub fn route_target(&self, subscription: bool) -> Option<u64> {
        if subscription {
            self.pending.iter().find(|e| e.persist).map(|e| e.id)
        } else {
            self.pending
                .iter()
                .find(|e| !e.persist)
                .map(|e| e.id)
                .or_else(|| self.pending.front().map(|e| e.id))
        }
    }
}

/// Commands that keep their entry alive across many replies.
pub(crate) fn is_persistent_command(name: &[u8]) -> bool {
    name.eq_ignore_ascii_case(b"subscribe")
        || name.eq_ignore_ascii_case(b"psubscribe")
        || name.eq_ignore_ascii_case(b"ssubscribe")
        || name.eq_ignore_ascii_case(b"monitor")
}

/// Commands whose replies are delivered as unsubscribe markers to the
/// matching subscribe entry rather than to an entry of their own.
pub(crate) fn is_unsubscribe_command(name: &[u8]) -> bool {
    name.eq_ignore_ascii_case(b"unsubscribe")
        || name.eq_ignore_ascii_case(b"punsubscribe")
        || name.eq_ignore_ascii_case(b"sunsubscribe")
}

/// Initial subscription slot count: one per channel argument for the
/// subscribe family, zero for MONITOR.
pub(crate) fn initial_sub_count(args: &[Bytes]) -> usize {
    if args[0].eq_ignore_ascii_case(b"monitor") {
        0
    } else {
        args.len() - 1
    }
}
