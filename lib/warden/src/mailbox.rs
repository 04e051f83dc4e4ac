// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The mailbox: the one cross-worker channel in the plane.
//!
//! A bounded multi-producer / single-consumer queue of command
//! records. Producers may sit on any worker; the consumer is the
//! worker the mailbox belongs to, which drains it in bursts between
//! packet bursts. Ordering is FIFO per producer with no guarantee
//! across producers. Overflow is non-fatal: the producer gets its
//! command back and decides what to do with its own work item.
//!
//! The backing ring is lock-free; nothing on this path blocks. A
//! dequeued command is owned by the consumer and its slot is released
//! when the command is dropped, so the "free exactly once" obligation
//! of a slab-backed ring is discharged by ownership here.

use alloc::vec::Vec;
use crossbeam_queue::ArrayQueue;

/// Capacity of a worker mailbox. Sized so a burst of policy decisions
/// for one worker rides out a full packet burst of latency.
pub const MAILBOX_MAX_ENTRIES: usize = 64;

#[derive(Debug)]
pub struct Mailbox<T> {
    ring: ArrayQueue<T>,
}

impl<T> Mailbox<T> {
    pub fn new(capacity: usize) -> Self {
        Self { ring: ArrayQueue::new(capacity) }
    }

    /// Enqueue a command. On a full ring the command is handed back.
    pub fn enqueue(&self, cmd: T) -> Result<(), MailboxFull<T>> {
        self.ring.push(cmd).map_err(MailboxFull)
    }

    /// Dequeue up to `max` commands in FIFO order, appending them to
    /// `out`. Returns how many were dequeued. Consumer-only.
    pub fn dequeue_burst(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.ring.pop() {
                Some(cmd) => {
                    out.push(cmd);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// The ring was full; the rejected command rides inside.
pub struct MailboxFull<T>(pub T);

impl<T> core::fmt::Debug for MailboxFull<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "MailboxFull(..)")
    }
}
