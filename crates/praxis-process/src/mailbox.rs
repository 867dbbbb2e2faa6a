use std::collections::VecDeque;
use std::fmt;

use praxis_types::Instant;

/// What happens when an enqueue hits a full mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Refuse the new message; `enqueue` reports rejection.
    Reject,
    /// Discard the oldest queued message, then accept the new one.
    DropOldest,
}

/// A message accepted into a mailbox.
#[derive(Debug)]
pub struct Queued<M> {
    pub msg: M,
    pub seq: u64,
    pub enqueued_at: Instant,
}

/// Result of an enqueue attempt. The owning process maps these to
/// `mailbox:full` / `mailbox:enqueue` events after releasing its lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    Accepted { seq: u64 },
    AcceptedAfterDrop { seq: u64, dropped_seq: u64 },
    Rejected,
}

impl Enqueued {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Bounded FIFO owned by a single process.
///
/// Sequence numbers are strictly increasing across the mailbox lifetime,
/// including messages later dropped by the overflow policy. Dequeue order
/// matches enqueue order for accepted messages.
pub struct Mailbox<M> {
    capacity: usize,
    policy: OverflowPolicy,
    items: VecDeque<Queued<M>>,
    next_seq: u64,
}

impl<M> Mailbox<M> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            items: VecDeque::new(),
            next_seq: 1,
        }
    }

    pub fn enqueue(&mut self, msg: M, at: Instant) -> Enqueued {
        let mut dropped = None;
        if self.items.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Reject => return Enqueued::Rejected,
                OverflowPolicy::DropOldest => {
                    dropped = self.items.pop_front().map(|q| q.seq);
                }
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.push_back(Queued {
            msg,
            seq,
            enqueued_at: at,
        });
        match dropped {
            Some(dropped_seq) => Enqueued::AcceptedAfterDrop { seq, dropped_seq },
            None => Enqueued::Accepted { seq },
        }
    }

    pub fn dequeue(&mut self) -> Option<Queued<M>> {
        self.items.pop_front()
    }

    /// Drop everything still queued. Reply handles inside the messages are
    /// dropped with them, which is how pending asks learn the process
    /// stopped.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}

impl<M> fmt::Debug for Mailbox<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("len", &self.items.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish()
    }
}
