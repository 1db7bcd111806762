//! Bounded dial slots with priority-ordered FIFO admission.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A bounded pool of dial slots.
///
/// Waiters are admitted highest priority first, strict FIFO within a
/// priority. The pool keeps two gauges: how many acquirers are waiting
/// and how many slots are in use.
pub(crate) struct DialSlots {
    queue: Mutex<SlotQueue>,
    pending: AtomicUsize,
    in_use: AtomicUsize,
    self_ref: Weak<DialSlots>,
}

struct SlotQueue {
    available: usize,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
}

struct Waiter {
    priority: u8,
    seq: u64,
    grant: oneshot::Sender<SlotPermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins, earlier arrival breaks ties.
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Holds one slot. Dropping it hands the slot to the next waiter.
pub(crate) struct SlotPermit {
    slots: Arc<DialSlots>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.slots.release();
    }
}

impl DialSlots {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            queue: Mutex::new(SlotQueue {
                available: capacity,
                waiters: BinaryHeap::new(),
                next_seq: 0,
            }),
            pending: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            self_ref: self_ref.clone(),
        })
    }

    /// Number of acquirers waiting for a slot.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(AtomicOrdering::Relaxed)
    }

    /// Number of slots currently held.
    pub(crate) fn in_use(&self) -> usize {
        self.in_use.load(AtomicOrdering::Relaxed)
    }

    /// Wait for a slot. Returns `None` when `cancel` fires first.
    pub(crate) async fn acquire(
        &self,
        priority: u8,
        cancel: &CancellationToken,
    ) -> Option<SlotPermit> {
        if cancel.is_cancelled() {
            return None;
        }
        let rx = {
            let mut queue = self.queue.lock();
            if queue.available > 0 {
                let permit = self.permit()?;
                queue.available -= 1;
                self.in_use.fetch_add(1, AtomicOrdering::Relaxed);
                return Some(permit);
            }
            let (tx, rx) = oneshot::channel();
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.waiters.push(Waiter { priority, seq, grant: tx });
            self.pending.store(queue.waiters.len(), AtomicOrdering::Relaxed);
            rx
        };

        tokio::select! {
            permit = rx => permit.ok(),
            _ = cancel.cancelled() => {
                // Purge dead waiters so the gauge stays honest. The grant
                // side skips closed waiters regardless.
                let mut queue = self.queue.lock();
                queue.waiters.retain(|waiter| !waiter.grant.is_closed());
                self.pending.store(queue.waiters.len(), AtomicOrdering::Relaxed);
                None
            }
        }
    }

    fn permit(&self) -> Option<SlotPermit> {
        self.self_ref.upgrade().map(|slots| SlotPermit { slots })
    }

    fn release(&self) {
        let mut queue = self.queue.lock();
        let next = loop {
            match queue.waiters.pop() {
                Some(waiter) if waiter.grant.is_closed() => continue,
                other => break other,
            }
        };
        self.pending.store(queue.waiters.len(), AtomicOrdering::Relaxed);
        match (next, self.permit()) {
            (Some(waiter), Some(permit)) => {
                // The slot transfers to the waiter; `in_use` is unchanged.
                // Unlock first: if the hand-off loses a race with the
                // receiver going away, the returned permit re-enters
                // release() when dropped.
                drop(queue);
                let _ = waiter.grant.send(permit);
            }
            _ => {
                queue.available += 1;
                self.in_use.fetch_sub(1, AtomicOrdering::Relaxed);
            }
        }
    }
}
