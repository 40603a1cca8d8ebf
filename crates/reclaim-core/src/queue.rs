//! Wait-free multi-producer/single-consumer callback queue.
//!
//! `enqueue` is wait-free: a producer takes exactly one atomic swap plus one
//! atomic store and never retries or loops. `drain` is lock-free with a
//! bounded spin: the only point where the consumer can stall is the narrow
//! window between a producer's tail-swap and its store into the
//! predecessor's `next`, where `next` is transiently null. The queue keeps a
//! sentinel dummy node so the consumer can always distinguish "nothing to
//! take yet" from "a node is present"; after each dequeue, the node that was
//! just taken becomes the new dummy, which keeps the list non-empty from a
//! concurrent producer's perspective even while the consumer is draining it.
//!
//! This is the classic intrusive MPSC queue described by Dmitry Vyukov
//! (1024cores.net) — the same shape `liburcu`'s `wfcqueue` uses for its
//! `call_rcu` worker queues, adapted here to own heap nodes and hand back
//! boxed closures instead of raw embedded links.

use core::sync::atomic::{AtomicPtr, Ordering};
use core::time::Duration;
use std::thread;

use crate::node::ReclaimNode;

/// How long the consumer sleeps while spinning on a transiently-null `next`
/// link (the producer has swapped the tail but not yet linked its
/// predecessor). Matches the 1 ms constant from the original design.
const LINK_SPIN_INTERVAL: Duration = Duration::from_millis(1);

pub(crate) struct Wfq {
    head: AtomicPtr<ReclaimNode>,
    tail: AtomicPtr<ReclaimNode>,
}

// SAFETY: every node pointer is reachable only through the atomics below;
// ownership transfers are mediated entirely by those atomic operations.
unsafe impl Send for Wfq {}
unsafe impl Sync for Wfq {}

impl Wfq {
    pub(crate) fn new() -> Self {
        let dummy = Box::into_raw(ReclaimNode::dummy());
        Self {
            head: AtomicPtr::new(dummy),
            tail: AtomicPtr::new(dummy),
        }
    }

    /// Wait-free: one swap, one store, no loop.
    pub(crate) fn enqueue(&self, node: Box<ReclaimNode>) {
        let node_ptr = Box::into_raw(node);
        let prev = self.tail.swap(node_ptr, Ordering::AcqRel);
        // SAFETY: `prev` was the tail at the moment of our swap; exactly one
        // producer observes any given `prev` value, since the swap is
        // atomic, so linking it is race-free.
        unsafe {
            (*prev).next.store(node_ptr, Ordering::Release);
        }
    }

    /// Best-effort emptiness check, racy against a concurrent enqueue in the
    /// same way `&q.head == load(q.tail)` is in the original: a stale read
    /// only ever causes a harmless spurious wake or drain attempt, never a
    /// missed item.
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Single-consumer: drain every node currently reachable from `head`
    /// into an owned batch of callbacks, without invoking anything. The
    /// worker loop calls `wait_for_grace_period()` between this and
    /// actually running the callbacks (see `worker.rs`), which is why
    /// draining and invoking are split into two steps here instead of one
    /// fused walk.
    pub(crate) fn take_batch(&self) -> Vec<Box<dyn FnOnce() + Send + 'static>> {
        let mut batch = Vec::new();
        loop {
            let head = self.head.load(Ordering::Relaxed);
            // SAFETY: `head` is written only by this function (the single
            // consumer) and always points at a live node.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if next.is_null() {
                if self.tail.load(Ordering::Acquire) == head {
                    break; // Genuinely empty: no producer has a node in flight.
                }
                // A producer has claimed the tail slot but not yet linked
                // `head.next`. Spin-poll for the narrow transient window.
                loop {
                    thread::sleep(LINK_SPIN_INTERVAL);
                    // SAFETY: `head` is still the consumer-owned cursor.
                    let retry = unsafe { (*head).next.load(Ordering::Acquire) };
                    if !retry.is_null() {
                        break;
                    }
                }
                continue;
            }

            // `next` becomes the new dummy; `head` is no longer referenced
            // by anything (the cursor has moved past it), so it is ours to
            // free.
            self.head.store(next, Ordering::Relaxed);
            // SAFETY: nothing else can reach `head` once `self.head` has
            // moved past it.
            unsafe { drop(Box::from_raw(head)) };

            // SAFETY: `next` is live and was published to us by a producer
            // whose write happens-before this read (the `next`-link store
            // above); we are the only consumer and take its payload once.
            if let Some(run) = unsafe { (*next).take_run() } {
                batch.push(run);
            }
        }
        batch
    }
}

impl Drop for Wfq {
    /// By the time a worker's queue is dropped, `destroy_runner`/
    /// `force_destroy` have already drained and spliced any pending
    /// callbacks elsewhere, so this only ever frees the dummy — but we walk
    /// defensively in case anything was left behind.
    fn drop(&mut self) {
        let mut cursor = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: the worker thread has been joined by this point, so
            // no concurrent access to the queue remains.
            let next = unsafe { (*cursor).next.load(Ordering::Relaxed) };
            unsafe { drop(Box::from_raw(cursor)) };
            if next.is_null() {
                break;
            }
            cursor = next;
        }
    }
}
