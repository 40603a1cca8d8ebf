//! Callback records carried through the wait-free queue.
//!
//! The C original embeds an intrusive link plus a raw function pointer
//! inside the user's own struct. Rust's ownership rules make that layout
//! awkward without `unsafe` that buys nothing (see `DESIGN.md`), so a
//! [`ReclaimNode`] is instead a heap-allocated record that owns a
//! type-erased `FnOnce` closure. The closure captures whatever value the
//! producer wants released and is responsible for dropping it, matching the
//! "callback frees the object" contract of the original.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::AtomicPtr;

type BoxedRun = Box<dyn FnOnce() + Send + 'static>;

/// One deferred callback, queued against a worker until a grace period lets
/// it run safely.
///
/// `run` lives in an `UnsafeCell` rather than behind a lock: a producer
/// writes it once, before the node is ever published through
/// [`Wfq::enqueue`](crate::queue::Wfq::enqueue), and only the queue's single
/// consumer ever reads it afterwards (via [`take_run`](Self::take_run)),
/// so the two accesses never race.
pub(crate) struct ReclaimNode {
    pub(crate) next: AtomicPtr<ReclaimNode>,
    run: UnsafeCell<Option<BoxedRun>>,
}

// SAFETY: `run` is written once by its creating thread before the node is
// published (via the queue's tail swap), and read exactly once afterwards
// by the queue's single consumer thread; the publish/consume handoff is
// itself ordered by the queue's `next`-link atomics.
unsafe impl Send for ReclaimNode {}
unsafe impl Sync for ReclaimNode {}

impl ReclaimNode {
    /// Build a node that, when invoked, calls `func(value)`.
    pub(crate) fn new<T, F>(value: T, func: F) -> Box<Self>
    where
        T: Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            run: UnsafeCell::new(Some(Box::new(move || func(value)))),
        })
    }

    /// The queue's permanent sentinel. Carries no payload.
    pub(crate) fn dummy() -> Box<Self> {
        Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            run: UnsafeCell::new(None),
        })
    }

    /// Take this node's callback, leaving it empty (as a dummy would be).
    ///
    /// # Safety
    ///
    /// Must only be called by the queue's single consumer, and only once
    /// per node, after establishing happens-before with the producer that
    /// created it (the queue's `next`-link handoff provides this).
    pub(crate) unsafe fn take_run(&self) -> Option<BoxedRun> {
        // SAFETY: see function contract.
        unsafe { &mut *self.run.get() }.take()
    }
}
