//! Quiescent-State-Based Reclamation (QSBR) grace-period primitive.
//!
//! Readers are wait-free: entering and leaving a read-side critical section
//! costs nothing beyond a thread-local lookup. Writers call
//! [`wait_for_grace_period`], which blocks until every currently registered
//! reader has passed through at least one quiescent state since the call
//! began — at that point no reader can still hold a reference to data that
//! was unpublished before the call started.
//!
//! This crate is the grace-period collaborator consumed by `reclaim-core`'s
//! worker loop. It does not know about callbacks, queues, or workers; it only
//! answers "has every reader observed a point after time T".
//!
//! # Safety
//!
//! [`RcuDomain`] manages a raw pointer internally so that readers can
//! dereference the current published value without locking. All public APIs
//! document their safety invariants.

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of concurrently registered readers.
const MAX_READERS: usize = 256;

/// Sentinel marking an empty slot.
const SLOT_EMPTY: u32 = 0;

/// Sentinel epoch for a reader that is offline (unregistered, or between
/// `reader_offline`/`reader_online`).
const EPOCH_OFFLINE: u64 = 0;

const CACHE_LINE: usize = 64;

// ---------------------------------------------------------------------------
// Per-reader slot
// ---------------------------------------------------------------------------

#[repr(C)]
struct ReaderSlot {
    /// Reader id owning this slot (0 = empty).
    id: AtomicU32,
    /// Last epoch this reader is known to have observed.
    epoch: AtomicU64,
    _pad: [u8; CACHE_LINE - 12],
}

impl ReaderSlot {
    const fn new() -> Self {
        Self {
            id: AtomicU32::new(SLOT_EMPTY),
            epoch: AtomicU64::new(EPOCH_OFFLINE),
            _pad: [0u8; CACHE_LINE - 12],
        }
    }
}

static GLOBAL_EPOCH: AtomicU64 = AtomicU64::new(1);

#[allow(clippy::declare_interior_mutable_const)]
static READER_SLOTS: [ReaderSlot; MAX_READERS] = {
    const EMPTY: ReaderSlot = ReaderSlot::new();
    [EMPTY; MAX_READERS]
};

static REGISTERED_COUNT: AtomicU32 = AtomicU32::new(0);

/// Monotonic counter handing out reader ids; 0 is reserved for "empty".
static NEXT_READER_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    /// This thread's reader id and slot, once registered.
    static SELF: Cell<Option<(u32, usize)>> = const { Cell::new(None) };
}

// ---------------------------------------------------------------------------
// Reader-side API
// ---------------------------------------------------------------------------

/// Register the calling thread as an RCU reader.
///
/// Idempotent: calling this again on a thread that is already registered is
/// a cheap no-op that returns the same slot. Must be called before
/// [`reader_offline`]/[`reader_online`] or any [`RcuDomain::read`].
///
/// Returns the slot index on success, or `Err(())` if the reader table is
/// full (at most [`MAX_READERS`] concurrently registered readers).
pub fn reader_register() -> Result<usize, ()> {
    if let Some((_, slot)) = SELF.with(|s| s.get()) {
        return Ok(slot);
    }

    let id = NEXT_READER_ID.fetch_add(1, Ordering::Relaxed);
    let start = (id as usize) % MAX_READERS;
    for i in 0..MAX_READERS {
        let idx = (start + i) % MAX_READERS;
        match READER_SLOTS[idx].id.compare_exchange(
            SLOT_EMPTY,
            id,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let ge = GLOBAL_EPOCH.load(Ordering::Acquire);
                READER_SLOTS[idx].epoch.store(ge, Ordering::Release);
                REGISTERED_COUNT.fetch_add(1, Ordering::AcqRel);
                SELF.with(|s| s.set(Some((id, idx))));
                return Ok(idx);
            }
            Err(_) => continue,
        }
    }
    Err(())
}

/// Unregister the calling thread. A no-op if it was never registered.
///
/// After this call the thread is implicitly quiescent: a concurrent
/// [`wait_for_grace_period`] will not wait for it.
pub fn reader_unregister() {
    if let Some((_, idx)) = SELF.with(|s| s.take()) {
        READER_SLOTS[idx]
            .epoch
            .store(EPOCH_OFFLINE, Ordering::Release);
        READER_SLOTS[idx].id.store(SLOT_EMPTY, Ordering::Release);
        REGISTERED_COUNT.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Mark the calling thread as offline: it is guaranteed not to access any
/// RCU-protected data until the matching [`reader_online`]. A grace period
/// in progress (or started later) will not wait for an offline reader.
///
/// The thread remains registered (its slot is retained); this is cheaper
/// than unregistering and re-registering around a sleep.
pub fn reader_offline() {
    SELF.with(|s| {
        if let Some((_, idx)) = s.get() {
            READER_SLOTS[idx]
                .epoch
                .store(EPOCH_OFFLINE, Ordering::Release);
        }
    });
}

/// Mark the calling thread as back online, observing the current epoch.
/// Call this immediately before re-entering a read-side critical section
/// after [`reader_offline`].
pub fn reader_online() {
    SELF.with(|s| {
        if let Some((_, idx)) = s.get() {
            let ge = GLOBAL_EPOCH.load(Ordering::Acquire);
            READER_SLOTS[idx].epoch.store(ge, Ordering::Release);
        }
    });
}

/// Record that the calling thread has passed through a quiescent point
/// (observed all writes published before this call). Registered readers
/// that never call this will block every `wait_for_grace_period` forever;
/// in practice a reader calls this at loop boundaries or uses
/// `reader_offline`/`reader_online` around blocking waits instead.
pub fn quiescent_state() {
    SELF.with(|s| {
        if let Some((_, idx)) = s.get() {
            let ge = GLOBAL_EPOCH.load(Ordering::Acquire);
            READER_SLOTS[idx].epoch.store(ge, Ordering::Release);
        }
    });
}

/// Enter an RCU read-side critical section. No-op under QSBR — present for
/// symmetry with [`rcu_read_unlock`] and to mark critical sections in
/// caller code for readability.
#[inline(always)]
pub fn rcu_read_lock() {}

/// Leave an RCU read-side critical section. No-op under QSBR; the reader
/// must still call [`quiescent_state`] (or go through
/// [`reader_offline`]/[`reader_online`]) for writers to make progress.
#[inline(always)]
pub fn rcu_read_unlock() {}

// ---------------------------------------------------------------------------
// Writer-side API
// ---------------------------------------------------------------------------

/// Block the calling thread until every *other* reader registered at call
/// time (and not presently offline) has observed at least one epoch at or
/// after the one this call publishes.
///
/// The calling thread's own slot, if it has one, is excluded from the wait:
/// a registered reader that calls this directly (as every worker's drain
/// loop does, to wait out readers of the object it is about to reclaim)
/// cannot itself advance past its own epoch while blocked inside this call,
/// so waiting on its own slot would deadlock unconditionally rather than
/// resolve once every *other* reader catches up. A caller that is also a
/// long-lived reader and wants its own quiescence reflected in future grace
/// periods should call [`quiescent_state`] (or bracket with
/// [`reader_offline`]/[`reader_online`]) itself; this call only ever needed
/// to wait for threads other than itself.
///
/// Concurrent callers must serialize against each other externally (e.g. via
/// a mutex); the global epoch counter itself is not designed to be advanced
/// by overlapping writers.
pub fn wait_for_grace_period() {
    if REGISTERED_COUNT.load(Ordering::Acquire) == 0 {
        return;
    }

    let new_epoch = GLOBAL_EPOCH.fetch_add(1, Ordering::AcqRel) + 1;
    let self_slot = SELF.with(|s| s.get()).map(|(_, idx)| idx);

    for (idx, slot) in READER_SLOTS.iter().enumerate() {
        if Some(idx) == self_slot {
            continue;
        }
        loop {
            let slot_id = slot.id.load(Ordering::Acquire);
            if slot_id == SLOT_EMPTY {
                break;
            }
            let reader_epoch = slot.epoch.load(Ordering::Acquire);
            if reader_epoch == EPOCH_OFFLINE || reader_epoch >= new_epoch {
                break;
            }
            core::hint::spin_loop();
        }
    }
}

/// Rebuild reader bookkeeping after `fork(2)`.
///
/// `fork` clones only the calling thread; every other slot in
/// [`READER_SLOTS`] still looks registered (the memory was copied
/// verbatim) but belongs to a thread that no longer exists in this process.
/// A writer that later calls [`wait_for_grace_period`] would spin forever
/// waiting for those phantom readers to advance. This clears every slot,
/// then re-registers the calling thread under a fresh id if it was
/// registered before the fork.
///
/// Must be called in the child, before any other reader or writer
/// operation in this process.
pub fn after_fork_child_reset() {
    let was_registered = SELF.with(|s| s.get()).is_some();
    for slot in &READER_SLOTS {
        slot.id.store(SLOT_EMPTY, Ordering::Release);
        slot.epoch.store(EPOCH_OFFLINE, Ordering::Release);
    }
    REGISTERED_COUNT.store(0, Ordering::Release);
    SELF.with(|s| s.set(None));
    if was_registered {
        let _ = reader_register();
    }
}

/// Best-effort current CPU index for per-CPU worker selection. Returns
/// `None` if the platform does not support the underlying query or the
/// result does not fit an index (treated by callers as "fall back to the
/// default worker").
pub fn current_cpu() -> Option<usize> {
    // SAFETY: `sched_getcpu` takes no arguments and only reads scheduler
    // state; a negative return means "unknown", not undefined behavior.
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 { None } else { Some(cpu as usize) }
}

// ---------------------------------------------------------------------------
// RcuDomain<T> — type-safe RCU-protected pointer
// ---------------------------------------------------------------------------

/// A type-safe RCU-protected pointer to `T`.
///
/// Writers publish new versions via [`update`](Self::update); readers
/// observe the current version via [`read`](Self::read). The old version
/// returned by `update` must not be freed until after a grace period.
pub struct RcuDomain<T> {
    ptr: AtomicUsize,
    _marker: core::marker::PhantomData<*mut T>,
}

// SAFETY: access is mediated entirely through atomic operations plus the
// grace-period contract enforced by the caller.
unsafe impl<T: Send + Sync> Send for RcuDomain<T> {}
unsafe impl<T: Send + Sync> Sync for RcuDomain<T> {}

impl<T> Default for RcuDomain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RcuDomain<T> {
    /// Create an empty domain (null pointer).
    pub const fn new() -> Self {
        Self {
            ptr: AtomicUsize::new(0),
            _marker: core::marker::PhantomData,
        }
    }

    /// Read the current value. Returns `None` if nothing has been
    /// published yet.
    ///
    /// # Safety
    ///
    /// The caller must be within a conceptual RCU read-side critical
    /// section: the returned reference is only valid until the calling
    /// thread's next quiescent point.
    pub unsafe fn read(&self) -> Option<&T> {
        let p = self.ptr.load(Ordering::Acquire);
        if p == 0 {
            None
        } else {
            Some(unsafe { &*(p as *const T) })
        }
    }

    /// Publish a new version, returning the previous raw pointer (0 if
    /// none). The caller must not free the old pointer until after
    /// [`wait_for_grace_period`] returns.
    ///
    /// # Safety
    ///
    /// `new_ptr` must be a live, heap-allocated `T` (or null). Callers must
    /// serialize concurrent `update`s themselves (e.g. via a registry
    /// mutex).
    pub unsafe fn update(&self, new_ptr: *mut T) -> *mut T {
        self.ptr.swap(new_ptr as usize, Ordering::AcqRel) as *mut T
    }

    /// Raw pointer value, for tests and diagnostics.
    pub fn load_raw(&self) -> usize {
        self.ptr.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) fn reset_for_test() {
    GLOBAL_EPOCH.store(1, Ordering::Release);
    REGISTERED_COUNT.store(0, Ordering::Release);
    for slot in &READER_SLOTS {
        slot.id.store(SLOT_EMPTY, Ordering::Release);
        slot.epoch.store(EPOCH_OFFLINE, Ordering::Release);
    }
    SELF.with(|s| s.set(None));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn lock_and_reset() -> std::sync::MutexGuard<'static, ()> {
        let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        reset_for_test();
        guard
    }

    #[test]
    fn register_is_idempotent_on_same_thread() {
        let _g = lock_and_reset();
        let a = reader_register().unwrap();
        let b = reader_register().unwrap();
        assert_eq!(a, b);
        assert_eq!(REGISTERED_COUNT.load(Ordering::Acquire), 1);
    }

    #[test]
    fn unregister_then_register_gets_a_fresh_slot_state() {
        let _g = lock_and_reset();
        let idx = reader_register().unwrap();
        reader_unregister();
        assert_eq!(READER_SLOTS[idx].id.load(Ordering::Acquire), SLOT_EMPTY);
        assert_eq!(REGISTERED_COUNT.load(Ordering::Acquire), 0);
    }

    #[test]
    fn offline_reader_does_not_block_grace_period() {
        let _g = lock_and_reset();
        reader_register().unwrap();
        reader_offline();
        // Should return immediately: the only reader is offline.
        wait_for_grace_period();
    }

    #[test]
    fn online_reader_blocks_until_quiescent_state_observed() {
        let _g = lock_and_reset();
        reader_register().unwrap();

        let handle = std::thread::spawn(wait_for_grace_period);
        std::thread::sleep(std::time::Duration::from_millis(10));
        // Simulate the reader's own thread catching up. We can't call
        // quiescent_state() from the spawned thread (different SELF), so
        // exercise the same effect directly against our own registration.
        quiescent_state();
        handle.join().expect("grace period thread panicked");
    }

    #[test]
    fn registered_thread_calling_wait_for_grace_period_on_itself_does_not_deadlock() {
        let _g = lock_and_reset();
        reader_register().unwrap();
        // A worker's drain loop calls this on itself while still registered
        // (and still online). Without self-exclusion this would spin
        // forever: nothing else would ever advance this thread's epoch
        // while it's stuck inside the wait.
        wait_for_grace_period();
    }

    #[test]
    fn multiple_readers_all_gate_the_writer() {
        let _g = lock_and_reset();

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(5));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let b = barrier.clone();
            handles.push(std::thread::spawn(move || {
                reader_register().unwrap();
                b.wait();
                std::thread::sleep(std::time::Duration::from_millis(5));
                quiescent_state();
            }));
        }

        barrier.wait();
        wait_for_grace_period();

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn rcu_domain_publishes_and_reads() {
        let _g = lock_and_reset();
        let domain: RcuDomain<u64> = RcuDomain::new();
        unsafe {
            assert!(domain.read().is_none());
            let p1 = Box::into_raw(Box::new(42u64));
            let old = domain.update(p1);
            assert!(old.is_null());
            assert_eq!(*domain.read().unwrap(), 42);

            let p2 = Box::into_raw(Box::new(7u64));
            let old2 = domain.update(p2);
            assert_eq!(old2, p1);
            assert_eq!(*domain.read().unwrap(), 7);

            drop(Box::from_raw(p1));
            drop(Box::from_raw(p2));
        }
    }

    #[test]
    fn current_cpu_is_some_index_or_none() {
        // Just exercise the call; either result is valid depending on host.
        let _ = current_cpu();
    }
}
