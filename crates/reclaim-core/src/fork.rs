//! Fork safety: a worker's OS thread does not survive `fork(2)` into the
//! child, but the lock it might have been holding and the registry state
//! describing it both do, unless something actively quiesces and rebuilds
//! them around the call.
//!
//! The protocol:
//! - [`before_fork`] locks the registry and pauses every worker, blocking
//!   until each has acknowledged `PAUSED`, so no worker thread is mid-drain
//!   (and therefore potentially holding an allocator lock, the classic
//!   fork-in-threaded-program hazard) at the moment `fork()` is called.
//! - The parent, via [`ForkGuard::after_fork_parent`], simply resumes every
//!   worker and releases the registry lock.
//! - The child, via [`ForkGuard::after_fork_child`], has zero surviving
//!   worker threads (fork only clones the calling thread) but a registry
//!   that still lists them as alive. It force-stops every stale worker
//!   (bypassing the normal handshake, since there is no thread left to
//!   answer it), migrates their still-pending callbacks onto a freshly
//!   spawned default worker, and clears the per-CPU table and thread-local
//!   override so neither point at threads that no longer exist.

use parking_lot::MutexGuard;

use crate::config::EngineConfig;
use crate::registry::{self, global_registry, Runner};
use crate::worker::PAUSE;

/// Held across a `fork()` call. Dropping it without calling one of the
/// `after_fork_*` methods leaves the registry permanently paused, so callers
/// must always route through [`with_forked_child`] or match the guard with
/// exactly one of the two consuming methods.
pub struct ForkGuard {
    workers: Vec<Runner>,
    config: EngineConfig,
    _lock: MutexGuard<'static, ()>,
}

// The registry's own internal mutex already serializes registry mutation;
// `before_fork` needs a *distinct* lock so that holding it across the actual
// `fork()` syscall doesn't require threading the registry's private mutex
// type through this module. A single static unit mutex plays that role.
static FORK_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

/// Quiesce every worker and lock out concurrent registry mutation. Call this
/// immediately before `libc::fork()`.
pub fn before_fork() -> ForkGuard {
    let lock: MutexGuard<'static, ()> = FORK_LOCK.lock();

    let registry = global_registry();
    let workers = registry.snapshot_workers();
    let config = registry.snapshot_config();

    for worker in &workers {
        worker.flags_set(PAUSE);
    }
    for worker in &workers {
        while !worker.flags_has(crate::worker::PAUSED) && !worker.is_stopped() {
            std::thread::sleep(config.pause_poll_interval);
        }
    }

    tracing::info!(target: "reclaim", count = workers.len(), "workers paused for fork");

    ForkGuard {
        workers,
        config,
        _lock: lock,
    }
}

impl ForkGuard {
    /// Resume every worker that was paused for the fork. Call this in the
    /// parent process immediately after `fork()` returns.
    pub fn after_fork_parent(self) {
        for worker in &self.workers {
            worker.flags_clear(PAUSE);
        }
        tracing::info!(target: "reclaim", count = self.workers.len(), "workers resumed after fork");
    }

    /// Rebuild the registry from scratch in the child. Call this in the
    /// child process immediately after `fork()` returns zero.
    pub fn after_fork_child(self) {
        // Every reader slot but this thread's own now describes a phantom
        // thread that does not exist in this process; fix that up before
        // anything below can trigger a grace-period wait that would spin
        // on one forever.
        reclaim_rcu::after_fork_child_reset();

        let registry = global_registry();
        // Clear the fields that would otherwise still reference
        // now-threadless workers, *before* force-destroying them, so that
        // any pending callbacks discovered during force-destroy migrate to
        // a freshly spawned default rather than the soon-to-be-forgotten
        // one.
        registry.clear_for_fork_child();

        for worker in self.workers {
            registry::force_destroy(worker);
        }
        tracing::info!(target: "reclaim", "registry rebuilt in fork child");
    }
}

/// Convenience wrapper around `libc::fork()` that runs the quiesce/rebuild
/// protocol automatically. Returns the child's pid in the parent and 0 in
/// the child, matching `fork(2)`'s own return convention. `child_fn` runs in
/// the child after the registry has been rebuilt.
pub fn with_forked_child(child_fn: impl FnOnce()) -> i32 {
    let guard = before_fork();
    // SAFETY: the calling thread holds no lock this module doesn't already
    // account for; every worker is paused, so no worker thread can be
    // mid-allocation (the standard fork-in-a-threaded-process hazard).
    let pid = unsafe { libc::fork() };
    if pid == 0 {
        guard.after_fork_child();
        child_fn();
        0
    } else {
        guard.after_fork_parent();
        pid
    }
}
