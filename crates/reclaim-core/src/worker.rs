//! `CallbackRunner`: one dedicated OS thread draining one wait-free queue.
//!
//! Implements the state machine from the design:
//! `CREATED -> RUNNING -> (PAUSED <-> RUNNING)* -> STOPPING -> STOPPED -> FREED`.
//! The drain -> grace-period -> invoke ordering in the main loop is the
//! crux of the whole engine's safety: the grace period must follow the
//! snapshot (so a reader that observed the pre-unlink state completes
//! first) and precede invocation (so the callback can safely free memory).

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::EngineConfig;
use crate::futex::FutexGate;
use crate::node::ReclaimNode;
use crate::queue::Wfq;
use crate::registry;

pub const RT: u32 = 1 << 0;
pub const STOP: u32 = 1 << 1;
pub const STOPPED: u32 = 1 << 2;
pub const PAUSE: u32 = 1 << 3;
pub const PAUSED: u32 = 1 << 4;

/// A worker: one wait-free queue, one futex gate, one OS thread.
///
/// Exposed to callers wrapped in `Arc` (`pub type Runner = Arc<CallbackRunner>`
/// in `lib.rs`) rather than through a raw pointer plus an intrusive registry
/// link, since Rust's ownership model gives us reference counting for free
/// and a `Vec` in the registry in place of the original's doubly linked
/// list (see `DESIGN.md`).
pub struct CallbackRunner {
    pub(crate) queue: Wfq,
    flags: AtomicU32,
    futex: FutexGate,
    qlen: AtomicUsize,
    cpu_affinity: AtomicI32,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CallbackRunner {
    fn new(cpu_affinity: i32, flags: u32) -> Arc<Self> {
        Arc::new(Self {
            queue: Wfq::new(),
            flags: AtomicU32::new(flags),
            futex: FutexGate::new(),
            qlen: AtomicUsize::new(0),
            cpu_affinity: AtomicI32::new(cpu_affinity),
            handle: parking_lot::Mutex::new(None),
        })
    }

    /// Spawn a worker and its dedicated thread. Thread-spawn failure is
    /// fatal: no sensible recovery exists from within a reclamation engine.
    pub(crate) fn spawn(flags: u32, cpu: i32, config: EngineConfig) -> Arc<Self> {
        let runner = Self::new(cpu, flags);
        let thread_runner = runner.clone();
        let builder = thread::Builder::new()
            .name("reclaim-worker".into())
            .stack_size(config.default_stack_size);
        let handle = builder
            .spawn(move || run_loop(thread_runner, config))
            .expect("reclaim-core: failed to spawn worker thread (broken host)");
        *runner.handle.lock() = Some(handle);
        runner
    }

    pub(crate) fn enqueue(&self, node: Box<ReclaimNode>) {
        self.queue.enqueue(node);
        self.qlen.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn wake_if_needed(&self, realtime_skips_wake: bool) {
        if !realtime_skips_wake {
            self.futex.wake();
        }
    }

    /// Approximate enqueued-minus-invoked count. Debug-only, never a
    /// correctness signal per the design's invariant.
    pub fn qlen(&self) -> usize {
        self.qlen.load(Ordering::Acquire)
    }

    pub fn is_realtime(&self) -> bool {
        self.flags.load(Ordering::Acquire) & RT != 0
    }

    pub fn cpu_affinity(&self) -> Option<usize> {
        let cpu = self.cpu_affinity.load(Ordering::Acquire);
        if cpu < 0 {
            None
        } else {
            Some(cpu as usize)
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.flags_has(STOPPED)
    }

    pub(crate) fn flags_has(&self, bits: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bits != 0
    }

    pub(crate) fn flags_set(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    pub(crate) fn flags_clear(&self, bits: u32) {
        self.flags.fetch_and(!bits, Ordering::AcqRel);
    }

    pub(crate) fn request_stop_and_wake(&self, config: &EngineConfig) {
        self.flags_set(STOP);
        self.futex.wake();
        while !self.flags_has(STOPPED) {
            if let Some(handle) = self.handle.lock().as_ref() {
                if handle.is_finished() {
                    // Open question (a): a panicked worker thread will never
                    // set STOPPED itself. A finished-but-not-STOPPED thread
                    // is treated as already stopped rather than spun on
                    // forever.
                    tracing::warn!(
                        target: "reclaim",
                        "worker thread exited without setting STOPPED; treating as stopped"
                    );
                    self.flags_set(STOPPED);
                    break;
                }
            }
            thread::sleep(config.stop_poll_interval);
        }
    }

    /// Bypass the stop handshake entirely: used only from the post-fork
    /// child path, where the worker's OS thread does not exist in this
    /// process and waiting for it to acknowledge `STOP` would hang forever.
    pub(crate) fn force_stopped(&self) {
        self.flags_set(STOPPED);
    }

    /// Drain this worker's queue without invoking anything, for splicing
    /// onto another worker's queue (destroy / fork-child orphan migration).
    pub(crate) fn take_pending(&self) -> Vec<Box<ReclaimNode>> {
        // `take_batch` already returns boxed closures rather than nodes; for
        // splicing we need real nodes so the target queue's wait-free
        // invariants hold (enqueue takes a `Box<ReclaimNode>`). Re-wrap each
        // extracted closure behind a fresh node — the allocation churn is
        // irrelevant on the shutdown/fork-child path, which is not the hot
        // path this engine optimizes for.
        self.queue
            .take_batch()
            .into_iter()
            .map(|run| ReclaimNode::new((), move |()| run()))
            .collect()
    }

    pub(crate) fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn pin_current_thread(cpu: usize) {
    // SAFETY: `set` operates on a stack-local `cpu_set_t`; `sched_setaffinity`
    // with pid 0 affects the calling thread only.
    unsafe {
        let mut set: libc::cpu_set_t = core::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            tracing::error!(target: "reclaim", cpu, "sched_setaffinity failed; aborting");
            std::process::abort();
        }
    }
}

fn run_loop(runner: Arc<CallbackRunner>, config: EngineConfig) {
    if let Some(cpu) = runner.cpu_affinity() {
        pin_current_thread(cpu);
    }
    reclaim_rcu::reader_register()
        .expect("reclaim-core: RCU reader table exhausted (broken host)");
    registry::set_thread_runner(Some(runner.clone()));

    tracing::debug!(target: "reclaim", realtime = runner.is_realtime(), "worker started");

    loop {
        if runner.flags_has(PAUSE) {
            reclaim_rcu::reader_unregister();
            runner.flags_set(PAUSED);
            while runner.flags_has(PAUSE) {
                thread::sleep(config.pause_poll_interval);
            }
            runner.flags_clear(PAUSED);
            reclaim_rcu::reader_register()
                .expect("reclaim-core: RCU reader table exhausted (broken host)");
        }

        let batch = runner.queue.take_batch();
        if !batch.is_empty() {
            // This thread is itself a registered reader (so it can safely
            // dereference RCU-published structures like the per-CPU table
            // between batches). `wait_for_grace_period` excludes the calling
            // thread's own slot for exactly this reason: a registered reader
            // that calls it directly, as every worker does here, could never
            // otherwise advance past its own epoch while it's busy spinning
            // on it.
            reclaim_rcu::wait_for_grace_period();
            let drained = batch.len();
            for run in batch {
                run();
            }
            runner.qlen.fetch_sub(drained, Ordering::AcqRel);
        }

        if runner.flags_has(STOP) {
            break;
        }

        reclaim_rcu::reader_offline();
        if runner.is_realtime() {
            thread::sleep(config.realtime_poll_interval);
        } else {
            runner.futex.sleep_while(|| runner.queue.is_empty());
        }
        reclaim_rcu::reader_online();
    }

    runner.futex.reset();
    runner.flags_set(STOPPED);
    reclaim_rcu::reader_unregister();
    registry::set_thread_runner(None);
    tracing::debug!(target: "reclaim", "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[test]
    fn spawned_worker_drains_and_stops() {
        let config = EngineConfig::default();
        let runner = CallbackRunner::spawn(0, -1, config.clone());
        let counter = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            runner.enqueue(ReclaimNode::new((), move |()| {
                counter.fetch_add(1, Ordering::AcqRel);
            }));
            runner.wake_if_needed(runner.is_realtime());
        }
        runner.request_stop_and_wake(&config);
        runner.join();
        assert_eq!(counter.load(Ordering::Acquire), 50);
        assert_eq!(runner.qlen(), 0);
    }
}
