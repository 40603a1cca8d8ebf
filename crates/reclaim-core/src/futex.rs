//! Per-worker sleep gate built on the Linux `futex(2)` fast path.
//!
//! A worker that finds its queue empty would rather block than spin. The
//! gate is a single 32-bit word: `0` means "running" (or "unknown" to a
//! producer that hasn't looked), `-1` means "this worker has committed to
//! sleeping". The lost-wakeup-safe protocol is:
//!
//! - Worker, before sleeping: store `-1`, fence, re-check the queue. If
//!   still empty, `FUTEX_WAIT` on the word expecting `-1`.
//! - Producer, after enqueueing: fence, and if the word reads `-1`, swap it
//!   to `0` and `FUTEX_WAKE` one waiter.
//!
//! The fence pairing is what makes this safe: a producer whose enqueue
//! happens-before the worker's fence is guaranteed to be visible when the
//! worker re-checks the queue; a producer whose enqueue happens-after the
//! worker's fence is guaranteed to observe `-1` and therefore issue the
//! wake. Neither side can "miss" the other.
//!
//! This uses the raw `futex` syscall via the `libc` crate (`FUTEX_WAIT`/
//! `FUTEX_WAKE`, `FUTEX_PRIVATE_FLAG` since every futex word here is
//! process-private) rather than a condition variable, matching the
//! original's reasoning that a condvar's extra mutex acquisition costs
//! something on the producer's fast path that a bare futex word does not.

use core::sync::atomic::{fence, AtomicI32, Ordering};
use core::time::Duration;

const RUNNING: i32 = 0;
const SLEEPING: i32 = -1;

pub(crate) struct FutexGate {
    word: AtomicI32,
}

impl FutexGate {
    pub(crate) fn new() -> Self {
        Self {
            word: AtomicI32::new(RUNNING),
        }
    }

    /// Worker side. Commits to sleeping, re-checks `is_empty`, and blocks in
    /// the futex syscall only if the recheck still finds nothing.
    pub(crate) fn sleep_while(&self, is_empty: impl Fn() -> bool) {
        self.word.store(SLEEPING, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        if !is_empty() {
            self.word.store(RUNNING, Ordering::Relaxed);
            return;
        }
        // SAFETY: `self.word` is a live, aligned i32 for the duration of
        // this call; FUTEX_WAIT only blocks while the kernel observes the
        // expected value, and returns spuriously-safely otherwise.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.word as *const AtomicI32 as *const i32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                SLEEPING,
                core::ptr::null::<libc::timespec>(),
            );
        }
        self.word.store(RUNNING, Ordering::Relaxed);
    }

    /// Producer side. Wakes the worker only if it had actually committed to
    /// sleeping; otherwise this is a single relaxed load and nothing else.
    pub(crate) fn wake(&self) {
        fence(Ordering::SeqCst);
        if self.word.swap(RUNNING, Ordering::Relaxed) == SLEEPING {
            // SAFETY: same validity argument as above; FUTEX_WAKE with no
            // waiters is a harmless no-op syscall.
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.word as *const AtomicI32 as *const i32,
                    libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                    1i32,
                );
            }
        }
    }

    /// Reset to `0` unconditionally. Called once a worker has fully stopped,
    /// so that a stale `-1` can't confuse a future reuse of the same memory.
    pub(crate) fn reset(&self) {
        self.word.store(RUNNING, Ordering::Relaxed);
    }
}

/// Realtime workers skip the futex entirely and poll on a fixed interval,
/// since realtime callers cannot tolerate futex-syscall tail latency.
pub(crate) const DEFAULT_REALTIME_POLL: Duration = Duration::from_millis(10);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration as StdDuration;

    #[test]
    fn wake_before_sleep_is_not_lost() {
        let gate = Arc::new(FutexGate::new());
        let produced = Arc::new(AtomicBool::new(true));
        // Producer "enqueues" (sets produced=true, already true here) then
        // wakes before the worker ever commits to sleeping.
        gate.wake();
        let produced2 = produced.clone();
        gate.sleep_while(|| !produced2.load(Ordering::Acquire));
        // Should return promptly without hanging: is_empty() is false.
    }

    #[test]
    fn sleep_then_wake_unblocks() {
        let gate = Arc::new(FutexGate::new());
        let empty = Arc::new(AtomicBool::new(true));
        let g2 = gate.clone();
        let e2 = empty.clone();
        let handle = thread::spawn(move || {
            g2.sleep_while(|| e2.load(Ordering::Acquire));
        });
        thread::sleep(StdDuration::from_millis(20));
        empty.store(false, Ordering::Release);
        gate.wake();
        handle.join().expect("worker thread panicked");
    }
}
