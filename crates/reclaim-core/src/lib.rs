//! Deferred-reclamation engine: a wait-free queue and a futex-gated worker
//! thread per reclamation domain, coordinated through a process-wide
//! registry that survives `fork(2)`.
//!
//! A caller that wants to free `value` only after every concurrent reader
//! has stopped looking at it calls [`defer_reclaim`]. The value and a
//! closure describing how to dispose of it are handed to whichever worker
//! the calling thread resolves to (its own override, its CPU's pinned
//! worker, or the process default); that worker waits for the current
//! grace period to end before running the closure.
//!
//! Grace-period tracking itself lives in the sibling `reclaim-rcu` crate;
//! this crate only knows how to queue, schedule, and eventually invoke
//! callbacks around that primitive.
//!
//! [`defer_reclaim`] must be called with RCU registration already active on
//! the caller (`reclaim_rcu::reader_register`); this crate never registers
//! or unregisters a caller's thread on its behalf, since a producer that
//! calls in once and exits would otherwise leave a permanently-registered
//! slot behind.
//!
//! ```
//! reclaim_rcu::reader_register().unwrap();
//! // defer_reclaim queues work for a background worker; call barrier() in
//! // tests to wait for it deterministically instead of sleeping.
//! reclaim_core::defer_reclaim(Box::new(42), |boxed| drop(boxed));
//! reclaim_core::barrier();
//! reclaim_rcu::reader_unregister();
//! ```

mod config;
mod error;
mod fork;
mod node;
mod queue;
mod registry;
mod worker;

pub use config::EngineConfig;
pub use error::EngineError;
pub use fork::{before_fork, with_forked_child, ForkGuard};
pub use registry::{
    barrier, configure, create_all_cpu_runners, create_runner, create_runner_with_config,
    defer_reclaim, destroy_runner, free_all_cpu_runners, get_current_runner, get_cpu_runner,
    get_default_runner, get_thread_runner, set_cpu_runner, set_thread_runner, Runner,
};
pub use worker::{CallbackRunner, PAUSE, PAUSED, RT, STOP, STOPPED};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn public_surface_round_trip() {
        let runner = create_runner(0, -1);
        set_thread_runner(Some(runner.clone()));

        let counter = Arc::new(AtomicUsize::new(0));
        let c2 = counter.clone();
        defer_reclaim((), move |()| {
            c2.fetch_add(1, Ordering::AcqRel);
        });
        barrier();
        assert_eq!(counter.load(Ordering::Acquire), 1);

        set_thread_runner(None);
        destroy_runner(runner);
    }

    #[test]
    fn self_spawning_callback_reenqueues_on_same_runner() {
        let runner = create_runner(0, -1);
        set_thread_runner(Some(runner.clone()));

        const K: usize = 1000;
        let remaining = Arc::new(AtomicUsize::new(K));
        let count = Arc::new(AtomicUsize::new(0));

        fn schedule(remaining: Arc<AtomicUsize>, count: Arc<AtomicUsize>) {
            count.fetch_add(1, Ordering::AcqRel);
            if remaining.fetch_sub(1, Ordering::AcqRel) > 1 {
                let remaining2 = remaining.clone();
                let count2 = count.clone();
                defer_reclaim((), move |()| schedule(remaining2, count2));
            }
        }
        schedule(remaining.clone(), count.clone());
        barrier();

        assert_eq!(count.load(Ordering::Acquire), K);

        set_thread_runner(None);
        destroy_runner(runner);
    }
}
