//! Engine-wide tunables.
//!
//! The classic userspace-RCU `call_rcu` worker hardcodes its poll intervals
//! (1 ms for pause/stop handshakes, 10 ms for realtime idle polling) with no
//! documented justification for either constant. `EngineConfig` makes them
//! configurable while keeping those same values as defaults, so call sites
//! that never touch configuration see identical behavior.

use core::time::Duration;

/// Default worker thread stack size, matching glibc's usual 2 MiB default
/// for a pthread created without an explicit `pthread_attr_setstacksize`.
const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often a worker polls for `PAUSE` to clear during a fork
    /// quiescence handshake.
    pub pause_poll_interval: Duration,
    /// How often `destroy_runner` polls for a worker to reach `STOPPED`.
    pub stop_poll_interval: Duration,
    /// How often a realtime (`RT`) worker polls its queue instead of using
    /// the futex gate.
    pub realtime_poll_interval: Duration,
    /// Stack size for spawned worker threads.
    pub default_stack_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pause_poll_interval: Duration::from_millis(1),
            stop_poll_interval: Duration::from_millis(1),
            realtime_poll_interval: Duration::from_millis(10),
            default_stack_size: DEFAULT_STACK_SIZE,
        }
    }
}
