//! Process-wide worker registry: a lazily-created default worker, an
//! RCU-published per-CPU array, and a thread-local override, forming a
//! three-tier lookup to pick "the" runner for the calling thread.
//!
//! The global singleton is a `OnceLock` holding a `parking_lot`-guarded
//! structure, accessed through a `global_registry()` function rather than a
//! `static mut` or `lazy_static!` macro.

use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::node::ReclaimNode;
use crate::worker::CallbackRunner;
use reclaim_rcu::RcuDomain;

pub type Runner = Arc<CallbackRunner>;

thread_local! {
    static THREAD_RUNNER: RefCell<Option<Runner>> = const { RefCell::new(None) };
}

struct RegistryInner {
    workers: Vec<Runner>,
    default_runner: Option<Runner>,
    config: EngineConfig,
}

/// Per-CPU lookup table. Published through [`RcuDomain`] as a whole `Vec`
/// rather than as individually-RCU-published slots: assigning a CPU slot is
/// rare (startup-time configuration, not a hot path), so the simplicity of
/// swapping one `Vec<Option<Runner>>` wholesale outweighs the original's
/// finer-grained per-slot publication (see `DESIGN.md`). Writers serialize
/// through `Registry::inner`'s mutex, matching `RcuDomain::update`'s
/// "caller serializes concurrent writers" contract.
struct PerCpu {
    domain: RcuDomain<Vec<Option<Runner>>>,
}

impl PerCpu {
    fn new() -> Self {
        Self {
            domain: RcuDomain::new(),
        }
    }

    /// Read-side helper: clone the currently published table (or an empty
    /// one if nothing has been published yet).
    ///
    /// # Safety
    /// Caller must be within a conceptual RCU read-side section; satisfied
    /// here since the clone happens entirely within this call.
    fn snapshot(&self) -> Vec<Option<Runner>> {
        // SAFETY: the borrowed slice is only read for the duration of the
        // clone, well within the calling thread's current quiescent window.
        unsafe { self.domain.read().cloned().unwrap_or_default() }
    }

    /// Writer-side helper: publish `table`, then free the previous table
    /// once a grace period has elapsed.
    fn publish(&self, table: Vec<Option<Runner>>) {
        let new_ptr = Box::into_raw(Box::new(table));
        // SAFETY: `new_ptr` is a freshly boxed, live `Vec`; writers are
        // serialized by the registry's mutex.
        let old_ptr = unsafe { self.domain.update(new_ptr) };
        if !old_ptr.is_null() {
            reclaim_rcu::wait_for_grace_period();
            // SAFETY: no reader can still be dereferencing `old_ptr` after
            // the grace period above, since `update` already unpublished it.
            unsafe { drop(Box::from_raw(old_ptr)) };
        }
    }
}

pub struct Registry {
    inner: Mutex<RegistryInner>,
    per_cpu: PerCpu,
}

impl Registry {
    fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                workers: Vec::new(),
                default_runner: None,
                config: EngineConfig::default(),
            }),
            per_cpu: PerCpu::new(),
        }
    }

    pub(crate) fn snapshot_workers(&self) -> Vec<Runner> {
        self.inner.lock().workers.clone()
    }

    pub(crate) fn snapshot_config(&self) -> EngineConfig {
        self.inner.lock().config.clone()
    }

    /// Reset everything that would otherwise reference now-threadless
    /// workers after a fork into the child. Called before force-destroying
    /// the stale workers themselves, so their pending callbacks migrate to
    /// a freshly spawned default rather than the one being forgotten here.
    pub(crate) fn clear_for_fork_child(&self) {
        let mut inner = self.inner.lock();
        inner.workers.clear();
        inner.default_runner = None;
        drop(inner);
        self.per_cpu.publish(Vec::new());
        THREAD_RUNNER.with(|cell| *cell.borrow_mut() = None);
    }
}

static GLOBAL_REGISTRY: OnceLock<Registry> = OnceLock::new();

pub(crate) fn global_registry() -> &'static Registry {
    GLOBAL_REGISTRY.get_or_init(Registry::new)
}

/// Create a new worker thread with the given flags, optionally pinned to a
/// CPU index (`cpu = -1` means unpinned). Uses the process-wide config set
/// via [`configure`] (or its defaults).
pub fn create_runner(flags: u32, cpu: i32) -> Runner {
    let config = global_registry().inner.lock().config.clone();
    create_runner_with_config(flags, cpu, config)
}

/// Like [`create_runner`], but with an explicit [`EngineConfig`] for this
/// worker's poll intervals and stack size instead of the process-wide
/// default. Does not change the config any other runner uses.
pub fn create_runner_with_config(flags: u32, cpu: i32, config: EngineConfig) -> Runner {
    let registry = global_registry();
    let runner = CallbackRunner::spawn(flags, cpu, config);
    registry.inner.lock().workers.push(runner.clone());
    tracing::info!(target: "reclaim", cpu, flags, "runner created");
    runner
}

/// Set the process-wide default [`EngineConfig`] used by [`create_runner`]
/// and [`get_default_runner`] for every worker spawned after this call.
/// Workers already running keep whatever config they were spawned with.
pub fn configure(config: EngineConfig) {
    global_registry().inner.lock().config = config;
}

fn is_default_runner(registry: &Registry, runner: &Runner) -> bool {
    registry
        .inner
        .lock()
        .default_runner
        .as_ref()
        .is_some_and(|d| Arc::ptr_eq(d, runner))
}

fn remove_from_workers(registry: &Registry, runner: &Runner) {
    let mut inner = registry.inner.lock();
    inner.workers.retain(|w| !Arc::ptr_eq(w, runner));
    if inner
        .default_runner
        .as_ref()
        .is_some_and(|d| Arc::ptr_eq(d, runner))
    {
        inner.default_runner = None;
    }
}

/// Splice `runner`'s still-pending callbacks onto the process default
/// worker (creating it if necessary) so a destroyed/orphaned worker never
/// silently drops queued work.
fn migrate_pending(runner: &Runner) {
    let pending = runner.take_pending();
    if pending.is_empty() {
        return;
    }
    let fallback = get_default_runner();
    if Arc::ptr_eq(&fallback, runner) {
        // The runner being destroyed *is* the default; nothing else to hand
        // work to. This only happens during a full teardown, where the
        // caller has already decided to drop everything.
        return;
    }
    tracing::warn!(
        target: "reclaim",
        count = pending.len(),
        "migrating orphaned callbacks to default runner"
    );
    for node in pending {
        fallback.enqueue(node);
    }
    fallback.wake_if_needed(fallback.is_realtime());
}

/// Stop a worker's thread cleanly, migrate any pending callbacks, and drop
/// it from the registry.
///
/// A silent no-op if `runner` is the process default worker: the default is
/// the "somewhere else" sink every other worker's stragglers migrate to, so
/// destroying it on purpose would defeat orphan migration for every other
/// in-flight `destroy_runner`/fork-child rebuild.
pub fn destroy_runner(runner: Runner) {
    let registry = global_registry();
    if is_default_runner(registry, &runner) {
        tracing::debug!(target: "reclaim", "destroy_runner on default runner ignored");
        return;
    }
    let config = registry.inner.lock().config.clone();
    runner.request_stop_and_wake(&config);
    migrate_pending(&runner);
    remove_from_workers(registry, &runner);
    runner.join();
}

/// Tear a worker down without waiting for its OS thread to acknowledge
/// `STOP` — used only from the post-fork child path, where that thread does
/// not exist in this process.
pub(crate) fn force_destroy(runner: Runner) {
    let registry = global_registry();
    runner.force_stopped();
    migrate_pending(&runner);
    remove_from_workers(registry, &runner);
}

/// The process-wide fallback worker, created lazily on first use and never
/// destroyed by anything but a fork-child rebuild.
pub fn get_default_runner() -> Runner {
    let registry = global_registry();
    let mut inner = registry.inner.lock();
    if let Some(runner) = &inner.default_runner {
        return runner.clone();
    }
    let config = inner.config.clone();
    let runner = CallbackRunner::spawn(0, -1, config);
    inner.workers.push(runner.clone());
    inner.default_runner = Some(runner.clone());
    tracing::info!(target: "reclaim", "default runner lazily created");
    runner
}

pub fn get_cpu_runner(cpu: usize) -> Option<Runner> {
    let table = global_registry().per_cpu.snapshot();
    table.get(cpu).cloned().flatten()
}

/// Number of CPU slots the per-CPU array is sized for. Uses the configured
/// (not just online) processor count, matching `liburcu`'s
/// `get_possible_cpus_array_len()`: a CPU that is merely offline right now
/// still gets a valid, addressable slot.
fn max_cpus() -> usize {
    // SAFETY: `sysconf` reads kernel state only, no pointer arguments.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n > 0 {
        n as usize
    } else {
        1
    }
}

/// Assign `runner` to per-CPU slot `cpu`. Rebuilds and republishes the
/// whole lookup table: see [`PerCpu`] for why that tradeoff is acceptable
/// here.
///
/// Order of operations matters here: the array is grown
/// to cover every valid slot *before* the requested index is checked
/// against it, so "out of range" is judged against the fully-allocated
/// array's bound rather than whatever happened to be allocated so far.
pub fn set_cpu_runner(cpu: usize, runner: Runner) -> Result<(), EngineError> {
    let registry = global_registry();
    // The registry mutex is the single-writer lock `RcuDomain::update`
    // requires; held across snapshot-modify-publish so no other caller's
    // write is lost to a lost-update race.
    let _guard = registry.inner.lock();
    let maxcpus = max_cpus();
    let mut table = registry.per_cpu.snapshot();
    if table.len() < maxcpus {
        table.resize(maxcpus, None);
    }
    if cpu >= maxcpus {
        return Err(EngineError::Invalid);
    }
    if table[cpu].is_some() {
        return Err(EngineError::Exists);
    }
    table[cpu] = Some(runner);
    registry.per_cpu.publish(table);
    Ok(())
}

/// Spawn one worker per online CPU, with `flags` applied to each, and
/// publish the whole table at once. Existing assignments are left
/// untouched; a CPU that already has a runner is skipped rather than
/// erroring, so this can be called idempotently at startup.
pub fn create_all_cpu_runners(flags: u32) {
    // SAFETY: `sysconf` with `_SC_NPROCESSORS_ONLN` reads kernel state, no
    // pointer arguments.
    let ncpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    let ncpus = if ncpus > 0 { ncpus as usize } else { 1 };
    for cpu in 0..ncpus {
        if get_cpu_runner(cpu).is_some() {
            continue;
        }
        let runner = create_runner(flags, cpu as i32);
        if set_cpu_runner(cpu, runner.clone()).is_err() {
            // Lost a race with a concurrent caller; the thread we just
            // spawned is now orphaned, so tear it down immediately.
            destroy_runner(runner);
        }
    }
}

/// Tear down and clear the entire per-CPU table.
pub fn free_all_cpu_runners() {
    let registry = global_registry();
    let runners: Vec<Runner> = {
        let _guard = registry.inner.lock();
        let table = registry.per_cpu.snapshot();
        registry.per_cpu.publish(Vec::new());
        table.into_iter().flatten().collect()
    };
    for runner in runners {
        destroy_runner(runner);
    }
}

pub fn get_thread_runner() -> Option<Runner> {
    THREAD_RUNNER.with(|cell| cell.borrow().clone())
}

pub fn set_thread_runner(runner: Option<Runner>) {
    THREAD_RUNNER.with(|cell| *cell.borrow_mut() = runner);
}

/// Resolve "the" runner for the calling thread: an explicit thread-local
/// override first, then this CPU's pinned worker, then the process default.
pub fn get_current_runner() -> Runner {
    if let Some(runner) = get_thread_runner() {
        return runner;
    }
    if let Some(cpu) = reclaim_rcu::current_cpu() {
        if let Some(runner) = get_cpu_runner(cpu) {
            return runner;
        }
    }
    get_default_runner()
}

/// Queue `value` for reclamation via `func(value)` on the current thread's
/// resolved runner, once a grace period has elapsed.
///
/// Per §6, this must be called with RCU registration already active on the
/// calling thread (the same precondition `reclaim_rcu::rcu_read_lock`-style
/// callers already satisfy for any other RCU-protected read). This
/// dispatcher does not register the caller itself: a producer thread that
/// called `defer_reclaim` once and then exited would otherwise leave a
/// permanently-registered, epoch-frozen slot behind, since nothing else
/// would ever unregister it — registration and its lifetime are the
/// caller's responsibility, not something this entry point can safely grant
/// and forget.
pub fn defer_reclaim<T, F>(value: T, func: F)
where
    T: Send + 'static,
    F: FnOnce(T) + Send + 'static,
{
    let runner = get_current_runner();
    let node = ReclaimNode::new(value, func);
    let realtime = runner.is_realtime();
    runner.enqueue(node);
    runner.wake_if_needed(realtime);
}

/// Block until every callback enqueued on every currently-registered worker,
/// as of this call, has been invoked.
///
/// Not present in the distilled interface table but implied by any serious
/// test suite (and by `rcu_barrier()` in the original): without it, a test
/// asserting "callback N ran" has no way to wait for that without sleeping
/// arbitrary amounts of wall-clock time.
pub fn barrier() {
    let registry = global_registry();
    let config = registry.inner.lock().config.clone();
    let workers: Vec<Runner> = registry.inner.lock().workers.clone();
    for runner in &workers {
        while runner.qlen() > 0 && !runner.is_stopped() {
            runner.wake_if_needed(runner.is_realtime());
            std::thread::sleep(config.stop_poll_interval);
        }
    }
}
