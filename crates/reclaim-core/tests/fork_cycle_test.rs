//! Fork-safety integration test: five
//! callbacks enqueued before `fork()` end up invoked exactly once, in the
//! child, after `after_fork_child()` rebuilds the registry.
//!
//! This file is its own test binary (cargo gives every `tests/*.rs` file a
//! fresh process), which matters here: the test deliberately never resumes
//! the parent's paused worker, so the parent's copy of the pending
//! callbacks is never drained in this process. Sharing that permanently-
//! paused state with any other test would be wrong; isolating it to one
//! process per file is what makes the trick safe.

use std::io::Read;
use std::os::unix::io::FromRawFd;

use reclaim_core::{before_fork, create_runner, defer_reclaim, set_thread_runner};

#[test]
fn fork_cycle_executes_pending_callbacks_once_in_child() {
    let runner = create_runner(0, -1);
    set_thread_runner(Some(runner.clone()));

    let mut fds = [0i32; 2];
    // SAFETY: `fds` is a valid, writable 2-element buffer for `pipe(2)`.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe() failed");
    let (read_fd, write_fd) = (fds[0], fds[1]);

    // Pause the registry *before* enqueueing: once `runner` has acknowledged
    // PAUSED, its main loop is parked in the pause handshake and will not
    // drain the queue no matter what gets enqueued next. Enqueueing first and
    // pausing second would race the worker's own drain loop, which could
    // invoke (and pipe-write) all five callbacks in the parent before the
    // fork ever happens.
    let guard = before_fork();

    for _ in 0..5 {
        defer_reclaim(write_fd, |fd| {
            let byte = [1u8];
            // SAFETY: `fd` is the writable end of the pipe created above,
            // still open (inherited across fork) when this callback runs.
            unsafe {
                libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
            }
        });
    }

    // SAFETY: `before_fork` has quiesced every worker thread, so no thread
    // other than the caller is running in this process at the moment of
    // the call, satisfying `fork`'s usual threaded-process hazard.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork() failed");

    if pid == 0 {
        // Child: rebuild the registry, then drain through the fresh default
        // worker before exiting. `after_fork_child` consumes the guard.
        guard.after_fork_child();
        // This thread registered as an RCU reader when it called
        // `defer_reclaim` in the parent (the registration carried over
        // verbatim into the child's copy of the reader table, then got a
        // fresh slot from `after_fork_child_reset`). It never calls
        // `quiescent_state`/`reader_offline` around the poll loop below, so
        // leaving it registered would block the fresh default worker's
        // `wait_for_grace_period` forever. Unregister: this thread is done
        // acting as a reader.
        reclaim_rcu::reader_unregister();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while reclaim_core::get_default_runner().qlen() > 0 {
            if std::time::Instant::now() > deadline {
                // SAFETY: `_exit` terminates immediately without running
                // destructors, appropriate for a forked-and-done test child.
                unsafe { libc::_exit(1) };
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        // SAFETY: fd is valid and owned by this process.
        unsafe { libc::close(write_fd) };
        // SAFETY: deliberate immediate exit; this process exists only to
        // drain the migrated callbacks and report back over the pipe.
        unsafe { libc::_exit(0) };
    }

    // Parent: deliberately does NOT call `guard.after_fork_parent()`. Doing
    // so would resume this process's own copy of `runner`, which still
    // holds the same five (unrun) callbacks and would invoke them a second
    // time here — a real hazard of forking with non-idempotent callbacks,
    // not an artifact of this test. Leaking the guard leaves the registry
    // paused, which is fine: this process's single test is about to end.
    std::mem::forget(guard);

    // SAFETY: fd is valid and owned by this process; the child holds its
    // own copy via fork, so closing here does not affect its ability to
    // write.
    unsafe { libc::close(write_fd) };

    let mut status = 0i32;
    // SAFETY: `status` is a valid out-pointer for `waitpid`.
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(waited, pid);
    assert!(
        libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0,
        "child exited abnormally: status={status}"
    );

    // SAFETY: `read_fd` is the pipe's read end, still open in this process.
    let mut file = unsafe { std::fs::File::from_raw_fd(read_fd) };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).expect("read from pipe");
    assert_eq!(buf.len(), 5, "expected exactly 5 callback invocations from the child");
}
