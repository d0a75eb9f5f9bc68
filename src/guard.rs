//! Lifecycle guard: fork-safe termination and reaping.
//!
//! Teardown ordering is always kill-then-wait. A companion process is not
//! guaranteed to exit when its input stream closes (it may hold a pending
//! timer or event-loop registration), so waiting for a natural exit before
//! killing can hang forever. [`terminate`] delivers an unconditional
//! SIGKILL first; only then is the exit status collected.
//!
//! [`ProcGuard`] is the leak-safety net behind explicit
//! [`Bridge::close`](crate::Bridge::close): a detached cleanup record that
//! holds only the companion's pid and the pid of the process that spawned
//! it. Dropping it kills and reaps the companion - unless the drop happens
//! in a forked descendant, where the owner-pid check makes it a no-op. A
//! descendant never owns, and must never kill, the ancestor's child
//! process.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// How long a drop-triggered reap will poll before giving up. SIGKILL
/// cannot be caught, so the wait only exceeds milliseconds when the
/// process is stuck in uninterruptible sleep.
const DROP_REAP_BUDGET: Duration = Duration::from_secs(2);

/// Send an unconditional kill signal to `pid`.
///
/// Idempotent: signaling an already-dead or already-terminating process is
/// success, not an error. Does not wait. Never panics and never returns an
/// error - a failure here is logged and swallowed, since termination runs
/// in contexts (drop, close) where raising is unsafe.
pub(crate) fn terminate(pid: u32) {
    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => tracing::debug!(pid, "sent SIGKILL to companion"),
        Err(Errno::ESRCH) => tracing::debug!(pid, "companion already gone"),
        Err(e) => tracing::warn!(pid, error = %e, "failed to signal companion"),
    }
}

/// Block until the OS confirms `pid` has exited, collecting its status.
///
/// Must only be called after [`terminate`], never before - a companion that
/// ignores input-stream closure would block this indefinitely otherwise.
/// Polls with `WNOHANG` so it can bail out after `budget`. ECHILD (someone
/// else already reaped, or not our child after a fork) and ESRCH are
/// treated as done.
pub(crate) fn reap_blocking(pid: u32, budget: Duration) {
    let target = Pid::from_raw(pid as i32);
    let deadline = Instant::now() + budget;

    loop {
        match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if Instant::now() >= deadline {
                    tracing::warn!(pid, "companion not reaped within {:?}", budget);
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(status) => {
                tracing::debug!(pid, ?status, "companion reaped");
                return;
            }
            Err(Errno::ECHILD) | Err(Errno::ESRCH) => return,
            Err(e) => {
                tracing::warn!(pid, error = %e, "waitpid failed");
                return;
            }
        }
    }
}

/// Detached cleanup record for one companion process.
///
/// Holds the companion's pid and the owning process id captured at spawn
/// time - plain data, never a reference back to the bridge. Explicit close
/// disarms the guard; an armed guard that drops kills and reaps the
/// companion, so the process cannot outlive an unreachable bridge.
#[derive(Debug)]
pub(crate) struct ProcGuard {
    pid: u32,
    owner_pid: u32,
    armed: bool,
}

impl ProcGuard {
    /// Arm a guard for `pid`, capturing the current process as owner.
    pub(crate) fn new(pid: u32) -> Self {
        Self {
            pid,
            owner_pid: std::process::id(),
            armed: true,
        }
    }

    /// Disarm the guard; dropping it becomes a no-op. Used once teardown
    /// has been performed (or deliberately skipped) elsewhere.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if std::process::id() != self.owner_pid {
            // Running in a forked descendant: not ours to kill.
            tracing::debug!(
                pid = self.pid,
                owner = self.owner_pid,
                "guard dropped in non-owning process, skipping teardown"
            );
            return;
        }
        terminate(self.pid);
        reap_blocking(self.pid, DROP_REAP_BUDGET);
    }
}
