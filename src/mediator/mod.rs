//! Process lock mediation.
//!
//! Answers "which processes hold resource R open, and can their hold be
//! neutralized long enough to write R?". The [`LockMediator`] trait exposes the
//! raw process primitives; [`suspend`] and [`terminate`] build the disciplined
//! operations the ladder uses on top of them.
//!
//! # Key invariant
//!
//! A process paused through [`suspend`] is owned by the returned
//! [`ScopedSuspension`]. Dropping the guard resumes the process, on every exit
//! path, including early returns and unwinding. There is no other way to get a
//! process paused through this module, so nothing can leak a frozen process.

pub mod procfs;

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::MediatorError;

pub use procfs::ProcMediator;

/// A process holding a resource open.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockHolder {
    pub process_id: u32,
    pub process_name: String,
    pub suspended: bool,
}

impl LockHolder {
    #[must_use]
    pub fn new(process_id: u32, process_name: impl Into<String>) -> Self {
        Self {
            process_id,
            process_name: process_name.into(),
            suspended: false,
        }
    }
}

/// Observed scheduling state of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopped,
    Gone,
}

/// Platform process primitives.
///
/// All methods are best effort. `detect_holders` must return an empty set
/// rather than fail when the platform denies inspection, and must not open the
/// target file itself.
#[allow(clippy::missing_errors_doc)]
pub trait LockMediator {
    /// Processes (other than this one) with `path` open.
    fn detect_holders(&self, path: &Path) -> Vec<LockHolder>;

    /// Pause a process without terminating it.
    fn pause(&self, pid: u32) -> Result<(), MediatorError>;

    /// Continue a paused process.
    fn resume(&self, pid: u32) -> Result<(), MediatorError>;

    /// Ask a process to exit.
    fn request_exit(&self, pid: u32) -> Result<(), MediatorError>;

    /// Kill a process outright.
    fn force_kill(&self, pid: u32) -> Result<(), MediatorError>;

    /// Current state of a process.
    fn run_state(&self, pid: u32) -> RunState;
}

// ---------------------------------------------------------------------------
// ScopedSuspension
// ---------------------------------------------------------------------------

/// A paused lock holder. Resumes the process when dropped.
#[must_use = "dropping the guard resumes the process immediately"]
pub struct ScopedSuspension<'m> {
    mediator: &'m dyn LockMediator,
    holder: LockHolder,
    released: bool,
}

impl ScopedSuspension<'_> {
    /// The suspended holder (with `suspended == true`).
    #[must_use]
    pub const fn holder(&self) -> &LockHolder {
        &self.holder
    }

    /// Resume the process now and report whether that worked.
    ///
    /// # Errors
    ///
    /// Returns the mediator error if the resume signal could not be delivered.
    /// A process that has already exited counts as resumed.
    pub fn release(mut self) -> Result<(), MediatorError> {
        self.released = true;
        resume_holder(self.mediator, &self.holder)
    }
}

impl Drop for ScopedSuspension<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = resume_holder(self.mediator, &self.holder) {
            tracing::error!(
                pid = self.holder.process_id,
                process = %self.holder.process_name,
                error = %e,
                "failed to resume suspended lock holder"
            );
        }
    }
}

fn resume_holder(mediator: &dyn LockMediator, holder: &LockHolder) -> Result<(), MediatorError> {
    match mediator.resume(holder.process_id) {
        Ok(()) | Err(MediatorError::Gone { .. }) => {
            tracing::debug!(pid = holder.process_id, "lock holder resumed");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Pause `holder`, returning a guard that resumes it.
///
/// # Errors
///
/// Returns the mediator error when the process cannot be paused; nothing is
/// left paused in that case.
pub fn suspend<'m>(
    mediator: &'m dyn LockMediator,
    holder: &LockHolder,
) -> Result<ScopedSuspension<'m>, MediatorError> {
    mediator.pause(holder.process_id)?;
    tracing::debug!(pid = holder.process_id, process = %holder.process_name, "lock holder suspended");
    Ok(ScopedSuspension {
        mediator,
        holder: LockHolder {
            suspended: true,
            ..holder.clone()
        },
        released: false,
    })
}

/// Pause every holder, or none: if any pause fails, the ones already paused are
/// resumed before the error is returned.
///
/// # Errors
///
/// Returns the first pause failure.
pub fn suspend_all<'m>(
    mediator: &'m dyn LockMediator,
    holders: &[LockHolder],
) -> Result<Vec<ScopedSuspension<'m>>, MediatorError> {
    let mut guards = Vec::with_capacity(holders.len());
    for holder in holders {
        // On error, `guards` is dropped and every earlier pause is undone.
        guards.push(suspend(mediator, holder)?);
    }
    Ok(guards)
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

/// Bounds for [`terminate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitWait {
    /// How long a graceful exit request is given.
    pub graceful_timeout: Duration,
    /// How long to wait for a forced kill to take effect.
    pub kill_wait: Duration,
    /// Polling interval while waiting.
    pub poll_interval: Duration,
}

impl Default for ExitWait {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(3),
            kill_wait: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Ask `holder` to exit; kill it if it is still alive after the graceful
/// timeout. Returns whether the process is confirmed gone.
#[must_use]
pub fn terminate(mediator: &dyn LockMediator, holder: &LockHolder, wait: &ExitWait) -> bool {
    let pid = holder.process_id;
    match mediator.request_exit(pid) {
        Ok(()) => {
            if wait_for_exit(mediator, pid, wait.graceful_timeout, wait.poll_interval) {
                tracing::info!(pid, process = %holder.process_name, "lock holder exited gracefully");
                return true;
            }
        }
        Err(MediatorError::Gone { .. }) => return true,
        Err(e) => {
            tracing::warn!(pid, error = %e, "graceful exit request failed");
        }
    }

    match mediator.force_kill(pid) {
        Ok(()) | Err(MediatorError::Gone { .. }) => {}
        Err(e) => {
            tracing::warn!(pid, error = %e, "forced kill failed");
            return mediator.run_state(pid) == RunState::Gone;
        }
    }
    let gone = wait_for_exit(mediator, pid, wait.kill_wait, wait.poll_interval);
    if gone {
        tracing::info!(pid, process = %holder.process_name, "lock holder killed");
    } else {
        tracing::warn!(pid, "lock holder survived forced kill");
    }
    gone
}

fn wait_for_exit(mediator: &dyn LockMediator, pid: u32, timeout: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if mediator.run_state(pid) == RunState::Gone {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(poll.min(deadline - now));
    }
}
