//! Platform lock mediator.
//!
//! On Linux, holders are found by walking `/proc/<pid>/fd` and comparing each
//! descriptor's link target with the canonical resource path. That only reads
//! symlinks, so detection never opens the resource. Processes whose `fd`
//! directory is unreadable (other users, without privilege) are skipped.
//!
//! Signals are delivered with the system `kill` utility (`taskkill` on
//! Windows), so the crate needs no `unsafe`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use super::{LockHolder, LockMediator, RunState};
use crate::error::MediatorError;

/// The real process mediator.
#[derive(Clone, Debug, Default)]
pub struct ProcMediator {
    /// Lowercase substring a holder's process name must contain, if set.
    name_filter: Option<String>,
}

impl ProcMediator {
    #[must_use]
    pub const fn new() -> Self {
        Self { name_filter: None }
    }

    /// Only report holders whose process name contains `filter`
    /// (case-insensitive).
    #[must_use]
    pub fn with_name_filter(filter: Option<&str>) -> Self {
        Self {
            name_filter: filter
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_lowercase),
        }
    }

    fn accepts(&self, process_name: &str) -> bool {
        self.name_filter
            .as_deref()
            .is_none_or(|f| process_name.to_lowercase().contains(f))
    }
}

impl LockMediator for ProcMediator {
    fn detect_holders(&self, path: &Path) -> Vec<LockHolder> {
        let mut holders: Vec<LockHolder> = scan_open_files(&canonical_target(path))
            .into_iter()
            .filter(|h| self.accepts(&h.process_name))
            .collect();
        holders.sort_by_key(|h| h.process_id);
        if !holders.is_empty() {
            tracing::debug!(path = %path.display(), count = holders.len(), "lock holders detected");
        }
        holders
    }

    fn pause(&self, pid: u32) -> Result<(), MediatorError> {
        signal(pid, Signal::Stop)
    }

    fn resume(&self, pid: u32) -> Result<(), MediatorError> {
        signal(pid, Signal::Cont)
    }

    fn request_exit(&self, pid: u32) -> Result<(), MediatorError> {
        signal(pid, Signal::Term)
    }

    fn force_kill(&self, pid: u32) -> Result<(), MediatorError> {
        signal(pid, Signal::Kill)
    }

    fn run_state(&self, pid: u32) -> RunState {
        process_state(pid)
    }
}

// ---------------------------------------------------------------------------
// Holder detection
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
fn scan_open_files(target: &Path) -> Vec<LockHolder> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    let me = std::process::id();
    let mut holders = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if pid == me {
            continue;
        }
        let proc_dir = entry.path();
        let Ok(fds) = fs::read_dir(proc_dir.join("fd")) else {
            continue;
        };
        let holds = fds
            .flatten()
            .any(|fd| fs::read_link(fd.path()).is_ok_and(|link| link == target));
        if holds {
            let name = fs::read_to_string(proc_dir.join("comm"))
                .map(|s| s.trim().to_owned())
                .unwrap_or_default();
            holders.push(LockHolder::new(pid, name));
        }
    }
    holders
}

#[cfg(not(target_os = "linux"))]
fn scan_open_files(_target: &Path) -> Vec<LockHolder> {
    Vec::new()
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
enum Signal {
    Stop,
    Cont,
    Term,
    Kill,
}

impl Signal {
    const fn action(self) -> &'static str {
        match self {
            Self::Stop => "suspend",
            Self::Cont => "resume",
            Self::Term => "terminate",
            Self::Kill => "kill",
        }
    }

    #[cfg(unix)]
    const fn name(self) -> &'static str {
        match self {
            Self::Stop => "STOP",
            Self::Cont => "CONT",
            Self::Term => "TERM",
            Self::Kill => "KILL",
        }
    }
}

#[cfg(unix)]
fn signal(pid: u32, sig: Signal) -> Result<(), MediatorError> {
    let pid_arg = pid.to_string();
    let out = Command::new("kill")
        .args(["-s", sig.name(), &pid_arg])
        .output()?;
    check(out, pid, sig, &format!("kill -s {} {pid}", sig.name()))
}

#[cfg(windows)]
fn signal(pid: u32, sig: Signal) -> Result<(), MediatorError> {
    let pid_arg = pid.to_string();
    let args: &[&str] = match sig {
        Signal::Term => &["/pid", &pid_arg],
        Signal::Kill => &["/f", "/pid", &pid_arg],
        Signal::Stop | Signal::Cont => {
            return Err(MediatorError::Unsupported {
                action: sig.action(),
            });
        }
    };
    let out = Command::new("taskkill").args(args).output()?;
    check(out, pid, sig, &format!("taskkill {}", args.join(" ")))
}

#[cfg(not(any(unix, windows)))]
fn signal(_pid: u32, sig: Signal) -> Result<(), MediatorError> {
    Err(MediatorError::Unsupported {
        action: sig.action(),
    })
}

#[cfg(any(unix, windows))]
fn check(out: Output, pid: u32, sig: Signal, command: &str) -> Result<(), MediatorError> {
    if out.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_owned();
    let lower = stderr.to_lowercase();
    if lower.contains("no such process") || lower.contains("not found") {
        Err(MediatorError::Gone { pid })
    } else if lower.contains("not permitted") || lower.contains("access is denied") {
        Err(MediatorError::Denied {
            action: sig.action(),
            pid,
        })
    } else {
        Err(MediatorError::Command {
            command: command.to_owned(),
            stderr,
        })
    }
}

// ---------------------------------------------------------------------------
// Process state
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
fn process_state(pid: u32) -> RunState {
    let Ok(stat) = fs::read_to_string(PathBuf::from(format!("/proc/{pid}/stat"))) else {
        return RunState::Gone;
    };
    // Format: "<pid> (<comm>) <state> ...". comm may contain ')' so split on the last one.
    let state = stat
        .rfind(')')
        .and_then(|i| stat[i + 1..].split_whitespace().next())
        .and_then(|s| s.chars().next());
    match state {
        Some('T' | 't') => RunState::Stopped,
        Some('Z' | 'X' | 'x') | None => RunState::Gone,
        Some(_) => RunState::Running,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn process_state(pid: u32) -> RunState {
    let Ok(out) = Command::new("ps")
        .args(["-o", "stat=", "-p", &pid.to_string()])
        .output()
    else {
        return RunState::Gone;
    };
    match String::from_utf8_lossy(&out.stdout).trim().chars().next() {
        Some('T') => RunState::Stopped,
        Some('Z') | None => RunState::Gone,
        Some(_) => RunState::Running,
    }
}

#[cfg(windows)]
fn process_state(pid: u32) -> RunState {
    let filter = format!("PID eq {pid}");
    let Ok(out) = Command::new("tasklist")
        .args(["/fi", &filter, "/nh", "/fo", "csv"])
        .output()
    else {
        return RunState::Gone;
    };
    let needle = format!("\"{pid}\"");
    if String::from_utf8_lossy(&out.stdout).contains(&needle) {
        RunState::Running
    } else {
        RunState::Gone
    }
}

#[cfg(not(any(unix, windows)))]
fn process_state(_pid: u32) -> RunState {
    RunState::Gone
}

/// Canonical form used when comparing descriptor targets.
#[must_use]
pub fn canonical_target(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
