//! "Is this process elevated?" capability.
//!
//! Relaunching with elevated rights is the caller's business; the core only
//! asks whether it already has them, to decide whether the privileged-write
//! rung is worth attempting.

/// Answers whether the current process runs with elevated privilege.
pub trait PrivilegeContext {
    fn is_elevated(&self) -> bool;
}

impl PrivilegeContext for bool {
    fn is_elevated(&self) -> bool {
        *self
    }
}

/// Privilege of the running process, detected once at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessPrivilege {
    elevated: bool,
}

impl ProcessPrivilege {
    /// Detect the current process's privilege level.
    ///
    /// Unix: effective uid 0. Windows: `net session` succeeds (it requires an
    /// administrator token). Anything that cannot be determined counts as not
    /// elevated.
    #[must_use]
    pub fn detect() -> Self {
        let elevated = detect_elevated();
        tracing::debug!(elevated, "detected process privilege");
        Self { elevated }
    }
}

impl PrivilegeContext for ProcessPrivilege {
    fn is_elevated(&self) -> bool {
        self.elevated
    }
}

#[cfg(unix)]
fn detect_elevated() -> bool {
    crate::fsops::effective_ids().is_ok_and(|(uid, _)| uid == 0)
}

#[cfg(windows)]
fn detect_elevated() -> bool {
    use std::process::{Command, Stdio};

    Command::new("net")
        .arg("session")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

#[cfg(not(any(unix, windows)))]
const fn detect_elevated() -> bool {
    false
}
