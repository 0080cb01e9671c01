//! Feature-gated fault injection for live-file I/O.
//!
//! Compile with `--features failpoints` to enable injection. Without the
//! feature, [`fp!`](crate::fp) expands to `Ok(())` and the registry is never
//! consulted.
//!
//! Injection points used by [`StdFs`](crate::fsops::StdFs):
//!
//! - `FP_LIVE_WRITE` before any write to a path
//! - `FP_LIVE_RENAME` before a rename
//! - `FP_BACKUP_WRITE` before a pre-replace backup is written

use std::collections::HashMap;
use std::io;
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::Duration;

/// Actions a failpoint can take when triggered.
#[derive(Clone, Debug)]
pub enum FailpointAction {
    /// No-op (default).
    Off,
    /// Fail with an I/O error of the given kind.
    Error(io::ErrorKind),
    /// Fail as if the file were held open by another process.
    Locked,
    /// Panic with the given message.
    Panic(String),
    /// Sleep for the given duration, then succeed.
    Sleep(Duration),
}

static REGISTRY: LazyLock<Mutex<HashMap<&'static str, FailpointAction>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Set a failpoint action.
pub fn set(name: &'static str, action: FailpointAction) {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name, action);
}

/// Clear a specific failpoint.
pub fn clear(name: &'static str) {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(name);
}

/// Clear all failpoints.
pub fn clear_all() {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

/// Check if a failpoint is set and execute its action.
///
/// # Errors
///
/// Returns the injected I/O error for `Error` and `Locked` actions.
///
/// # Panics
///
/// Panics when the failpoint action is `Panic`.
pub fn check(name: &str) -> io::Result<()> {
    let registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
    match registry.get(name) {
        None | Some(FailpointAction::Off) => Ok(()),
        Some(FailpointAction::Error(kind)) => {
            Err(io::Error::new(*kind, format!("failpoint {name}")))
        }
        Some(FailpointAction::Locked) => Err(io::Error::new(
            io::ErrorKind::ResourceBusy,
            format!("failpoint {name}: locked"),
        )),
        Some(FailpointAction::Panic(msg)) => panic!("failpoint {name}: {msg}"),
        Some(FailpointAction::Sleep(d)) => {
            let d = *d;
            drop(registry);
            std::thread::sleep(d);
            Ok(())
        }
    }
}

/// Failpoint injection point yielding `std::io::Result<()>`.
///
/// Usage: `fp!("FP_LIVE_WRITE")?;`
#[cfg(feature = "failpoints")]
#[macro_export]
macro_rules! fp {
    ($name:expr) => {
        $crate::failpoints::check($name)
    };
}

#[cfg(not(feature = "failpoints"))]
#[macro_export]
macro_rules! fp {
    ($name:expr) => {
        Ok::<(), std::io::Error>(())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fp_noop_when_not_set() {
        clear("FP_TEST_NOOP");
        assert!(fp!("FP_TEST_NOOP").is_ok());
    }

    #[test]
    fn check_reports_injected_kind() {
        set("FP_TEST_KIND", FailpointAction::Error(io::ErrorKind::StorageFull));
        let err = check("FP_TEST_KIND").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::StorageFull);
        clear("FP_TEST_KIND");
        assert!(check("FP_TEST_KIND").is_ok());
    }

    #[test]
    fn locked_action_is_a_lock_signal() {
        set("FP_TEST_LOCKED", FailpointAction::Locked);
        let err = check("FP_TEST_LOCKED").unwrap_err();
        assert!(crate::fsops::is_lock_signal(&err));
        clear("FP_TEST_LOCKED");
    }

    #[test]
    fn sleep_returns_ok() {
        set("FP_TEST_SLEEP", FailpointAction::Sleep(Duration::from_millis(1)));
        assert!(check("FP_TEST_SLEEP").is_ok());
        clear("FP_TEST_SLEEP");
    }

    #[test]
    #[cfg(feature = "failpoints")]
    fn macro_consults_registry_with_feature() {
        set("FP_TEST_MACRO", FailpointAction::Error(io::ErrorKind::Other));
        assert!(fp!("FP_TEST_MACRO").is_err());
        clear("FP_TEST_MACRO");
    }
}
