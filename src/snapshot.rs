//! Read-only snapshot sets.
//!
//! A snapshot set is a directory holding previously captured copies of some
//! or all registry resources at their `snapshot_relative_path`, plus an
//! optional `backup_info.json` describing where it came from. The core never
//! writes into a snapshot.
//!
//! ```text
//! cursor_lite_backup_20250101_120000/   ← id
//! ├── backup_info.json                  ← origin (optional)
//! ├── sentry/session.json
//! ├── sentry/scope_v3.json
//! └── Network/Cookies
//! ```

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::registry::Registry;

/// Name of the metadata file inside a snapshot directory.
pub const INFO_FILE: &str = "backup_info.json";

/// Errors opening a snapshot set.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot `{id}` not found at {}", path.display())]
    NotFound { id: String, path: PathBuf },

    #[error("snapshot id `{id}` is not a plain directory name")]
    InvalidId { id: String },

    #[error("I/O error reading snapshot {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Informational metadata about where a snapshot was taken.
///
/// Parsed leniently: unknown fields are ignored and every field is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotOrigin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_note: Option<String>,
}

/// A captured, read-only set of resource copies.
#[derive(Clone, Debug)]
pub struct SnapshotSet {
    /// Identifier (the snapshot directory name).
    pub id: String,
    /// Absolute snapshot directory.
    pub root: PathBuf,
    /// Where the snapshot came from.
    pub origin: SnapshotOrigin,
    /// Resource name → path relative to `root`, for resources present.
    pub contents: BTreeMap<String, PathBuf>,
}

impl SnapshotSet {
    /// Open the snapshot directory `root`, recording which registry resources
    /// it contains.
    ///
    /// # Errors
    ///
    /// Fails when `root` is not a directory.
    pub fn open(root: &Path, registry: &Registry) -> Result<Self, SnapshotError> {
        let id = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !root.is_dir() {
            return Err(SnapshotError::NotFound {
                id,
                path: root.to_path_buf(),
            });
        }

        let origin = match std::fs::read(root.join(INFO_FILE)) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(snapshot = %id, error = %e, "ignoring unreadable {INFO_FILE}");
                SnapshotOrigin::default()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => SnapshotOrigin::default(),
            Err(source) => {
                return Err(SnapshotError::Io {
                    path: root.join(INFO_FILE),
                    source,
                });
            }
        };

        let contents = registry
            .iter()
            .filter(|d| root.join(&d.snapshot_relative_path).is_file())
            .map(|d| (d.name.clone(), d.snapshot_relative_path.clone()))
            .collect();

        Ok(Self {
            id,
            root: root.to_path_buf(),
            origin,
            contents,
        })
    }

    /// Whether the snapshot holds a copy of `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.contents.contains_key(name)
    }

    /// Read the snapshot copy of `name`. `None` when the snapshot lacks it.
    #[must_use]
    pub fn read(&self, name: &str) -> Option<io::Result<Vec<u8>>> {
        let rel = self.contents.get(name)?;
        Some(std::fs::read(self.root.join(rel)))
    }

    /// Absolute path of the snapshot copy of `name`.
    #[must_use]
    pub fn path_of(&self, name: &str) -> Option<PathBuf> {
        self.contents.get(name).map(|rel| self.root.join(rel))
    }
}

/// Supplies snapshot sets by id.
#[allow(clippy::missing_errors_doc)]
pub trait SnapshotProvider {
    fn open(&self, id: &str, registry: &Registry) -> Result<SnapshotSet, SnapshotError>;
}

/// Snapshot sets stored as sibling directories under one root.
#[derive(Clone, Debug)]
pub struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl SnapshotProvider for DirectoryProvider {
    fn open(&self, id: &str, registry: &Registry) -> Result<SnapshotSet, SnapshotError> {
        let plain = Path::new(id)
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
        if id.is_empty() || !plain || Path::new(id).components().count() != 1 {
            return Err(SnapshotError::InvalidId { id: id.to_owned() });
        }
        SnapshotSet::open(&self.root.join(id), registry)
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The account a snapshot belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub user_id: String,
}

/// Work out which account a snapshot belongs to.
///
/// Prefers `scope.user` in the `scope` resource; falls back to the device id
/// (`did`) of the `session` resource. Returns `None` when neither is readable.
#[must_use]
pub fn extract_identity(snapshot: &SnapshotSet) -> Option<Identity> {
    let parse = |name: &str| -> Option<Value> {
        let bytes = snapshot.read(name)?.ok()?;
        serde_json::from_slice(&bytes).ok()
    };

    if let Some(scope) = parse("scope")
        && let Some(user) = scope.get("scope").and_then(|s| s.get("user"))
    {
        let user_id = user.get("id").and_then(Value::as_str).unwrap_or_default();
        let email = user.get("email").and_then(Value::as_str);
        if !user_id.is_empty() || email.is_some() {
            return Some(Identity {
                email: email.map(str::to_owned),
                user_id: user_id.to_owned(),
            });
        }
    }

    let session = parse("session")?;
    let did = session.get("did").and_then(Value::as_str)?;
    (!did.is_empty()).then(|| Identity {
        email: None,
        user_id: did.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::registry::default_specs;

    fn registry() -> Registry {
        Registry::from_specs(Path::new("/live"), &default_specs()).unwrap()
    }

    fn put(root: &Path, rel: &str, bytes: &[u8]) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, bytes).unwrap();
    }

    #[test]
    fn open_records_partial_contents_and_origin() {
        let dir = TempDir::new().unwrap();
        let snap = dir.path().join("cursor_lite_backup_20250101_120000");
        put(&snap, "Network/Cookies", b"c");
        put(&snap, "sentry/session.json", b"{}");
        put(
            &snap,
            INFO_FILE,
            br#"{"backup_time":"2025-01-01T12:00:00","computer_name":"box","files_total":10}"#,
        );

        let set = SnapshotSet::open(&snap, &registry()).unwrap();
        assert_eq!(set.id, "cursor_lite_backup_20250101_120000");
        assert_eq!(set.origin.computer_name.as_deref(), Some("box"));
        assert!(set.contains("cookies"));
        assert!(set.contains("session"));
        assert!(!set.contains("keybindings"));
        assert_eq!(set.read("cookies").unwrap().unwrap(), b"c");
        assert!(set.read("keybindings").is_none());
    }

    #[test]
    fn missing_directory_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = SnapshotSet::open(&dir.path().join("nope"), &registry()).unwrap_err();
        assert!(matches!(err, SnapshotError::NotFound { .. }));
    }

    #[test]
    fn provider_rejects_traversal_ids() {
        let dir = TempDir::new().unwrap();
        let provider = DirectoryProvider::new(dir.path().to_path_buf());
        assert!(matches!(
            provider.open("../etc", &registry()),
            Err(SnapshotError::InvalidId { .. })
        ));
        assert!(matches!(
            provider.open("a/b", &registry()),
            Err(SnapshotError::InvalidId { .. })
        ));
    }

    #[test]
    fn identity_prefers_scope_user() {
        let dir = TempDir::new().unwrap();
        let snap = dir.path().join("s");
        put(
            &snap,
            "sentry/scope_v3.json",
            br#"{"scope":{"user":{"email":"b@y.com","id":"2"}}}"#,
        );
        put(&snap, "sentry/session.json", br#"{"did":"device-9"}"#);
        let set = SnapshotSet::open(&snap, &registry()).unwrap();
        let id = extract_identity(&set).unwrap();
        assert_eq!(id.email.as_deref(), Some("b@y.com"));
        assert_eq!(id.user_id, "2");
    }

    #[test]
    fn identity_falls_back_to_session_did() {
        let dir = TempDir::new().unwrap();
        let snap = dir.path().join("s");
        put(&snap, "sentry/scope_v3.json", b"not json");
        put(&snap, "sentry/session.json", br#"{"did":"device-9"}"#);
        let set = SnapshotSet::open(&snap, &registry()).unwrap();
        let id = extract_identity(&set).unwrap();
        assert_eq!(id.email, None);
        assert_eq!(id.user_id, "device-9");
    }
}
