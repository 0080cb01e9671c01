//! Durable, timestamped pre-write backups.
//!
//! A backup is written beside the resource it protects as
//! `<file name>.backup_<unix millis>` (with a `-N` suffix if that name is
//! taken) using create-new semantics, so no backup ever overwrites another.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::fsops::LiveFs;

const BACKUP_INFIX: &str = ".backup_";
const MAX_NAME_ATTEMPTS: u32 = 64;

/// A backup that has been written and synced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Where the prior bytes were stored.
    pub path: PathBuf,
    /// Lowercase hex SHA-256 of the stored bytes.
    pub sha256: String,
}

/// Candidate backup path for `live` at `unix_ms`, before collision handling.
#[must_use]
pub fn backup_path(live: &Path, unix_ms: u128, attempt: u32) -> PathBuf {
    let name = live
        .file_name()
        .map_or_else(|| "resource".into(), |n| n.to_string_lossy().into_owned());
    let suffix = if attempt == 0 {
        String::new()
    } else {
        format!("-{attempt}")
    };
    live.with_file_name(format!("{name}{BACKUP_INFIX}{unix_ms}{suffix}"))
}

/// Store `bytes` (the current content of `live`) in a fresh backup file.
///
/// # Errors
///
/// Returns the underlying I/O error if the backup cannot be created. The
/// caller must not mutate `live` in that case.
pub fn write_backup(fs: &dyn LiveFs, live: &Path, bytes: &[u8]) -> io::Result<BackupRecord> {
    let now = now_unix_ms();
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let path = backup_path(live, now, attempt);
        match fs.write_new(&path, bytes) {
            Ok(()) => {
                tracing::debug!(backup = %path.display(), bytes = bytes.len(), "pre-write backup stored");
                return Ok(BackupRecord {
                    path,
                    sha256: sha256_hex(bytes),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!(
            "no free backup name for {} after {MAX_NAME_ATTEMPTS} attempts",
            live.display()
        ),
    ))
}

/// Lowercase hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Milliseconds since the Unix epoch (0 if the clock is before it).
#[must_use]
pub fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
