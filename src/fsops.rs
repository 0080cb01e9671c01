//! Live-file operations and lock-signal classification.
//!
//! Every byte the ladder writes goes through the [`LiveFs`] trait so that the
//! ordering guarantees (backup before mutation, original never missing) can be
//! exercised against a lock-simulating implementation in tests. [`StdFs`] is
//! the real filesystem.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Filesystem primitives the replacement engine needs.
///
/// Implementations must not retry internally: a lock signal has to reach the
/// ladder unchanged so it can escalate.
#[allow(clippy::missing_errors_doc)]
pub trait LiveFs {
    /// Read the whole file.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Truncate-and-write `bytes` to `path`, creating parent directories, and
    /// flush to stable storage before returning.
    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;

    /// Create a new file that must not already exist (used for backups so an
    /// earlier backup is never overwritten).
    fn write_new(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;

    /// Rename `from` to `to`, replacing `to` if it exists.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Remove a file.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Whether `path` exists as a file.
    fn exists(&self, path: &Path) -> bool;

    /// Take ownership of `path` and grant the current principal write access.
    fn grant_write_access(&self, path: &Path) -> io::Result<()>;
}

/// The real filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdFs;

impl LiveFs for StdFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        crate::fp!("FP_LIVE_WRITE")?;
        ensure_parent(path)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(bytes)?;
        file.sync_all()
    }

    fn write_new(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        crate::fp!("FP_BACKUP_WRITE")?;
        ensure_parent(path)?;
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        sync_parent(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        crate::fp!("FP_LIVE_RENAME")?;
        fs::rename(from, to)?;
        sync_parent(to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn grant_write_access(&self, path: &Path) -> io::Result<()> {
        take_ownership(path)?;
        let mut perms = fs::metadata(path)?.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            perms.set_mode(perms.mode() | 0o600);
        }
        #[cfg(not(unix))]
        perms.set_readonly(false);
        fs::set_permissions(path, perms)
    }
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Fsync the parent directory so a create/rename is durable.
fn sync_parent(path: &Path) -> io::Result<()> {
    if cfg!(unix)
        && let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
    {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(unix)]
fn take_ownership(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::MetadataExt as _;

    let current = fs::metadata(path)?;
    let (uid, gid) = effective_ids()?;
    if current.uid() == uid {
        return Ok(());
    }
    std::os::unix::fs::chown(path, Some(uid), Some(gid))
}

#[cfg(windows)]
fn take_ownership(path: &Path) -> io::Result<()> {
    use std::process::Command;

    let takeown = Command::new("takeown").arg("/f").arg(path).output()?;
    if !takeown.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            String::from_utf8_lossy(&takeown.stderr).trim().to_owned(),
        ));
    }
    let icacls = Command::new("icacls")
        .arg(path)
        .args(["/grant", "*S-1-5-32-544:F"])
        .output()?;
    if !icacls.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            String::from_utf8_lossy(&icacls.stderr).trim().to_owned(),
        ));
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn take_ownership(_path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "taking ownership is not supported on this platform",
    ))
}

/// Effective uid/gid of this process.
///
/// Read from the ownership of `/proc/self` where available, otherwise from
/// `id -u` / `id -g`.
#[cfg(unix)]
pub(crate) fn effective_ids() -> io::Result<(u32, u32)> {
    use std::os::unix::fs::MetadataExt as _;

    if let Ok(meta) = fs::metadata("/proc/self") {
        return Ok((meta.uid(), meta.gid()));
    }
    Ok((id_output("-u")?, id_output("-g")?))
}

#[cfg(unix)]
fn id_output(flag: &str) -> io::Result<u32> {
    let out = std::process::Command::new("id").arg(flag).output()?;
    String::from_utf8_lossy(&out.stdout)
        .trim()
        .parse()
        .map_err(|e| io::Error::other(format!("`id {flag}` returned garbage: {e}")))
}

/// Does this error mean "another process holds the file"?
///
/// Sharing/lock violations (Windows error 32 and 33), busy resources, and
/// access denial all count: on the platforms the target application runs on,
/// an exclusively held file surfaces as one of these. Everything else is an
/// unrelated I/O failure that escalation will not fix.
#[must_use]
pub fn is_lock_signal(err: &io::Error) -> bool {
    const ERROR_SHARING_VIOLATION: i32 = 32;
    const ERROR_LOCK_VIOLATION: i32 = 33;

    if cfg!(windows)
        && matches!(
            err.raw_os_error(),
            Some(ERROR_SHARING_VIOLATION | ERROR_LOCK_VIOLATION)
        )
    {
        return true;
    }
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied
            | io::ErrorKind::ResourceBusy
            | io::ErrorKind::ExecutableFileBusy
            | io::ErrorKind::WouldBlock
    )
}

/// Sibling path in the same directory as `path`, used for rename-swap
/// staging. Same directory keeps the rename on one filesystem.
#[must_use]
pub fn sibling_path(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "resource".into(), |n| n.to_string_lossy().into_owned());
    let nonce: u32 = rand::random();
    path.with_file_name(format!(".{name}.hotswap-{tag}-{nonce:08x}"))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn write_creates_parents_and_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c.json");
        StdFs.write(&path, b"long content").unwrap();
        StdFs.write(&path, b"short").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"short");
    }

    #[test]
    fn write_new_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup");
        StdFs.write_new(&path, b"first").unwrap();
        let err = StdFs.write_new(&path, b"second").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&path).unwrap(), b"first");
    }

    #[test]
    fn lock_signals_are_classified() {
        assert!(is_lock_signal(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(is_lock_signal(&io::Error::from(io::ErrorKind::ResourceBusy)));
        assert!(!is_lock_signal(&io::Error::from(io::ErrorKind::NotFound)));
        assert!(!is_lock_signal(&io::Error::from(io::ErrorKind::StorageFull)));
    }

    #[test]
    fn sibling_stays_in_same_directory() {
        let live = Path::new("/data/Network/Cookies");
        let tmp = sibling_path(live, "tmp");
        assert_eq!(tmp.parent(), live.parent());
        let name = tmp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".Cookies.hotswap-tmp-"), "{name}");
        assert_ne!(sibling_path(live, "tmp"), tmp);
    }

    #[cfg(unix)]
    #[test]
    fn grant_write_access_restores_owner_write_bit() {
        use std::os::unix::fs::PermissionsExt as _;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ro");
        fs::write(&path, b"x").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o400)).unwrap();

        StdFs.grant_write_access(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o200, 0o200);
    }
}
