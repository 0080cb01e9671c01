//! Shared helpers for hotswap integration tests.
//!
//! [`World`] simulates processes holding files open. [`LockingFs`] refuses to
//! touch a file while a running simulated process holds it, and
//! [`FakeMediator`] suspends, resumes, and kills those processes. Both share
//! one `World`, so suspending a holder really does unlock its file.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use tempfile::TempDir;

use hotswap::error::MediatorError;
use hotswap::fsops::{LiveFs, StdFs};
use hotswap::mediator::{ExitWait, LockHolder, LockMediator, RunState};
use hotswap::registry::{Registry, ResourceSpec, default_specs};

// ---------------------------------------------------------------------------
// Simulated processes
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct SimProcess {
    pub name: String,
    pub holds: PathBuf,
    pub state: RunState,
    /// Exits when asked politely.
    pub exits_on_request: bool,
    /// Refuses to be paused (as a process owned by another user would).
    pub refuses_pause: bool,
}

#[derive(Default)]
pub struct World {
    procs: RefCell<BTreeMap<u32, SimProcess>>,
    /// `(path, kind)`: fail writes to `path` with `kind` once unlocked.
    write_fault: RefCell<Option<(PathBuf, io::ErrorKind)>>,
    signals: RefCell<Vec<(u32, &'static str)>>,
}

impl World {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Add a running process holding `path` open.
    pub fn spawn_holder(&self, pid: u32, name: &str, path: &Path) {
        self.procs.borrow_mut().insert(
            pid,
            SimProcess {
                name: name.to_owned(),
                holds: path.to_path_buf(),
                state: RunState::Running,
                exits_on_request: true,
                refuses_pause: false,
            },
        );
    }

    pub fn configure(&self, pid: u32, f: impl FnOnce(&mut SimProcess)) {
        if let Some(p) = self.procs.borrow_mut().get_mut(&pid) {
            f(p);
        }
    }

    #[must_use]
    pub fn state(&self, pid: u32) -> RunState {
        self.procs
            .borrow()
            .get(&pid)
            .map_or(RunState::Gone, |p| p.state)
    }

    pub fn fail_writes(&self, path: &Path, kind: io::ErrorKind) {
        *self.write_fault.borrow_mut() = Some((path.to_path_buf(), kind));
    }

    #[must_use]
    pub fn signals(&self) -> Vec<(u32, &'static str)> {
        self.signals.borrow().clone()
    }

    fn is_locked(&self, path: &Path) -> bool {
        self.procs
            .borrow()
            .values()
            .any(|p| p.holds == path && p.state == RunState::Running)
    }

    fn guard(&self, path: &Path) -> io::Result<()> {
        if self.is_locked(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is in use by another process", path.display()),
            ));
        }
        Ok(())
    }

    fn signal(&self, pid: u32, what: &'static str) -> Result<(), MediatorError> {
        self.signals.borrow_mut().push((pid, what));
        let mut procs = self.procs.borrow_mut();
        let Some(p) = procs.get_mut(&pid) else {
            return Err(MediatorError::Gone { pid });
        };
        if p.state == RunState::Gone {
            return Err(MediatorError::Gone { pid });
        }
        match what {
            "suspend" if p.refuses_pause => {
                return Err(MediatorError::Denied {
                    action: "suspend",
                    pid,
                });
            }
            "suspend" => p.state = RunState::Stopped,
            "resume" => p.state = RunState::Running,
            "terminate" if p.exits_on_request => p.state = RunState::Gone,
            "kill" => p.state = RunState::Gone,
            _ => {}
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LockingFs
// ---------------------------------------------------------------------------

/// Real filesystem that honours simulated locks.
pub struct LockingFs {
    pub world: Rc<World>,
}

impl LiveFs for LockingFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.world.guard(path)?;
        StdFs.read(path)
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        self.world.guard(path)?;
        if let Some((fault, kind)) = &*self.world.write_fault.borrow()
            && fault == path
        {
            return Err(io::Error::new(*kind, "injected write fault"));
        }
        StdFs.write(path, bytes)
    }

    fn write_new(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        self.world.guard(path)?;
        StdFs.write_new(path, bytes)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.world.guard(from)?;
        self.world.guard(to)?;
        StdFs.rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.world.guard(path)?;
        StdFs.remove(path)
    }

    fn exists(&self, path: &Path) -> bool {
        StdFs.exists(path)
    }

    fn grant_write_access(&self, path: &Path) -> io::Result<()> {
        self.world.guard(path)
    }
}

// ---------------------------------------------------------------------------
// FakeMediator
// ---------------------------------------------------------------------------

pub struct FakeMediator {
    pub world: Rc<World>,
}

impl LockMediator for FakeMediator {
    fn detect_holders(&self, path: &Path) -> Vec<LockHolder> {
        self.world
            .procs
            .borrow()
            .iter()
            .filter(|(_, p)| p.holds == path && p.state != RunState::Gone)
            .map(|(pid, p)| LockHolder::new(*pid, p.name.clone()))
            .collect()
    }

    fn pause(&self, pid: u32) -> Result<(), MediatorError> {
        self.world.signal(pid, "suspend")
    }

    fn resume(&self, pid: u32) -> Result<(), MediatorError> {
        self.world.signal(pid, "resume")
    }

    fn request_exit(&self, pid: u32) -> Result<(), MediatorError> {
        self.world.signal(pid, "terminate")
    }

    fn force_kill(&self, pid: u32) -> Result<(), MediatorError> {
        self.world.signal(pid, "kill")
    }

    fn run_state(&self, pid: u32) -> RunState {
        self.world.state(pid)
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A live installation plus a snapshot directory, both under one temp dir.
pub struct Fixture {
    pub dir: TempDir,
    pub live_root: PathBuf,
    pub snapshot_root: PathBuf,
}

impl Fixture {
    pub const SNAPSHOT_ID: &'static str = "cursor_lite_backup_20250101_120000";

    #[must_use]
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let live_root = dir.path().join("live");
        let snapshot_root = dir.path().join("snapshots").join(Self::SNAPSHOT_ID);
        std::fs::create_dir_all(&live_root).unwrap();
        std::fs::create_dir_all(&snapshot_root).unwrap();
        Self {
            dir,
            live_root,
            snapshot_root,
        }
    }

    #[must_use]
    pub fn live(&self, rel: &str) -> PathBuf {
        self.live_root.join(rel)
    }

    pub fn put_live(&self, rel: &str, bytes: &[u8]) -> PathBuf {
        let p = self.live(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, bytes).unwrap();
        p
    }

    pub fn put_snapshot(&self, rel: &str, bytes: &[u8]) {
        let p = self.snapshot_root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, bytes).unwrap();
    }

    #[must_use]
    pub fn read_live(&self, rel: &str) -> Vec<u8> {
        std::fs::read(self.live(rel)).unwrap()
    }

    #[must_use]
    pub fn registry(&self) -> Registry {
        self.registry_with(&default_specs())
    }

    #[must_use]
    pub fn registry_with(&self, specs: &[ResourceSpec]) -> Registry {
        Registry::from_specs(&self.live_root, specs).unwrap()
    }
}

/// Waits short enough for tests.
#[must_use]
pub const fn fast_exit_wait() -> ExitWait {
    ExitWait {
        graceful_timeout: Duration::from_millis(20),
        kill_wait: Duration::from_millis(20),
        poll_interval: Duration::from_millis(1),
    }
}

/// Backup files (`*.backup_*`) next to `path`.
#[must_use]
pub fn backups_of(path: &Path) -> Vec<PathBuf> {
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    let mut found: Vec<PathBuf> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(&format!("{name}.backup_")))
        })
        .collect();
    found.sort();
    found
}
