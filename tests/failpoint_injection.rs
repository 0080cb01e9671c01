//! Fault injection on the real filesystem path.
//!
//! Run with `--features failpoints`. Everything lives in one test because the
//! failpoint registry is process-global.

#![cfg(feature = "failpoints")]

use std::io;

use tempfile::TempDir;

use hotswap::error::FailureKind;
use hotswap::failpoints::{self, FailpointAction};
use hotswap::fsops::StdFs;
use hotswap::ladder::{Ladder, Outcome, Rung, RungStatus};
use hotswap::mediator::ProcMediator;
use hotswap::registry::{Registry, default_specs};

#[test]
fn injected_faults_drive_the_ladder() {
    let dir = TempDir::new().unwrap();
    let registry = Registry::from_specs(dir.path(), &default_specs()).unwrap();
    let cookies = registry.resolve("cookies").unwrap();
    std::fs::create_dir_all(cookies.live_path.parent().unwrap()).unwrap();
    std::fs::write(&cookies.live_path, b"v0").unwrap();

    let mediator = ProcMediator::new();
    let ladder = Ladder::new(&StdFs, &mediator, &false);

    // Staged temp writes go through `write` too, so a locked write blocks
    // rename-swap as well and the ladder runs out of rungs.
    failpoints::set("FP_LIVE_WRITE", FailpointAction::Locked);
    let attempt = ladder.apply(cookies, b"v1");
    assert_eq!(attempt.rungs[0].status, RungStatus::Locked);
    assert_eq!(attempt.rungs[1].status, RungStatus::Locked);
    assert!(matches!(
        attempt.outcome,
        Outcome::Failed {
            kind: FailureKind::LockedResource,
            ..
        }
    ));
    let first_backup = attempt.pre_replace_backup_path.unwrap();
    assert_eq!(std::fs::read(first_backup).unwrap(), b"v0");
    assert_eq!(std::fs::read(&cookies.live_path).unwrap(), b"v0");
    failpoints::clear_all();

    // A failing backup stops the ladder before the live file is touched.
    failpoints::set("FP_BACKUP_WRITE", FailpointAction::Error(io::ErrorKind::StorageFull));
    let attempt = ladder.apply(cookies, b"v2");
    assert_eq!(attempt.rungs.len(), 1);
    assert_eq!(attempt.rungs[0].status, RungStatus::Failed);
    assert!(attempt.pre_replace_backup_path.is_none());
    assert_eq!(std::fs::read(&cookies.live_path).unwrap(), b"v0");
    failpoints::clear_all();

    failpoints::set("FP_LIVE_WRITE", FailpointAction::Off);
    let attempt = ladder.apply(cookies, b"v3");
    assert_eq!(attempt.technique_used, Some(Rung::DirectWrite));
    assert_eq!(std::fs::read(&cookies.live_path).unwrap(), b"v3");
    failpoints::clear_all();
}
