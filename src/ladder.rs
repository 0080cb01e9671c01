//! Replacement strategy ladder.
//!
//! A resource is replaced by climbing an ordered list of increasingly invasive
//! techniques ("rungs") until one succeeds:
//!
//! ```text
//! Pending ─► Attempting(direct_write)
//!              │ locked / unavailable
//!              ▼
//!            Attempting(rename_swap) ─► ... ─► Attempting(privileged_write)
//!              │                                   │
//!              ├─ write ok ──► Succeeded(rung)     └─ locked ──► Exhausted
//!              └─ unrelated I/O error ──► Aborted
//! ```
//!
//! Which rungs run is decided up front by [`LadderPolicy`] from the resource's
//! sensitivity tier, the operation profile, and the process privilege.
//!
//! # Key invariant
//!
//! No rung mutates the live file before its prior bytes are stored in a
//! durable backup. The backup is taken lazily (the first rung that is about to
//! write takes it) and at most once per attempt, so a resource whose read is
//! locked until its holder is suspended still gets backed up before the
//! mediated write.

use std::fmt;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backup::{self, BackupRecord};
use crate::error::{FailureKind, ReplaceError};
use crate::fsops::{self, LiveFs};
use crate::mediator::{self, ExitWait, LockHolder, LockMediator, ScopedSuspension};
use crate::privilege::PrivilegeContext;
use crate::registry::{ResourceDescriptor, SensitivityTier};

// ---------------------------------------------------------------------------
// Rungs and states
// ---------------------------------------------------------------------------

/// One replacement technique.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rung {
    /// Truncate and write the live file in place.
    DirectWrite,
    /// Write a sibling temp file and rename it over the live file.
    RenameSwap,
    /// Suspend every holder, write, resume.
    MediatedSuspendWrite,
    /// Terminate every holder, then write.
    MediatedTerminateWrite,
    /// Take ownership, grant write access, write.
    PrivilegedWrite,
}

impl Rung {
    /// Every rung, in escalation order.
    pub const ALL: [Self; 5] = [
        Self::DirectWrite,
        Self::RenameSwap,
        Self::MediatedSuspendWrite,
        Self::MediatedTerminateWrite,
        Self::PrivilegedWrite,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DirectWrite => "direct_write",
            Self::RenameSwap => "rename_swap",
            Self::MediatedSuspendWrite => "mediated_suspend_write",
            Self::MediatedTerminateWrite => "mediated_terminate_write",
            Self::PrivilegedWrite => "privileged_write",
        }
    }
}

impl fmt::Display for Rung {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ladder state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LadderState {
    Pending,
    Attempting(Rung),
    Succeeded(Rung),
    /// Every permitted rung failed without an unrelated error.
    Exhausted,
    /// An unrelated I/O error stopped the ladder.
    Aborted(Rung),
}

impl LadderState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Exhausted | Self::Aborted(_))
    }
}

/// Which rungs may run for one resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LadderPolicy {
    pub tier: SensitivityTier,
    /// Whether the operation profile allows terminating lock holders.
    pub allow_termination: bool,
    /// Whether the process is already elevated.
    pub elevated: bool,
}

impl LadderPolicy {
    #[must_use]
    pub const fn permits(&self, rung: Rung) -> bool {
        match rung {
            Rung::DirectWrite | Rung::RenameSwap | Rung::MediatedSuspendWrite => true,
            Rung::MediatedTerminateWrite => {
                self.allow_termination && self.tier.permits_termination()
            }
            Rung::PrivilegedWrite => self.elevated,
        }
    }

    /// Permitted rungs in escalation order.
    #[must_use]
    pub fn rungs(&self) -> Vec<Rung> {
        Rung::ALL.into_iter().filter(|r| self.permits(*r)).collect()
    }
}

// ---------------------------------------------------------------------------
// Attempt records
// ---------------------------------------------------------------------------

/// Final outcome for one resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed { kind: FailureKind, detail: String },
    Skipped { reason: String },
}

impl Outcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// What happened to the live bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    /// Whole-file replacement.
    Replaced,
    /// Selected fields were merged into the live document.
    Merged,
    /// The live resource already matched.
    Unchanged,
    #[default]
    None,
}

/// How a single rung ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RungStatus {
    Succeeded,
    /// Failed with a lock signal; escalation continues.
    Locked,
    /// The rung could not run (no holders, mediator denied, privilege denied).
    Unavailable,
    /// Unrelated failure; the ladder stopped here.
    Failed,
}

/// Trace entry for one rung.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RungRecord {
    pub rung: Rung,
    pub status: RungStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-resource result of an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementAttempt {
    pub resource_name: String,
    pub technique_used: Option<Rung>,
    pub outcome: Outcome,
    #[serde(default)]
    pub change: Change,
    /// Set whenever the live resource was (or was about to be) mutated in place.
    #[serde(default)]
    pub pre_replace_backup_path: Option<std::path::PathBuf>,
    #[serde(default)]
    pub backup_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rungs: Vec<RungRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub holders: Vec<LockHolder>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_fields: Vec<String>,
}

impl ReplacementAttempt {
    fn blank(resource_name: &str, outcome: Outcome) -> Self {
        Self {
            resource_name: resource_name.to_owned(),
            technique_used: None,
            outcome,
            change: Change::None,
            pre_replace_backup_path: None,
            backup_sha256: None,
            rungs: Vec::new(),
            holders: Vec::new(),
            merged_fields: Vec::new(),
        }
    }

    /// A resource that was not attempted.
    #[must_use]
    pub fn skipped(resource_name: &str, reason: impl Into<String>) -> Self {
        Self::blank(
            resource_name,
            Outcome::Skipped {
                reason: reason.into(),
            },
        )
    }

    /// A resource that failed before reaching the ladder.
    #[must_use]
    pub fn failed(resource_name: &str, err: &ReplaceError) -> Self {
        Self::blank(
            resource_name,
            Outcome::Failed {
                kind: err.kind(),
                detail: err.to_string(),
            },
        )
    }

    /// A resource whose live content already matched.
    #[must_use]
    pub fn unchanged(resource_name: &str) -> Self {
        Self {
            change: Change::Unchanged,
            ..Self::blank(resource_name, Outcome::Success)
        }
    }

    fn attach_backup(&mut self, record: &BackupRecord) {
        self.pre_replace_backup_path = Some(record.path.clone());
        self.backup_sha256 = Some(record.sha256.clone());
    }
}

// ---------------------------------------------------------------------------
// Deferred backup
// ---------------------------------------------------------------------------

/// Backup progress for one ladder run.
#[derive(Clone, Debug, PartialEq, Eq)]
enum BackupState {
    Pending,
    Written(BackupRecord),
    /// The live file did not exist, so there is nothing to preserve.
    NotNeeded,
}

impl BackupState {
    /// Make sure the prior bytes of `live` are stored before anything writes
    /// to it.
    fn ensure(&mut self, fs: &dyn LiveFs, live: &Path) -> io::Result<()> {
        if !matches!(self, Self::Pending) {
            return Ok(());
        }
        match fs.read(live) {
            Ok(prior) => {
                *self = Self::Written(backup::write_backup(fs, live, &prior)?);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                *self = Self::NotNeeded;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    const fn record(&self) -> Option<&BackupRecord> {
        match self {
            Self::Written(r) => Some(r),
            Self::Pending | Self::NotNeeded => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Ladder
// ---------------------------------------------------------------------------

enum RungResult {
    Done,
    Locked(String),
    Unavailable(String),
    Failed(ReplaceError),
}

impl RungResult {
    fn from_io(path: &Path, err: io::Error) -> Self {
        if fsops::is_lock_signal(&err) {
            Self::Locked(err.to_string())
        } else {
            Self::Failed(ReplaceError::io(path, err))
        }
    }
}

/// Mutable state of one climb.
struct Climb {
    state: LadderState,
    backup: BackupState,
    trace: Vec<RungRecord>,
    holders: Vec<LockHolder>,
}

impl Climb {
    const fn new(backup: BackupState) -> Self {
        Self {
            state: LadderState::Pending,
            backup,
            trace: Vec::new(),
            holders: Vec::new(),
        }
    }

    /// Record how `rung` ended. Returns the error that stopped the climb, if
    /// any.
    fn settle(&mut self, rung: Rung, result: RungResult) -> Option<ReplaceError> {
        let mut failure = None;
        let (status, detail) = match result {
            RungResult::Done => {
                self.state = LadderState::Succeeded(rung);
                (RungStatus::Succeeded, None)
            }
            RungResult::Locked(d) => (RungStatus::Locked, Some(d)),
            RungResult::Unavailable(d) => (RungStatus::Unavailable, Some(d)),
            RungResult::Failed(e) => {
                let detail = e.to_string();
                self.state = LadderState::Aborted(rung);
                failure = Some(e);
                (RungStatus::Failed, Some(detail))
            }
        };
        tracing::debug!(%rung, ?status, detail = detail.as_deref().unwrap_or(""), "rung finished");
        self.trace.push(RungRecord {
            rung,
            status,
            detail,
        });
        failure
    }

    /// Close the climb and build the attempt record.
    fn finish(mut self, desc: &ResourceDescriptor, mut failure: Option<ReplaceError>) -> ReplacementAttempt {
        if !self.state.is_terminal() {
            self.state = LadderState::Exhausted;
            failure = Some(ReplaceError::LockedResource {
                path: desc.live_path.clone(),
                rungs_tried: self.trace.len(),
            });
        }

        let outcome = match (self.state, &failure) {
            (LadderState::Succeeded(rung), _) => {
                tracing::info!(%rung, "resource replaced");
                Outcome::Success
            }
            (_, Some(err)) => {
                tracing::warn!(error = %err, "resource replacement failed");
                Outcome::Failed {
                    kind: err.kind(),
                    detail: err.to_string(),
                }
            }
            // Unreachable: every non-success terminal state sets `failure`.
            (_, None) => Outcome::Failed {
                kind: FailureKind::LockedResource,
                detail: format!("{} could not be replaced", desc.live_path.display()),
            },
        };

        let mut attempt = ReplacementAttempt::blank(&desc.name, outcome);
        if let LadderState::Succeeded(rung) = self.state {
            attempt.technique_used = Some(rung);
            attempt.change = Change::Replaced;
        }
        if let Some(record) = self.backup.record() {
            attempt.attach_backup(record);
        }
        attempt.rungs = self.trace;
        attempt.holders = self.holders;
        attempt
    }

    fn note_holders(&mut self, holders: &[LockHolder]) {
        for h in holders {
            match self.holders.iter_mut().find(|x| x.process_id == h.process_id) {
                Some(existing) => existing.suspended |= h.suspended,
                None => self.holders.push(h.clone()),
            }
        }
    }
}

/// Drives the rungs for one resource at a time.
pub struct Ladder<'a> {
    fs: &'a dyn LiveFs,
    mediator: &'a dyn LockMediator,
    privilege: &'a dyn PrivilegeContext,
    exit_wait: ExitWait,
    allow_termination: bool,
}

impl<'a> Ladder<'a> {
    #[must_use]
    pub fn new(
        fs: &'a dyn LiveFs,
        mediator: &'a dyn LockMediator,
        privilege: &'a dyn PrivilegeContext,
    ) -> Self {
        Self {
            fs,
            mediator,
            privilege,
            exit_wait: ExitWait::default(),
            allow_termination: true,
        }
    }

    #[must_use]
    pub const fn with_exit_wait(mut self, exit_wait: ExitWait) -> Self {
        self.exit_wait = exit_wait;
        self
    }

    #[must_use]
    pub const fn allow_termination(mut self, allow: bool) -> Self {
        self.allow_termination = allow;
        self
    }

    /// The filesystem this ladder writes through.
    #[must_use]
    pub const fn fs(&self) -> &'a dyn LiveFs {
        self.fs
    }

    /// Policy for a resource of `tier`.
    #[must_use]
    pub fn policy(&self, tier: SensitivityTier) -> LadderPolicy {
        LadderPolicy {
            tier,
            allow_termination: self.allow_termination,
            elevated: self.privilege.is_elevated(),
        }
    }

    /// Replace the live resource with `bytes`.
    ///
    /// Returns `Unchanged` without writing when the live bytes already match.
    pub fn apply(&self, desc: &ResourceDescriptor, bytes: &[u8]) -> ReplacementAttempt {
        if self.fs.read(&desc.live_path).is_ok_and(|live| live == bytes) {
            tracing::debug!(resource = %desc.name, "live bytes already match");
            return ReplacementAttempt::unchanged(&desc.name);
        }
        self.apply_prepared(desc, bytes, None)
    }

    /// Replace the live resource with `bytes`, reusing `backup` when the
    /// caller already stored the prior bytes.
    pub fn apply_prepared(
        &self,
        desc: &ResourceDescriptor,
        bytes: &[u8],
        backup: Option<BackupRecord>,
    ) -> ReplacementAttempt {
        let span = replace_span(desc);
        let _enter = span.enter();

        let live = desc.live_path.as_path();
        let mut climb = Climb::new(backup.map_or(BackupState::Pending, BackupState::Written));
        let mut failure = None;
        for rung in self.policy(desc.sensitivity_tier).rungs() {
            climb.state = LadderState::Attempting(rung);
            span.record("rung", rung.as_str());
            let result = self.attempt(rung, live, bytes, &mut climb);
            failure = climb.settle(rung, result);
            if climb.state.is_terminal() {
                break;
            }
        }
        climb.finish(desc, failure)
    }

    /// Read-modify-write of a live file whose holders block even reads.
    ///
    /// Every holder is suspended across the read, `prepare`, and the write, so
    /// the holder cannot change the file in between. `prepare` gets the live
    /// bytes and returns the bytes to write, or a finished attempt when there
    /// is nothing to write. The write is recorded as
    /// [`Rung::MediatedSuspendWrite`].
    pub fn apply_held(
        &self,
        desc: &ResourceDescriptor,
        prepare: impl FnOnce(&[u8]) -> Result<Vec<u8>, ReplacementAttempt>,
    ) -> ReplacementAttempt {
        const RUNG: Rung = Rung::MediatedSuspendWrite;

        let span = replace_span(desc);
        let _enter = span.enter();
        span.record("rung", RUNG.as_str());

        let live = desc.live_path.as_path();
        let mut climb = Climb::new(BackupState::Pending);
        climb.state = LadderState::Attempting(RUNG);

        let holders = self.mediator.detect_holders(live);
        climb.note_holders(&holders);
        let guards = if holders.is_empty() {
            Err("no lock holders detected".to_owned())
        } else {
            mediator::suspend_all(self.mediator, &holders)
                .map_err(|e| format!("cannot suspend holders: {e}"))
        };
        let guards = match guards {
            Ok(guards) => guards,
            Err(detail) => {
                let failure = climb.settle(RUNG, RungResult::Unavailable(detail));
                return climb.finish(desc, failure);
            }
        };
        let suspended: Vec<LockHolder> = guards.iter().map(|g| g.holder().clone()).collect();
        climb.note_holders(&suspended);

        let result = match self.fs.read(live) {
            Ok(prior) => match prepare(&prior) {
                Ok(bytes) => self.direct_write(live, &bytes, &mut climb),
                Err(done) => {
                    release_all(guards);
                    return done;
                }
            },
            Err(e) => RungResult::from_io(live, e),
        };
        release_all(guards);

        let failure = climb.settle(RUNG, result);
        climb.finish(desc, failure)
    }

    fn attempt(&self, rung: Rung, live: &Path, bytes: &[u8], climb: &mut Climb) -> RungResult {
        match rung {
            Rung::DirectWrite => self.direct_write(live, bytes, climb),
            Rung::RenameSwap => self.rename_swap(live, bytes, climb),
            Rung::MediatedSuspendWrite => self.suspend_write(live, bytes, climb),
            Rung::MediatedTerminateWrite => self.terminate_write(live, bytes, climb),
            Rung::PrivilegedWrite => self.privileged_write(live, bytes, climb),
        }
    }

    fn direct_write(&self, live: &Path, bytes: &[u8], climb: &mut Climb) -> RungResult {
        if let Err(e) = climb.backup.ensure(self.fs, live) {
            return RungResult::from_io(live, e);
        }
        match self.fs.write(live, bytes) {
            Ok(()) => RungResult::Done,
            Err(e) => RungResult::from_io(live, e),
        }
    }

    fn rename_swap(&self, live: &Path, bytes: &[u8], climb: &mut Climb) -> RungResult {
        if let Err(e) = climb.backup.ensure(self.fs, live) {
            return RungResult::from_io(live, e);
        }

        let staged = fsops::sibling_path(live, "tmp");
        if let Err(e) = self.fs.write(&staged, bytes) {
            self.discard(&staged);
            return RungResult::from_io(&staged, e);
        }

        let aside = self.fs.exists(live).then(|| fsops::sibling_path(live, "old"));
        if let Some(aside) = &aside
            && let Err(e) = self.fs.rename(live, aside)
        {
            self.discard(&staged);
            return RungResult::from_io(live, e);
        }

        match self.fs.rename(&staged, live) {
            Ok(()) => {
                if let Some(aside) = &aside {
                    self.discard(aside);
                }
                RungResult::Done
            }
            Err(e) => {
                if let Some(aside) = &aside
                    && let Err(restore) = self.fs.rename(aside, live)
                {
                    tracing::error!(
                        live = %live.display(),
                        aside = %aside.display(),
                        error = %restore,
                        "could not move original back into place"
                    );
                }
                self.discard(&staged);
                RungResult::from_io(live, e)
            }
        }
    }

    fn suspend_write(&self, live: &Path, bytes: &[u8], climb: &mut Climb) -> RungResult {
        let holders = self.mediator.detect_holders(live);
        climb.note_holders(&holders);
        if holders.is_empty() {
            return RungResult::Unavailable("no lock holders detected".to_owned());
        }

        let guards = match mediator::suspend_all(self.mediator, &holders) {
            Ok(guards) => guards,
            Err(e) => return RungResult::Unavailable(format!("cannot suspend holders: {e}")),
        };
        let suspended: Vec<LockHolder> = guards.iter().map(|g| g.holder().clone()).collect();
        climb.note_holders(&suspended);

        let result = self.direct_write(live, bytes, climb);
        release_all(guards);
        result
    }

    fn terminate_write(&self, live: &Path, bytes: &[u8], climb: &mut Climb) -> RungResult {
        let holders = self.mediator.detect_holders(live);
        climb.note_holders(&holders);
        if holders.is_empty() {
            return RungResult::Unavailable("no lock holders detected".to_owned());
        }
        for holder in &holders {
            if !mediator::terminate(self.mediator, holder, &self.exit_wait) {
                return RungResult::Unavailable(format!(
                    "process {} ({}) survived termination",
                    holder.process_id, holder.process_name
                ));
            }
        }
        self.direct_write(live, bytes, climb)
    }

    fn privileged_write(&self, live: &Path, bytes: &[u8], climb: &mut Climb) -> RungResult {
        if self.fs.exists(live)
            && let Err(e) = self.fs.grant_write_access(live)
        {
            if fsops::is_lock_signal(&e) {
                let denied = ReplaceError::PrivilegeDenied {
                    operation: "take ownership of".to_owned(),
                    path: live.to_path_buf(),
                };
                return RungResult::Unavailable(denied.to_string());
            }
            return RungResult::Failed(ReplaceError::io(live, e));
        }
        self.direct_write(live, bytes, climb)
    }

    fn discard(&self, path: &Path) {
        match self.fs.remove(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not remove temporary file");
            }
        }
    }
}

fn replace_span(desc: &ResourceDescriptor) -> tracing::Span {
    tracing::info_span!(
        "replace",
        resource = %desc.name,
        rung = tracing::field::Empty
    )
}

/// Resume every suspended holder, logging the ones that refuse.
fn release_all(guards: Vec<ScopedSuspension<'_>>) {
    for guard in guards {
        let pid = guard.holder().process_id;
        if let Err(e) = guard.release() {
            tracing::warn!(pid, error = %e, "lock holder could not be resumed");
        }
    }
}
