//! Replacement orchestrator.
//!
//! Runs one operation (restore, hot switch, identity switch, activation) over
//! a resource set. Each resource is routed to the merge engine or the ladder,
//! and its attempt is folded into an [`OperationReport`]. One resource failing
//! never stops the rest.
//!
//! The four operations are [`OperationProfile`]s of the same loop: they differ
//! only in default resources, default merge mode, whether holders may be
//! terminated, and which fields are refreshed after a merge.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backup;
use crate::error::ReplaceError;
use crate::fsops::LiveFs;
use crate::ladder::{Change, Ladder, Outcome, ReplacementAttempt};
use crate::mediator::{ExitWait, LockMediator};
use crate::merge::{self, FieldOverride, OverrideValue};
use crate::privilege::PrivilegeContext;
use crate::registry::{Registry, ResourceDescriptor, ResourceSelection};
use crate::snapshot::{self, Identity, SnapshotError, SnapshotProvider, SnapshotSet};

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// The operations the orchestrator can run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Put every snapshot resource back.
    Restore,
    /// Restore while the application keeps running.
    HotSwitch,
    /// Switch account identity fields only.
    IdentitySwitch,
    /// Identity switch plus refreshed session timestamps.
    Activation,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Restore => "restore",
            Self::HotSwitch => "hot-switch",
            Self::IdentitySwitch => "identity-switch",
            Self::Activation => "activation",
        })
    }
}

/// How structured documents are applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Replace every resource wholesale.
    #[default]
    Full,
    /// Merge declared fields of structured documents.
    #[value(name = "selective")]
    SelectiveFields,
}

/// Resource names identity-bearing operations touch.
const IDENTITY_RESOURCES: [&str; 3] = ["session", "scope", "machine-storage"];

/// Configuration variant of the one orchestrator operation.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationProfile {
    pub kind: OperationKind,
    pub resources: ResourceSelection,
    pub merge_mode: MergeMode,
    /// Whether the terminate-and-write rung may run at all.
    pub allow_termination: bool,
    /// `(resource name, override)` pairs applied after a selective merge.
    pub overrides: Vec<(String, FieldOverride)>,
}

impl OperationKind {
    #[must_use]
    pub fn profile(self) -> OperationProfile {
        let identity = || {
            ResourceSelection::Only(IDENTITY_RESOURCES.iter().map(|s| (*s).to_owned()).collect())
        };
        match self {
            Self::Restore => OperationProfile {
                kind: self,
                resources: ResourceSelection::All,
                merge_mode: MergeMode::Full,
                allow_termination: true,
                overrides: Vec::new(),
            },
            Self::HotSwitch => OperationProfile {
                kind: self,
                resources: ResourceSelection::All,
                merge_mode: MergeMode::Full,
                allow_termination: false,
                overrides: Vec::new(),
            },
            Self::IdentitySwitch => OperationProfile {
                kind: self,
                resources: identity(),
                merge_mode: MergeMode::SelectiveFields,
                allow_termination: false,
                overrides: Vec::new(),
            },
            Self::Activation => OperationProfile {
                kind: self,
                resources: identity(),
                merge_mode: MergeMode::SelectiveFields,
                allow_termination: false,
                overrides: activation_overrides(),
            },
        }
    }
}

fn activation_overrides() -> Vec<(String, FieldOverride)> {
    [
        ("session", "timestamp", OverrideValue::Now),
        ("session", "started", OverrideValue::Now),
        ("session", "status", OverrideValue::Literal(Value::from("ok"))),
        ("scope", "event.timestamp", OverrideValue::Now),
        ("machine-storage", "lastActiveTime", OverrideValue::Now),
    ]
    .into_iter()
    .filter_map(|(resource, path, value)| {
        FieldOverride::new(path, value).map(|o| (resource.to_owned(), o))
    })
    .collect()
}

impl OperationProfile {
    fn overrides_for(&self, resource: &str) -> Vec<FieldOverride> {
        self.overrides
            .iter()
            .filter(|(name, _)| name == resource)
            .map(|(_, o)| o.clone())
            .collect()
    }
}

/// What the caller asks for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub snapshot_set_id: String,
    pub kind: OperationKind,
    pub resources: ResourceSelection,
    pub merge_mode: MergeMode,
}

impl OperationRequest {
    /// A request using the profile defaults for `kind`.
    #[must_use]
    pub fn new(snapshot_set_id: impl Into<String>, kind: OperationKind) -> Self {
        let profile = kind.profile();
        Self {
            snapshot_set_id: snapshot_set_id.into(),
            kind,
            resources: profile.resources,
            merge_mode: profile.merge_mode,
        }
    }

    #[must_use]
    pub fn resources(mut self, resources: ResourceSelection) -> Self {
        self.resources = resources;
        self
    }

    #[must_use]
    pub const fn merge_mode(mut self, mode: MergeMode) -> Self {
        self.merge_mode = mode;
        self
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared flag checked between resources.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Counts over an operation's attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub merged: usize,
    pub unchanged: usize,
}

/// Overall verdict of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Overall {
    /// Every attempted resource succeeded and nothing was skipped.
    Complete,
    /// Some resources succeeded, others failed or were skipped.
    Partial,
    /// Nothing succeeded and at least one resource failed.
    Failed,
    /// Nothing was attempted.
    NothingApplied,
}

/// Structured result of one operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationReport {
    pub operation: OperationKind,
    pub snapshot_set_id: String,
    #[serde(default)]
    pub target_identity: Option<Identity>,
    pub attempts: Vec<ReplacementAttempt>,
    pub summary: Summary,
    pub overall: Overall,
}

impl OperationReport {
    fn new(
        operation: OperationKind,
        snapshot_set_id: &str,
        target_identity: Option<Identity>,
        attempts: Vec<ReplacementAttempt>,
    ) -> Self {
        let summary = summarize(&attempts);
        let overall = overall(&summary);
        Self {
            operation,
            snapshot_set_id: snapshot_set_id.to_owned(),
            target_identity,
            attempts,
            summary,
            overall,
        }
    }

    /// The attempt for `resource`, if any.
    #[must_use]
    pub fn attempt(&self, resource: &str) -> Option<&ReplacementAttempt> {
        self.attempts.iter().find(|a| a.resource_name == resource)
    }
}

fn summarize(attempts: &[ReplacementAttempt]) -> Summary {
    let mut s = Summary::default();
    for a in attempts {
        match a.outcome {
            Outcome::Success => s.succeeded += 1,
            Outcome::Failed { .. } => s.failed += 1,
            Outcome::Skipped { .. } => s.skipped += 1,
        }
        match a.change {
            Change::Merged => s.merged += 1,
            Change::Unchanged => s.unchanged += 1,
            Change::Replaced | Change::None => {}
        }
    }
    s
}

const fn overall(s: &Summary) -> Overall {
    match (s.succeeded, s.failed, s.skipped) {
        (0, 0, _) => Overall::NothingApplied,
        (0, _, _) => Overall::Failed,
        (_, 0, 0) => Overall::Complete,
        _ => Overall::Partial,
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Skip reasons recorded in reports.
pub mod reason {
    pub const ABSENT_IN_SNAPSHOT: &str = "absent_in_snapshot";
    pub const CANCELLED: &str = "cancelled";
    pub const NO_BACKUP: &str = "no_backup";
    pub const NOT_SUCCESSFUL: &str = "not_successful";
}

/// Drives ladder and merge engine across a resource set.
pub struct Orchestrator<'a> {
    registry: &'a Registry,
    fs: &'a dyn LiveFs,
    mediator: &'a dyn LockMediator,
    privilege: &'a dyn PrivilegeContext,
    exit_wait: ExitWait,
    cancel: CancelToken,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(
        registry: &'a Registry,
        fs: &'a dyn LiveFs,
        mediator: &'a dyn LockMediator,
        privilege: &'a dyn PrivilegeContext,
    ) -> Self {
        Self {
            registry,
            fs,
            mediator,
            privilege,
            exit_wait: ExitWait::default(),
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub const fn with_exit_wait(mut self, exit_wait: ExitWait) -> Self {
        self.exit_wait = exit_wait;
        self
    }

    /// Use `cancel` to stop between resources.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn ladder(&self, allow_termination: bool) -> Ladder<'a> {
        Ladder::new(self.fs, self.mediator, self.privilege)
            .with_exit_wait(self.exit_wait)
            .allow_termination(allow_termination)
    }

    /// Open the requested snapshot and run the operation.
    ///
    /// # Errors
    ///
    /// Only fails when the snapshot set cannot be opened; per-resource
    /// failures end up in the report.
    pub fn run(
        &self,
        provider: &dyn SnapshotProvider,
        request: &OperationRequest,
    ) -> Result<OperationReport, SnapshotError> {
        let snapshot = provider.open(&request.snapshot_set_id, self.registry)?;
        Ok(self.run_on(&snapshot, request))
    }

    /// Run the operation against an opened snapshot.
    pub fn run_on(&self, snapshot: &SnapshotSet, request: &OperationRequest) -> OperationReport {
        let span = tracing::info_span!(
            "operation",
            kind = %request.kind,
            snapshot = %snapshot.id,
        );
        let _enter = span.enter();

        let profile = request.kind.profile();
        let ladder = self.ladder(profile.allow_termination);
        let selected = self.registry.all_for(&request.resources);
        let target_identity = snapshot::extract_identity(snapshot);
        let now = merge::unix_now();

        let mut attempts: Vec<ReplacementAttempt> = selected
            .unknown
            .iter()
            .map(|name| {
                ReplacementAttempt::failed(
                    name,
                    &ReplaceError::UnknownResource { name: name.clone() },
                )
            })
            .collect();

        let mut remaining = selected.descriptors.iter();
        while let Some(desc) = remaining.next() {
            if self.cancel.is_cancelled() {
                tracing::info!("operation cancelled");
                attempts.push(ReplacementAttempt::skipped(&desc.name, reason::CANCELLED));
                attempts.extend(
                    remaining
                        .by_ref()
                        .map(|d| ReplacementAttempt::skipped(&d.name, reason::CANCELLED)),
                );
                break;
            }
            let overrides = profile.overrides_for(&desc.name);
            attempts.push(self.apply_one(&ladder, snapshot, desc, request.merge_mode, &overrides, now));
        }

        let report =
            OperationReport::new(request.kind, &snapshot.id, target_identity, attempts);
        tracing::info!(
            overall = ?report.overall,
            succeeded = report.summary.succeeded,
            failed = report.summary.failed,
            skipped = report.summary.skipped,
            "operation finished"
        );
        report
    }

    fn apply_one(
        &self,
        ladder: &Ladder<'_>,
        snapshot: &SnapshotSet,
        desc: &ResourceDescriptor,
        mode: MergeMode,
        overrides: &[FieldOverride],
        now: f64,
    ) -> ReplacementAttempt {
        let bytes = match snapshot.read(&desc.name) {
            None => {
                tracing::debug!(resource = %desc.name, "not in snapshot");
                return ReplacementAttempt::skipped(&desc.name, reason::ABSENT_IN_SNAPSHOT);
            }
            Some(Err(e)) => {
                let path = snapshot.path_of(&desc.name).unwrap_or_default();
                return ReplacementAttempt::failed(&desc.name, &ReplaceError::io(path, e));
            }
            Some(Ok(bytes)) => bytes,
        };

        if desc.is_document() && mode == MergeMode::SelectiveFields {
            merge::merge_resource(ladder, desc, &bytes, overrides, now)
        } else {
            ladder.apply(desc, &bytes)
        }
    }

    /// Put back the pre-replace backups recorded in `report`.
    ///
    /// Only successful attempts with a backup are rolled back. Each backup is
    /// checked against its recorded digest before it is applied, and applying
    /// it goes through the ladder (so it is itself backed up first).
    pub fn rollback(&self, report: &OperationReport) -> OperationReport {
        let span = tracing::info_span!("rollback", snapshot = %report.snapshot_set_id);
        let _enter = span.enter();

        let ladder = self.ladder(report.operation.profile().allow_termination);
        let mut attempts = Vec::with_capacity(report.attempts.len());
        let mut remaining = report.attempts.iter();
        while let Some(prior) = remaining.next() {
            if self.cancel.is_cancelled() {
                attempts.push(ReplacementAttempt::skipped(&prior.resource_name, reason::CANCELLED));
                attempts.extend(
                    remaining
                        .by_ref()
                        .map(|a| ReplacementAttempt::skipped(&a.resource_name, reason::CANCELLED)),
                );
                break;
            }
            attempts.push(self.rollback_one(&ladder, prior));
        }
        OperationReport::new(
            report.operation,
            &report.snapshot_set_id,
            report.target_identity.clone(),
            attempts,
        )
    }

    fn rollback_one(&self, ladder: &Ladder<'_>, prior: &ReplacementAttempt) -> ReplacementAttempt {
        let name = prior.resource_name.as_str();
        if !prior.outcome.is_success() {
            return ReplacementAttempt::skipped(name, reason::NOT_SUCCESSFUL);
        }
        let Some(backup_path) = &prior.pre_replace_backup_path else {
            return ReplacementAttempt::skipped(name, reason::NO_BACKUP);
        };
        let desc = match self.registry.resolve(name) {
            Ok(desc) => desc,
            Err(e) => return ReplacementAttempt::failed(name, &e),
        };

        let bytes = match self.fs.read(backup_path) {
            Ok(bytes) => bytes,
            Err(e) => return ReplacementAttempt::failed(name, &ReplaceError::io(backup_path, e)),
        };
        if let Some(expected) = &prior.backup_sha256 {
            let actual = backup::sha256_hex(&bytes);
            if &actual != expected {
                let err = ReplaceError::io(
                    backup_path,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("backup digest mismatch: expected {expected}, found {actual}"),
                    ),
                );
                tracing::warn!(resource = name, error = %err, "refusing to restore altered backup");
                return ReplacementAttempt::failed(name, &err);
            }
        }
        ladder.apply(desc, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(outcome: Outcome, change: Change) -> ReplacementAttempt {
        let mut a = ReplacementAttempt::skipped("x", "");
        a.outcome = outcome;
        a.change = change;
        a
    }

    fn failed() -> Outcome {
        Outcome::Failed {
            kind: crate::error::FailureKind::LockedResource,
            detail: String::new(),
        }
    }

    fn skipped() -> Outcome {
        Outcome::Skipped {
            reason: reason::ABSENT_IN_SNAPSHOT.into(),
        }
    }

    #[test]
    fn overall_verdicts() {
        let ok = attempt(Outcome::Success, Change::Replaced);
        let cases = [
            (vec![], Overall::NothingApplied),
            (vec![attempt(skipped(), Change::None)], Overall::NothingApplied),
            (vec![ok.clone()], Overall::Complete),
            (vec![ok.clone(), attempt(skipped(), Change::None)], Overall::Partial),
            (vec![ok, attempt(failed(), Change::None)], Overall::Partial),
            (vec![attempt(failed(), Change::None)], Overall::Failed),
        ];
        for (attempts, want) in cases {
            assert_eq!(overall(&summarize(&attempts)), want, "{attempts:?}");
        }
    }

    #[test]
    fn summary_counts_changes() {
        let s = summarize(&[
            attempt(Outcome::Success, Change::Merged),
            attempt(Outcome::Success, Change::Unchanged),
            attempt(Outcome::Success, Change::Replaced),
            attempt(failed(), Change::None),
        ]);
        assert_eq!(
            s,
            Summary {
                succeeded: 3,
                failed: 1,
                skipped: 0,
                merged: 1,
                unchanged: 1
            }
        );
    }

    #[test]
    fn profiles_are_variants_of_one_operation() {
        let restore = OperationKind::Restore.profile();
        assert_eq!(restore.resources, ResourceSelection::All);
        assert!(restore.allow_termination);
        assert!(restore.overrides.is_empty());

        assert!(!OperationKind::HotSwitch.profile().allow_termination);

        let identity = OperationKind::IdentitySwitch.profile();
        assert_eq!(identity.merge_mode, MergeMode::SelectiveFields);
        assert_eq!(
            identity.resources,
            ResourceSelection::Only(vec!["session".into(), "scope".into(), "machine-storage".into()])
        );

        let activation = OperationKind::Activation.profile();
        let session: Vec<String> = activation
            .overrides_for("session")
            .iter()
            .map(|o| o.path.to_string())
            .collect();
        assert_eq!(session, ["timestamp", "started", "status"]);
        assert_eq!(activation.overrides_for("scope").len(), 1);
        assert!(activation.overrides_for("cookies").is_empty());
    }

    #[test]
    fn request_defaults_follow_profile() {
        let req = OperationRequest::new("snap", OperationKind::Activation);
        assert_eq!(req.merge_mode, MergeMode::SelectiveFields);
        let req = req.merge_mode(MergeMode::Full).resources(ResourceSelection::All);
        assert_eq!(req.merge_mode, MergeMode::Full);
        assert_eq!(req.resources, ResourceSelection::All);
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn report_round_trips_through_json() {
        let report = OperationReport::new(
            OperationKind::HotSwitch,
            "cursor_lite_backup_20250101_120000",
            Some(Identity {
                email: Some("b@y.com".into()),
                user_id: "2".into(),
            }),
            vec![attempt(Outcome::Success, Change::Replaced)],
        );
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"operation\":\"hot-switch\""));
        assert!(json.contains("\"overall\":\"complete\""));
        let back: OperationReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
