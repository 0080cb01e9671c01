//! Selective field merge for structured documents.
//!
//! Instead of overwriting a live JSON document wholesale, only the declared
//! fields are copied from the snapshot copy; everything else in the live
//! document (including key order) is left as it was.
//!
//! The work is split in two:
//!
//! - [`plan_merge`] is pure: bytes in, merged bytes plus a field report out.
//! - [`merge_resource`] reads the live document, stores a backup of it, and
//!   writes the planned document through the [`Ladder`].
//!
//! A document that does not change is never written, so merging the same
//! snapshot twice reports `Unchanged` the second time.

use std::io;

use serde_json::{Map, Value};

use crate::backup;
use crate::error::ReplaceError;
use crate::fsops;
use crate::ladder::{Change, Ladder, Outcome, ReplacementAttempt};
use crate::registry::{FieldPath, ResourceDescriptor};

// ---------------------------------------------------------------------------
// Overrides
// ---------------------------------------------------------------------------

/// Value written by a [`FieldOverride`].
#[derive(Clone, Debug, PartialEq)]
pub enum OverrideValue {
    /// Current time as fractional Unix seconds.
    Now,
    Literal(Value),
}

/// A value forced into the merged document after the field merge.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldOverride {
    pub path: FieldPath,
    pub value: OverrideValue,
}

impl FieldOverride {
    /// Override `path` (which must be a valid field path) with `value`.
    #[must_use]
    pub fn new(path: &str, value: OverrideValue) -> Option<Self> {
        Some(Self {
            path: path.parse().ok()?,
            value,
        })
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Why a merge could not be planned.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("live document: {0}")]
    Live(String),
    #[error("snapshot document: {0}")]
    Snapshot(String),
}

/// Result of [`plan_merge`].
#[derive(Clone, Debug, PartialEq)]
pub struct MergePlan {
    /// Serialized merged document.
    pub document: Vec<u8>,
    /// Whether the merged document differs from the live one.
    pub changed: bool,
    /// Fields copied from the snapshot (and overrides written).
    pub applied: Vec<String>,
    /// Fields the snapshot does not have.
    pub absent: Vec<String>,
    /// Fields whose live path runs through a non-object value.
    pub blocked: Vec<String>,
}

/// Merge `fields` from `snapshot` into `live`, then apply `overrides`.
///
/// `now` is the value written for [`OverrideValue::Now`].
///
/// # Errors
///
/// Fails when either document is not a JSON object.
pub fn plan_merge(
    live: &[u8],
    snapshot: &[u8],
    fields: &[FieldPath],
    overrides: &[FieldOverride],
    now: f64,
) -> Result<MergePlan, PlanError> {
    let snapshot_doc = parse_object(snapshot).map_err(PlanError::Snapshot)?;
    let original = parse_object(live).map_err(PlanError::Live)?;

    let mut merged = original.clone();
    let mut plan = MergePlan {
        document: Vec::new(),
        changed: false,
        applied: Vec::new(),
        absent: Vec::new(),
        blocked: Vec::new(),
    };

    for field in fields {
        let Some(snapshot_keys) = resolve_keys(&snapshot_doc, field.segments()) else {
            plan.absent.push(field.to_string());
            continue;
        };
        let value = lookup(&snapshot_doc, &snapshot_keys).cloned().unwrap_or(Value::Null);
        // Write where the live document keeps the field, whatever key shape
        // the snapshot uses.
        let keys = resolve_keys(&merged, field.segments()).unwrap_or(snapshot_keys);
        if set_path(&mut merged, &keys, value) {
            plan.applied.push(field.to_string());
        } else {
            plan.blocked.push(field.to_string());
        }
    }

    for o in overrides {
        let keys = resolve_keys(&merged, o.path.segments())
            .unwrap_or_else(|| o.path.segments().to_vec());
        let value = match &o.value {
            OverrideValue::Now => serde_json::Number::from_f64(now).map_or(Value::Null, Value::Number),
            OverrideValue::Literal(v) => v.clone(),
        };
        if set_path(&mut merged, &keys, value) {
            if !plan.applied.iter().any(|f| f == o.path.as_str()) {
                plan.applied.push(o.path.to_string());
            }
        } else {
            plan.blocked.push(o.path.to_string());
        }
    }

    plan.changed = merged != original;
    plan.document = if plan.changed {
        serialize_like(&merged, live)
    } else {
        live.to_vec()
    };
    Ok(plan)
}

fn parse_object(bytes: &[u8]) -> Result<Map<String, Value>, String> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("top level is not an object".to_owned()),
        Err(e) => Err(e.to_string()),
    }
}

/// Serialize `doc` in the layout of `original`: pretty when the original spans
/// lines, compact otherwise, keeping a trailing newline if it had one.
fn serialize_like(doc: &Map<String, Value>, original: &[u8]) -> Vec<u8> {
    let body = if original.contains(&b'\n') {
        serde_json::to_vec_pretty(doc)
    } else {
        serde_json::to_vec(doc)
    };
    // Serializing a `Map<String, Value>` cannot fail.
    let mut out = body.unwrap_or_default();
    if original.ends_with(b"\n") {
        out.push(b'\n');
    }
    out
}

/// Resolve dot-separated `segments` to the actual keys present in `doc`.
///
/// At each level the longest run of segments that names an existing key wins,
/// so `["telemetry", "machineId"]` resolves to the single key
/// `"telemetry.machineId"` when the document has it. Shorter splits are tried
/// when a longer one leads nowhere.
#[must_use]
pub fn resolve_keys(doc: &Map<String, Value>, segments: &[String]) -> Option<Vec<String>> {
    if segments.is_empty() {
        return None;
    }
    for take in (1..=segments.len()).rev() {
        let key = segments[..take].join(".");
        let Some(value) = doc.get(&key) else {
            continue;
        };
        if take == segments.len() {
            return Some(vec![key]);
        }
        if let Value::Object(inner) = value
            && let Some(mut rest) = resolve_keys(inner, &segments[take..])
        {
            rest.insert(0, key);
            return Some(rest);
        }
    }
    None
}

fn lookup<'v>(doc: &'v Map<String, Value>, keys: &[String]) -> Option<&'v Value> {
    let (last, parents) = keys.split_last()?;
    let mut cur = doc;
    for key in parents {
        cur = cur.get(key)?.as_object()?;
    }
    cur.get(last)
}

/// Write `value` at `keys`, creating missing intermediate objects. Returns
/// `false` (and leaves `doc` untouched) when an intermediate is not an object.
fn set_path(doc: &mut Map<String, Value>, keys: &[String], value: Value) -> bool {
    let Some((last, parents)) = keys.split_last() else {
        return false;
    };
    // Check first so a blocked path never leaves half-created objects behind.
    let mut probe = Some(&*doc);
    for key in parents {
        probe = match probe.and_then(|m| m.get(key)) {
            Some(Value::Object(inner)) => Some(inner),
            Some(_) => return false,
            None => None,
        };
    }

    let mut cur = doc;
    for key in parents {
        let entry = cur
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(inner) = entry else {
            return false;
        };
        cur = inner;
    }
    cur.insert(last.clone(), value);
    true
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

/// Merge the declared fields of `desc` from `snapshot` into the live document.
///
/// Falls back to whole-document replacement through the ladder when the live
/// document is missing or unparseable. A corrupt snapshot is skipped. A live
/// document that is held open is merged with its holders suspended.
pub fn merge_resource(
    ladder: &Ladder<'_>,
    desc: &ResourceDescriptor,
    snapshot: &[u8],
    overrides: &[FieldOverride],
    now: f64,
) -> ReplacementAttempt {
    let live_path = desc.live_path.as_path();
    let fs = ladder.fs();

    if let Err(detail) = parse_object(snapshot) {
        let err = ReplaceError::CorruptSnapshot {
            name: desc.name.clone(),
            detail,
        };
        tracing::warn!(resource = %desc.name, error = %err, "skipping corrupt snapshot document");
        return ReplacementAttempt::skipped(&desc.name, format!("corrupt_snapshot: {err}"));
    }

    let live = match fs.read(live_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!(resource = %desc.name, "live document missing; replacing whole document");
            return replace_whole(ladder, desc, snapshot, overrides, now);
        }
        Err(e) if fsops::is_lock_signal(&e) => {
            tracing::info!(resource = %desc.name, error = %e, "live document is held; merging with holders suspended");
            return merge_held(ladder, desc, snapshot, overrides, now);
        }
        Err(e) => return ReplacementAttempt::failed(&desc.name, &ReplaceError::io(live_path, e)),
    };

    let plan = match plan_merge(&live, snapshot, &desc.mergeable_fields, overrides, now) {
        Ok(plan) => plan,
        Err(e) => {
            let err = ReplaceError::CorruptLiveDocument {
                path: live_path.to_path_buf(),
                detail: e.to_string(),
            };
            tracing::warn!(resource = %desc.name, error = %err, "falling back to whole-document replacement");
            return replace_whole(ladder, desc, snapshot, overrides, now);
        }
    };

    if !plan.blocked.is_empty() {
        tracing::warn!(resource = %desc.name, fields = ?plan.blocked, "fields blocked by non-object values");
    }
    if !plan.changed {
        tracing::debug!(resource = %desc.name, "document already up to date");
        return ReplacementAttempt::unchanged(&desc.name);
    }

    let record = match backup::write_backup(fs, live_path, &live) {
        Ok(record) => record,
        Err(e) => return ReplacementAttempt::failed(&desc.name, &ReplaceError::io(live_path, e)),
    };

    let attempt = ladder.apply_prepared(desc, &plan.document, Some(record));
    mark_merged(attempt, plan.applied)
}

/// Merge into a live document that cannot even be read until its holders
/// are suspended. They stay suspended until the merged bytes are written.
fn merge_held(
    ladder: &Ladder<'_>,
    desc: &ResourceDescriptor,
    snapshot: &[u8],
    overrides: &[FieldOverride],
    now: f64,
) -> ReplacementAttempt {
    let mut applied = None;
    let attempt = ladder.apply_held(desc, |live| {
        match plan_merge(live, snapshot, &desc.mergeable_fields, overrides, now) {
            Ok(plan) if !plan.changed => Err(ReplacementAttempt::unchanged(&desc.name)),
            Ok(plan) => {
                applied = Some(plan.applied);
                Ok(plan.document)
            }
            Err(e) => {
                tracing::warn!(resource = %desc.name, error = %e, "falling back to whole-document replacement");
                Ok(whole_document(snapshot, overrides, now))
            }
        }
    });
    match applied {
        Some(fields) => mark_merged(attempt, fields),
        None => attempt,
    }
}

fn mark_merged(mut attempt: ReplacementAttempt, fields: Vec<String>) -> ReplacementAttempt {
    if attempt.outcome == Outcome::Success && attempt.change == Change::Replaced {
        attempt.change = Change::Merged;
        attempt.merged_fields = fields;
        tracing::info!(resource = %attempt.resource_name, fields = attempt.merged_fields.len(), "fields merged");
    }
    attempt
}

/// Full replacement used when no live document can be merged into.
fn replace_whole(
    ladder: &Ladder<'_>,
    desc: &ResourceDescriptor,
    snapshot: &[u8],
    overrides: &[FieldOverride],
    now: f64,
) -> ReplacementAttempt {
    ladder.apply(desc, &whole_document(snapshot, overrides, now))
}

/// The snapshot document with `overrides` applied.
fn whole_document(snapshot: &[u8], overrides: &[FieldOverride], now: f64) -> Vec<u8> {
    if overrides.is_empty() {
        return snapshot.to_vec();
    }
    // Merge nothing from the snapshot into itself so only overrides change it.
    plan_merge(snapshot, snapshot, &[], overrides, now)
        .map_or_else(|_| snapshot.to_vec(), |plan| plan.document)
}

/// Current time as fractional Unix seconds.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn unix_now() -> f64 {
    backup::now_unix_ms() as f64 / 1000.0
}
