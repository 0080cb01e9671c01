//! Resource descriptor registry.
//!
//! The registry is the static map from a logical resource name (`"session"`,
//! `"cookies"`, ...) to where that resource lives, where its copy sits inside
//! a snapshot, how it may be merged, and how invasive the replacement ladder
//! is allowed to be. It is built once from configuration and passed around
//! explicitly; nothing here is global.

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ConfigError, ReplaceError};

// ---------------------------------------------------------------------------
// Kinds and tiers
// ---------------------------------------------------------------------------

/// How a resource's bytes are interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Opaque bytes; only whole-file replacement applies.
    OpaqueBlob,
    /// A JSON document eligible for selective field merge.
    StructuredDocument,
}

/// Policy classification limiting how invasive a rung may be.
///
/// Ordering is meaningful: resources are processed from `Low` to `High`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityTier {
    Low,
    Medium,
    High,
}

impl SensitivityTier {
    /// Whether the terminate-and-write rung may ever run for this tier.
    #[must_use]
    pub const fn permits_termination(self) -> bool {
        !matches!(self, Self::High)
    }
}

impl fmt::Display for SensitivityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

// ---------------------------------------------------------------------------
// FieldPath
// ---------------------------------------------------------------------------

/// A dot-separated path to a field inside a structured document.
///
/// Segments are matched greedily against the document (longest key first),
/// so `telemetry.machineId` addresses a literal dotted key when the document
/// has one, and `user.email` descends into `user` otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldPath {
    raw: String,
    segments: Vec<String>,
}

impl FieldPath {
    /// The path as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The dot-separated segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl FromStr for FieldPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("field path must not be empty".to_owned());
        }
        let segments: Vec<String> = s.split('.').map(str::to_owned).collect();
        if segments.iter().any(String::is_empty) {
            return Err(format!("field path `{s}` has an empty segment"));
        }
        Ok(Self {
            raw: s.to_owned(),
            segments,
        })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// ResourceSpec / ResourceDescriptor
// ---------------------------------------------------------------------------

/// Declarative description of a resource, as written in configuration.
///
/// `live` may be relative (joined onto the live root) or absolute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    pub name: String,
    pub live: PathBuf,
    pub snapshot: PathBuf,
    pub kind: ResourceKind,
    #[serde(default)]
    pub fields: Vec<FieldPath>,
    pub tier: SensitivityTier,
}

impl ResourceSpec {
    fn new(
        name: &str,
        rel: &str,
        kind: ResourceKind,
        fields: &[&str],
        tier: SensitivityTier,
    ) -> Self {
        Self {
            name: name.to_owned(),
            live: PathBuf::from(rel),
            snapshot: PathBuf::from(rel),
            kind,
            fields: fields
                .iter()
                .filter_map(|f| f.parse().ok())
                .collect(),
            tier,
        }
    }
}

/// A fully resolved resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResourceDescriptor {
    pub name: String,
    pub live_path: PathBuf,
    pub snapshot_relative_path: PathBuf,
    pub kind: ResourceKind,
    pub mergeable_fields: Vec<FieldPath>,
    pub sensitivity_tier: SensitivityTier,
}

impl ResourceDescriptor {
    /// Whether the selective merge engine applies to this resource.
    #[must_use]
    pub const fn is_document(&self) -> bool {
        matches!(self.kind, ResourceKind::StructuredDocument)
    }
}

/// The resources shipped with the tool: the application's session, identity,
/// machine-id, cookie, and preference files.
#[must_use]
pub fn default_specs() -> Vec<ResourceSpec> {
    use ResourceKind::{OpaqueBlob, StructuredDocument};
    use SensitivityTier::{High, Low, Medium};

    vec![
        ResourceSpec::new(
            "session",
            "sentry/session.json",
            StructuredDocument,
            &["did", "sid", "started", "timestamp", "status", "attrs"],
            High,
        ),
        ResourceSpec::new(
            "scope",
            "sentry/scope_v3.json",
            StructuredDocument,
            &["scope.user", "event.user", "event.contexts"],
            High,
        ),
        ResourceSpec::new(
            "machine-storage",
            "User/globalStorage/storage.json",
            StructuredDocument,
            &[
                "telemetry.machineId",
                "telemetry.devDeviceId",
                "telemetry.macMachineId",
                "telemetry.sqmId",
            ],
            High,
        ),
        ResourceSpec::new("state-db", "User/globalStorage/state.vscdb", OpaqueBlob, &[], High),
        ResourceSpec::new(
            "state-db-backup",
            "User/globalStorage/state.vscdb.backup",
            OpaqueBlob,
            &[],
            Medium,
        ),
        ResourceSpec::new("cookies", "Network/Cookies", OpaqueBlob, &[], Medium),
        ResourceSpec::new("trust-tokens", "Network/Trust Tokens", OpaqueBlob, &[], Medium),
        ResourceSpec::new(
            "network-state",
            "Network/Network Persistent State",
            OpaqueBlob,
            &[],
            Medium,
        ),
        ResourceSpec::new("settings", "User/settings.json", OpaqueBlob, &[], Low),
        ResourceSpec::new("keybindings", "User/keybindings.json", OpaqueBlob, &[], Low),
    ]
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Which resources an operation covers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceSelection {
    #[default]
    All,
    Only(Vec<String>),
}

/// Result of [`Registry::all_for`].
#[derive(Debug)]
pub struct Selected<'r> {
    /// Known resources, ordered by tier then declaration order.
    pub descriptors: Vec<&'r ResourceDescriptor>,
    /// Requested names the registry does not know, in request order.
    pub unknown: Vec<String>,
}

/// Read-only lookup table of resource descriptors.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    descriptors: Vec<ResourceDescriptor>,
}

impl Registry {
    /// Build a registry from specs, resolving relative live paths against
    /// `live_root`.
    ///
    /// # Errors
    ///
    /// Fails when names repeat, when fields are declared on an opaque blob,
    /// or when a snapshot path is absolute or escapes the snapshot root.
    pub fn from_specs(live_root: &Path, specs: &[ResourceSpec]) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut descriptors = Vec::with_capacity(specs.len());
        for spec in specs {
            if spec.name.trim().is_empty() {
                return Err(ConfigError::Invalid("resource name must not be empty".into()));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "resource `{}` is declared twice",
                    spec.name
                )));
            }
            if spec.kind == ResourceKind::OpaqueBlob && !spec.fields.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "resource `{}` is an opaque blob but declares mergeable fields",
                    spec.name
                )));
            }
            if !is_contained_relative(&spec.snapshot) {
                return Err(ConfigError::Invalid(format!(
                    "resource `{}` snapshot path `{}` must be relative and stay inside the snapshot",
                    spec.name,
                    spec.snapshot.display()
                )));
            }
            descriptors.push(ResourceDescriptor {
                name: spec.name.clone(),
                live_path: live_root.join(&spec.live),
                snapshot_relative_path: spec.snapshot.clone(),
                kind: spec.kind,
                mergeable_fields: spec.fields.clone(),
                sensitivity_tier: spec.tier,
            });
        }
        Ok(Self { descriptors })
    }

    /// Look up a resource by name.
    ///
    /// # Errors
    ///
    /// Returns [`ReplaceError::UnknownResource`] when the name is not registered.
    pub fn resolve(&self, name: &str) -> Result<&ResourceDescriptor, ReplaceError> {
        self.descriptors
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ReplaceError::UnknownResource {
                name: name.to_owned(),
            })
    }

    /// Resources covered by `selection`, lowest tier first, declaration order
    /// within a tier.
    #[must_use]
    pub fn all_for(&self, selection: &ResourceSelection) -> Selected<'_> {
        let (mut descriptors, unknown): (Vec<&ResourceDescriptor>, Vec<String>) = match selection {
            ResourceSelection::All => (self.descriptors.iter().collect(), Vec::new()),
            ResourceSelection::Only(names) => {
                let mut unknown = Vec::new();
                let mut seen = HashSet::new();
                for name in names {
                    if !seen.insert(name.as_str()) {
                        continue;
                    }
                    if self.resolve(name).is_err() {
                        unknown.push(name.clone());
                    }
                }
                let picked = self
                    .descriptors
                    .iter()
                    .filter(|d| seen.contains(d.name.as_str()))
                    .collect();
                (picked, unknown)
            }
        };
        // Stable sort keeps declaration order within a tier.
        descriptors.sort_by_key(|d| d.sensitivity_tier);
        Selected {
            descriptors,
            unknown,
        }
    }

    /// All descriptors in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.descriptors.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

fn is_contained_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
