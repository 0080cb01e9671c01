//! Tool configuration (`config.toml`).
//!
//! Defines where the live installation is, how long the ladder waits on lock
//! holders, and which resources exist beyond (or instead of) the built-in
//! registry.
//!
//! ```toml
//! [live]
//! root = "/home/me/.config/Cursor"
//!
//! [ladder]
//! graceful_timeout_ms = 3000
//! exit_poll_interval_ms = 100
//! kill_wait_ms = 2000
//!
//! [mediator]
//! holder_name_filter = "cursor"
//!
//! [[resource]]
//! name = "cookies"
//! live = "Network/Cookies"
//! snapshot = "Network/Cookies"
//! kind = "opaque-blob"
//! tier = "medium"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::mediator::ExitWait;
use crate::registry::{self, Registry, ResourceSpec};

/// Directory name of the application under the platform config dir.
const APP_DIR: &str = "Cursor";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration.
///
/// Missing fields use defaults. Missing file → all defaults (no error).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HotswapConfig {
    #[serde(default)]
    pub live: LiveConfig,

    #[serde(default)]
    pub ladder: LadderConfig,

    #[serde(default)]
    pub mediator: MediatorConfig,

    /// Resource definitions. An entry whose name matches a built-in resource
    /// replaces it; other entries are appended.
    #[serde(default)]
    pub resource: Vec<ResourceSpec>,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Location of the live installation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LiveConfig {
    /// Root that relative resource paths are joined onto.
    ///
    /// Defaults to `<platform config dir>/Cursor`.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

/// Bounds on how long mediated rungs wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LadderConfig {
    /// How long a holder asked to exit is given before it is killed.
    #[serde(default = "default_graceful_timeout_ms")]
    pub graceful_timeout_ms: u64,

    /// Polling interval while waiting for a holder to exit.
    #[serde(default = "default_exit_poll_interval_ms")]
    pub exit_poll_interval_ms: u64,

    /// How long a killed holder is given to disappear.
    #[serde(default = "default_kill_wait_ms")]
    pub kill_wait_ms: u64,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_ms: default_graceful_timeout_ms(),
            exit_poll_interval_ms: default_exit_poll_interval_ms(),
            kill_wait_ms: default_kill_wait_ms(),
        }
    }
}

const fn default_graceful_timeout_ms() -> u64 {
    3000
}

const fn default_exit_poll_interval_ms() -> u64 {
    100
}

const fn default_kill_wait_ms() -> u64 {
    2000
}

/// Lock mediator settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MediatorConfig {
    /// Only treat processes whose name contains this (case-insensitive) as
    /// lock holders. Unset: any process.
    #[serde(default)]
    pub holder_name_filter: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl HotswapConfig {
    /// Default location: `<platform config dir>/hotswap/config.toml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("hotswap").join("config.toml"))
    }

    /// Load configuration from `path`.
    ///
    /// - File missing → returns defaults (no error).
    /// - File present but invalid → returns a [`ConfigError`] with line-level detail.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found), parse errors,
    /// or failed validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_owned(),
                    source,
                });
            }
        };
        let cfg = Self::parse_at(&contents, path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML or unknown fields.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        Self::parse_at(toml_str, Path::new("<inline>"))
    }

    fn parse_at(toml_str: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| {
            let mut detail = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                detail = format!("line {line}: {detail}");
            }
            ConfigError::Parse {
                path: path.to_owned(),
                detail,
            }
        })
    }

    /// Check cross-field consistency.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] for zero timeouts, repeated resource
    /// names, or resources the registry would reject.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let l = &self.ladder;
        for (name, value) in [
            ("graceful_timeout_ms", l.graceful_timeout_ms),
            ("exit_poll_interval_ms", l.exit_poll_interval_ms),
            ("kill_wait_ms", l.kill_wait_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("ladder.{name} must be greater than 0")));
            }
        }
        for (i, spec) in self.resource.iter().enumerate() {
            if self.resource[..i].iter().any(|s| s.name == spec.name) {
                return Err(ConfigError::Invalid(format!(
                    "[[resource]] `{}` appears more than once",
                    spec.name
                )));
            }
        }
        // Paths are only joined, never touched, so any root works here.
        Registry::from_specs(Path::new(""), &self.resource_specs()).map(|_| ())
    }

    /// Live root: configured, or the platform default.
    ///
    /// # Errors
    /// Fails when no root is configured and the platform has no config dir.
    pub fn live_root(&self) -> Result<PathBuf, ConfigError> {
        if let Some(root) = &self.live.root {
            return Ok(root.clone());
        }
        dirs::config_dir()
            .map(|d| d.join(APP_DIR))
            .ok_or_else(|| {
                ConfigError::Invalid("no live.root configured and no platform config dir".into())
            })
    }

    /// Built-in resources with configured entries applied.
    #[must_use]
    pub fn resource_specs(&self) -> Vec<ResourceSpec> {
        let mut specs = registry::default_specs();
        for spec in &self.resource {
            match specs.iter_mut().find(|s| s.name == spec.name) {
                Some(existing) => *existing = spec.clone(),
                None => specs.push(spec.clone()),
            }
        }
        specs
    }

    /// Build the resource registry.
    ///
    /// # Errors
    /// See [`HotswapConfig::live_root`] and [`Registry::from_specs`].
    pub fn registry(&self) -> Result<Registry, ConfigError> {
        Registry::from_specs(&self.live_root()?, &self.resource_specs())
    }

    /// Wait bounds for the terminate-and-write rung.
    #[must_use]
    pub const fn exit_wait(&self) -> ExitWait {
        ExitWait {
            graceful_timeout: Duration::from_millis(self.ladder.graceful_timeout_ms),
            kill_wait: Duration::from_millis(self.ladder.kill_wait_ms),
            poll_interval: Duration::from_millis(self.ladder.exit_poll_interval_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ResourceKind, SensitivityTier};

    #[test]
    fn defaults_all_fields() {
        let cfg = HotswapConfig::default();
        assert_eq!(cfg.live.root, None);
        assert_eq!(cfg.ladder.graceful_timeout_ms, 3000);
        assert_eq!(cfg.ladder.exit_poll_interval_ms, 100);
        assert_eq!(cfg.ladder.kill_wait_ms, 2000);
        assert_eq!(cfg.mediator.holder_name_filter, None);
        assert!(cfg.resource.is_empty());
        assert_eq!(cfg.exit_wait(), ExitWait::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parse_empty_string() {
        let cfg = HotswapConfig::parse("").unwrap();
        assert_eq!(cfg, HotswapConfig::default());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[live]
root = "/srv/cursor"

[ladder]
graceful_timeout_ms = 500
exit_poll_interval_ms = 10
kill_wait_ms = 250

[mediator]
holder_name_filter = "cursor"

[[resource]]
name = "cookies"
live = "/elsewhere/Cookies"
snapshot = "Network/Cookies"
kind = "opaque-blob"
tier = "high"

[[resource]]
name = "mcp"
live = "User/mcp.json"
snapshot = "User/mcp.json"
kind = "structured-document"
fields = ["servers", "telemetry.machineId"]
tier = "low"
"#;
        let cfg = HotswapConfig::parse(toml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.live_root().unwrap(), PathBuf::from("/srv/cursor"));
        assert_eq!(cfg.exit_wait().graceful_timeout, Duration::from_millis(500));
        assert_eq!(cfg.mediator.holder_name_filter.as_deref(), Some("cursor"));

        let reg = cfg.registry().unwrap();
        assert_eq!(reg.len(), 11);
        let cookies = reg.resolve("cookies").unwrap();
        assert_eq!(cookies.live_path, PathBuf::from("/elsewhere/Cookies"));
        assert_eq!(cookies.sensitivity_tier, SensitivityTier::High);
        let mcp = reg.resolve("mcp").unwrap();
        assert_eq!(mcp.kind, ResourceKind::StructuredDocument);
        assert_eq!(mcp.live_path, PathBuf::from("/srv/cursor/User/mcp.json"));
        assert_eq!(mcp.mergeable_fields.len(), 2);
    }

    #[test]
    fn parse_partial_config_uses_defaults() {
        let cfg = HotswapConfig::parse("[ladder]\nkill_wait_ms = 5\n").unwrap();
        assert_eq!(cfg.ladder.kill_wait_ms, 5);
        assert_eq!(cfg.ladder.graceful_timeout_ms, 3000);
    }

    #[test]
    fn parse_rejects_unknown_top_level_field() {
        let err = HotswapConfig::parse("[surprise]\nx = 1\n").unwrap_err();
        assert!(err.to_string().contains("surprise"), "{err}");
    }

    #[test]
    fn parse_rejects_unknown_nested_field() {
        let err = HotswapConfig::parse("[ladder]\nretries = 3\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("line 2"), "{msg}");
        assert!(msg.contains("retries"), "{msg}");
    }

    #[test]
    fn parse_rejects_invalid_tier() {
        let toml = r#"
[[resource]]
name = "x"
live = "x"
snapshot = "x"
kind = "opaque-blob"
tier = "extreme"
"#;
        assert!(HotswapConfig::parse(toml).is_err());
    }

    #[test]
    fn validate_rejects_zero_timeouts() {
        let cfg = HotswapConfig::parse("[ladder]\ngraceful_timeout_ms = 0\n").unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("graceful_timeout_ms"), "{err}");
    }

    #[test]
    fn validate_rejects_fields_on_blob() {
        let toml = r#"
[[resource]]
name = "cookies"
live = "Network/Cookies"
snapshot = "Network/Cookies"
kind = "opaque-blob"
fields = ["a"]
tier = "medium"
"#;
        let cfg = HotswapConfig::parse(toml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_repeated_resource_entries() {
        let entry = r#"
[[resource]]
name = "extra"
live = "x"
snapshot = "x"
kind = "opaque-blob"
tier = "low"
"#;
        let cfg = HotswapConfig::parse(&format!("{entry}{entry}")).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"), "{err}");
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = HotswapConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, HotswapConfig::default());
    }

    #[test]
    fn load_reports_path_on_parse_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[live\n").unwrap();
        let err = HotswapConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"), "{err}");
    }
}
