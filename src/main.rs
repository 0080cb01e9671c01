use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};

use hotswap::config::HotswapConfig;
use hotswap::fsops::StdFs;
use hotswap::mediator::{LockMediator as _, ProcMediator};
use hotswap::orchestrator::{
    MergeMode, OperationKind, OperationReport, OperationRequest, Orchestrator, Overall,
};
use hotswap::privilege::ProcessPrivilege;
use hotswap::registry::ResourceSelection;
use hotswap::snapshot::DirectoryProvider;
use hotswap::telemetry;

/// Put saved application state back onto a live installation
///
/// Copies resources from a snapshot directory over the live files, escalating
/// from a plain write to rename-swap, suspending lock holders, terminating
/// them (where the resource tier allows), and privileged writes. Every
/// mutated file is backed up beside itself first as `<name>.backup_<millis>`.
///
/// The result is printed as a JSON report on stdout. Save it to undo the
/// operation later with `hotswap rollback --report FILE`.
///
/// OPERATIONS:
///
///   restore          all resources, whole-file replacement
///   hot-switch       like restore, never terminates the application
///   identity-switch  session/scope/machine ids only, field merge
///   activation       identity-switch plus refreshed session timestamps
#[derive(Parser)]
#[command(name = "hotswap")]
#[command(version, about)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file [default: <config dir>/hotswap/config.toml]
    #[arg(long, global = true, env = "HOTSWAP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a snapshot to the live installation
    Apply {
        /// Snapshot directory
        #[arg(long)]
        snapshot: PathBuf,

        /// Which operation to run
        #[arg(long, value_enum, default_value_t = OperationKind::Restore)]
        operation: OperationKind,

        /// Limit to these resources (repeatable) [default: the operation's set]
        #[arg(long = "resource", value_name = "NAME")]
        resources: Vec<String>,

        /// How structured documents are applied [default: the operation's mode]
        #[arg(long, value_enum)]
        merge: Option<MergeMode>,
    },

    /// Undo an earlier operation from its saved report
    Rollback {
        /// JSON report printed by `apply`
        #[arg(long)]
        report: PathBuf,
    },

    /// List processes holding a file open
    Holders {
        /// File to inspect
        path: PathBuf,
    },

    /// List the configured resources
    Resources,
}

fn main() -> Result<()> {
    let _telemetry = telemetry::init();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Apply {
            snapshot,
            operation,
            resources,
            merge,
        } => apply(&config, &snapshot, operation, resources, merge),
        Commands::Rollback { report } => rollback(&config, &report),
        Commands::Holders { path } => {
            let mediator = ProcMediator::with_name_filter(None);
            print_json(&mediator.detect_holders(&path))
        }
        Commands::Resources => {
            let registry = config.registry()?;
            let all: Vec<_> = registry.iter().collect();
            print_json(&all)
        }
    }
}

fn load_config(explicit: Option<&Path>) -> Result<HotswapConfig> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => match HotswapConfig::default_path() {
            Some(p) => p,
            None => return Ok(HotswapConfig::default()),
        },
    };
    HotswapConfig::load(&path).with_context(|| format!("loading {}", path.display()))
}

fn apply(
    config: &HotswapConfig,
    snapshot: &Path,
    operation: OperationKind,
    resources: Vec<String>,
    merge: Option<MergeMode>,
) -> Result<()> {
    let Some(id) = snapshot.file_name().and_then(|n| n.to_str()) else {
        bail!("snapshot path {} has no directory name", snapshot.display());
    };
    let provider = DirectoryProvider::new(
        snapshot
            .parent()
            .map_or_else(PathBuf::new, Path::to_path_buf),
    );

    let mut request = OperationRequest::new(id, operation);
    if !resources.is_empty() {
        request = request.resources(ResourceSelection::Only(resources));
    }
    if let Some(mode) = merge {
        request = request.merge_mode(mode);
    }

    let registry = config.registry()?;
    let mediator = ProcMediator::with_name_filter(config.mediator.holder_name_filter.as_deref());
    let privilege = ProcessPrivilege::detect();
    let orchestrator = Orchestrator::new(&registry, &StdFs, &mediator, &privilege)
        .with_exit_wait(config.exit_wait());

    let report = orchestrator
        .run(&provider, &request)
        .with_context(|| format!("opening snapshot {}", snapshot.display()))?;
    finish(&report)
}

fn rollback(config: &HotswapConfig, report_path: &Path) -> Result<()> {
    let raw = std::fs::read(report_path)
        .with_context(|| format!("reading report {}", report_path.display()))?;
    let prior: OperationReport = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing report {}", report_path.display()))?;

    let registry = config.registry()?;
    let mediator = ProcMediator::with_name_filter(config.mediator.holder_name_filter.as_deref());
    let privilege = ProcessPrivilege::detect();
    let orchestrator = Orchestrator::new(&registry, &StdFs, &mediator, &privilege)
        .with_exit_wait(config.exit_wait());

    finish(&orchestrator.rollback(&prior))
}

fn finish(report: &OperationReport) -> Result<()> {
    print_json(report)?;
    if report.overall == Overall::Failed {
        bail!(
            "no resource could be applied ({} failed)",
            report.summary.failed
        );
    }
    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{json}");
    Ok(())
}
