use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use conflux::config::Config;
use conflux::core::{TaskId, TaskOutput};
use conflux::orchestration::{
    Analysis, AnalysisRequest, ConflictDetector, ConflictKind, ConflictReport, DependencyAnalyzer,
    DetectorOptions, MergeCoordinator, MergeRequest, MergeStrategy, ResolutionPolicy,
};
use conflux::{cxlog, cxlog_error, Result};

/// Exit code for a failed merge or critical conflicts.
const EXIT_CONFLICT: i32 = 4;

/// Conflux - dependency analysis, conflict detection and merge coordination
/// for decomposed task batches
#[derive(Parser, Debug)]
#[command(name = "conflux")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONFLUX_DEBUG=1     Enable debug logging (alternative to --debug)\n    CONFLUX_LOG=LEVEL   Log level: error, warn, info, debug or trace\n\nEXIT CODES:\n    0  success\n    2  input file missing or invalid JSON\n    3  validation error or dependency cycle\n    4  critical conflicts or failed merge"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conflux/conflux.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Write JSON output to this file instead of stdout
    #[arg(short = 'o', long, global = true)]
    pub output: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Compute execution order, parallel levels and critical path
    Analyze {
        /// JSON file with tasks, dependencies and durations
        input: PathBuf,

        /// Separate JSON file with the dependency map (and optional durations)
        #[arg(long)]
        dependencies: Option<PathBuf>,
    },

    /// Detect conflicts between completed task outputs
    Detect {
        /// JSON file with task outputs
        outputs: PathBuf,

        /// Detect one conflict type only
        #[arg(long = "type", value_name = "TYPE", value_parser = parse_kind)]
        kind: Option<ConflictKind>,

        /// Recommend region-level coordination for shared files
        #[arg(long)]
        fine_grained: bool,
    },

    /// Merge task outputs into the staging area
    Merge {
        /// JSON file with task outputs (or a full merge request)
        outputs: PathBuf,

        /// JSON file with a previously detected conflict report
        #[arg(long)]
        conflicts: Option<PathBuf>,

        /// Merge strategy: topological or sequential
        #[arg(long)]
        strategy: Option<MergeStrategy>,

        /// Conflict resolution policy: serialize, skip or manual
        #[arg(long)]
        resolve: Option<ResolutionPolicy>,

        /// Verification command run in the staging area
        #[arg(long)]
        verify: Option<String>,

        /// Verification timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Keep staged changes when verification fails
        #[arg(long)]
        no_rollback: bool,

        /// Plan the merge without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Staging directory (default: config or current directory)
        #[arg(long)]
        staging: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Write the defaults to ~/.conflux/conflux.toml if it does not exist
        #[arg(long)]
        init: bool,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Analyze { .. } => "analyze",
            Command::Detect { .. } => "detect",
            Command::Merge { .. } => "merge",
            Command::Config { .. } => "config",
        }
    }
}

fn parse_kind(s: &str) -> std::result::Result<ConflictKind, String> {
    match s {
        "file" => Ok(ConflictKind::File),
        "semantic" => Ok(ConflictKind::Semantic),
        "dependency" => Ok(ConflictKind::Dependency),
        "schema" => Ok(ConflictKind::Schema),
        other => Err(format!(
            "unknown conflict type '{}' (expected file, semantic, dependency or schema)",
            other
        )),
    }
}

fn main() {
    let cli = Cli::parse();

    conflux::log::init(cli.command.name(), cli.debug);
    if conflux::log::is_debug() {
        cxlog!("Conflux starting (debug mode enabled)");
    }

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            cxlog_error!("{}", e);
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let output = cli.output.as_deref();
    match cli.command {
        Command::Analyze {
            input,
            dependencies,
        } => run_analyze(&input, dependencies.as_deref(), output),
        Command::Detect {
            outputs,
            kind,
            fine_grained,
        } => run_detect(&outputs, kind, fine_grained, output),
        Command::Merge {
            outputs,
            conflicts,
            strategy,
            resolve,
            verify,
            timeout,
            no_rollback,
            dry_run,
            staging,
        } => {
            let flags = MergeFlags {
                conflicts,
                strategy,
                resolve,
                verify,
                timeout,
                no_rollback,
                dry_run,
                staging,
            };
            run_merge(&outputs, flags, output)
        }
        Command::Config { init } => run_config(init),
    }
}

fn run_config(init: bool) -> Result<i32> {
    let path = Config::config_path()?;
    if init && !path.exists() {
        Config::default().save()?;
        eprintln!("Wrote default configuration to {}", path.display());
    }
    print!("{}", Config::load()?.to_toml()?);
    Ok(0)
}

/// Dependency file: either `{dependencies, durations?}` or the bare map.
#[derive(Deserialize)]
#[serde(untagged)]
enum DependencyFile {
    Wrapped {
        dependencies: BTreeMap<TaskId, Vec<TaskId>>,
        #[serde(default)]
        durations: BTreeMap<TaskId, f64>,
    },
    Bare(BTreeMap<TaskId, Vec<TaskId>>),
}

fn run_analyze(input: &Path, dependencies: Option<&Path>, output: Option<&Path>) -> Result<i32> {
    cxlog!("analyze input={}", input.display());
    let mut request: AnalysisRequest = read_json(input)?;

    if let Some(path) = dependencies {
        match read_json::<DependencyFile>(path)? {
            DependencyFile::Wrapped {
                dependencies,
                durations,
            } => {
                request.dependencies = dependencies;
                request.durations.extend(durations);
            }
            DependencyFile::Bare(dependencies) => request.dependencies = dependencies,
        }
    }

    let analysis = DependencyAnalyzer::new().analyze(&request)?;
    match &analysis {
        Analysis::Report(report) => {
            emit(report, output)?;
            Ok(0)
        }
        Analysis::Cycle { error } => {
            eprintln!("{}", serde_json::to_string_pretty(&analysis)?);
            Ok(i32::from(error.code))
        }
    }
}

fn run_detect(
    path: &Path,
    kind: Option<ConflictKind>,
    fine_grained: bool,
    output: Option<&Path>,
) -> Result<i32> {
    let config = Config::load()?;
    let outputs = load_outputs(path)?;
    let detector = ConflictDetector::with_options(DetectorOptions {
        only: kind,
        fine_grained_patching: fine_grained || config.fine_grained_patching,
    });

    let report = detector.detect(&outputs)?;
    emit(&report, output)?;
    Ok(if report.has_critical() { EXIT_CONFLICT } else { 0 })
}

#[derive(Debug, Default)]
struct MergeFlags {
    conflicts: Option<PathBuf>,
    strategy: Option<MergeStrategy>,
    resolve: Option<ResolutionPolicy>,
    verify: Option<String>,
    timeout: Option<u64>,
    no_rollback: bool,
    dry_run: bool,
    staging: Option<PathBuf>,
}

#[derive(Serialize)]
struct MergeOutput<'a> {
    merge_result: &'a conflux::orchestration::MergeResult,
}

fn run_merge(path: &Path, flags: MergeFlags, output: Option<&Path>) -> Result<i32> {
    let mut config = Config::load()?;
    if let Some(dir) = &flags.staging {
        config.staging_dir = Some(dir.to_string_lossy().into_owned());
    }

    let mut request = load_merge_request(path, &config)?;
    if let Some(conflicts) = &flags.conflicts {
        let report: ConflictReport = read_json(conflicts)?;
        request.conflicts = Some(ConflictReport::new(report.conflicts));
    }
    if let Some(strategy) = flags.strategy {
        request.strategy = strategy;
    }
    if let Some(resolve) = flags.resolve {
        request.resolution = resolve;
    }
    if flags.verify.is_some() {
        request.verify = flags.verify;
    }
    if flags.timeout.is_some() {
        request.verify_timeout_secs = flags.timeout;
    }
    if flags.no_rollback {
        request.rollback_on_failure = false;
    }
    request.dry_run |= flags.dry_run;

    let mut coordinator = MergeCoordinator::from_config(&config)?;
    cxlog!(
        "merge outputs={} staging={}",
        path.display(),
        coordinator.staging().root().display()
    );

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async { coordinator.merge(&request).await })?;

    emit(
        &MergeOutput {
            merge_result: &result,
        },
        output,
    )?;
    Ok(if result.is_failed() { EXIT_CONFLICT } else { 0 })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Task outputs, accepted wrapped as `{"outputs": {...}}` or bare.
fn load_outputs(path: &Path) -> Result<BTreeMap<TaskId, TaskOutput>> {
    let mut value: serde_json::Value = read_json(path)?;
    if let Some(outputs) = value.get_mut("outputs") {
        return Ok(serde_json::from_value(outputs.take())?);
    }
    Ok(serde_json::from_value(value)?)
}

/// A full merge request, or bare outputs. Config supplies missing defaults.
fn load_merge_request(path: &Path, config: &Config) -> Result<MergeRequest> {
    let mut value: serde_json::Value = read_json(path)?;
    if value.get("outputs").is_none() {
        value = serde_json::json!({ "outputs": value });
    }
    if let Some(obj) = value.as_object_mut() {
        obj.entry("strategy")
            .or_insert(serde_json::to_value(config.default_strategy)?);
        obj.entry("resolution")
            .or_insert(serde_json::to_value(config.default_resolution)?);
        obj.entry("rollback_on_failure")
            .or_insert(serde_json::Value::Bool(config.rollback_on_failure));
    }
    Ok(serde_json::from_value(value)?)
}

fn emit<T: Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => fs::write(path, json + "\n")?,
        None => println!("{}", json),
    }
    Ok(())
}
