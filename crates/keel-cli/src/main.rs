//! keel - run build plans against the local machine
//!
//! The `keel` command drives the step engine without a cluster: workers are
//! the local process runtime, the pipeline store is in memory and locks are
//! in-process.
//!
//! ## Commands
//!
//! - `run`: Execute a plan and copy its artifacts to a directory
//! - `lock-name`: Print the fetch lock name of a resource signature
//! - `config`: Print the effective engine configuration

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use keel_core::{
    init_tracing, LogFormat, Params, Plan, PlanId, Source, Space, StaticVariables,
    StaticVariablesFactory, Version,
};
use keel_exec::{
    BuildStepMetadata, DelegateFactory, EngineConfig, ExitStatus, GetDelegate, Origin,
    ResourceFetcher, RunState, StepFactory, StepMetadata, VersionInfo,
};
use keel_state::fakes::{MemoryBuild, MemoryResourceCacheFactory};
use keel_state::{Build, ContainerMetadata, InProcessLockFactory};
use keel_worker::fakes::MemoryWorkerProvider;
use keel_worker::{DirectoryDestination, LocalWorker, PlacementStrategyKind, Pool};

#[derive(Parser)]
#[command(name = "keel")]
#[command(author = "Keel Maintainers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run keel build plans locally", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Engine settings. Flags override the config file.
#[derive(Args, Debug, Default)]
struct EngineArgs {
    /// Engine configuration file (JSON)
    #[arg(long, global = true, env = "KEEL_CONFIG")]
    config: Option<PathBuf>,

    /// Milliseconds between attempts to take a busy fetch lock
    #[arg(long, global = true, env = "KEEL_LOCK_POLL_INTERVAL_MS")]
    lock_poll_interval_ms: Option<u64>,

    /// Working directory recorded for get containers
    #[arg(long, global = true, env = "KEEL_GET_WORKING_DIRECTORY")]
    get_working_directory: Option<String>,

    /// fewest-build-containers or most-available-volume-space
    #[arg(long, global = true, env = "KEEL_PLACEMENT_STRATEGY")]
    placement_strategy: Option<PlacementStrategyKind>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a build plan on the local worker
    Run {
        /// Plan file (JSON)
        plan: PathBuf,

        /// Directory of resource types, each holding an executable `in`
        #[arg(long, env = "KEEL_TYPES_DIR")]
        types_dir: PathBuf,

        /// Directory for volumes (default: a fresh directory under the
        /// system temp dir)
        #[arg(long, env = "KEEL_WORK_DIR")]
        work_dir: Option<PathBuf>,

        /// Copy every artifact here, one subdirectory per artifact
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Credential variable, `name=value`; JSON values are parsed
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,

        /// File of credential variables (JSON object)
        #[arg(long)]
        vars_file: Option<PathBuf>,

        #[arg(long, default_value = "1")]
        build_id: i64,

        #[arg(long, default_value = "1")]
        team_id: i32,

        #[arg(long, default_value = "main")]
        team_name: String,

        #[arg(long, default_value = "local")]
        pipeline: String,
    },

    /// Print the fetch lock name of a resource signature
    LockName {
        /// Resource type
        #[arg(long = "type")]
        resource_type: String,

        #[arg(long, default_value = "")]
        space: String,

        /// Version (JSON object)
        #[arg(long, default_value = "{}")]
        version: String,

        /// Source (JSON object)
        #[arg(long, default_value = "{}")]
        source: String,

        /// Params (JSON object)
        #[arg(long, default_value = "{}")]
        params: String,

        /// Worker the fetch runs on
        #[arg(long)]
        worker: String,
    },

    /// Print the effective engine configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let format = if cli.json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_tracing(format, level);

    let config = engine_config(&cli.engine)?;

    match cli.command {
        Commands::Run {
            plan,
            types_dir,
            work_dir,
            output,
            vars,
            vars_file,
            build_id,
            team_id,
            team_name,
            pipeline,
        } => {
            let variables = load_variables(vars, vars_file.as_deref())?;
            let build = BuildArgs {
                build_id,
                team_id,
                team_name,
                pipeline,
            };
            cmd_run(
                config,
                &plan,
                &types_dir,
                work_dir.as_deref(),
                output.as_deref(),
                variables,
                build,
            )
            .await
        }
        Commands::LockName {
            resource_type,
            space,
            version,
            source,
            params,
            worker,
        } => cmd_lock_name(&resource_type, &space, &version, &source, &params, &worker),
        Commands::Config => cmd_config(&config),
    }
}

/// Config file, then flags and environment.
fn engine_config(args: &EngineArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {:?}", path))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse config file {:?}", path))?
        }
        None => EngineConfig::default(),
    };

    if let Some(ms) = args.lock_poll_interval_ms {
        config = config.with_lock_poll_interval(Duration::from_millis(ms));
    }
    if let Some(dir) = &args.get_working_directory {
        config = config.with_get_working_directory(dir.clone());
    }
    if let Some(strategy) = args.placement_strategy {
        config = config.with_placement_strategy(strategy);
    }
    Ok(config)
}

fn parse_var(raw: &str) -> std::result::Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    if name.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn load_variables(vars: Vec<(String, Value)>, file: Option<&Path>) -> Result<StaticVariables> {
    let mut all: BTreeMap<String, Value> = BTreeMap::new();
    if let Some(path) = file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vars file {:?}", path))?;
        let from_file: BTreeMap<String, Value> = serde_json::from_str(&raw)
            .with_context(|| format!("Vars file {:?} is not a JSON object", path))?;
        all.extend(from_file);
    }
    all.extend(vars);
    Ok(all.into_iter().collect())
}

struct BuildArgs {
    build_id: i64,
    team_id: i32,
    team_name: String,
    pipeline: String,
}

/// Execute a plan on the local worker
async fn cmd_run(
    config: EngineConfig,
    plan_path: &Path,
    types_dir: &Path,
    work_dir: Option<&Path>,
    output: Option<&Path>,
    variables: StaticVariables,
    args: BuildArgs,
) -> Result<()> {
    let raw = std::fs::read_to_string(plan_path)
        .with_context(|| format!("Failed to read plan {:?}", plan_path))?;
    let plan: Plan = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse plan {:?}", plan_path))?;

    let work_dir = match work_dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::temp_dir().join(format!("keel-build-{}", args.build_id)),
    };
    let worker = LocalWorker::new("local", &work_dir, types_dir)
        .context("Failed to start local worker")?
        .with_team(args.team_id);
    info!(work_dir = %work_dir.display(), "local worker ready");

    let provider = MemoryWorkerProvider::new().with_worker(Arc::new(worker));
    let fetcher = ResourceFetcher::new(
        Arc::new(InProcessLockFactory::new()),
        config.lock_poll_interval(),
    );
    let factory = StepFactory::new(
        Arc::new(Pool::new(Arc::new(provider))),
        Arc::new(fetcher),
        Arc::new(MemoryResourceCacheFactory::new()),
        Arc::new(StaticVariablesFactory::new(variables)),
        config,
    );

    let build: Arc<dyn Build> = Arc::new(
        MemoryBuild::new(args.build_id, args.team_id, args.pipeline.clone())
            .with_team_name(args.team_name.clone()),
    );
    let step_metadata: Arc<dyn StepMetadata> = Arc::new(BuildStepMetadata {
        build_id: args.build_id,
        build_name: args.build_id.to_string(),
        team_name: args.team_name,
        pipeline_name: args.pipeline.clone(),
        ..Default::default()
    });
    let container_metadata = ContainerMetadata {
        build_id: args.build_id,
        build_name: args.build_id.to_string(),
        pipeline_name: args.pipeline,
        ..Default::default()
    };

    let mut step = factory.step_for(
        &plan,
        &build,
        &step_metadata,
        &container_metadata,
        &ConsoleDelegate::factory(),
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling build");
            interrupt.cancel();
        }
    });

    let state = RunState::new();
    step.run(&cancel, &state)
        .await
        .context("Build errored")?;

    if let Some(output) = output {
        state
            .artifacts()
            .stream_to(&cancel, &DirectoryDestination::new(output))
            .await
            .context("Failed to copy artifacts")?;
        println!("Artifacts written to {:?}", output);
    }

    if !step.succeeded() {
        bail!("build failed");
    }
    println!("Build succeeded");
    Ok(())
}

/// Print the fetch lock name of a resource signature
fn cmd_lock_name(
    resource_type: &str,
    space: &str,
    version: &str,
    source: &str,
    params: &str,
    worker: &str,
) -> Result<()> {
    let version: Version = serde_json::from_str(version).context("Invalid --version JSON")?;
    let source: Source = serde_json::from_str(source).context("Invalid --source JSON")?;
    let params: Params = serde_json::from_str(params).context("Invalid --params JSON")?;

    let name = keel_exec::lock_name(
        resource_type,
        &Space::new(space),
        &version,
        &source,
        &params,
        worker,
    )?;
    println!("{name}");
    Ok(())
}

/// Print the effective engine configuration
fn cmd_config(config: &EngineConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

/// Prints script output and step outcomes to the terminal.
struct ConsoleDelegate {
    name: String,
}

impl ConsoleDelegate {
    fn factory() -> impl DelegateFactory {
        |_: &PlanId, name: &str| -> Arc<dyn GetDelegate> {
            Arc::new(ConsoleDelegate {
                name: name.to_string(),
            })
        }
    }
}

impl GetDelegate for ConsoleDelegate {
    fn initializing(&self) {
        eprintln!("get: {}", self.name);
    }

    fn starting(&self) {}

    fn finished(&self, status: ExitStatus, info: &VersionInfo) {
        if status.success() {
            let version = serde_json::to_string(&info.version).unwrap_or_default();
            eprintln!("{}: fetched {version}", self.name);
        } else {
            eprintln!("{}: failed with exit status {status}", self.name);
        }
    }

    fn output(&self, _origin: &Origin, chunk: &str) {
        eprint!("{chunk}");
        if !chunk.ends_with('\n') {
            eprintln!();
        }
    }
}
