// Entry point for the batch change execution engine. Parses CLI args,
// assembles the Coordinator's collaborators, and runs one batch to
// completion — grounded on `runner-worker/src/main.rs`'s shape (a flat
// `clap::Parser` args struct, a hand-built multi-thread Tokio runtime,
// `tracing_subscriber::fmt` for diagnostics, translate the result to a
// process exit code).

mod archive_registry;
mod ui;

use anyhow::{Context, Result};
use archive_registry::FilesystemArchiveRegistry;
use batchexec_common::config::{EngineConfig, FailurePolicy};
use batchexec_common::constants::CURRENT_PLATFORM;
use batchexec_common::model::{ImportChangeset, Task};
use batchexec_coordinator::Coordinator;
use batchexec_engine::{DefaultWorkspaceCreator, DockerClient, StepRunner, TaskExecutor};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use ui::ConsoleUi;

/// Command-line arguments for the engine binary.
#[derive(Parser, Debug)]
#[command(name = "batchexecd", about = "Batch change execution engine")]
struct Args {
    /// Path to a JSON file holding the resolved task list, or `-` to read
    /// it from stdin. Batch-spec parsing and repository discovery happen
    /// upstream of this binary (spec.md §1); each entry is a fully-formed
    /// `Task`.
    #[arg(long, default_value = "-")]
    tasks: PathBuf,

    /// Path to a JSON file holding `importChangesets` entries, if any.
    #[arg(long)]
    import_changesets: Option<PathBuf>,

    /// Directory archives are staged under as `<repo>/<commit>.tar.gz`.
    #[arg(long, default_value = "./.batchexec/archives")]
    archive_dir: PathBuf,

    #[arg(long, default_value = "./.batchexec/cache")]
    cache_dir: PathBuf,

    #[arg(long, default_value = "./.batchexec/tmp")]
    temp_dir: PathBuf,

    /// Container working directory every workspace variant mounts to.
    #[arg(long, default_value = "/work")]
    container_dir: String,

    /// Maximum number of tasks executing concurrently. Defaults to the
    /// host's CPU count (spec.md §5).
    #[arg(long)]
    parallelism: Option<usize>,

    /// Cancel all still-pending tasks as soon as one fails.
    #[arg(long)]
    fail_fast: bool,

    /// Delete every cache entry before starting the run.
    #[arg(long)]
    clear_cache: bool,

    /// Path to the `docker` binary.
    #[arg(long, default_value = "docker")]
    docker_path: String,
}

fn main() {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build Tokio runtime");

    let exit_code = runtime.block_on(async move { run(args).await });
    std::process::exit(exit_code);
}

async fn run(args: Args) -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    tracing::info!(
        version = batchexec_sdk::build_constants::EngineVersion::identifier(),
        platform = %CURRENT_PLATFORM,
        "batchexecd starting"
    );

    match run_batch(&args).await {
        Ok(exit_code) => exit_code,
        Err(e) => {
            tracing::error!("batchexecd failed: {e:#}");
            1
        }
    }
}

async fn run_batch(args: &Args) -> Result<i32> {
    let tasks = load_json::<Vec<Task>>(&args.tasks).await.context("loading tasks")?;
    let import_changesets = match &args.import_changesets {
        Some(path) => load_json::<Vec<ImportChangeset>>(path).await.context("loading importChangesets")?,
        None => Vec::new(),
    };

    let mut config = EngineConfig::new(args.cache_dir.clone(), args.temp_dir.clone());
    if let Some(parallelism) = args.parallelism {
        config.parallelism = parallelism.max(1);
    }
    config.failure_policy = if args.fail_fast { FailurePolicy::FailFast } else { FailurePolicy::SkipErrors };
    config.clear_cache = args.clear_cache;

    tokio::fs::create_dir_all(config.cache_entries_dir()).await.context("creating cache directory")?;
    tokio::fs::create_dir_all(config.workspaces_dir()).await.context("creating workspaces directory")?;
    tokio::fs::create_dir_all(config.logs_dir()).await.context("creating logs directory")?;

    let docker = Arc::new(DockerClient::with_path(args.docker_path.clone()));
    let launcher: Arc<dyn batchexec_engine::ContainerLauncher> = docker.clone();
    let registry: Arc<dyn batchexec_engine::ImageRegistry> = docker;

    let cache: Arc<dyn batchexec_engine::ExecutionCache> = Arc::new(batchexec_engine::DiskCache::new(config.cache_entries_dir()));

    if config.clear_cache {
        for task in &tasks {
            cache.clear(&task.slug()).await.ok();
        }
    }

    let archive_registry = Arc::new(FilesystemArchiveRegistry::new(args.archive_dir.clone()));
    let workspace_creator =
        Arc::new(DefaultWorkspaceCreator { archive_registry, container_dir: args.container_dir.clone() });
    let step_runner = StepRunner::new(launcher, registry);
    let process_env: HashMap<String, String> = std::env::vars().collect();
    let executor = TaskExecutor::new(step_runner, cache.clone(), workspace_creator, config, process_env);
    let coordinator = Coordinator::new(cache, executor, args.container_dir.clone());

    let (uncached, mut specs) = coordinator.check_cache(tasks).await.context("checking cache")?;

    let ui: Arc<dyn batchexec_engine::TaskExecutionUI> = Arc::new(ConsoleUi);
    let (executed_specs, outcome, error) =
        coordinator.execute_and_build_specs(uncached, &import_changesets, ui, CancellationToken::new()).await;
    specs.extend(executed_specs);

    println!("{}", serde_json::to_string_pretty(&specs).context("serializing changeset specs")?);

    if let Some(e) = error {
        tracing::error!("{}", e.summary());
    }
    tracing::info!(outcome = %outcome, "batchexecd finished");
    Ok(outcome.exit_code())
}

async fn load_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let bytes = if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut tokio::io::stdin(), &mut buf)
            .await
            .context("reading stdin")?;
        buf
    } else {
        tokio::fs::read(path).await.with_context(|| format!("reading {}", path.display()))?
    };
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}
