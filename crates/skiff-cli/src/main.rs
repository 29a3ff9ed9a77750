//! Skiff entry point.
//!
//! Runs execution plans against a pool of Docker sandboxes.
//!
//! ## Commands
//!
//! - **run** `<plan.json>`: execute a plan, print the report as JSON
//! - **cleanup**: remove sandboxes left behind by earlier runs
//! - **status**: list sandboxes owned by skiff
//! - **check**: validate configuration and daemon connectivity

use anyhow::Context;
use clap::{Parser, Subcommand};
use skiff_cli::{HttpBlockRunner, JsonLinesSink, SkiffConfig};
use skiff_core::{EventSink, ExecutionPlan, LaneExecutor, ParallelismModel, SandboxPool, TracingSink};
use skiff_runtime::{ContainerFilter, ContainerRuntime, DockerRuntime};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "skiff", version, about = "Run workflow blocks in pooled container sandboxes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Sandbox image (overrides SKIFF_IMAGE).
    #[arg(long, global = true)]
    image: Option<String>,

    /// Maximum live sandboxes (overrides SKIFF_MAX_SANDBOXES).
    #[arg(long, global = true)]
    max_sandboxes: Option<usize>,

    /// multi-sandbox or single-sandbox (overrides SKIFF_PARALLELISM).
    #[arg(long, global = true)]
    parallelism: Option<ParallelismModel>,

    /// Docker daemon socket (overrides SKIFF_DOCKER_SOCKET).
    #[arg(long, global = true)]
    docker_socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan file and print the report as JSON.
    Run {
        /// Plan file (JSON).
        plan: PathBuf,

        /// JSON object mapping block ids to their input payloads.
        #[arg(long)]
        inputs: Option<PathBuf>,

        /// Stream events to stdout as JSON lines.
        #[arg(long, default_value_t = false)]
        events: bool,

        /// Sandboxes to start before the first lane (overrides SKIFF_PREWARM).
        #[arg(long)]
        prewarm: Option<usize>,
    },
    /// Remove sandboxes left behind by earlier runs.
    Cleanup,
    /// List sandboxes owned by skiff.
    Status,
    /// Validate configuration and check the docker daemon.
    Check,
}

impl Cli {
    /// Layer command-line overrides on top of the environment.
    fn config(&self) -> SkiffConfig {
        let mut config = SkiffConfig::from_env();
        if let Some(image) = &self.image {
            config.image = image.clone();
        }
        if let Some(max) = self.max_sandboxes {
            config.max_sandboxes = max;
        }
        if let Some(parallelism) = self.parallelism {
            config.parallelism = parallelism;
        }
        if let Some(socket) = &self.docker_socket {
            config.docker_socket = socket.clone();
        }
        if let Commands::Run {
            prewarm: Some(n), ..
        } = &self.command
        {
            config.prewarm = *n;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr (stdout carries reports and events)
    let level = &cli.log_level;
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive(format!("skiff={level}").parse()?)
                .add_directive(format!("skiff_cli={level}").parse()?)
                .add_directive(format!("skiff_core={level}").parse()?)
                .add_directive(format!("skiff_runtime={level}").parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = cli.config();
    tracing::debug!(?config, "Configuration loaded");

    match &cli.command {
        Commands::Run {
            plan,
            inputs,
            events,
            ..
        } => run(&config, plan, inputs.as_deref(), *events).await,
        Commands::Cleanup => cleanup(&config).await,
        Commands::Status => status(&config).await,
        Commands::Check => check(&config).await,
    }
}

async fn connect(config: &SkiffConfig) -> anyhow::Result<Arc<DockerRuntime>> {
    let runtime = DockerRuntime::new(&config.docker_socket);
    runtime.ping().await.with_context(|| {
        format!(
            "docker daemon not reachable at {}",
            config.docker_socket.display()
        )
    })?;
    Ok(Arc::new(runtime))
}

async fn run(
    config: &SkiffConfig,
    plan_path: &std::path::Path,
    inputs_path: Option<&std::path::Path>,
    stream_events: bool,
) -> anyhow::Result<()> {
    config.validate_warn();
    let pool_config = config.pool_config()?;

    let plan: ExecutionPlan = serde_json::from_str(
        &tokio::fs::read_to_string(plan_path)
            .await
            .with_context(|| format!("reading plan {}", plan_path.display()))?,
    )
    .with_context(|| format!("parsing plan {}", plan_path.display()))?;

    let inputs: HashMap<String, serde_json::Value> = match inputs_path {
        Some(path) => serde_json::from_str(
            &tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading inputs {}", path.display()))?,
        )
        .with_context(|| format!("parsing inputs {}", path.display()))?,
        None => HashMap::new(),
    };

    let runtime = connect(config).await?;
    let events: Arc<dyn EventSink> = if stream_events {
        Arc::new(JsonLinesSink)
    } else {
        Arc::new(TracingSink)
    };

    let pool = SandboxPool::with_events(pool_config, runtime, events.clone())?;
    let removed = pool.cleanup_orphans().await;
    if removed > 0 {
        tracing::info!(removed, "Removed orphaned sandboxes from an earlier run");
    }
    if config.prewarm > 0 {
        if let Err(e) = pool.prewarm(config.prewarm).await {
            tracing::warn!(error = %e, "Prewarm incomplete, continuing with what started");
        }
    }

    let runner = Arc::new(HttpBlockRunner::new(config.block_timeout()).with_inputs(inputs));
    let executor = LaneExecutor::new(pool.clone(), runner).with_event_sink(events);

    let abort = executor.abort_handle();
    let interrupt = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received interrupt, stopping after in-flight blocks");
            abort.abort();
        }
    });

    tracing::info!(plan = %plan_path.display(), lanes = plan.lanes.len(), "Starting execution");
    let report = executor.execute(&plan).await;
    interrupt.abort();
    pool.teardown().await;

    let report = report?;
    let stats = pool.stats();
    tracing::info!(
        results = report.results.len(),
        failed = report.failed().count(),
        spawned = stats.spawned(),
        reuse_rate = format!("{:.1}%", stats.reuse_rate()),
        "Execution finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_success() {
        anyhow::bail!("plan did not complete successfully: {:?}", report.status);
    }
    Ok(())
}

async fn cleanup(config: &SkiffConfig) -> anyhow::Result<()> {
    let runtime = connect(config).await?;
    let pool = SandboxPool::new(config.pool_config()?, runtime)?;
    let removed = pool.cleanup_orphans().await;
    println!("removed {removed} sandbox(es)");
    Ok(())
}

async fn status(config: &SkiffConfig) -> anyhow::Result<()> {
    let runtime = connect(config).await?;
    let containers = runtime.list_containers(&ContainerFilter::owned()).await?;
    if containers.is_empty() {
        println!("no skiff sandboxes");
        return Ok(());
    }

    println!("{:<14} {:<10} {:<30} NAME", "ID", "STATE", "IMAGE");
    for container in containers {
        let id = container.id.get(..12).unwrap_or(&container.id);
        let name = container
            .names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or_default();
        println!(
            "{:<14} {:<10} {:<30} {}",
            id, container.state, container.image, name
        );
    }
    Ok(())
}

async fn check(config: &SkiffConfig) -> anyhow::Result<()> {
    config.validate()?;
    let runtime = connect(config).await?;
    println!(
        "ok: {} backend at {}, image {}",
        runtime.backend_name(),
        config.docker_socket.display(),
        config.image
    );
    Ok(())
}
