//! Agentflow CLI entry point.
//!
//! Provides `serve`, `plan`, `run`, and `migrate` subcommands binding the
//! planner, registry, synthesizer, and executor behind a daemon or a
//! one-shot invocation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use agentflow::capability::{build_capability, LanguageCapability};
use agentflow::config::{self, Config, RuntimePaths};
use agentflow::executor::Doer;
use agentflow::logging;
use agentflow::planner::{Planner, PlannerEvent};
use agentflow::registry::BlockRegistry;
use agentflow::sandbox::direct::DirectExecutor;
use agentflow::sandbox::docker::DockerExecutor;
use agentflow::sandbox::{self, Executor, ExecutorKind};
use agentflow::store::Store;
use agentflow::synthesizer::Synthesizer;
use agentflow::types::PipelineJson;

/// Agentflow — turns a natural-language intent into an executable block
/// pipeline and runs it.
#[derive(Parser)]
#[command(name = "agentflow", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the HTTP/SSE server binding the planner and executor.
    Serve {
        /// Address to bind, e.g. "0.0.0.0:8080".
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,
    },
    /// Decompose a natural-language intent into a pipeline and print it.
    Plan {
        /// The goal to decompose.
        intent: String,
    },
    /// Execute a saved pipeline JSON file and print its results.
    Run {
        /// Path to a `PipelineJson` document.
        pipeline: PathBuf,
        /// User id the run executes on behalf of.
        #[arg(long, default_value = "cli")]
        user_id: String,
    },
    /// Apply SQLite schema migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { addr } => handle_serve(&addr).await,
        Command::Plan { intent } => handle_plan(&intent).await,
        Command::Run { pipeline, user_id } => handle_run(&pipeline, &user_id).await,
        Command::Migrate => handle_migrate().await,
    }
}

/// Components shared by every subcommand that touches the registry/store.
struct Runtime {
    registry: Arc<BlockRegistry>,
    sandbox: Arc<dyn Executor>,
    capability: Arc<dyn LanguageCapability>,
    store: Arc<Store>,
    config: Config,
}

/// Open config, registry, sandbox, capability, and store for `paths`.
async fn build_runtime(paths: RuntimePaths) -> anyhow::Result<Runtime> {
    let config = config::load_config_or_default(&paths.config_toml)
        .with_context(|| format!("failed to load {}", paths.config_toml.display()))?;

    let capability =
        build_capability(&config.capability).context("failed to build language capability")?;

    let sandbox = build_sandbox(&config, &paths).await?;

    let registry = Arc::new(
        BlockRegistry::open(
            &paths.db_path,
            config.registry.clone(),
            Some(Arc::clone(&capability)),
            Some(Arc::clone(&sandbox)),
        )
        .await
        .context("failed to open block registry")?,
    );

    let store = Arc::new(
        Store::open(&paths.db_path)
            .await
            .context("failed to open store")?,
    );

    Ok(Runtime {
        registry,
        sandbox,
        capability,
        store,
        config,
    })
}

/// Select and construct the sandbox backend per `config.sandbox.backend`.
async fn build_sandbox(config: &Config, paths: &RuntimePaths) -> anyhow::Result<Arc<dyn Executor>> {
    use agentflow::config::SandboxBackendKind;

    let kind = match config.sandbox.backend {
        SandboxBackendKind::Docker => ExecutorKind::Docker,
        SandboxBackendKind::Subprocess => ExecutorKind::Direct,
        SandboxBackendKind::Auto => sandbox::auto_detect().await,
    };

    match kind {
        ExecutorKind::Docker => {
            let executor = DockerExecutor::new(config, paths)
                .await
                .context("failed to start docker sandbox")?;
            Ok(Arc::new(executor))
        }
        ExecutorKind::Direct => {
            std::fs::create_dir_all(&paths.workspace_dir)
                .with_context(|| format!("failed to create {}", paths.workspace_dir.display()))?;
            std::fs::create_dir_all(&paths.scripts_dir)
                .with_context(|| format!("failed to create {}", paths.scripts_dir.display()))?;
            Ok(Arc::new(DirectExecutor::new(
                paths.scripts_dir.clone(),
                paths.workspace_dir.clone(),
                config.sandbox.memory_mb,
                config.sandbox.exec_timeout_secs,
            )))
        }
    }
}

fn build_planner(runtime: &Runtime) -> Planner {
    let synthesizer = Synthesizer::new(
        Arc::clone(&runtime.capability),
        Arc::clone(&runtime.sandbox),
        runtime.config.synthesizer.clone(),
    );
    Planner::new(Arc::clone(&runtime.capability), Arc::clone(&runtime.registry), synthesizer)
}

fn build_doer(runtime: &Runtime) -> Doer {
    Doer::new(
        Arc::clone(&runtime.registry),
        Arc::clone(&runtime.sandbox),
        Arc::clone(&runtime.capability),
        Arc::clone(&runtime.store),
        runtime.config.executor.clone(),
        Duration::from_secs(runtime.config.capability.generate_deadline_secs),
    )
}

/// Run the HTTP/SSE server.
async fn handle_serve(addr: &str) -> anyhow::Result<()> {
    let paths = config::runtime_paths()?;
    let _logging_guard = logging::init_production(&paths.logs_dir)?;

    let runtime = build_runtime(paths).await?;
    let planner = build_planner(&runtime);
    let doer = build_doer(&runtime);
    let state = Arc::new(agentflow::server::AppState {
        planner,
        doer,
        store: Arc::clone(&runtime.store),
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(addr = %addr, "agentflow server listening");
    axum::serve(listener, agentflow::server::router(state))
        .await
        .context("server exited")?;
    Ok(())
}

/// Decompose `intent` into a pipeline, printing each planner event as it
/// arrives, then the resulting pipeline JSON.
async fn handle_plan(intent: &str) -> anyhow::Result<()> {
    logging::init_cli();

    let paths = config::runtime_paths()?;
    let runtime = build_runtime(paths).await?;
    let planner = build_planner(&runtime);

    let intent = intent.to_owned();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<PlannerEvent>();
    let plan_task = tokio::spawn(async move { planner.plan(&intent, &tx).await });

    while let Some(event) = rx.recv().await {
        println!("[{:?}] {}", event.status, event.message);
    }

    let pipeline = plan_task
        .await
        .context("planner task panicked")?
        .context("planning failed")?;
    println!("{}", serde_json::to_string_pretty(&pipeline)?);
    Ok(())
}

/// Execute a saved pipeline JSON file to completion and print its results.
async fn handle_run(pipeline_path: &PathBuf, user_id: &str) -> anyhow::Result<()> {
    logging::init_cli();

    let contents = std::fs::read_to_string(pipeline_path)
        .with_context(|| format!("failed to read {}", pipeline_path.display()))?;
    let pipeline: PipelineJson = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {} as a pipeline", pipeline_path.display()))?;

    let paths = config::runtime_paths()?;
    let runtime = build_runtime(paths).await?;
    let doer = build_doer(&runtime);

    let outcome = doer
        .run(
            &pipeline,
            user_id,
            serde_json::Value::Null,
            serde_json::Value::Null,
            CancellationToken::new(),
        )
        .await
        .context("run failed")?;

    println!("run {} finished with status {:?}", outcome.run_id, outcome.status);
    println!("{}", serde_json::to_string_pretty(&outcome.state.results)?);
    Ok(())
}

/// Open the registry and store, applying schema migrations, then exit.
async fn handle_migrate() -> anyhow::Result<()> {
    logging::init_cli();

    let paths = config::runtime_paths()?;
    std::fs::create_dir_all(&paths.root)
        .with_context(|| format!("failed to create {}", paths.root.display()))?;
    let config = config::load_config_or_default(&paths.config_toml)?;

    let _registry = BlockRegistry::open(&paths.db_path, config.registry, None, None)
        .await
        .context("failed to migrate block registry")?;
    let _store = Store::open(&paths.db_path)
        .await
        .context("failed to migrate store")?;

    info!(db = %paths.db_path.display(), "migrations applied");
    Ok(())
}
