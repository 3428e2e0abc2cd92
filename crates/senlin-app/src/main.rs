//! Senlin application binary - composition root.
//!
//! 1. Load configuration from TOML and apply CLI overrides
//! 2. Open the action store (SQLite or in-memory)
//! 3. Build the dispatcher and the engine, rebuilding the dependency graph
//! 4. Run one operator command, or the scheduler until Ctrl-C

mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use senlin_core::config::{SenlinConfig, StorageBackend};
use senlin_core::store::{ActionFilter, ActionStore};
use senlin_core::types::{Action, Params};
use senlin_engine::{
    ActionSpec, Dispatcher, Engine, MemoryActionStore, PassthroughHandler, Scheduler,
};
use senlin_storage::SqliteActionStore;

use cli::{CliArgs, Command, SubmitArgs};

/// Expand ~ to home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    match data_dir.strip_prefix("~/").or_else(|| data_dir.strip_prefix("~\\")) {
        Some(rest) => cli::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(data_dir),
    }
}

fn open_store(config: &SenlinConfig) -> Result<Arc<dyn ActionStore>, Box<dyn std::error::Error>> {
    match config.storage.backend {
        StorageBackend::Sqlite => {
            let data_dir = resolve_data_dir(&config.general.data_dir);
            std::fs::create_dir_all(&data_dir).map_err(|e| {
                tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
                e
            })?;
            let db_path = data_dir.join(&config.storage.db_file);
            let store = SqliteActionStore::open(&db_path)?;
            tracing::info!(path = %db_path.display(), "SQLite action store opened");
            Ok(Arc::new(store))
        }
        StorageBackend::Memory => {
            tracing::warn!("In-memory action store: records are lost on exit");
            Ok(Arc::new(MemoryActionStore::new()))
        }
    }
}

fn build_dispatcher(simulate: bool) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    if simulate {
        dispatcher.register_all(Arc::new(PassthroughHandler));
        tracing::info!(handlers = dispatcher.len(), "Simulated operations registered");
    }
    dispatcher
}

/// Write `config` to `path`, refusing to replace an existing file unless
/// `force` is set.
fn init_config(
    config: &SenlinConfig,
    path: &Path,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() && !force {
        return Err(format!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        )
        .into());
    }
    config.save(path)?;
    Ok(())
}

fn build_spec(args: SubmitArgs) -> ActionSpec {
    let inputs: Params = args.inputs.into_iter().collect();
    let mut spec = ActionSpec::new(args.kind, args.target, args.verb).with_inputs(inputs);
    if let Some(cause) = args.cause {
        spec = spec.with_cause(cause);
    }
    for dep in args.depends_on {
        spec = spec.depends_on(dep);
    }
    if let Some(start) = args.start {
        spec = spec.with_start_time(start);
    }
    if let Some(end) = args.end {
        spec = spec.with_end_time(end);
    }
    if let Some(interval) = args.interval {
        spec = spec.with_interval(interval);
    }
    if let Some(timeout) = args.timeout {
        spec = spec.with_timeout(timeout);
    }
    if let Some(description) = args.description {
        spec = spec.with_description(description);
    }
    spec
}

fn print_row(action: &Action) {
    println!(
        "{}  {:<9}  {:<7} {:<14} {:<20} {}",
        action.id,
        action.status.as_str(),
        action.target_kind.to_string(),
        action.action.as_str(),
        action.target,
        action.status_reason
    );
}

async fn run_scheduler(engine: Arc<Engine>) -> Result<(), Box<dyn std::error::Error>> {
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&engine)));
    let runner = Arc::clone(&scheduler);
    let handle = tokio::spawn(async move { runner.run().await });

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(kind = event.kind(), action_id = %event.action_id(), "Event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "Event log lagged")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, waiting for running actions");
    scheduler.shutdown();
    handle.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = SenlinConfig::load_or_default(&config_file);
    if let Some(data_dir) = args.resolve_data_dir() {
        config.general.data_dir = data_dir;
    }
    if let Some(log_level) = args.resolve_log_level() {
        config.general.log_level = log_level;
    }
    if let Some(workers) = args.resolve_workers() {
        config.engine.workers = workers;
    }

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting Senlin v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration loaded");

    if let Command::Init { force } = args.command {
        init_config(&config, &config_file, force)?;
        println!("{}", config_file.display());
        return Ok(());
    }

    // Engine.
    let store = open_store(&config)?;
    let simulate = matches!(args.command, Command::Run { simulate: true });
    let engine = Arc::new(Engine::new(
        store,
        Arc::new(build_dispatcher(simulate)),
        config.engine.clone(),
    )?);

    match args.command {
        Command::Submit(submit) => {
            let action = engine.register(build_spec(submit))?;
            println!("{}", serde_json::to_string_pretty(&action)?);
        }
        Command::List {
            status,
            target,
            limit,
        } => {
            let mut filter = ActionFilter::new().with_limit(limit);
            if let Some(status) = status {
                filter = filter.with_status(status);
            }
            if let Some(target) = target {
                filter = filter.with_target(target);
            }
            for action in engine.query(&filter)? {
                print_row(&action);
            }
        }
        Command::Show { id } => {
            let action = engine.get(id)?;
            println!("{}", serde_json::to_string_pretty(&action)?);
        }
        Command::Cancel { id } => {
            let action = engine.cancel(id)?;
            println!("{} {}", action.id, action.status);
        }
        Command::Run { simulate } => {
            if !simulate {
                tracing::warn!("No operation handlers registered; every action will fail as unsupported");
            }
            run_scheduler(engine).await?
        }
        // Written before the store is opened.
        Command::Init { .. } => {}
    }

    Ok(())
}
