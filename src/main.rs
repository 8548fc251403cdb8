use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use taskprog::env;
use taskprog::{TaskHandle, TaskManager, TaskManagerConfig, TaskScope, TaskSpec};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "taskprog")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Hierarchical task status and progress tracking engine")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Drive a tree of worker tasks from background threads
    Demo {
        /// Number of worker tasks below the root
        #[arg(short = 'w', long = "workers", default_value_t = 3)]
        workers: usize,
        /// Subtasks per worker
        #[arg(short = 's', long = "steps", default_value_t = 5)]
        steps: usize,
        /// Duration of one subtask in milliseconds
        #[arg(long = "step-ms", default_value_t = 200)]
        step_ms: u64,
        /// Kill the whole tree after this many milliseconds
        #[arg(long = "kill-after-ms", value_name = "MS")]
        kill_after_ms: Option<u64>,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Log every task event
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// Show the discovered configuration
    ShowConfig,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(env::DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Demo {
            workers,
            steps,
            step_ms,
            kill_after_ms,
            config,
            verbose,
        } => {
            let mut config = load_config(config)?;
            config.log_events |= verbose;
            run_demo(
                config,
                workers,
                steps,
                Duration::from_millis(step_ms),
                kill_after_ms.map(Duration::from_millis),
            )
            .await
        }
        Commands::ShowConfig => show_config(),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<TaskManagerConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration override from: {:?}", path);
            TaskManagerConfig::from_toml_file(&path)
                .with_context(|| format!("Failed to load configuration from {:?}", path))
        }
        None => TaskManagerConfig::discover(),
    }
}

fn show_config() -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to resolve working directory")?;
    let home = std::env::var_os("HOME").map(PathBuf::from);

    match TaskManagerConfig::find_config_file(&cwd, home.as_deref()) {
        Some(path) => println!("# Loaded from {}", path.display()),
        None => println!("# No configuration file found, using built-in defaults"),
    }

    let config = TaskManagerConfig::discover_from(&cwd, home.as_deref())?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}

async fn run_demo(
    config: TaskManagerConfig,
    workers: usize,
    steps: usize,
    step: Duration,
    kill_after: Option<Duration>,
) -> Result<()> {
    let manager = TaskManager::new(config);
    let shutdown = CancellationToken::new();

    let root = manager.create_task(
        TaskSpec::new("Demo")
            .with_description("Simulated batch of workers")
            .with_may_kill(true)
            .with_scopes([TaskScope::Foreground]),
    )?;

    let mut tasks = Vec::with_capacity(workers);
    for index in 0..workers {
        let worker = manager.create_task(
            TaskSpec::new(&format!("Worker {}", index + 1))
                .with_may_kill(true)
                .with_parent(root.id()),
        )?;
        worker.set_subtasks_named((0..steps).map(|step| format!("Step {}", step + 1)))?;
        tasks.push(worker);
    }

    info!("Starting {} workers with {} steps each", workers, steps);

    let handles: Vec<_> = tasks
        .iter()
        .map(|worker| {
            let handle = worker.handle();
            tokio::task::spawn_blocking(move || drive_worker(handle, steps, step))
        })
        .collect();

    let drive = async {
        for handle in handles {
            if let Err(e) = handle.await.context("Worker thread panicked")? {
                warn!("Worker stopped early: {}", e);
            }
        }
        shutdown.cancel();
        Ok::<_, anyhow::Error>(())
    };

    let kill = async {
        if let Some(delay) = kill_after {
            tokio::time::sleep(delay).await;
            info!("Killing demo tree after {:?}", delay);
            if let Err(e) = root.kill(true) {
                warn!("Failed to kill demo tree: {}", e);
            }
        }
    };

    let kill = async {
        tokio::select! {
            _ = kill => {}
            _ = shutdown.cancelled() => {}
        }
    };

    let (_, driven, _) = tokio::join!(manager.run_event_loop(shutdown.clone()), drive, kill);
    driven?;

    let stats = manager.statistics();
    info!(
        "Demo finished: {} tasks, {:.1}% finished, root {}",
        stats.total_tasks,
        stats.completion_percentage,
        root.status()
    );

    println!("{}", manager.export_to_json()?);
    Ok(())
}

fn drive_worker(task: TaskHandle, steps: usize, step: Duration) -> taskprog::task::Result<()> {
    task.set_running()?;

    for index in 0..steps {
        if task.abort_requested() {
            task.set_aborting()?;
            std::thread::sleep(step / 2);
            return task.set_aborted();
        }

        task.set_subtask_started(index, None)?;
        std::thread::sleep(step);
        task.set_subtask_finished(index, None)?;
    }

    task.set_finished()
}
