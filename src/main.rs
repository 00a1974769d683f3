mod daemon;
mod prompt;
mod render;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pipeliner_core::traits::{NonInteractivePrompter, Prompter};
use pipeliner_core::{
    load_workflow, EventBus, ExecuteOptions, NewSchedule, PipelinerConfig, ResolvedPaths,
};
use pipeliner_engine::{BackoffPolicy, Engine, HistoryStore, ShellRunner};
use pipeliner_scheduler::{cron_expr, schedule_file, DaemonManager, ScheduleStore, Scheduler};

#[derive(Parser)]
#[command(name = "pipeliner", version, about = "Run local workflows and schedule them with cron")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "PIPELINER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow file
    Run {
        /// Workflow file (.yaml, .yml or .json)
        file: PathBuf,
        /// Apply a profile's variables as preset answers
        #[arg(short, long)]
        profile: Option<String>,
        /// Preset a variable (KEY=VALUE), repeatable
        #[arg(long = "var", value_parser = parse_key_value)]
        vars: Vec<(String, String)>,
    },
    /// Inspect past runs
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
    /// Manage cron schedules and the scheduler daemon
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// List history files, newest first
    List,
    /// Show one run
    Show {
        /// History file name (defaults to the newest)
        file: Option<String>,
    },
    /// Delete one history file
    Remove { file: String },
    /// Delete all history
    Clear {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Add schedules from a definition file, or one schedule from flags
    Add {
        /// Schedule definition file (.yaml, .yml or .json)
        file: Option<PathBuf>,
        /// Workflow file to schedule
        #[arg(long, conflicts_with = "file", requires = "cron")]
        workflow: Option<PathBuf>,
        /// 5-field cron expression
        #[arg(long)]
        cron: Option<String>,
        /// Display name
        #[arg(long)]
        name: Option<String>,
        /// UTC offset in hours, e.g. +9
        #[arg(long, allow_hyphen_values = true)]
        timezone: Option<String>,
        /// Suppress start/finish notifications
        #[arg(long)]
        silent: bool,
        /// Profile to apply when the schedule fires
        #[arg(long)]
        profile: Option<String>,
    },
    /// List schedules
    List,
    /// Remove a schedule
    Remove { id: String },
    /// Enable or disable a schedule
    Toggle { id: String },
    /// Start the scheduler
    Start {
        /// Run in the background
        #[arg(short, long)]
        daemon: bool,
    },
    /// Stop the background scheduler
    Stop,
    /// Show daemon status
    Status,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if key.trim().is_empty() {
        return Err(format!("empty variable name in '{}'", raw));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pipeliner=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "pipeliner", &mut std::io::stdout());
        return Ok(());
    }

    let config_path = cli.config.clone().unwrap_or_else(PipelinerConfig::default_path);
    let config = PipelinerConfig::load_or_default(&config_path)?;
    let paths = config.paths();

    match cli.command {
        Commands::Run {
            file,
            profile,
            vars,
        } => run_workflow(&config, &paths, &file, profile.as_deref(), vars).await,
        Commands::History { action } => handle_history(&paths, action).await,
        Commands::Schedule { action } => handle_schedule(&config, &paths, action).await,
        Commands::Completions { .. } => Ok(()),
    }
}

fn build_engine(
    config: &PipelinerConfig,
    paths: &ResolvedPaths,
    prompter: Arc<dyn Prompter>,
    events: EventBus,
) -> Engine {
    let engine = Engine::new(Arc::new(ShellRunner::with_events(events.clone())), prompter)
        .with_backoff(BackoffPolicy::from(&config.engine))
        .with_events(events);
    if config.engine.record_history {
        engine.with_history(Arc::new(HistoryStore::new(&paths.history_dir)))
    } else {
        engine
    }
}

async fn run_workflow(
    config: &PipelinerConfig,
    paths: &ResolvedPaths,
    file: &Path,
    profile: Option<&str>,
    vars: Vec<(String, String)>,
) -> anyhow::Result<()> {
    let workflow = load_workflow(file)?;

    let mut presets = BTreeMap::new();
    if let Some(name) = profile {
        presets.extend(workflow.profile(name)?.vars.clone());
        info!(profile = name, "Applying profile");
    }
    presets.extend(vars);

    let events = EventBus::default();
    let engine = build_engine(config, paths, Arc::new(prompt::DialoguerPrompter), events.clone());
    let printer = render::spawn_printer(&events);

    let result = engine
        .execute(&workflow, ExecuteOptions { vars: presets })
        .await;
    printer.await.ok();

    let report = result?;
    if let Some(path) = report.history_path {
        eprintln!("History saved to {}", path.display());
    }
    Ok(())
}

async fn handle_history(paths: &ResolvedPaths, action: HistoryAction) -> anyhow::Result<()> {
    let store = HistoryStore::new(&paths.history_dir);
    match action {
        HistoryAction::List => {
            let entries = store.list().await?;
            if entries.is_empty() {
                println!("No workflow history.");
            }
            for entry in entries {
                println!("{}", entry.file_name);
            }
        }
        HistoryAction::Show { file } => {
            let name = match file {
                Some(name) => name,
                None => match store.list().await?.into_iter().next() {
                    Some(entry) => entry.file_name,
                    None => {
                        println!("No workflow history.");
                        return Ok(());
                    }
                },
            };
            let history = store.load(&name).await?;
            render::print_history(&history);
        }
        HistoryAction::Remove { file } => {
            store.remove(&file).await?;
            println!("Removed {}", file);
        }
        HistoryAction::Clear { yes } => {
            let confirmed = yes
                || tokio::task::spawn_blocking(|| {
                    dialoguer::Confirm::new()
                        .with_prompt("Delete all workflow history?")
                        .default(false)
                        .interact()
                        .unwrap_or(false)
                })
                .await
                .unwrap_or(false);
            if confirmed {
                store.clear().await?;
                println!("Workflow history cleared.");
            }
        }
    }
    Ok(())
}

async fn handle_schedule(
    config: &PipelinerConfig,
    paths: &ResolvedPaths,
    action: ScheduleAction,
) -> anyhow::Result<()> {
    let store = ScheduleStore::new(&paths.schedules_file);
    let manager = DaemonManager::new(&paths.daemon_dir, &config.daemon);

    match action {
        ScheduleAction::Add {
            file,
            workflow,
            cron,
            name,
            timezone,
            silent,
            profile,
        } => {
            let added = match (file, workflow) {
                (Some(file), _) => schedule_file::add_from_file(&store, &file).await?,
                (None, Some(workflow)) => {
                    let cron = cron.unwrap_or_default();
                    cron_expr::parse(&cron)?;
                    let workflow = if workflow.is_absolute() {
                        workflow
                    } else {
                        std::env::current_dir()?.join(workflow)
                    };
                    if !workflow.exists() {
                        anyhow::bail!("Workflow file not found: {}", workflow.display());
                    }
                    vec![
                        store
                            .add(NewSchedule {
                                name,
                                workflow_path: workflow.to_string_lossy().into_owned(),
                                cron,
                                enabled: true,
                                timezone,
                                silent,
                                profile,
                            })
                            .await?,
                    ]
                }
                (None, None) => anyhow::bail!("Pass a schedule file or --workflow with --cron"),
            };
            println!("Added {} schedule(s)\n", added.len());
            for schedule in &added {
                render::print_schedule(schedule);
            }
            if manager.is_running().await? {
                println!("\nRestart the scheduler daemon to pick up new schedules.");
            }
        }
        ScheduleAction::List => {
            let schedules = store.load().await?;
            if schedules.is_empty() {
                println!("No schedules.");
            }
            for schedule in &schedules {
                render::print_schedule(schedule);
            }
        }
        ScheduleAction::Remove { id } => {
            if !store.remove(&id).await? {
                return Err(pipeliner_core::PipelinerError::ScheduleNotFound(id).into());
            }
            println!("Removed schedule {}", id);
        }
        ScheduleAction::Toggle { id } => {
            let schedule = store
                .get(&id)
                .await?
                .ok_or_else(|| pipeliner_core::PipelinerError::ScheduleNotFound(id.clone()))?;
            store.toggle(&id, !schedule.enabled).await?;
            let state = if schedule.enabled { "disabled" } else { "enabled" };
            println!("Schedule {} {}", id, state);
        }
        ScheduleAction::Start { daemon: true } if !daemon::is_daemon_child() => {
            if let Some(pid) = manager.daemon_pid().await? {
                anyhow::bail!(
                    "Scheduler daemon is already running (PID: {}). Run \"pipeliner schedule stop\" first.",
                    pid
                );
            }
            match daemon::spawn_detached(&manager).await? {
                Some(pid) => println!("Scheduler daemon started in background (PID: {})", pid),
                None => {
                    let detail = daemon::log_tail(manager.dir(), 10)
                        .unwrap_or_else(|| "no log output".to_string());
                    anyhow::bail!("Failed to start scheduler daemon:\n{}", detail);
                }
            }
        }
        ScheduleAction::Start { daemon: daemon_mode } => {
            let events = EventBus::default();
            let engine = build_engine(config, paths, Arc::new(NonInteractivePrompter), events.clone());
            let scheduler = Scheduler::new(store, manager.clone(), Arc::new(engine));
            let printer = render::spawn_schedule_printer(&events);

            if daemon_mode {
                manager.save_daemon_pid().await?;
            }
            let armed = match scheduler.start(daemon_mode).await {
                Ok(armed) => armed,
                Err(e) => {
                    if daemon_mode {
                        manager.remove_daemon_pid().await.ok();
                    }
                    return Err(e.into());
                }
            };
            for schedule in &armed {
                render::print_schedule(schedule);
            }
            if armed.is_empty() {
                warn!("No enabled schedules; waiting anyway");
            }

            daemon::shutdown_signal().await;
            scheduler.shutdown(daemon_mode).await?;
            printer.abort();
        }
        ScheduleAction::Stop => {
            if !manager.is_running().await? {
                println!("Scheduler daemon is not running.");
                return Ok(());
            }
            if manager.stop_daemon().await? {
                println!("Scheduler daemon stopped.");
            } else {
                anyhow::bail!("Scheduler daemon did not stop");
            }
        }
        ScheduleAction::Status => {
            let status = manager.status().await?;
            match status.pid {
                Some(pid) => {
                    println!("Scheduler daemon is running (PID: {})", pid);
                    if let Some(started) = status.start_time {
                        println!("Started: {}", started);
                    }
                }
                None => println!("Scheduler daemon is not running."),
            }
            let schedules = store.load().await?;
            let enabled = schedules.iter().filter(|s| s.enabled).count();
            println!("Schedules: {} ({} enabled)", schedules.len(), enabled);
        }
    }
    Ok(())
}
