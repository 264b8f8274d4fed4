use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveTime, Weekday};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use varflow_core::config::AppConfig;
use varflow_core::event::EventBus;
use varflow_core::types::{EngineEvent, Frequency, ScheduleEntry};

use varflow_engine::{convert_legacy, DirectorySource, Orchestrator, ScheduleBook, Scheduler};
use varflow_runner::ProcessExecutor;
use varflow_store::{SqliteSnapshot, VariableStore};

#[derive(Parser)]
#[command(
    name = "varflow",
    version,
    about = "Run scripts that talk to each other through named variables"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "varflow.toml", env = "VARFLOW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan script directories and list what each script declares
    Scan,
    /// Print the producer -> consumer edges
    Graph,
    /// Resolve a script's inputs and run it
    Run {
        /// Script path or file name
        script: String,
        /// Stop right after the first produced variable is bound
        #[arg(long)]
        partial: bool,
        /// Run even if already finished or inputs are missing
        #[arg(long)]
        force: bool,
    },
    /// Show stored variables and who produced them
    Vars,
    /// Clear all variables and script states
    Reset,
    /// Manage scheduled runs
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Evaluate the schedule until interrupted
    Daemon,
    /// Rewrite legacy PRODUCES/REQUIRES assignments as marker comments
    Convert {
        file: PathBuf,
        /// Overwrite the file instead of printing the result
        #[arg(long)]
        write: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Add a schedule entry
    Add {
        /// Script path or file name
        script: String,
        #[arg(long, value_enum)]
        frequency: FrequencyArg,
        /// Time of day (HH:MM) for daily and weekly entries
        #[arg(long)]
        at: Option<String>,
        /// Comma-separated weekdays for weekly entries (mon,tue,...)
        #[arg(long, value_delimiter = ',')]
        days: Vec<String>,
        /// Interval for every-n-hours entries
        #[arg(long)]
        hours: Option<u32>,
        /// Retry a failed run after this many minutes (0 = never)
        #[arg(long, default_value = "0")]
        retry_minutes: u32,
    },
    /// List schedule entries
    List,
    /// Remove every entry for a script
    Remove { script: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum FrequencyArg {
    Daily,
    Weekly,
    EveryNHours,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("varflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle commands that need no config first
    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "varflow", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Convert { ref file, write } => return convert(file, write),
        _ => {}
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Scan => {
            let (mut orchestrator, _) = build_orchestrator(&config);
            let failures = orchestrator.refresh();
            for script in orchestrator.registry().values() {
                println!("{}", script.path);
                if !script.docstring.is_empty() {
                    println!("    {}", script.docstring.lines().next().unwrap_or_default());
                }
                println!("    produces: {}", list_or_none(&script.produces));
                println!("    requires: {}", list_or_none(&script.requires));
            }
            for failure in failures {
                println!("skipped: {}", failure);
            }
        }
        Commands::Graph => {
            let (mut orchestrator, _) = build_orchestrator(&config);
            orchestrator.refresh();
            let graph = orchestrator.graph();
            if graph.edge_count() == 0 {
                println!("No dependencies.");
            }
            for edge in graph.edges() {
                println!("{}", edge);
            }
            for (variable, producers) in graph.ambiguous_variables() {
                println!("ambiguous: {} produced by {}", variable, producers.join(", "));
            }
        }
        Commands::Run {
            ref script,
            partial,
            force,
        } => {
            let (mut orchestrator, event_bus) = build_orchestrator(&config);
            let printer = tokio::spawn(print_events(event_bus.subscribe()));

            let result = orchestrator.resolve_and_run(script, partial, force).await;
            drop(orchestrator);
            drop(event_bus);
            printer.await.ok();

            let state = result?;
            println!("{}: {}", script, state);
        }
        Commands::Vars => {
            let (orchestrator, _) = build_orchestrator(&config);
            let store = orchestrator.store();
            if store.is_empty() {
                println!("No variables stored.");
            }
            for (name, value) in store.values() {
                println!(
                    "{} = {} ({})",
                    name,
                    value,
                    store.provenance(name).unwrap_or("?")
                );
            }
        }
        Commands::Reset => {
            let (mut orchestrator, _) = build_orchestrator(&config);
            orchestrator.refresh();
            orchestrator.reset();
            println!("Variables and script states cleared.");
        }
        Commands::Schedule { ref action } => handle_schedule_cli(action, &config)?,
        Commands::Daemon => {
            let (mut orchestrator, event_bus) = build_orchestrator(&config);
            orchestrator.refresh();
            let book = load_book(&config);
            let orchestrator = Arc::new(tokio::sync::Mutex::new(orchestrator));
            let mut scheduler =
                Scheduler::new(book, orchestrator, event_bus, config.scheduler.clone());

            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down daemon...");
                cancel_clone.cancel();
            });

            scheduler.run(cancel).await;
        }
        Commands::Completions { .. } | Commands::Convert { .. } => {
            unreachable!("handled before config load")
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    warn!(path = %path.display(), "No config file, using defaults");
    Ok(AppConfig::default())
}

/// Build the orchestrator with its store and executor. A snapshot that
/// cannot be opened or read leaves the store empty and in memory.
fn build_orchestrator(config: &AppConfig) -> (Orchestrator, Arc<EventBus>) {
    let snapshot_path = config.snapshot_path();
    let mut store = match SqliteSnapshot::open(&snapshot_path) {
        Ok(db) => VariableStore::with_snapshot(Arc::new(db)),
        Err(e) => {
            warn!(path = %snapshot_path.display(), error = %e, "Snapshot unavailable, variables will not persist");
            VariableStore::new()
        }
    };
    if let Err(e) = store.load() {
        warn!(error = %e, "Failed to load variable snapshot, starting empty");
    }

    let event_bus = Arc::new(EventBus::default());
    let executor = Arc::new(ProcessExecutor::new(config.executor.clone()));
    let source = DirectorySource::new(config.script_dirs(), config.engine.extensions.clone());
    let orchestrator =
        Orchestrator::new(executor, store, event_bus.clone()).with_source(Arc::new(source));
    (orchestrator, event_bus)
}

fn load_book(config: &AppConfig) -> ScheduleBook {
    let path = config.schedule_path();
    match ScheduleBook::load(&path) {
        Ok(book) => book,
        Err(e) => {
            // Keep the broken file on disk for the user to fix.
            warn!(error = %e, "Failed to load schedule, running with an unsaved empty one");
            ScheduleBook::in_memory()
        }
    }
}

/// Print orchestrator events until the bus is dropped.
async fn print_events(mut rx: tokio::sync::broadcast::Receiver<EngineEvent>) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match rx.recv().await {
            Ok(EngineEvent::ScriptStateChanged {
                path,
                state,
                message,
            }) => match message {
                Some(message) => eprintln!("[{}] {}: {}", state, path, message),
                None => eprintln!("[{}] {}", state, path),
            },
            Ok(EngineEvent::ScriptOutput { stdout, .. }) => {
                let stdout = stdout.trim_end();
                if !stdout.is_empty() {
                    println!("{}", stdout);
                }
            }
            Ok(EngineEvent::VariablesUpdated { producer, names }) => {
                eprintln!("  {} -> {}", producer, names.join(", "));
            }
            Ok(EngineEvent::PersistenceFailed { message }) => {
                eprintln!("warning: {}", message);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Handle `varflow schedule` subcommands.
fn handle_schedule_cli(action: &ScheduleAction, config: &AppConfig) -> anyhow::Result<()> {
    let path = config.schedule_path();
    let mut book = ScheduleBook::load(&path)?;

    match action {
        ScheduleAction::Add {
            script,
            frequency,
            at,
            days,
            hours,
            retry_minutes,
        } => {
            let at = at
                .as_deref()
                .map(|t| NaiveTime::parse_from_str(t, "%H:%M"))
                .transpose()
                .map_err(|e| anyhow::anyhow!("--at must be HH:MM: {}", e))?;
            let days = days
                .iter()
                .map(|d| {
                    d.trim()
                        .parse::<Weekday>()
                        .map_err(|_| anyhow::anyhow!("unknown weekday: {}", d))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let entry = match frequency {
                FrequencyArg::Daily => ScheduleEntry::daily(script.as_str(), require_time(at)?),
                FrequencyArg::Weekly => {
                    ScheduleEntry::weekly(script.as_str(), require_time(at)?, days)
                }
                FrequencyArg::EveryNHours => {
                    ScheduleEntry::every_n_hours(script.as_str(), hours.unwrap_or(0))
                }
            }
            .with_retry(*retry_minutes);

            book.add(entry)?;
            book.save()?;
            println!("Scheduled {}.", script);
        }
        ScheduleAction::List => {
            if book.is_empty() {
                println!("No scheduled scripts.");
            }
            for entry in book.entries() {
                let when = match entry.frequency {
                    Frequency::Daily => format!("daily at {}", fmt_time(entry)),
                    Frequency::Weekly => format!(
                        "weekly at {} on {}",
                        fmt_time(entry),
                        entry
                            .days_of_week
                            .iter()
                            .map(|d| d.to_string())
                            .collect::<Vec<_>>()
                            .join(",")
                    ),
                    Frequency::EveryNHours => {
                        format!("every {}h", entry.interval_hours.unwrap_or(0))
                    }
                };
                let last = entry
                    .last_run
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                let status = if entry.last_run_failed() { " (failed)" } else { "" };
                println!(
                    "{}  {}  retry={}m  last_run={}{}",
                    entry.script, when, entry.retry_interval_minutes, last, status
                );
            }
            for err in book.invalid() {
                println!("invalid: {}", err);
            }
        }
        ScheduleAction::Remove { script } => {
            let removed = book.remove(script);
            book.save()?;
            println!("Removed {} entr{} for {}.", removed, if removed == 1 { "y" } else { "ies" }, script);
        }
    }
    Ok(())
}

/// `varflow convert`: print or overwrite.
fn convert(file: &Path, write: bool) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(file)?;
    let converted = convert_legacy(&source);
    if write {
        if converted != source {
            std::fs::write(file, &converted)?;
            println!("Converted {}.", file.display());
        } else {
            println!("{} has no legacy declarations.", file.display());
        }
    } else {
        print!("{}", converted);
    }
    Ok(())
}

fn require_time(at: Option<NaiveTime>) -> anyhow::Result<NaiveTime> {
    at.ok_or_else(|| anyhow::anyhow!("--at HH:MM is required for daily and weekly entries"))
}

fn fmt_time(entry: &ScheduleEntry) -> String {
    entry
        .time_of_day
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string())
}

fn list_or_none(names: &[String]) -> String {
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(", ")
    }
}
