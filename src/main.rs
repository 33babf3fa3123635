//! ci-autorepair - CI failure detection and repair loop
//!
//! Polls the latest CI run of a branch, repairs known failure categories and
//! re-verifies until the pipeline stays green.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ci_autorepair::ci::github::GhStatusSource;
use ci_autorepair::ci::{Run, RunStatus};
use ci_autorepair::operations::{ProcessRunner, RealGitOperations};
use ci_autorepair::{
    AutorepairError, EventLog, EventOutcome, LoopCoordinator, LoopState, ProjectConfig,
    RepairExecutor, Result, StateStore, StopSignal, Termination,
};

#[derive(Parser)]
#[command(name = "ci-autorepair")]
#[command(version)]
#[command(about = "Detect CI failures, apply known repairs and re-verify", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the repair loop until the pipeline is stable
    Start {
        /// Maximum iterations
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Consecutive clean runs required to stop
        #[arg(short, long)]
        clean_threshold: Option<u32>,

        /// Seconds to sleep between iterations
        #[arg(long, value_name = "SECS")]
        poll_interval: Option<u64>,

        /// Branch to monitor
        #[arg(short, long)]
        branch: Option<String>,

        /// Only monitor this workflow
        #[arg(short, long)]
        workflow: Option<String>,

        /// Discard saved state and start a new session
        #[arg(long)]
        fresh: bool,
    },

    /// Show the saved loop state
    Status {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the iteration event log
    Events {
        /// Only show the last N events
        #[arg(short, long, value_name = "N")]
        tail: Option<usize>,
    },

    /// Classify a failure log without contacting CI
    Classify {
        /// File containing the failure log
        log_file: PathBuf,

        /// Name of the failed step
        #[arg(short, long)]
        step: Option<String>,

        /// Exit code of the failed step
        #[arg(short, long)]
        exit_code: Option<i32>,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Delete the saved loop state (the event log is kept)
    Reset,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Check the configuration for errors
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "ci_autorepair=debug,info"
    } else {
        "ci_autorepair=info,warn"
    };

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    // Resolve project path
    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());

    if !project_path.exists() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(1);
    }

    if let Err(e) = run(cli.command, &project_path).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if e.is_fatal() {
            eprintln!("   Loop state is kept; run `ci-autorepair start` again once resolved to resume.");
        }
        std::process::exit(e.exit_code());
    }
}

async fn run(command: Commands, project_path: &Path) -> Result<()> {
    let mut config = ProjectConfig::load(project_path)?;

    match command {
        Commands::Start {
            max_iterations,
            clean_threshold,
            poll_interval,
            branch,
            workflow,
            fresh,
        } => {
            // CLI flags override settings
            if let Some(n) = max_iterations {
                config.max_iterations = n;
            }
            if let Some(n) = clean_threshold {
                config.clean_threshold = n;
            }
            if let Some(secs) = poll_interval {
                config.poll_interval_secs = secs;
            }
            if let Some(b) = branch {
                config.branch = b;
            }
            if workflow.is_some() {
                config.workflow = workflow;
            }
            start(config, project_path, fresh).await
        }

        Commands::Status { json } => {
            let store = StateStore::new(config.state_dir(project_path));
            match store.load()? {
                None => println!("No loop state found in {}", store.dir().display()),
                Some(state) if json => println!("{}", serde_json::to_string_pretty(&state)?),
                Some(state) => print_state(&state, config.clean_threshold, config.max_iterations),
            }
            Ok(())
        }

        Commands::Events { tail } => {
            let log = EventLog::new(config.state_dir(project_path));
            let events = match tail {
                Some(n) => log.tail(n)?,
                None => log.read_all()?,
            };
            if events.is_empty() {
                println!("No events recorded");
            }
            for event in events {
                let label = event.outcome.to_string();
                let outcome = match event.outcome {
                    EventOutcome::Clean | EventOutcome::Repaired | EventOutcome::Done => {
                        label.green()
                    }
                    EventOutcome::FailedPermanent | EventOutcome::Aborted => label.red(),
                    EventOutcome::Stopped => label.yellow(),
                };
                println!(
                    "{} #{:<3} {:<16} {} {} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.loop_count,
                    outcome,
                    event.run_id.as_deref().unwrap_or("-"),
                    event.category.map_or_else(|| "-".to_string(), |c| c.to_string()),
                    event.detail
                );
            }
            Ok(())
        }

        Commands::Classify {
            log_file,
            step,
            exit_code,
        } => {
            let log = std::fs::read_to_string(&log_file)?;
            let mut run = Run::new("local", RunStatus::Failed).with_log(log);
            if let Some(step) = step {
                run = run.with_failed_step(step);
            }
            if let Some(code) = exit_code {
                run = run.with_exit_code(code);
            }

            let classifier = config.classifier()?;
            let strategies = config.strategies();
            if let Some(record) = classifier.classify(&run) {
                println!("{} {}", "Category:".cyan().bold(), record.category);
                println!(
                    "{} {}",
                    "Rule:".cyan().bold(),
                    record.rule.as_deref().unwrap_or("(none)")
                );
                println!("{} {}", "Message:".cyan().bold(), record.message);
                match strategies.resolve(record.category) {
                    Some(strategy) if strategy.declines() => {
                        println!(
                            "{} {} (declined, needs human attention)",
                            "Repair:".yellow().bold(),
                            strategy.action_name
                        );
                        for step in &strategy.steps {
                            println!("   → {}", step.describe());
                        }
                    }
                    Some(strategy) => {
                        println!(
                            "{} {} (up to {} attempt(s))",
                            "Repair:".cyan().bold(),
                            strategy.action_name,
                            strategy.max_attempts()
                        );
                        for step in &strategy.steps {
                            println!("   → {}", step.describe());
                        }
                    }
                    None => println!(
                        "{} none, needs human attention",
                        "Repair:".yellow().bold()
                    ),
                }
            }
            Ok(())
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigAction::Validate => {
                let report = config.validate();
                for warning in &report.warnings {
                    println!("{} {}", "Warning:".yellow().bold(), warning);
                }
                for error in &report.errors {
                    println!("{} {}", "Error:".red().bold(), error);
                }
                if report.is_valid() {
                    println!(
                        "{} Configuration is valid ({})",
                        "OK".green().bold(),
                        ProjectConfig::settings_path(project_path).display()
                    );
                }
                report.into_result()
            }
        },

        Commands::Reset => {
            let store = StateStore::new(config.state_dir(project_path));
            store.reset()?;
            println!("{} Loop state cleared", "OK".green().bold());
            Ok(())
        }
    }
}

async fn start(config: ProjectConfig, project_path: &Path, fresh: bool) -> Result<()> {
    config.validate().into_result()?;

    if which::which("git").is_err() {
        return Err(AutorepairError::MissingTool {
            tool: "git".to_string(),
        });
    }

    let source = Arc::new(
        GhStatusSource::detect(project_path.to_path_buf(), config.branch.clone())?
            .with_workflow(config.workflow.clone())
            .with_fetch_timeout(config.fetch_timeout()),
    );
    let executor = RepairExecutor::new(
        source.clone(),
        Arc::new(RealGitOperations::new(project_path.to_path_buf())),
        Arc::new(ProcessRunner::new(project_path.to_path_buf())),
    );

    let stop = StopSignal::new();
    stop.stop_on_signals();

    let coordinator = LoopCoordinator::new(
        config.coordinator_config().with_fresh(fresh),
        source,
        config.classifier()?,
        config.strategies(),
        executor,
        StateStore::new(config.state_dir(project_path)),
    )
    .with_stop_signal(stop);

    println!(
        "{} Monitoring branch {} (max {} iterations, {} clean runs to finish)",
        "Start:".cyan().bold(),
        config.branch.bold(),
        config.max_iterations,
        config.clean_threshold
    );

    let summary = coordinator.run().await?;

    let label = match summary.termination {
        Termination::CleanThreshold => "OK".green().bold(),
        Termination::MaxIterations => "Done:".yellow().bold(),
        Termination::Stopped => "Stopped:".yellow().bold(),
    };
    println!(
        "{} {} after {} iteration(s), {} error(s) fixed, clean streak {}",
        label,
        summary.termination,
        summary.loop_count,
        summary.total_errors_fixed,
        summary.consecutive_clean_count
    );
    Ok(())
}

fn print_state(state: &LoopState, clean_threshold: u32, max_iterations: u32) {
    println!("{} {}", "Session:".cyan().bold(), state.session_id);
    println!("   Phase:            {}", state.phase);
    println!("   Iterations:       {}/{}", state.loop_count, max_iterations);
    println!(
        "   Clean streak:     {}/{}",
        state.consecutive_clean_count, clean_threshold
    );
    println!("   Errors fixed:     {}", state.total_errors_fixed);
    println!(
        "   Last scan:        {}",
        state
            .last_scan
            .map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
    );
    if let Some(outcome) = state.last_outcome {
        println!("   Last outcome:     {}", outcome);
    }
    if !state.retries_by_category.is_empty() {
        let used: Vec<String> = state
            .retries_by_category
            .iter()
            .map(|(category, n)| format!("{}={}", category, n))
            .collect();
        println!("   Attempts used:    {}", used.join(", "));
    }
    if state.active_repairs.is_empty() {
        println!("   Active repairs:   none");
    } else {
        for (run_id, attempt) in &state.active_repairs {
            println!(
                "   Active repair:    run {} '{}' since {}",
                run_id,
                attempt.action_name,
                attempt.started_at.to_rfc3339()
            );
        }
    }
}
