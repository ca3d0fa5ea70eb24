//! taskloop - unattended agent build loops
//!
//! Command-line front end over [`taskloop::Orchestrator`].

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use taskloop::{
    ConfigValidator, LoopConfig, LoopDependencies, LoopError, MergePolicy, Orchestrator,
    ParallelSummary, RunSummary, StatusReport, Step, Strategy, WorkerStatus, EXIT_COMPLETE,
};

#[derive(Parser)]
#[command(name = "taskloop")]
#[command(version)]
#[command(about = "Drive an agent through a task list with gates, receipts and parallel workspaces", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "TASKLOOP_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the loop until every task is done or a backstop fires
    Run {
        /// Dispatch open tasks to concurrent workers in isolated worktrees
        #[arg(long)]
        parallel: bool,

        /// Maximum agent invocations for this run
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Concurrent workers (parallel mode)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Dispatch strategy (parallel mode)
        #[arg(long, value_enum)]
        strategy: Option<Strategy>,

        /// What happens to successful worker branches (parallel mode)
        #[arg(long, value_enum)]
        merge_policy: Option<MergePolicy>,
    },

    /// Run exactly one attempt against the next selectable task
    Step,

    /// Show loop state and the next selectable task
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Return a blocked task to open
    Unblock {
        /// Task id
        id: String,
    },

    /// Validate configuration and the task document
    Validate {
        /// Print the effective configuration as TOML
        #[arg(long)]
        print: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.log_json);

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

    let mut config = match LoopConfig::load(&project_path) {
        Ok(config) => config,
        Err(e) => fail(&e),
    };

    match cli.command {
        Commands::Validate { print } => {
            let code = validate(&config, &project_path, true);
            if print {
                println!("{}", config.to_toml()?);
            }
            std::process::exit(code);
        }

        Commands::Run {
            parallel,
            max_iterations,
            workers,
            strategy,
            merge_policy,
        } => {
            if let Some(n) = max_iterations {
                config.limits.max_iterations = n;
            }
            if let Some(n) = workers {
                config.parallel.max_workers = n;
            }
            if let Some(strategy) = strategy {
                config.parallel.strategy = strategy;
            }
            if let Some(policy) = merge_policy {
                config.parallel.merge_policy = policy;
            }

            let code = validate(&config, &project_path, false);
            if code != EXIT_COMPLETE {
                std::process::exit(code);
            }

            let orchestrator = open(config, &project_path);
            let handle = orchestrator.handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("{} finishing in-flight work, then stopping", "Interrupt:".yellow().bold());
                    handle.stop();
                }
            });

            let code = if parallel {
                match orchestrator.run_parallel().await {
                    Ok(summary) => print_parallel(&summary),
                    Err(e) => fail(&e),
                }
            } else {
                match orchestrator.run(None).await {
                    Ok(summary) => print_run(&summary),
                    Err(e) => fail(&e),
                }
            };
            std::process::exit(code);
        }

        Commands::Step => {
            let code = validate(&config, &project_path, false);
            if code != EXIT_COMPLETE {
                std::process::exit(code);
            }

            let orchestrator = open(config, &project_path);
            match orchestrator.step().await {
                Ok(Step::Ran { summary, blocked }) => {
                    let mark = if summary.completed {
                        "done".green().bold()
                    } else {
                        "not done".yellow().bold()
                    };
                    println!("{} task {} ({})", "Attempt:".bold(), summary.task_id, mark);
                    if let Some(reason) = &summary.failure {
                        println!("  {} {}", "Failure:".red(), reason);
                    }
                    if let Some(reason) = blocked {
                        println!("  {} {}", "Blocked:".red().bold(), reason);
                    }
                    if let Some(receipt) = &summary.receipt {
                        println!("  {} {}", "Receipt:".dimmed(), receipt.display());
                    }
                }
                Ok(Step::Exit(exit)) => {
                    println!("{} {}", "Nothing to run:".yellow().bold(), exit);
                    std::process::exit(exit.code());
                }
                Err(e) => fail(&e),
            }
        }

        Commands::Status { json } => {
            let orchestrator = open(config, &project_path);
            let report = match orchestrator.status().await {
                Ok(report) => report,
                Err(e) => fail(&e),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_status(&report);
            }
        }

        Commands::Unblock { id } => {
            let orchestrator = open(config, &project_path);
            if let Err(e) = orchestrator.unblock(&id).await {
                fail(&e);
            }
            println!("{} task {} is open again", "Unblocked:".green().bold(), id);
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose {
        "taskloop=debug,info"
    } else {
        "taskloop=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Print the validation report and return its exit code.
fn validate(config: &LoopConfig, project_path: &Path, always_report: bool) -> i32 {
    let report = ConfigValidator::new(project_path).validate(config);
    for warning in &report.warnings {
        eprintln!("{} {}", "Warning:".yellow().bold(), warning);
    }
    for error in &report.errors {
        eprintln!("{} {}", "Error:".red().bold(), error);
    }
    if always_report || !report.is_valid() {
        let summary = if report.is_valid() {
            report.summary().green()
        } else {
            report.summary().red()
        };
        println!("{summary}");
    }
    report.exit_code()
}

fn open(config: LoopConfig, project_path: &Path) -> Orchestrator {
    LoopDependencies::real(&config, project_path)
        .and_then(|deps| Orchestrator::new(config, project_path, deps))
        .unwrap_or_else(|e| fail(&e))
}

fn fail(err: &LoopError) -> ! {
    eprintln!("{} {}", "Error:".red().bold(), err);
    std::process::exit(err.exit_code());
}

fn print_run(summary: &RunSummary) -> i32 {
    let headline = format!("Loop finished: {}", summary.exit);
    if summary.exit_code() == EXIT_COMPLETE {
        println!("{}", headline.green().bold());
    } else {
        println!("{}", headline.yellow().bold());
    }
    println!("  Attempts:  {}", summary.attempts);
    println!("  Completed: {}", join_or_dash(&summary.completed));
    println!("  Blocked:   {}", join_or_dash(&summary.blocked));
    summary.exit_code()
}

fn print_parallel(summary: &ParallelSummary) -> i32 {
    let headline = format!(
        "Parallel run finished: {} succeeded, {} failed",
        summary.succeeded(),
        summary.failed()
    );
    if summary.exit_code == EXIT_COMPLETE {
        println!("{}", headline.green().bold());
    } else {
        println!("{}", headline.yellow().bold());
    }
    for worker in &summary.workers {
        let status = match worker.status {
            WorkerStatus::Success => "success".green(),
            WorkerStatus::Failed => "failed".red(),
            WorkerStatus::Queued => "queued".dimmed(),
            WorkerStatus::Running => "running".cyan(),
        };
        println!(
            "  worker {:>3}  task {:<12} {:<8} {}",
            worker.worker_id,
            worker.task.id,
            status,
            worker.branch_name.as_deref().unwrap_or("-")
        );
        if let Some(error) = &worker.error {
            println!("              {}", error.dimmed());
        }
    }
    for (task, reason) in &summary.skipped {
        println!("  {} {} ({})", "skipped".yellow(), task, reason);
    }
    if !summary.blocked.is_empty() {
        println!("  Blocked: {}", summary.blocked.join(", "));
    }
    if summary.stopped {
        println!("  {}", "Stopped before every task was dispatched".yellow());
    }
    summary.exit_code
}

fn print_status(report: &StatusReport) {
    println!("{}", "Loop status".bold());
    println!("  Tracker:      {}", report.tracker);
    println!(
        "  Tasks:        {} total, {} open, {} done, {} blocked",
        report.counts.total, report.counts.open, report.counts.done, report.counts.blocked
    );
    println!("  Invocations:  {}", report.invocation_count);
    println!("  No progress:  {}", report.no_progress_streak);
    println!("  History:      {}", report.history_len);

    if let Some(last) = &report.last_attempt {
        let outcome = match &last.failure {
            None if last.completed => "completed".green(),
            None => "no change".yellow(),
            Some(_) => "failed".red(),
        };
        println!(
            "  Last attempt: task {} at {} ({})",
            last.task_id,
            last.finished_at.format("%Y-%m-%d %H:%M:%S"),
            outcome
        );
    }

    match &report.next_task {
        Some(task) => println!("  Next task:    {}", task.to_string().cyan()),
        None => println!("  Next task:    {}", "none".dimmed()),
    }

    if !report.blocked_tasks.is_empty() {
        println!("{}", "Blocked".red().bold());
        for (id, reason) in &report.blocked_tasks {
            println!("  {id}: {reason}");
        }
    }
    for cycle in &report.cycles {
        println!("{} {}", "Cycle:".yellow().bold(), cycle.join(" -> "));
    }
    if let Some(diagnostic) = &report.diagnostic {
        println!("{} {}", "Diagnostic:".yellow().bold(), diagnostic);
    }
}

fn join_or_dash(ids: &[String]) -> String {
    if ids.is_empty() {
        "-".to_string()
    } else {
        ids.join(", ")
    }
}
