//! taskloop - unattended agent build loops
//!
//! Drives an external agent process against a durable task list, one
//! bounded and recorded attempt at a time, until every task is done, every
//! remaining task is blocked, or a backstop fires.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`tracker`] - Task storage backends behind one selection contract
//! - [`iteration`] - One attempt: context, agent, gates, review, receipt
//! - [`controller`] - Sequential loop state machine
//! - [`parallel`] - Worker pool over isolated git worktrees
//! - [`state`] - Durable loop state with atomic writes
//! - [`orchestrator`] - Control surface (`step`, `run`, `status`, stop/pause)
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Error types and exit codes
//! - [`testing`] - Mock agent and git for deterministic runs
//!
//! # Example
//!
//! ```rust,ignore
//! use taskloop::{LoopConfig, LoopDependencies, Orchestrator};
//!
//! let config = LoopConfig::load(&project_dir)?;
//! let deps = LoopDependencies::real(&config, &project_dir)?;
//! let orchestrator = Orchestrator::new(config, &project_dir, deps)?;
//!
//! let summary = orchestrator.run(None).await?;
//! std::process::exit(summary.exit_code());
//! ```

pub mod agent;
pub mod atomic;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod gates;
pub mod git;
pub mod iteration;
pub mod orchestrator;
pub mod parallel;
pub mod process;
pub mod receipt;
pub mod review;
pub mod state;
pub mod testing;
pub mod tracker;

// Re-export commonly used types
pub use error::{LoopError, Result, EXIT_COMPLETE, EXIT_ERROR, EXIT_INCOMPLETE};

pub use config::{ConfigValidator, LoopConfig, MergePolicy, Strategy, ValidationReport};

pub use controller::{LoopExit, LoopHandle, RunSummary, Step};
pub use iteration::{Attempt, IterationEngine, IterationRequest};
pub use orchestrator::{LoopDependencies, Orchestrator, StatusReport};
pub use parallel::{ParallelSummary, Worker, WorkerStatus};
pub use state::{AttemptSummary, LoopState, StateStore};
pub use tracker::{Task, TaskStatus, Tracker};
