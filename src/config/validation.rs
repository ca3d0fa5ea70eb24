//! Configuration validation for taskloop.
//!
//! Validation collects every problem instead of stopping at the first one, so
//! `taskloop validate` can print a complete report.
//!
//! # Example
//!
//! ```rust,ignore
//! use taskloop::config::{ConfigValidator, LoopConfig};
//!
//! let config = LoopConfig::load(project_dir)?;
//! let report = ConfigValidator::new(project_dir).validate(&config);
//! if !report.is_valid() {
//!     std::process::exit(report.exit_code());
//! }
//! ```

use std::path::{Path, PathBuf};

use super::{LoopConfig, TrackerBackend};
use crate::error::{LoopError, EXIT_ERROR};

/// Result of configuration validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Errors that prevent the configuration from being used.
    pub errors: Vec<String>,
    /// Warnings that don't prevent validity but indicate potential issues.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Create a new empty validation report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the configuration is valid (no errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns 0 if valid, the configuration exit code otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_valid() {
            0
        } else {
            EXIT_ERROR
        }
    }

    /// Generate a human-readable summary of the validation result.
    #[must_use]
    pub fn summary(&self) -> String {
        match (self.is_valid(), self.warnings.len()) {
            (true, 0) => "Configuration is valid.".to_string(),
            (true, n) => format!("Configuration is valid with {n} warning(s)."),
            (false, _) => format!(
                "Configuration is invalid with {} error(s).",
                self.errors.len()
            ),
        }
    }

    /// Convert into a `Result`, folding all errors into one message.
    pub fn into_result(self) -> crate::error::Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(LoopError::invalid("config", self.errors.join("; ")))
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Validates a [`LoopConfig`] against a project directory.
#[derive(Debug, Clone)]
pub struct ConfigValidator {
    project_dir: PathBuf,
}

impl ConfigValidator {
    #[must_use]
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        Self {
            project_dir: project_dir.as_ref().to_path_buf(),
        }
    }

    /// Check every section of the configuration.
    #[must_use]
    pub fn validate(&self, config: &LoopConfig) -> ValidationReport {
        let mut report = ValidationReport::new();

        self.check_agent(config, &mut report);
        self.check_tracker(config, &mut report);

        for (i, gate) in config.gates.commands.iter().enumerate() {
            if gate.is_empty() || gate[0].trim().is_empty() {
                report.error(format!("gates.commands[{i}] is empty"));
            }
        }
        if config.gates.timeout_secs == 0 {
            report.error("gates.timeout_secs must be greater than zero");
        }

        if config.review.is_enabled() {
            if config.review.ship_token.trim().is_empty() {
                report.error("review.ship_token must not be empty");
            }
            if config.review.timeout_secs == 0 {
                report.error("review.timeout_secs must be greater than zero");
            }
        }

        if config.limits.max_iterations == 0 {
            report.error("loop.max_iterations must be greater than zero");
        }
        if config.limits.no_progress_limit == 0 {
            report.error("loop.no_progress_limit must be greater than zero");
        }
        if config.limits.max_attempts == 0 {
            report.error("loop.max_attempts must be greater than zero");
        }

        if config.parallel.max_workers == 0 {
            report.error("parallel.max_workers must be greater than zero");
        }
        let prefix = &config.parallel.branch_prefix;
        if prefix.is_empty() || prefix.contains(char::is_whitespace) || prefix.contains("..") {
            report.error(format!("parallel.branch_prefix '{prefix}' is not a valid ref prefix"));
        }

        if !config.context.context_command.is_empty() && config.context.context_command[0].is_empty()
        {
            report.error("context.context_command program is empty");
        }

        report
    }

    fn check_agent(&self, config: &LoopConfig, report: &mut ValidationReport) {
        match config.agent.argv.first() {
            None => report.error("agent.argv must name a program"),
            Some(program) if program.trim().is_empty() => {
                report.error("agent.argv must name a program");
            }
            Some(program) => {
                if which::which(program).is_err() && !Path::new(program).exists() {
                    report.warning(format!("agent program '{program}' was not found on PATH"));
                }
            }
        }
        if config.agent.timeout_secs == 0 {
            report.error("agent.timeout_secs must be greater than zero");
        }
    }

    fn check_tracker(&self, config: &LoopConfig, report: &mut ValidationReport) {
        match config.tracker.backend {
            TrackerBackend::Markdown | TrackerBackend::Json => {
                let path = self.project_dir.join(config.tracker.document_path());
                if !path.exists() {
                    report.error(format!("task document {} does not exist", path.display()));
                }
            }
            TrackerBackend::Github => {
                if config.tracker.label.trim().is_empty() {
                    report.error("tracker.label must not be empty for the github backend");
                }
                if which::which("gh").is_err() {
                    report.warning("gh CLI was not found on PATH");
                }
            }
        }
    }
}
