//! Test doubles for the loop's external seams.
//!
//! The drivers talk to the outside world through two traits:
//! [`AgentRunner`](crate::agent::AgentRunner) and [`Git`](crate::git::Git).
//! This module provides controllable implementations of both so the whole
//! loop can run deterministically inside a temp directory.
//!
//! # Example
//!
//! ```rust,ignore
//! use taskloop::testing::{MockAgent, MockGit, MockReply};
//!
//! let agent = MockAgent::new("mock", |_| MockReply::output("EXIT_SIGNAL: false"));
//! let git = MockGit::new().with_conflict("task-3", &["src/lib.rs"]);
//! ```

pub mod mocks;

pub use mocks::*;
