//! Runtime-agnostic command execution library
//!
//! This crate provides a unified interface for running commands to completion
//! across different contexts: the local host and remote SSH hosts. Every run
//! captures the exit code plus stdout and stderr, and is bounded by a deadline.

#![warn(missing_docs)]

pub mod backends;
pub mod command;
pub mod error;
pub mod runner;
#[cfg(any(test, feature = "test-utils"))]
pub mod scripted;

pub use backends::{LocalRunner, SshConfig, SshRunner};
pub use command::{Command, CommandBuilder, shell_escape};
pub use error::{Error, Result};
pub use runner::{Output, Runner};
#[cfg(any(test, feature = "test-utils"))]
pub use scripted::ScriptedRunner;
