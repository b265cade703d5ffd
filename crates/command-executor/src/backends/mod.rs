//! Backend implementations for different execution contexts
//!
//! This module provides built-in runners for common execution contexts.
//! Runners compose: [`SshRunner`] wraps any inner runner and rewrites each
//! command into an `ssh` invocation before delegating.
//!
//! # Example
//!
//! ```ignore
//! use command_executor::{Command, Runner};
//! use command_executor::backends::{LocalRunner, SshConfig, SshRunner};
//!
//! let remote = SshRunner::new(LocalRunner::new(), SshConfig::new("10.0.0.5").with_user("pi"));
//! let output = remote.run(&Command::builder("uname").arg("-a").build()).await?;
//! ```

pub mod local;
pub use local::LocalRunner;

pub mod ssh;
pub use ssh::{SshConfig, SshRunner};
