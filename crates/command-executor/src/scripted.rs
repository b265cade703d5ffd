//! Scripted runner for tests
//!
//! Responds to commands by matching their rendered shell line against
//! registered prefixes, and records every command it was asked to run.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::runner::{Output, Runner};

struct Script {
    prefix: String,
    output: Output,
    once: bool,
}

/// A runner that replays canned outputs
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<Vec<Script>>,
    calls: Mutex<Vec<String>>,
    fallback: Option<Output>,
}

impl ScriptedRunner {
    /// Create a runner with no scripts; unmatched commands are errors
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every command starting with `prefix`
    pub fn on(self, prefix: impl Into<String>, output: Output) -> Self {
        self.push(prefix.into(), output, false);
        self
    }

    /// Answer the next command starting with `prefix`, then forget the script
    pub fn on_once(self, prefix: impl Into<String>, output: Output) -> Self {
        self.push(prefix.into(), output, true);
        self
    }

    /// Answer unmatched commands with `output` instead of failing
    pub fn with_fallback(mut self, output: Output) -> Self {
        self.fallback = Some(output);
        self
    }

    fn push(&self, prefix: String, output: Output, once: bool) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push(Script {
                prefix,
                output,
                once,
            });
        }
    }

    /// Every command run so far, rendered as shell lines
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of recorded commands starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn run(&self, command: &Command) -> Result<Output> {
        let line = command.to_shell_line();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line.clone());
        }

        let mut scripts = self
            .scripts
            .lock()
            .map_err(|_| Error::spawn_failed("scripted runner lock poisoned"))?;
        if let Some(pos) = scripts.iter().position(|s| line.starts_with(&s.prefix)) {
            let output = scripts[pos].output.clone();
            if scripts[pos].once {
                scripts.remove(pos);
            }
            return Ok(output);
        }

        self.fallback
            .clone()
            .ok_or(Error::Unscripted { command: line })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_once_scripts_are_consumed_in_order() {
        smol::block_on(async {
            let runner = ScriptedRunner::new()
                .on_once("systemctl is-active", Output::failed(3, "inactive"))
                .on("systemctl is-active", Output::ok("active"));
            let cmd = Command::builder("systemctl")
                .args(["is-active", "x.service"])
                .build();

            assert!(!runner.run(&cmd).await.unwrap().success());
            assert!(runner.run(&cmd).await.unwrap().success());
            assert!(runner.run(&cmd).await.unwrap().success());
            assert_eq!(runner.count("systemctl is-active"), 3);
        });
    }

    #[test]
    fn test_unscripted_is_an_error() {
        smol::block_on(async {
            let runner = ScriptedRunner::new();
            let result = runner.run(&Command::new("true")).await;
            assert!(matches!(result, Err(Error::Unscripted { .. })));
        });
    }
}
