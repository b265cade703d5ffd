//! Local process execution backend

use async_io::Timer;
use async_process::Stdio;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{debug, warn};

use crate::command::Command;
use crate::error::{Error, Result};
use crate::runner::{Output, Runner};

/// Default deadline for commands that do not set their own
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Runner for executing processes on the local host
///
/// Stdin is closed, stdout and stderr are captured, and the child is killed
/// if it outlives its deadline.
#[derive(Debug, Clone, Copy)]
pub struct LocalRunner {
    default_timeout: Duration,
}

impl LocalRunner {
    /// Create a local runner with the default deadline
    pub fn new() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the deadline used for commands that do not set one
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for LocalRunner {
    async fn run(&self, command: &Command) -> Result<Output> {
        let mut async_cmd = command.prepare();
        async_cmd.stdin(Stdio::null());
        async_cmd.stdout(Stdio::piped());
        async_cmd.stderr(Stdio::piped());
        async_cmd.kill_on_drop(true);

        let child = async_cmd.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                Error::CommandNotFound {
                    command: command.get_program().to_string_lossy().into_owned(),
                }
            } else {
                Error::spawn_failed(format!("Failed to spawn {}: {}", command, e))
            }
        })?;

        let timeout = command.get_timeout().unwrap_or(self.default_timeout);
        debug!(command = %command, timeout_secs = timeout.as_secs(), "running command");

        // Dropping the losing branch drops the child, which kills it
        let finished = futures_lite::future::or(async { child.output().await.map(Some) }, async {
            Timer::after(timeout).await;
            Ok(None)
        })
        .await?;

        match finished {
            Some(output) => {
                let output = Output::from(output);
                if !output.success() {
                    debug!(command = %command, code = ?output.code, "command exited non-zero");
                }
                Ok(output)
            }
            None => {
                warn!(command = %command, "command exceeded its deadline");
                Err(Error::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captures_stdout_and_exit_code() {
        smol::block_on(async {
            let runner = LocalRunner::new();
            let cmd = Command::builder("sh")
                .arg("-c")
                .arg("echo out; echo err >&2; exit 3")
                .build();

            let output = runner.run(&cmd).await.unwrap();
            assert_eq!(output.code, Some(3));
            assert_eq!(output.stdout_trimmed(), "out");
            assert_eq!(output.diagnostic(), "err");
        });
    }

    #[test]
    fn test_env_and_working_directory() {
        smol::block_on(async {
            let runner = LocalRunner::new();
            let cmd = Command::builder("sh")
                .arg("-c")
                .arg("echo $TEST_VAR; pwd")
                .env("TEST_VAR", "test_value")
                .current_dir("/")
                .build();

            let output = runner.run(&cmd).await.unwrap();
            assert!(output.success());
            assert_eq!(output.stdout, "test_value\n/\n");
        });
    }

    #[test]
    fn test_missing_program() {
        smol::block_on(async {
            let runner = LocalRunner::new();
            let cmd = Command::new("this_command_does_not_exist_12345");

            match runner.run(&cmd).await {
                Err(Error::CommandNotFound { command }) => {
                    assert_eq!(command, "this_command_does_not_exist_12345")
                }
                other => panic!("expected CommandNotFound, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_timeout_kills_command() {
        smol::block_on(async {
            let runner = LocalRunner::new();
            let cmd = Command::builder("sleep")
                .arg("5")
                .timeout(Duration::from_millis(100))
                .build();

            let started = std::time::Instant::now();
            let result = runner.run(&cmd).await;
            assert!(matches!(result, Err(Error::Timeout { .. })));
            assert!(started.elapsed() < Duration::from_secs(4));
        });
    }
}
