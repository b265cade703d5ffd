//! Runner trait for executing commands to completion

use async_trait::async_trait;

use crate::command::Command;
use crate::error::Result;

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    /// Exit code if the process exited normally
    pub code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl Output {
    /// Build a successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Build a failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the process exited successfully (code 0)
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Trimmed stdout
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Trimmed stderr, falling back to stdout when stderr is empty
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

impl From<std::process::Output> for Output {
    fn from(output: std::process::Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Something that can run a command to completion and capture its output
///
/// A non-zero exit code is not an error at this level; callers decide what a
/// failure means. Errors are reserved for commands that could not be run at
/// all or that exceeded their deadline.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run the command and capture its output
    async fn run(&self, command: &Command) -> Result<Output>;
}

#[async_trait]
impl<R: Runner + ?Sized> Runner for &R {
    async fn run(&self, command: &Command) -> Result<Output> {
        (**self).run(command).await
    }
}

#[async_trait]
impl<R: Runner + ?Sized> Runner for std::sync::Arc<R> {
    async fn run(&self, command: &Command) -> Result<Output> {
        (**self).run(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_diagnostic_prefers_stderr() {
        let output = Output {
            code: Some(1),
            stdout: "partial\n".to_string(),
            stderr: "  boom \n".to_string(),
        };
        assert_eq!(output.diagnostic(), "boom");
        assert!(!output.success());

        let output = Output {
            code: Some(1),
            stdout: "only stdout\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(output.diagnostic(), "only stdout");
    }
}
