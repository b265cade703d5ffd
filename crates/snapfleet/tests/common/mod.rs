//! Helpers for running the snapfleet binary against a scratch root

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// A scratch filesystem root with its own configuration paths
pub struct CliTestContext {
    pub dir: TempDir,
}

impl CliTestContext {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn config(&self) -> PathBuf {
        self.root().join("config.yaml")
    }

    pub fn overrides(&self) -> PathBuf {
        self.root().join("generated.yaml")
    }

    pub fn write_config(&self, text: &str) {
        std::fs::write(self.config(), text).unwrap();
    }

    /// Run snapfleet with the scratch paths prepended
    pub fn run(&self, args: &[&str]) -> CliOutput {
        let output = Command::new(env!("CARGO_BIN_EXE_snapfleet"))
            .args(args)
            .arg("--root")
            .arg(self.root())
            .arg("--config")
            .arg(self.config())
            .arg("--overrides")
            .arg(self.overrides())
            .env("RUST_LOG", "warn")
            .output()
            .unwrap();
        CliOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

pub struct CliOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CliOutput {
    pub fn assert_code(&self, code: i32) -> &Self {
        assert_eq!(
            self.code,
            Some(code),
            "stdout:\n{}\nstderr:\n{}",
            self.stdout,
            self.stderr
        );
        self
    }

    pub fn assert_success(&self) -> &Self {
        self.assert_code(0)
    }

    pub fn assert_contains(&self, text: &str) -> &Self {
        assert!(
            self.stdout.contains(text),
            "stdout does not contain '{}':\n{}",
            text,
            self.stdout
        );
        self
    }

    pub fn assert_stderr_contains(&self, text: &str) -> &Self {
        assert!(
            self.stderr.contains(text),
            "stderr does not contain '{}':\n{}",
            text,
            self.stderr
        );
        self
    }
}
