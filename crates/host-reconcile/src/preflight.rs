//! Read-only checks run before touching a host

use crate::doctor::{Finding, Report, Severity};
use snapfleet_config::ConfigResolver;
use std::path::{Path, PathBuf};

/// Host tools the reconciler shells out to, with the package providing each
pub const REQUIRED_TOOLS: [(&str, &str); 5] = [
    ("systemctl", "systemd"),
    ("apt-get", "apt"),
    ("dpkg-query", "dpkg"),
    ("dpkg-deb", "dpkg"),
    ("curl", "curl"),
];

/// Preflight checker
#[derive(Debug, Clone)]
pub struct Preflight {
    search_path: Vec<PathBuf>,
    is_root: bool,
}

impl Preflight {
    /// Check against the current process's `PATH` and effective user
    pub fn from_env() -> Self {
        let search_path = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();
        Self {
            search_path,
            is_root: nix::unistd::geteuid().is_root(),
        }
    }

    /// Check against explicit inputs
    pub fn new(search_path: Vec<PathBuf>, is_root: bool) -> Self {
        Self {
            search_path,
            is_root,
        }
    }

    /// Run every check; `resolver` is resolved once to validate configuration
    pub fn run(&self, resolver: &ConfigResolver) -> Report {
        let mut report = Report::default();

        for (tool, package) in REQUIRED_TOOLS {
            let found = self.locate(tool);
            report.push(Finding::new(
                format!("tool {}", tool),
                found.is_some(),
                Severity::MustFix,
                found
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "not found on PATH".to_string()),
                format!("sudo apt-get install -y {}", package),
            ));
        }

        report.push(Finding::new(
            "root privileges",
            self.is_root,
            Severity::MustFix,
            if self.is_root { "running as root" } else { "not running as root" },
            "sudo snapfleet preflight",
        ));

        let (ok, detail, fix) = match resolver.resolve() {
            Ok(config) => (
                true,
                format!(
                    "{} key(s), profile {}",
                    config.len(),
                    config.profile().unwrap_or("(none)")
                ),
                String::new(),
            ),
            Err(e) => (
                false,
                e.to_string(),
                e.remediation()
                    .unwrap_or_else(|| "sudoedit /etc/snapfleet/config.yaml".to_string()),
            ),
        };
        report.push(Finding::new("configuration", ok, Severity::MustFix, detail, fix));

        report
    }

    fn locate(&self, tool: &str) -> Option<PathBuf> {
        self.search_path
            .iter()
            .map(|dir| dir.join(tool))
            .find(|candidate| is_executable_file(candidate))
    }
}

fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
