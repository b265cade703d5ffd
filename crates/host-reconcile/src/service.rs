//! Service manager access and the managed-unit lifecycle

use async_trait::async_trait;
use command_executor::{Command, Output, Runner};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Wait before the second active-state check after a start or restart
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(3);

/// Number of log lines attached to a failed start
pub const LOG_LINES: usize = 20;

/// Service manager errors
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The unit did not reach the active state after the bounded wait
    #[error("{unit} is not active after start{}", format_logs(logs))]
    NotActive {
        /// Unit name
        unit: String,
        /// Most recent log lines for the unit
        logs: Vec<String>,
    },

    /// A service manager verb exited non-zero
    #[error("systemctl {verb} {unit} failed: {stderr}")]
    CommandFailed {
        /// Verb that failed
        verb: String,
        /// Unit it was applied to
        unit: String,
        /// Captured diagnostic text
        stderr: String,
    },

    /// The command could not be run at all
    #[error("Command execution error: {0}")]
    Command(#[from] command_executor::Error),
}

fn format_logs(logs: &[String]) -> String {
    if logs.is_empty() {
        String::new()
    } else {
        format!("\nrecent log lines:\n  {}", logs.join("\n  "))
    }
}

impl ServiceError {
    /// A copy-pasteable command that addresses the error, when one is known
    pub fn remediation(&self) -> Option<String> {
        match self {
            ServiceError::NotActive { unit, .. } => {
                Some(format!("sudo journalctl -u {} -n 50 --no-pager", unit))
            }
            ServiceError::CommandFailed { unit, .. } => {
                Some(format!("sudo systemctl status {}", unit))
            }
            ServiceError::Command(_) => None,
        }
    }
}

/// Result type for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Unit file enablement as reported by the service manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enablement {
    /// Started at boot
    Enabled,
    /// Installed but not started at boot
    Disabled,
    /// Linked to /dev/null and cannot be started
    Masked,
    /// No install section; pulled in by other units only
    Static,
    /// The unit file does not exist
    NotFound,
    /// Any other state, verbatim
    Other(String),
}

impl Enablement {
    /// Parse `systemctl is-enabled` output
    pub fn parse(text: &str) -> Self {
        match text.trim() {
            "enabled" | "enabled-runtime" => Enablement::Enabled,
            "disabled" => Enablement::Disabled,
            "masked" | "masked-runtime" => Enablement::Masked,
            "static" | "indirect" | "generated" | "alias" => Enablement::Static,
            "" | "not-found" => Enablement::NotFound,
            other => Enablement::Other(other.to_string()),
        }
    }
}

/// The host's service manager
///
/// Verbs are used exactly as named; implementations must not add implicit
/// behaviour such as starting on enable.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Enable the unit at boot
    async fn enable(&self, unit: &str) -> Result<()>;
    /// Disable the unit at boot
    async fn disable(&self, unit: &str) -> Result<()>;
    /// Mask the unit so it cannot be started
    async fn mask(&self, unit: &str) -> Result<()>;
    /// Remove a mask
    async fn unmask(&self, unit: &str) -> Result<()>;
    /// Start the unit
    async fn start(&self, unit: &str) -> Result<()>;
    /// Stop the unit
    async fn stop(&self, unit: &str) -> Result<()>;
    /// Restart the unit
    async fn restart(&self, unit: &str) -> Result<()>;
    /// Whether the unit is active
    async fn is_active(&self, unit: &str) -> Result<bool>;
    /// Enablement state of the unit file
    async fn enablement(&self, unit: &str) -> Result<Enablement>;
    /// Path of the unit file the manager loaded, if any
    async fn unit_source(&self, unit: &str) -> Result<Option<PathBuf>>;
    /// The unit's start command line
    async fn start_command(&self, unit: &str) -> Result<String>;
    /// All installed service unit names
    async fn list_units(&self) -> Result<Vec<String>>;
    /// Reload unit files from disk
    async fn daemon_reload(&self) -> Result<()>;
    /// The last `lines` log lines of the unit
    async fn recent_logs(&self, unit: &str, lines: usize) -> Result<Vec<String>>;
}

#[async_trait]
impl<S: ServiceManager + ?Sized> ServiceManager for &S {
    async fn enable(&self, unit: &str) -> Result<()> {
        (**self).enable(unit).await
    }

    async fn disable(&self, unit: &str) -> Result<()> {
        (**self).disable(unit).await
    }

    async fn mask(&self, unit: &str) -> Result<()> {
        (**self).mask(unit).await
    }

    async fn unmask(&self, unit: &str) -> Result<()> {
        (**self).unmask(unit).await
    }

    async fn start(&self, unit: &str) -> Result<()> {
        (**self).start(unit).await
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        (**self).stop(unit).await
    }

    async fn restart(&self, unit: &str) -> Result<()> {
        (**self).restart(unit).await
    }

    async fn is_active(&self, unit: &str) -> Result<bool> {
        (**self).is_active(unit).await
    }

    async fn enablement(&self, unit: &str) -> Result<Enablement> {
        (**self).enablement(unit).await
    }

    async fn unit_source(&self, unit: &str) -> Result<Option<PathBuf>> {
        (**self).unit_source(unit).await
    }

    async fn start_command(&self, unit: &str) -> Result<String> {
        (**self).start_command(unit).await
    }

    async fn list_units(&self) -> Result<Vec<String>> {
        (**self).list_units().await
    }

    async fn daemon_reload(&self) -> Result<()> {
        (**self).daemon_reload().await
    }

    async fn recent_logs(&self, unit: &str, lines: usize) -> Result<Vec<String>> {
        (**self).recent_logs(unit, lines).await
    }
}

#[async_trait]
impl<S: ServiceManager + ?Sized> ServiceManager for Arc<S> {
    async fn enable(&self, unit: &str) -> Result<()> {
        (**self).enable(unit).await
    }

    async fn disable(&self, unit: &str) -> Result<()> {
        (**self).disable(unit).await
    }

    async fn mask(&self, unit: &str) -> Result<()> {
        (**self).mask(unit).await
    }

    async fn unmask(&self, unit: &str) -> Result<()> {
        (**self).unmask(unit).await
    }

    async fn start(&self, unit: &str) -> Result<()> {
        (**self).start(unit).await
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        (**self).stop(unit).await
    }

    async fn restart(&self, unit: &str) -> Result<()> {
        (**self).restart(unit).await
    }

    async fn is_active(&self, unit: &str) -> Result<bool> {
        (**self).is_active(unit).await
    }

    async fn enablement(&self, unit: &str) -> Result<Enablement> {
        (**self).enablement(unit).await
    }

    async fn unit_source(&self, unit: &str) -> Result<Option<PathBuf>> {
        (**self).unit_source(unit).await
    }

    async fn start_command(&self, unit: &str) -> Result<String> {
        (**self).start_command(unit).await
    }

    async fn list_units(&self) -> Result<Vec<String>> {
        (**self).list_units().await
    }

    async fn daemon_reload(&self) -> Result<()> {
        (**self).daemon_reload().await
    }

    async fn recent_logs(&self, unit: &str, lines: usize) -> Result<Vec<String>> {
        (**self).recent_logs(unit, lines).await
    }
}

/// [`ServiceManager`] backed by `systemctl` and `journalctl`
pub struct Systemctl<R> {
    runner: R,
}

impl<R: Runner> Systemctl<R> {
    /// Issue commands through `runner`
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    async fn query(&self, args: &[&str]) -> Result<Output> {
        let cmd = Command::builder("systemctl").args(args).build();
        debug!(command = %cmd, "querying service manager");
        Ok(self.runner.run(&cmd).await?)
    }

    async fn verb(&self, verb: &str, unit: &str) -> Result<()> {
        let output = self.query(&[verb, unit]).await?;
        if output.success() {
            debug!(verb, unit, "systemctl succeeded");
            Ok(())
        } else {
            Err(ServiceError::CommandFailed {
                verb: verb.to_string(),
                unit: unit.to_string(),
                stderr: output.diagnostic().to_string(),
            })
        }
    }

    async fn show(&self, unit: &str, property: &str) -> Result<String> {
        let output = self
            .query(&["show", "--property", property, "--value", unit])
            .await?;
        if !output.success() {
            return Err(ServiceError::CommandFailed {
                verb: format!("show --property {}", property),
                unit: unit.to_string(),
                stderr: output.diagnostic().to_string(),
            });
        }
        Ok(output.stdout_trimmed().to_string())
    }
}

#[async_trait]
impl<R: Runner> ServiceManager for Systemctl<R> {
    async fn enable(&self, unit: &str) -> Result<()> {
        self.verb("enable", unit).await
    }

    async fn disable(&self, unit: &str) -> Result<()> {
        self.verb("disable", unit).await
    }

    async fn mask(&self, unit: &str) -> Result<()> {
        self.verb("mask", unit).await
    }

    async fn unmask(&self, unit: &str) -> Result<()> {
        self.verb("unmask", unit).await
    }

    async fn start(&self, unit: &str) -> Result<()> {
        self.verb("start", unit).await
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        self.verb("stop", unit).await
    }

    async fn restart(&self, unit: &str) -> Result<()> {
        self.verb("restart", unit).await
    }

    async fn is_active(&self, unit: &str) -> Result<bool> {
        // Non-zero exit simply means "not active"
        Ok(self.query(&["is-active", "--quiet", unit]).await?.success())
    }

    async fn enablement(&self, unit: &str) -> Result<Enablement> {
        let output = self.query(&["is-enabled", unit]).await?;
        Ok(Enablement::parse(output.stdout_trimmed()))
    }

    async fn unit_source(&self, unit: &str) -> Result<Option<PathBuf>> {
        let path = self.show(unit, "FragmentPath").await?;
        Ok((!path.is_empty()).then(|| PathBuf::from(path)))
    }

    async fn start_command(&self, unit: &str) -> Result<String> {
        self.show(unit, "ExecStart").await
    }

    async fn list_units(&self) -> Result<Vec<String>> {
        let output = self
            .query(&[
                "list-unit-files",
                "--type=service",
                "--no-legend",
                "--plain",
            ])
            .await?;
        if !output.success() {
            return Err(ServiceError::CommandFailed {
                verb: "list-unit-files".to_string(),
                unit: "*".to_string(),
                stderr: output.diagnostic().to_string(),
            });
        }
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter(|name| name.ends_with(".service"))
            .map(str::to_string)
            .collect())
    }

    async fn daemon_reload(&self) -> Result<()> {
        let output = self.query(&["daemon-reload"]).await?;
        if output.success() {
            Ok(())
        } else {
            Err(ServiceError::CommandFailed {
                verb: "daemon-reload".to_string(),
                unit: "(all units)".to_string(),
                stderr: output.diagnostic().to_string(),
            })
        }
    }

    async fn recent_logs(&self, unit: &str, lines: usize) -> Result<Vec<String>> {
        let cmd = Command::builder("journalctl")
            .args(["-u", unit, "-n", &lines.to_string(), "--no-pager", "--output=cat"])
            .build();
        let output = self.runner.run(&cmd).await?;
        Ok(output.stdout.lines().map(str::to_string).collect())
    }
}

/// What the lifecycle manager did to a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    /// The unit was running and was restarted
    Restarted,
    /// The unit was not running and was started
    Started,
    /// The unit was already enabled and running; nothing was disturbed
    AlreadyRunning,
}

/// Drives managed units to enabled and running
pub struct ServiceLifecycle<S> {
    manager: S,
    settle: Duration,
}

impl<S: ServiceManager> ServiceLifecycle<S> {
    /// Manage units through `manager`
    pub fn new(manager: S) -> Self {
        Self {
            manager,
            settle: DEFAULT_SETTLE,
        }
    }

    /// Override the wait between active-state checks
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Restart (or start) a unit whose inputs changed
    pub async fn enable_restart(&self, unit: &str) -> Result<ServiceAction> {
        self.unmask_if_masked(unit).await?;
        self.manager.enable(unit).await?;
        let action = if self.manager.is_active(unit).await? {
            self.manager.restart(unit).await?;
            ServiceAction::Restarted
        } else {
            self.manager.start(unit).await?;
            ServiceAction::Started
        };
        info!(unit, ?action, "applied changed configuration");
        self.verify(unit).await?;
        Ok(action)
    }

    /// Ensure a unit whose inputs did not change is unmasked, enabled and running
    ///
    /// A running unit is never restarted here.
    pub async fn converge(&self, unit: &str) -> Result<ServiceAction> {
        self.unmask_if_masked(unit).await?;
        if self.manager.enablement(unit).await? != Enablement::Enabled {
            self.manager.enable(unit).await?;
        }
        if self.manager.is_active(unit).await? {
            debug!(unit, "already running");
            return Ok(ServiceAction::AlreadyRunning);
        }
        self.manager.start(unit).await?;
        info!(unit, "started");
        self.verify(unit).await?;
        Ok(ServiceAction::Started)
    }

    /// [`enable_restart`](Self::enable_restart) if `changed`, else [`converge`](Self::converge)
    pub async fn apply(&self, unit: &str, changed: bool) -> Result<ServiceAction> {
        if changed {
            self.enable_restart(unit).await
        } else {
            self.converge(unit).await
        }
    }

    async fn unmask_if_masked(&self, unit: &str) -> Result<()> {
        if self.manager.enablement(unit).await? == Enablement::Masked {
            info!(unit, "unmasking");
            self.manager.unmask(unit).await?;
        }
        Ok(())
    }

    async fn verify(&self, unit: &str) -> Result<()> {
        if self.manager.is_active(unit).await? {
            return Ok(());
        }
        async_io::Timer::after(self.settle).await;
        if self.manager.is_active(unit).await? {
            return Ok(());
        }
        let logs = self
            .manager
            .recent_logs(unit, LOG_LINES)
            .await
            .unwrap_or_else(|e| vec![format!("(logs unavailable: {})", e)]);
        warn!(unit, "unit did not become active");
        Err(ServiceError::NotActive {
            unit: unit.to_string(),
            logs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use command_executor::ScriptedRunner;

    #[smol_potat::test]
    async fn test_systemctl_issues_named_verbs() {
        let runner = ScriptedRunner::new().with_fallback(Output::ok(""));
        let systemctl = Systemctl::new(&runner);
        systemctl.enable("a.service").await.unwrap();
        systemctl.mask("b.service").await.unwrap();
        systemctl.daemon_reload().await.unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "systemctl enable a.service",
                "systemctl mask b.service",
                "systemctl daemon-reload",
            ]
        );
    }

    #[smol_potat::test]
    async fn test_systemctl_queries() {
        let runner = ScriptedRunner::new()
            .on("systemctl is-active --quiet up", Output::ok(""))
            .on("systemctl is-active", Output::failed(3, ""))
            .on(
                "systemctl is-enabled",
                Output {
                    code: Some(1),
                    stdout: "masked\n".to_string(),
                    stderr: String::new(),
                },
            )
            .on(
                "systemctl show --property FragmentPath --value x.service",
                Output::ok("/lib/systemd/system/x.service\n"),
            )
            .on(
                "systemctl list-unit-files",
                Output::ok("a.service enabled enabled\nb.socket enabled enabled\nc.service disabled enabled\n"),
            );
        let systemctl = Systemctl::new(&runner);

        assert!(systemctl.is_active("up.service").await.unwrap());
        assert!(!systemctl.is_active("down.service").await.unwrap());
        assert_eq!(
            systemctl.enablement("x.service").await.unwrap(),
            Enablement::Masked
        );
        assert_eq!(
            systemctl.unit_source("x.service").await.unwrap(),
            Some(PathBuf::from("/lib/systemd/system/x.service"))
        );
        assert_eq!(
            systemctl.list_units().await.unwrap(),
            vec!["a.service", "c.service"]
        );
    }

    #[smol_potat::test]
    async fn test_failed_verb_carries_diagnostic() {
        let runner = ScriptedRunner::new().on(
            "systemctl start",
            Output::failed(5, "Unit x.service not found."),
        );
        let err = Systemctl::new(&runner).start("x.service").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert_eq!(
            err.remediation().as_deref(),
            Some("sudo systemctl status x.service")
        );
    }

    #[test]
    fn test_enablement_parsing() {
        assert_eq!(Enablement::parse("enabled\n"), Enablement::Enabled);
        assert_eq!(Enablement::parse("masked"), Enablement::Masked);
        assert_eq!(Enablement::parse(""), Enablement::NotFound);
        assert_eq!(
            Enablement::parse("linked"),
            Enablement::Other("linked".to_string())
        );
    }
}
