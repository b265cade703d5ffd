//! Fleet-wide deployment
//!
//! Each host runs the same remote pipeline independently: trust its key,
//! probe it, copy the binary and configuration to a staging directory, then
//! run the role there. A failing host is recorded and the run moves on.

use crate::classify::{FailureKind, classify};
use crate::error::{ConnectivityError, Error, Result};
use crate::report::{DeploymentResult, FleetReport};
use crate::state::{HostState, HostTarget};
use crate::transport::{PROBE_TIMEOUT, RemoteTransport};
use crate::trust::{Confirmer, establish_trust};
use command_executor::{Command, Output};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// Remote directory each run's private staging directory is created in
pub const DEFAULT_STAGING_DIR: &str = "/tmp";

/// Deadline for the remote role run
pub const ROLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// What to copy to each host and how to run it there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePlan {
    /// Role argument passed to the remote binary
    pub role: String,
    /// Local binary to copy
    pub binary: PathBuf,
    /// Local base configuration document
    pub config: PathBuf,
    /// Local generated override document, if any
    pub overrides: Option<PathBuf>,
    /// Remote parent of the per-run staging directory
    pub staging_dir: String,
    /// Extra arguments for the remote run
    pub extra_args: Vec<String>,
}

impl RemotePlan {
    /// Copy `binary` and `config`, then run `<binary> <role>`
    pub fn new(
        role: impl Into<String>,
        binary: impl Into<PathBuf>,
        config: impl Into<PathBuf>,
    ) -> Self {
        Self {
            role: role.into(),
            binary: binary.into(),
            config: config.into(),
            overrides: None,
            staging_dir: DEFAULT_STAGING_DIR.to_string(),
            extra_args: Vec::new(),
        }
    }

    /// Also copy and pass a generated override document
    pub fn with_overrides(mut self, path: impl Into<PathBuf>) -> Self {
        self.overrides = Some(path.into());
        self
    }

    /// Create staging directories somewhere other than `/tmp`
    pub fn with_staging_dir(mut self, dir: impl Into<String>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    /// Append arguments to the remote run
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Local files to copy
    pub fn sources(&self) -> Vec<PathBuf> {
        let mut sources = vec![self.binary.clone(), self.config.clone()];
        sources.extend(self.overrides.clone());
        sources
    }

    /// Creates a fresh directory only the login user can write to
    ///
    /// The binary is later run as root, so it is never staged in a path
    /// another local user could have created first.
    pub fn stage_command(&self) -> Command {
        Command::builder("mktemp")
            .arg("-d")
            .arg(format!(
                "{}/snapfleet.XXXXXXXX",
                self.staging_dir.trim_end_matches('/')
            ))
            .timeout(PROBE_TIMEOUT)
            .build()
    }

    fn staged(staging: &str, local: &Path) -> String {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}/{}", staging.trim_end_matches('/'), name)
    }

    /// The command run on each host, with files staged in `staging`
    pub fn remote_command(&self, staging: &str) -> Command {
        let mut command = Command::new("sudo");
        command
            .arg("-n")
            .arg(Self::staged(staging, &self.binary))
            .arg(&self.role)
            .arg("--config")
            .arg(Self::staged(staging, &self.config));
        if let Some(overrides) = &self.overrides {
            command
                .arg("--overrides")
                .arg(Self::staged(staging, overrides));
        }
        command.args(&self.extra_args).timeout(ROLE_TIMEOUT);
        command
    }
}

/// Deploys a [`RemotePlan`] to many hosts
pub struct FleetOrchestrator<T, C> {
    transport: T,
    confirmer: C,
    plan: RemotePlan,
    parallel: bool,
    run_id: Uuid,
}

impl<T: RemoteTransport, C: Confirmer> FleetOrchestrator<T, C> {
    /// Sequential orchestration with a fresh run id
    pub fn new(transport: T, confirmer: C, plan: RemotePlan) -> Self {
        Self {
            transport,
            confirmer,
            plan,
            parallel: false,
            run_id: Uuid::new_v4(),
        }
    }

    /// Deploy to all hosts concurrently
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Identifier of this run
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Deploy to every host; one host's failure never stops the others
    ///
    /// Fails up front only if parallel mode was requested with a confirmer
    /// that may block on a human.
    pub async fn run(&self, hosts: &[HostTarget]) -> Result<FleetReport> {
        if self.parallel && self.confirmer.is_interactive() {
            return Err(Error::InteractiveParallel);
        }
        info!(
            run_id = %self.run_id,
            hosts = hosts.len(),
            parallel = self.parallel,
            role = %self.plan.role,
            "starting fleet run"
        );

        let results = if self.parallel {
            join_all(hosts.iter().map(|host| self.deploy(host))).await
        } else {
            let mut results = Vec::with_capacity(hosts.len());
            for host in hosts {
                results.push(self.deploy(host).await);
            }
            results
        };

        let report = FleetReport {
            run_id: self.run_id,
            results,
        };
        info!(run_id = %self.run_id, failed = report.failed(), "fleet run complete");
        Ok(report)
    }

    /// Drive one host to `Done` or `Failed`
    pub async fn deploy(&self, host: &HostTarget) -> DeploymentResult {
        let span = info_span!("deploy", run_id = %self.run_id, host = %host);
        async {
            let mut result = DeploymentResult::start(host.to_string(), &self.plan.role);
            let mut staging = None;
            let mut state = HostState::Unverified;
            while let Some(next) = state.next() {
                if let Err(e) = self.step(host, &next, &mut staging).await {
                    warn!(stage = next.name(), error = %e, "host failed");
                    result.fail(next, &e);
                    break;
                }
                info!(stage = next.name(), "stage reached");
                result.reached(next.clone());
                state = next;
            }
            if let Some(dir) = staging {
                self.clean_up(host, &dir).await;
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn step(
        &self,
        host: &HostTarget,
        stage: &HostState,
        staging: &mut Option<String>,
    ) -> Result<()> {
        match stage {
            HostState::HostKeyTrusted => {
                establish_trust(&self.transport, &self.confirmer, host).await?;
                Ok(())
            }
            HostState::Reachable => match self.probe(host).await {
                Err(e) if e.kind() == Some(FailureKind::AuthFailed) => {
                    let setup = FailureKind::AuthFailed.hint(host);
                    if !self.confirmer.confirm_auth_setup(host, &setup).await {
                        return Err(e);
                    }
                    info!("authentication set up by operator, probing again");
                    self.probe(host).await
                }
                other => other,
            },
            HostState::Syncing => {
                let dir = self.stage(host).await?;
                let dir = staging.insert(dir);
                let output = self
                    .transport
                    .sync(host, &self.plan.sources(), dir)
                    .await
                    .map_err(|e| command_error(host, e))?;
                check(host, stage, &output, true)
            }
            HostState::RoleExecuted => {
                let dir = staging.as_deref().ok_or_else(|| Error::RemoteFailed {
                    host: host.login(),
                    stage: stage.clone(),
                    code: None,
                    stderr: "files were never staged".to_string(),
                })?;
                let output = self.exec(host, &self.plan.remote_command(dir)).await?;
                check(host, stage, &output, false)
            }
            HostState::Unverified | HostState::Done | HostState::Failed { .. } => Ok(()),
        }
    }

    async fn probe(&self, host: &HostTarget) -> Result<()> {
        let probe = Command::builder("true").timeout(PROBE_TIMEOUT).build();
        let output = self.exec(host, &probe).await?;
        check(host, &HostState::Reachable, &output, true)
    }

    async fn stage(&self, host: &HostTarget) -> Result<String> {
        let output = self.exec(host, &self.plan.stage_command()).await?;
        check(host, &HostState::Syncing, &output, false)?;
        let dir = output.stdout_trimmed();
        if !dir.starts_with('/') || dir.contains('\n') {
            return Err(Error::RemoteFailed {
                host: host.login(),
                stage: HostState::Syncing,
                code: output.code,
                stderr: format!("mktemp returned an unusable path {:?}", dir),
            });
        }
        debug!(dir, "staging directory created");
        Ok(dir.to_string())
    }

    async fn clean_up(&self, host: &HostTarget, dir: &str) {
        let rm = Command::builder("rm")
            .arg("-rf")
            .arg("--")
            .arg(dir)
            .timeout(PROBE_TIMEOUT)
            .build();
        match self.exec(host, &rm).await {
            Ok(output) if output.success() => debug!(dir, "staging directory removed"),
            Ok(output) => warn!(dir, stderr = output.diagnostic(), "staging directory left behind"),
            Err(e) => warn!(dir, error = %e, "staging directory left behind"),
        }
    }

    async fn exec(&self, host: &HostTarget, command: &Command) -> Result<Output> {
        self.transport
            .exec(host, command)
            .await
            .map_err(|e| command_error(host, e))
    }
}

/// A timed-out remote command means the host stopped answering
fn command_error(host: &HostTarget, error: command_executor::Error) -> Error {
    match error {
        command_executor::Error::Timeout { .. } => ConnectivityError {
            target: host.clone(),
            kind: FailureKind::HostUnreachable,
            stderr: error.to_string(),
        }
        .into(),
        other => Error::Command(other),
    }
}

/// Turn a failed remote step into an error
///
/// Exit code 255 is ssh's own failure, so it counts as a connection problem
/// even when the text is not recognised. Other exits are matched against
/// connection messages only when the output comes from the connection
/// itself; a remote program's own "Permission denied" is not an
/// authentication failure.
fn check(host: &HostTarget, stage: &HostState, output: &Output, connection: bool) -> Result<()> {
    if output.success() {
        return Ok(());
    }
    let stderr = output.diagnostic().to_string();
    let ssh_failed = output.code == Some(255);
    if connection || ssh_failed {
        let kind = classify(&stderr);
        if kind != FailureKind::Unknown || ssh_failed {
            return Err(ConnectivityError {
                target: host.clone(),
                kind,
                stderr,
            }
            .into());
        }
    }
    Err(Error::RemoteFailed {
        host: host.login(),
        stage: stage.clone(),
        code: output.code,
        stderr,
    })
}
