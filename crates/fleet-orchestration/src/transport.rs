//! Remote execution and file synchronisation
//!
//! [`RemoteTransport`] is the seam between the orchestrator and the network.
//! [`SshTransport`] implements it with the OpenSSH client tools and `rsync`,
//! all run through a [`Runner`] so tests can script them.

use crate::error::TrustError;
use crate::state::HostTarget;
use async_trait::async_trait;
use command_executor::{Command, Output, Runner, SshConfig};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Deadline for key scans and reachability probes
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for copying files to a host
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(300);

/// A host key as fetched from the network, before it is trusted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    /// `known_hosts` lines, one per key type
    pub lines: Vec<String>,
    /// `SHA256:` fingerprints in the same order
    pub fingerprints: Vec<String>,
}

/// Talks to remote hosts
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Whether the host's key is already in the known hosts file
    async fn is_known(&self, host: &HostTarget) -> Result<bool, TrustError>;

    /// Fetch the host's keys out of band
    async fn fetch_host_key(&self, host: &HostTarget) -> Result<HostKey, TrustError>;

    /// Record a confirmed key in the known hosts file
    async fn trust(&self, host: &HostTarget, key: &HostKey) -> Result<(), TrustError>;

    /// Run a command on the host
    async fn exec(&self, host: &HostTarget, command: &Command)
    -> command_executor::Result<Output>;

    /// Copy local files into a directory on the host
    async fn sync(
        &self,
        host: &HostTarget,
        sources: &[PathBuf],
        remote_dir: &str,
    ) -> command_executor::Result<Output>;
}

#[async_trait]
impl<T: RemoteTransport + ?Sized> RemoteTransport for &T {
    async fn is_known(&self, host: &HostTarget) -> Result<bool, TrustError> {
        (**self).is_known(host).await
    }

    async fn fetch_host_key(&self, host: &HostTarget) -> Result<HostKey, TrustError> {
        (**self).fetch_host_key(host).await
    }

    async fn trust(&self, host: &HostTarget, key: &HostKey) -> Result<(), TrustError> {
        (**self).trust(host, key).await
    }

    async fn exec(
        &self,
        host: &HostTarget,
        command: &Command,
    ) -> command_executor::Result<Output> {
        (**self).exec(host, command).await
    }

    async fn sync(
        &self,
        host: &HostTarget,
        sources: &[PathBuf],
        remote_dir: &str,
    ) -> command_executor::Result<Output> {
        (**self).sync(host, sources, remote_dir).await
    }
}

#[async_trait]
impl<T: RemoteTransport + ?Sized> RemoteTransport for Arc<T> {
    async fn is_known(&self, host: &HostTarget) -> Result<bool, TrustError> {
        (**self).is_known(host).await
    }

    async fn fetch_host_key(&self, host: &HostTarget) -> Result<HostKey, TrustError> {
        (**self).fetch_host_key(host).await
    }

    async fn trust(&self, host: &HostTarget, key: &HostKey) -> Result<(), TrustError> {
        (**self).trust(host, key).await
    }

    async fn exec(
        &self,
        host: &HostTarget,
        command: &Command,
    ) -> command_executor::Result<Output> {
        (**self).exec(host, command).await
    }

    async fn sync(
        &self,
        host: &HostTarget,
        sources: &[PathBuf],
        remote_dir: &str,
    ) -> command_executor::Result<Output> {
        (**self).sync(host, sources, remote_dir).await
    }
}

/// [`RemoteTransport`] over the OpenSSH client and rsync
pub struct SshTransport<R> {
    runner: R,
    known_hosts: PathBuf,
}

impl<R: Runner> SshTransport<R> {
    /// Run tools through `runner`, trusting keys recorded in `known_hosts`
    pub fn new(runner: R, known_hosts: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            known_hosts: known_hosts.into(),
        }
    }

    /// The known hosts file in use
    pub fn known_hosts(&self) -> &Path {
        &self.known_hosts
    }

    fn ssh_config(&self, host: &HostTarget) -> SshConfig {
        let mut config = SshConfig::new(&host.address).with_known_hosts(&self.known_hosts);
        if let Some(user) = &host.user {
            config = config.with_user(user);
        }
        if let Some(port) = host.port {
            config = config.with_port(port);
        }
        if let Some(identity) = &host.identity {
            config = config.with_identity_file(identity);
        }
        config
    }

    async fn fingerprints(
        &self,
        host: &HostTarget,
        lines: &[String],
    ) -> Result<Vec<String>, TrustError> {
        let persist_err = |source: std::io::Error| TrustError::Persist {
            path: PathBuf::from("(scratch key file)"),
            source,
        };
        let mut scratch = tempfile::NamedTempFile::new().map_err(persist_err)?;
        for line in lines {
            writeln!(scratch, "{}", line).map_err(persist_err)?;
        }
        scratch.as_file().sync_all().map_err(persist_err)?;

        let output = self
            .runner
            .run(
                &Command::builder("ssh-keygen")
                    .arg("-lf")
                    .arg(scratch.path())
                    .timeout(PROBE_TIMEOUT)
                    .build(),
            )
            .await?;
        if !output.success() {
            return Err(TrustError::KeyUnavailable {
                host: host.address.clone(),
                reason: output.diagnostic().to_string(),
            });
        }
        Ok(parse_fingerprints(&output.stdout))
    }
}

/// `SHA256:` fingerprints from `ssh-keygen -l` output
pub fn parse_fingerprints(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter(|fp| fp.contains(':'))
        .map(str::to_string)
        .collect()
}

/// Key lines from `ssh-keyscan` output, comments dropped
pub fn parse_keyscan(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl<R: Runner> RemoteTransport for SshTransport<R> {
    async fn is_known(&self, host: &HostTarget) -> Result<bool, TrustError> {
        if !self.known_hosts.exists() {
            return Ok(false);
        }
        let output = self
            .runner
            .run(
                &Command::builder("ssh-keygen")
                    .arg("-F")
                    .arg(host.known_hosts_name())
                    .arg("-f")
                    .arg(&self.known_hosts)
                    .timeout(PROBE_TIMEOUT)
                    .build(),
            )
            .await?;
        Ok(output.success() && !output.stdout_trimmed().is_empty())
    }

    async fn fetch_host_key(&self, host: &HostTarget) -> Result<HostKey, TrustError> {
        let mut scan = Command::new("ssh-keyscan");
        scan.args(["-T", "10"]);
        if let Some(port) = host.port {
            scan.arg("-p").arg(port.to_string());
        }
        scan.arg(&host.address).timeout(PROBE_TIMEOUT);
        let output = self.runner.run(&scan).await?;

        let lines = parse_keyscan(&output.stdout);
        if lines.is_empty() {
            let reason = match output.diagnostic() {
                "" => "no keys returned".to_string(),
                text => text.to_string(),
            };
            return Err(TrustError::KeyUnavailable {
                host: host.address.clone(),
                reason,
            });
        }
        let fingerprints = self.fingerprints(host, &lines).await?;
        debug!(host = %host, keys = lines.len(), "fetched host keys");
        Ok(HostKey {
            lines,
            fingerprints,
        })
    }

    async fn trust(&self, _host: &HostTarget, key: &HostKey) -> Result<(), TrustError> {
        let persist_err = |source: std::io::Error| TrustError::Persist {
            path: self.known_hosts.clone(),
            source,
        };
        if let Some(dir) = self.known_hosts.parent() {
            std::fs::create_dir_all(dir).map_err(persist_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.known_hosts)
            .map_err(persist_err)?;
        for line in &key.lines {
            writeln!(file, "{}", line).map_err(persist_err)?;
        }
        file.sync_all().map_err(persist_err)?;
        info!(known_hosts = %self.known_hosts.display(), "recorded host key");
        Ok(())
    }

    async fn exec(
        &self,
        host: &HostTarget,
        command: &Command,
    ) -> command_executor::Result<Output> {
        self.runner.run(&self.ssh_config(host).wrap(command)).await
    }

    async fn sync(
        &self,
        host: &HostTarget,
        sources: &[PathBuf],
        remote_dir: &str,
    ) -> command_executor::Result<Output> {
        let config = self.ssh_config(host);
        let mut ssh = vec!["ssh".to_string()];
        ssh.extend(config.ssh_options());
        let shell = ssh
            .iter()
            .map(|part| command_executor::shell_escape(part))
            .collect::<Vec<_>>()
            .join(" ");

        let mut rsync = Command::new("rsync");
        rsync.args(["-az", "--timeout=30", "-e"]).arg(shell);
        rsync.args(sources);
        rsync
            .arg(format!("{}:{}/", config.host_string(), remote_dir))
            .timeout(SYNC_TIMEOUT);
        self.runner.run(&rsync).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use command_executor::ScriptedRunner;

    const KEYSCAN: &str = "# 10.0.0.5:22 SSH-2.0-OpenSSH_9.2\n\
                           10.0.0.5 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKx\n";

    #[smol_potat::test]
    async fn test_fetch_host_key() {
        let runner = ScriptedRunner::new()
            .on("ssh-keyscan -T 10 10.0.0.5", Output::ok(KEYSCAN))
            .on(
                "ssh-keygen -lf",
                Output::ok("256 SHA256:q3Xf0kV7 10.0.0.5 (ED25519)\n"),
            );
        let dir = tempfile::tempdir().unwrap();
        let transport = SshTransport::new(&runner, dir.path().join("known_hosts"));

        let key = transport
            .fetch_host_key(&HostTarget::new("10.0.0.5"))
            .await
            .unwrap();
        assert_eq!(key.lines, vec!["10.0.0.5 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKx"]);
        assert_eq!(key.fingerprints, vec!["SHA256:q3Xf0kV7"]);
    }

    #[smol_potat::test]
    async fn test_no_keys_is_key_unavailable() {
        let runner = ScriptedRunner::new().on(
            "ssh-keyscan",
            Output::failed(1, "getaddrinfo kitchen: Name or service not known"),
        );
        let transport = SshTransport::new(&runner, "/nonexistent/known_hosts");
        let err = transport
            .fetch_host_key(&HostTarget::new("kitchen").with_port(2222))
            .await
            .unwrap_err();
        assert!(matches!(err, TrustError::KeyUnavailable { .. }));
        assert_eq!(runner.calls()[0], "ssh-keyscan -T 10 -p 2222 kitchen");
    }

    #[smol_potat::test]
    async fn test_trust_appends_and_is_known() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("ssh").join("known_hosts");
        let runner = ScriptedRunner::new().on(
            "ssh-keygen -F 10.0.0.5",
            Output::ok("10.0.0.5 ssh-ed25519 AAAA\n"),
        );
        let transport = SshTransport::new(&runner, &known_hosts);
        let host = HostTarget::new("10.0.0.5");

        // Missing file means unknown without running anything
        assert!(!transport.is_known(&host).await.unwrap());
        assert!(runner.calls().is_empty());

        let key = HostKey {
            lines: vec!["10.0.0.5 ssh-ed25519 AAAA".to_string()],
            fingerprints: vec!["SHA256:abc".to_string()],
        };
        transport.trust(&host, &key).await.unwrap();
        let contents = std::fs::read_to_string(&known_hosts).unwrap();
        assert!(contents.starts_with("10.0.0.5 ssh-ed25519 AAAA\n"));

        assert!(transport.is_known(&host).await.unwrap());
    }

    #[smol_potat::test]
    async fn test_exec_and_sync_use_strict_options() {
        let runner = ScriptedRunner::new().with_fallback(Output::ok(""));
        let transport = SshTransport::new(&runner, "/home/op/.ssh/known_hosts");
        let host = HostTarget::new("10.0.0.5").with_user("pi");

        transport
            .exec(&host, &Command::builder("true").build())
            .await
            .unwrap();
        transport
            .sync(
                &host,
                &[PathBuf::from("/usr/local/bin/snapfleet")],
                "/tmp/snapfleet.k3Jd81xQ",
            )
            .await
            .unwrap();

        let calls = runner.calls();
        assert!(calls[0].starts_with("ssh -o BatchMode=yes -o ConnectTimeout=10"));
        assert!(calls[0].contains("UserKnownHostsFile=/home/op/.ssh/known_hosts"));
        assert!(calls[0].ends_with("pi@10.0.0.5 true"));
        assert!(calls[1].starts_with("rsync -az --timeout=30 -e "));
        assert!(calls[1].ends_with("/usr/local/bin/snapfleet pi@10.0.0.5:/tmp/snapfleet.k3Jd81xQ/"));
    }
}
