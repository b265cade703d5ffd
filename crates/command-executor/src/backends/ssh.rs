//! SSH remote execution backend using the CLI

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::command::Command;
use crate::error::Result;
use crate::runner::{Output, Runner};

/// Connect timeout passed to every ssh invocation
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// SSH connection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    /// Target host (hostname or IP)
    host: String,
    /// SSH user (optional, uses system default if not specified)
    user: Option<String>,
    /// SSH port (optional, defaults to 22)
    port: Option<u16>,
    /// Path to identity file (private key)
    identity_file: Option<PathBuf>,
    /// Known hosts file to verify against (optional, ssh default otherwise)
    known_hosts: Option<PathBuf>,
    /// Additional SSH arguments
    extra_args: Vec<String>,
}

impl SshConfig {
    /// Create a new SSH configuration for the given host
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            identity_file: None,
            known_hosts: None,
            extra_args: Vec::new(),
        }
    }

    /// Set the SSH user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the identity file (private key)
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Verify host keys against this known_hosts file
    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = Some(path.into());
        self
    }

    /// Add extra SSH arguments
    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Host name or address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port, if one was set
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Get the host string (user@host if user is specified)
    pub fn host_string(&self) -> String {
        if let Some(user) = &self.user {
            format!("{}@{}", user, self.host)
        } else {
            self.host.clone()
        }
    }

    /// Options shared by `ssh` and the `ssh -e` handed to rsync
    ///
    /// Host keys are checked strictly: trust is established explicitly
    /// beforehand, never on first use.
    pub fn ssh_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", CONNECT_TIMEOUT.as_secs()),
            "-o".to_string(),
            "StrictHostKeyChecking=yes".to_string(),
        ];
        if let Some(known_hosts) = &self.known_hosts {
            opts.push("-o".to_string());
            opts.push(format!("UserKnownHostsFile={}", known_hosts.display()));
        }
        if let Some(port) = self.port {
            opts.push("-p".to_string());
            opts.push(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            opts.push("-i".to_string());
            opts.push(identity.to_string_lossy().into_owned());
        }
        opts.extend(self.extra_args.iter().cloned());
        opts
    }

    /// Wrap a command so it runs on the remote host
    pub fn wrap(&self, command: &Command) -> Command {
        let mut ssh_cmd = Command::new("ssh");
        ssh_cmd.args(self.ssh_options());
        ssh_cmd.arg(self.host_string());
        ssh_cmd.arg(command.to_shell_line());
        if let Some(timeout) = command.get_timeout() {
            ssh_cmd.timeout(timeout);
        }
        ssh_cmd
    }
}

/// SSH runner that wraps another runner for remote execution
#[derive(Debug, Clone)]
pub struct SshRunner<R> {
    inner: R,
    config: SshConfig,
}

impl<R> SshRunner<R> {
    /// Create a new SSH runner wrapping the given inner runner
    pub fn new(inner: R, config: SshConfig) -> Self {
        Self { inner, config }
    }

    /// The connection settings
    pub fn config(&self) -> &SshConfig {
        &self.config
    }
}

impl SshRunner<crate::backends::local::LocalRunner> {
    /// Convenience constructor for SSH wrapping LocalRunner
    pub fn to_host(host: impl Into<String>) -> Self {
        Self {
            inner: crate::backends::local::LocalRunner::new(),
            config: SshConfig::new(host),
        }
    }
}

#[async_trait]
impl<R> Runner for SshRunner<R>
where
    R: Runner,
{
    async fn run(&self, command: &Command) -> Result<Output> {
        self.inner.run(&self.config.wrap(command)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_config() {
        let config = SshConfig::new("example.com")
            .with_user("alice")
            .with_port(2222)
            .with_identity_file("/home/alice/.ssh/id_ed25519");

        assert_eq!(config.host_string(), "alice@example.com");
        assert_eq!(config.port(), Some(2222));
        let opts = config.ssh_options();
        assert!(opts.contains(&"BatchMode=yes".to_string()));
        assert!(opts.contains(&"ConnectTimeout=10".to_string()));
        assert!(opts.contains(&"StrictHostKeyChecking=yes".to_string()));
    }

    #[test]
    fn test_wrap_escapes_remote_command() {
        let config = SshConfig::new("10.0.0.5").with_user("pi");
        let remote = Command::builder("echo").arg("hello world").build();

        let wrapped = config.wrap(&remote);
        assert_eq!(wrapped.get_program(), "ssh");
        let args = wrapped.get_args();
        assert_eq!(args[args.len() - 2], "pi@10.0.0.5");
        assert_eq!(args[args.len() - 1], "echo 'hello world'");
    }
}
