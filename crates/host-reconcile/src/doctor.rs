//! Read-only health checks
//!
//! The doctor never changes host state. Every check yields one [`Finding`]
//! with a severity and a remediation command, whether it passed or not.

use crate::product::{
    Component, DEFAULT_CONTROL_PORT, DEFAULT_FIFO_PATH, DEFAULT_HTTP_PORT, DEFAULT_STREAM_PORT,
    Role,
};
use crate::service::{Enablement, ServiceManager};
use async_trait::async_trait;
use futures_lite::FutureExt;
use serde::Serialize;
use snapfleet_config::ResolvedConfig;
use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Timeout for one port probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// How much a failing check matters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    /// Blocks core function
    MustFix,
    /// Degrades diagnostics or non-essential function
    Optional,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::MustFix => "must-fix",
            Severity::Optional => "optional",
        })
    }
}

/// The result of one check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// What was checked, e.g. `port 1704`
    pub subject: String,
    /// Whether the check passed
    pub ok: bool,
    /// Severity if the check fails
    pub severity: Severity,
    /// Observed state
    pub detail: String,
    /// Command that fixes a failure
    pub remediation: String,
}

impl Finding {
    /// A finding for a check that passed or failed
    pub fn new(
        subject: impl Into<String>,
        ok: bool,
        severity: Severity,
        detail: impl Into<String>,
        remediation: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            ok,
            severity,
            detail: detail.into(),
            remediation: remediation.into(),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ok {
            write!(f, "[ok]       {}: {}", self.subject, self.detail)
        } else {
            write!(
                f,
                "[{}] {}: {}\n           fix: {}",
                self.severity, self.subject, self.detail, self.remediation
            )
        }
    }
}

/// A set of findings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    /// Findings in check order
    pub findings: Vec<Finding>,
}

impl Report {
    /// Add a finding
    pub fn push(&mut self, finding: Finding) {
        self.findings.push(finding);
    }

    /// Failing findings
    pub fn failures(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| !f.ok)
    }

    /// Number of failing must-fix findings
    pub fn must_fix(&self) -> usize {
        self.failures()
            .filter(|f| f.severity == Severity::MustFix)
            .count()
    }

    /// Process exit code: non-zero only for failing must-fix findings, and
    /// never in advisory mode
    pub fn exit_code(&self, advisory: bool) -> i32 {
        if advisory || self.must_fix() == 0 { 0 } else { 1 }
    }

    /// The finding for `subject`, if any
    pub fn find(&self, subject: &str) -> Option<&Finding> {
        self.findings.iter().find(|f| f.subject == subject)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for finding in &self.findings {
            writeln!(f, "{}", finding)?;
        }
        write!(
            f,
            "{} check(s), {} failing, {} must-fix",
            self.findings.len(),
            self.failures().count(),
            self.must_fix()
        )
    }
}

/// Detects whether something listens on a TCP port
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Whether `host:port` accepts connections
    async fn is_listening(&self, host: &str, port: u16) -> bool;
}

#[async_trait]
impl<P: PortProbe + ?Sized> PortProbe for &P {
    async fn is_listening(&self, host: &str, port: u16) -> bool {
        (**self).is_listening(host, port).await
    }
}

/// [`PortProbe`] that attempts a TCP connection with a short timeout
#[derive(Debug, Clone, Copy)]
pub struct TcpConnect {
    timeout: Duration,
}

impl Default for TcpConnect {
    fn default() -> Self {
        Self {
            timeout: PROBE_TIMEOUT,
        }
    }
}

impl TcpConnect {
    /// Probe with a custom timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PortProbe for TcpConnect {
    async fn is_listening(&self, host: &str, port: u16) -> bool {
        let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                debug!(host, port, error = %e, "could not resolve probe target");
                return false;
            }
        };
        for addr in addrs {
            let connect = async { async_io::Async::<TcpStream>::connect(addr).await.is_ok() };
            let timeout = async {
                async_io::Timer::after(self.timeout).await;
                false
            };
            if connect.or(timeout).await {
                return true;
            }
        }
        false
    }
}

/// Runs the read-only health checks
pub struct Doctor<S, P> {
    manager: S,
    probe: P,
}

impl<S: ServiceManager, P: PortProbe> Doctor<S, P> {
    /// Check through `manager` and `probe`
    pub fn new(manager: S, probe: P) -> Self {
        Self { manager, probe }
    }

    /// Check every component of `role` against `config`
    pub async fn check(&self, role: Role, config: &ResolvedConfig) -> Report {
        let mut report = Report::default();
        for component in role.components() {
            self.check_unit(component.canonical_unit(), &mut report).await;
            match component {
                Component::Server => self.check_server(config, &mut report).await,
                Component::Client => self.check_client(role, config, &mut report).await,
            }
        }
        report
    }

    async fn check_unit(&self, unit: &str, report: &mut Report) {
        match self.manager.enablement(unit).await {
            Ok(state) => report.push(Finding::new(
                format!("{} enabled", unit),
                state == Enablement::Enabled,
                Severity::MustFix,
                format!("{:?}", state).to_lowercase(),
                format!("sudo systemctl unmask {0} && sudo systemctl enable {0}", unit),
            )),
            Err(e) => report.push(Finding::new(
                format!("{} enabled", unit),
                false,
                Severity::MustFix,
                e.to_string(),
                format!("sudo systemctl status {}", unit),
            )),
        }

        let active = self.manager.is_active(unit).await;
        report.push(Finding::new(
            format!("{} active", unit),
            matches!(active, Ok(true)),
            Severity::MustFix,
            match active {
                Ok(true) => "active".to_string(),
                Ok(false) => "inactive".to_string(),
                Err(e) => e.to_string(),
            },
            format!(
                "sudo systemctl restart {0} && sudo journalctl -u {0} -n 50 --no-pager",
                unit
            ),
        ));
    }

    async fn check_server(&self, config: &ResolvedConfig, report: &mut Report) {
        let ports = [
            ("stream_port", DEFAULT_STREAM_PORT, Severity::MustFix),
            ("control_port", DEFAULT_CONTROL_PORT, Severity::MustFix),
            ("http_port", DEFAULT_HTTP_PORT, Severity::Optional),
        ];
        for (key, default, severity) in ports {
            let port = match config.nested_port("server", key, default) {
                Ok(port) => port,
                Err(e) => {
                    report.push(Finding::new(
                        format!("server.{}", key),
                        false,
                        severity,
                        e.to_string(),
                        format!("set server.{} to a port number in /etc/snapfleet/config.yaml", key),
                    ));
                    continue;
                }
            };
            let listening = self.probe.is_listening("127.0.0.1", port).await;
            report.push(Finding::new(
                format!("port {}", port),
                listening,
                severity,
                if listening {
                    "listening".to_string()
                } else {
                    format!("nothing listening on 127.0.0.1:{} ({})", port, key)
                },
                format!(
                    "sudo systemctl restart {} && sudo ss -ltnp 'sport = :{}'",
                    Component::Server.canonical_unit(),
                    port
                ),
            ));
        }

        let fifo = config.nested_or("server", "fifo_path", DEFAULT_FIFO_PATH);
        report.push(check_fifo(Path::new(fifo)));
    }

    async fn check_client(&self, role: Role, config: &ResolvedConfig, report: &mut Report) {
        let host = match config.nested("client", "server_host") {
            Some(host) => host,
            None if role == Role::Combined => "127.0.0.1",
            None => {
                report.push(Finding::new(
                    "client.server_host",
                    false,
                    Severity::MustFix,
                    "no server configured",
                    "sudo snapfleet init --role client --server <address>",
                ));
                return;
            }
        };
        let port = config
            .nested_port("server", "stream_port", DEFAULT_STREAM_PORT)
            .unwrap_or(DEFAULT_STREAM_PORT);
        let reachable = self.probe.is_listening(host, port).await;
        report.push(Finding::new(
            format!("server {}:{}", host, port),
            reachable,
            Severity::Optional,
            if reachable { "reachable" } else { "unreachable" },
            format!("nc -zv -w 2 {} {}", host, port),
        ));
    }
}

/// Check that `path` exists and is a FIFO
pub fn check_fifo(path: &Path) -> Finding {
    use std::os::unix::fs::FileTypeExt;
    let subject = format!("fifo {}", path.display());
    let create = format!("sudo mkfifo -m 0666 {}", path.display());
    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => {
            Finding::new(subject, true, Severity::MustFix, "present", create)
        }
        Ok(_) => Finding::new(
            subject,
            false,
            Severity::MustFix,
            "exists but is not a FIFO",
            format!("sudo mv {0} {0}.bak && {1}", path.display(), create),
        ),
        Err(_) => Finding::new(subject, false, Severity::MustFix, "missing", create),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakePortProbe, FakeServiceManager, FakeUnit};

    fn healthy_server() -> FakeServiceManager {
        FakeServiceManager::new().with_unit(
            "snapfleet-server.service",
            FakeUnit::new().enabled().active(),
        )
    }

    #[smol_potat::test]
    async fn test_missing_listener_is_must_fix_then_passes() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("snapfifo");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::from_bits_truncate(0o666)).unwrap();
        let config = ResolvedConfig::from_pairs([
            ("server.stream_port", "1704"),
            ("server.fifo_path", fifo.to_str().unwrap()),
        ]);
        let services = healthy_server();

        let probe = FakePortProbe::new().listening("127.0.0.1", 1705);
        let report = Doctor::new(&services, &probe).check(Role::Server, &config).await;
        let finding = report.find("port 1704").unwrap();
        assert!(!finding.ok);
        assert_eq!(finding.severity, Severity::MustFix);
        assert!(finding.remediation.contains("1704"));
        assert_eq!(report.exit_code(false), 1);
        assert_eq!(report.exit_code(true), 0);

        let probe = FakePortProbe::new()
            .listening("127.0.0.1", 1704)
            .listening("127.0.0.1", 1705);
        let report = Doctor::new(&services, &probe).check(Role::Server, &config).await;
        assert!(report.find("port 1704").unwrap().ok);
        // Only the optional HTTP port is down
        assert_eq!(report.must_fix(), 0);
        assert!(!report.find("port 1780").unwrap().ok);
        assert_eq!(report.exit_code(false), 0);
    }

    #[test]
    fn test_fifo_type_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapfifo");
        assert_eq!(check_fifo(&path).detail, "missing");
        std::fs::write(&path, "").unwrap();
        let finding = check_fifo(&path);
        assert!(!finding.ok);
        assert_eq!(finding.detail, "exists but is not a FIFO");
    }

    #[smol_potat::test]
    async fn test_client_without_server_host() {
        let services = FakeServiceManager::new().with_unit(
            "snapfleet-client.service",
            FakeUnit::new().enabled().active(),
        );
        let probe = FakePortProbe::new();
        let report = Doctor::new(&services, &probe)
            .check(Role::Client, &ResolvedConfig::default())
            .await;
        assert!(!report.find("client.server_host").unwrap().ok);
        assert!(report.find("snapfleet-client.service active").unwrap().ok);
    }

    #[smol_potat::test]
    async fn test_inactive_unit_reported() {
        let services = FakeServiceManager::new()
            .with_unit("snapfleet-client.service", FakeUnit::new().masked());
        let probe = FakePortProbe::new().listening("10.0.0.2", 1704);
        let config = ResolvedConfig::from_pairs([("client.server_host", "10.0.0.2")]);
        let report = Doctor::new(&services, &probe).check(Role::Client, &config).await;

        let enabled = report.find("snapfleet-client.service enabled").unwrap();
        assert!(!enabled.ok);
        assert_eq!(enabled.detail, "masked");
        assert!(report.find("server 10.0.0.2:1704").unwrap().ok);
    }

    #[smol_potat::test]
    async fn test_tcp_connect_probe() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpConnect::default();
        assert!(probe.is_listening("127.0.0.1", port).await);
        drop(listener);
        assert!(!probe.is_listening("127.0.0.1", port).await);
    }
}
