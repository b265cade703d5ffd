//! Connection failure classification
//!
//! The transport only hands back an exit code and captured error text, so
//! failures are classified by matching well-known `ssh` and `rsync`
//! messages. The match is case-insensitive and ordered: a changed host key
//! is reported as such even when the same output also mentions a refused
//! authentication.

use crate::state::HostTarget;
use command_executor::shell_escape;
use serde::Serialize;
use std::fmt;

/// Why a host could not be talked to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    /// The host refused our credentials
    AuthFailed,
    /// The host could not be reached at all
    HostUnreachable,
    /// The host presented a key different from the trusted one
    HostKeyMismatch,
    /// Anything else
    Unknown,
}

const HOST_KEY_MISMATCH: &[&str] = &[
    "remote host identification has changed",
    "host key verification failed",
    "host key mismatch",
    "offending",
];

const AUTH_FAILED: &[&str] = &[
    "permission denied",
    "authentication failed",
    "too many authentication failures",
    "no supported authentication methods",
    "sudo: a password is required",
];

const HOST_UNREACHABLE: &[&str] = &[
    "could not resolve hostname",
    "name or service not known",
    "temporary failure in name resolution",
    "connection timed out",
    "operation timed out",
    "connection refused",
    "no route to host",
    "network is unreachable",
    "connection closed by remote host",
];

impl FailureKind {
    /// Copy-pasteable command that helps with this failure on `host`
    pub fn hint(&self, host: &HostTarget) -> String {
        let port = host.port.filter(|p| *p != 22);
        let port_flag = |flag: &str| {
            port.map(|p| format!("{} {} ", flag, p))
                .unwrap_or_default()
        };
        match self {
            FailureKind::AuthFailed => format!("ssh-copy-id {}{}", port_flag("-p"), host.login()),
            FailureKind::HostUnreachable => format!(
                "ping -c 3 {0} && nc -zv -w 5 {0} {1}",
                host.address,
                port.unwrap_or(22)
            ),
            FailureKind::HostKeyMismatch => format!(
                "ssh-keygen -R {} # then verify the new key out of band",
                shell_escape(&host.known_hosts_name())
            ),
            FailureKind::Unknown => format!("ssh -v {}{} true", port_flag("-p"), host.login()),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::AuthFailed => "authentication failed",
            FailureKind::HostUnreachable => "host unreachable",
            FailureKind::HostKeyMismatch => "host key mismatch",
            FailureKind::Unknown => "unknown failure",
        })
    }
}

/// Classify captured error text
pub fn classify(stderr: &str) -> FailureKind {
    let text = stderr.to_lowercase();
    let any = |patterns: &[&str]| patterns.iter().any(|p| text.contains(p));
    if any(HOST_KEY_MISMATCH) {
        FailureKind::HostKeyMismatch
    } else if any(AUTH_FAILED) {
        FailureKind::AuthFailed
    } else if any(HOST_UNREACHABLE) {
        FailureKind::HostUnreachable
    } else {
        FailureKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ssh_messages() {
        assert_eq!(
            classify("pi@10.0.0.5: Permission denied (publickey,password)."),
            FailureKind::AuthFailed
        );
        assert_eq!(
            classify("ssh: connect to host 10.0.0.9 port 22: No route to host"),
            FailureKind::HostUnreachable
        );
        assert_eq!(
            classify("ssh: Could not resolve hostname kitchen.local: Name or service not known"),
            FailureKind::HostUnreachable
        );
        assert_eq!(classify("rsync: write failed: disk full"), FailureKind::Unknown);
    }

    #[test]
    fn test_mismatch_wins_over_auth() {
        let stderr = "@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@\n\
                      @    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @\n\
                      Host key verification failed.\n\
                      Permission denied";
        assert_eq!(classify(stderr), FailureKind::HostKeyMismatch);
    }

    #[test]
    fn test_hints_are_distinct() {
        let host = HostTarget::new("10.0.0.5").with_user("pi");
        let kinds = [
            FailureKind::AuthFailed,
            FailureKind::HostUnreachable,
            FailureKind::HostKeyMismatch,
            FailureKind::Unknown,
        ];
        let hints: std::collections::BTreeSet<String> =
            kinds.iter().map(|k| k.hint(&host)).collect();
        assert_eq!(hints.len(), kinds.len());
        assert_eq!(
            FailureKind::HostKeyMismatch.hint(&host),
            "ssh-keygen -R 10.0.0.5 # then verify the new key out of band"
        );
        assert_eq!(FailureKind::AuthFailed.hint(&host), "ssh-copy-id pi@10.0.0.5");
    }

    #[test]
    fn test_hints_carry_non_default_port() {
        let host = HostTarget::new("10.0.0.5").with_user("pi").with_port(2222);
        assert_eq!(
            FailureKind::HostKeyMismatch.hint(&host),
            "ssh-keygen -R '[10.0.0.5]:2222' # then verify the new key out of band"
        );
        assert_eq!(
            FailureKind::AuthFailed.hint(&host),
            "ssh-copy-id -p 2222 pi@10.0.0.5"
        );
        assert_eq!(
            FailureKind::HostUnreachable.hint(&host),
            "ping -c 3 10.0.0.5 && nc -zv -w 5 10.0.0.5 2222"
        );

        let standard = HostTarget::new("10.0.0.5").with_port(22);
        assert_eq!(
            FailureKind::HostKeyMismatch.hint(&standard),
            "ssh-keygen -R 10.0.0.5 # then verify the new key out of band"
        );
    }
}
