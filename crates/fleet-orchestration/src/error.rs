//! Error types for fleet orchestration

use crate::classify::FailureKind;
use crate::state::{HostState, HostTarget};
use std::path::PathBuf;
use thiserror::Error;

/// Host key trust could not be established
#[derive(Debug, Error)]
pub enum TrustError {
    /// No key could be fetched from the host
    #[error("Could not fetch a host key from {host}: {reason}")]
    KeyUnavailable {
        /// Target host
        host: String,
        /// Captured reason
        reason: String,
    },

    /// The operator declined the key, or no confirmation was supplied
    #[error("Host key for {host} was not confirmed (fingerprints: {})", fingerprints.join(", "))]
    Unconfirmed {
        /// Target host
        host: String,
        /// Fingerprints that were offered
        fingerprints: Vec<String>,
    },

    /// The confirmed key could not be written to the known hosts file
    #[error("Failed to record host key in {}: {source}", path.display())]
    Persist {
        /// Known hosts file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A key tool could not be run
    #[error(transparent)]
    Command(#[from] command_executor::Error),
}

impl TrustError {
    /// A copy-pasteable command that addresses the error, when one is known
    pub fn remediation(&self) -> Option<String> {
        match self {
            TrustError::KeyUnavailable { host, .. } => {
                Some(format!("ssh-keyscan -T 10 {}", host))
            }
            TrustError::Unconfirmed { fingerprints, .. } => fingerprints
                .first()
                .map(|fp| format!("re-run with --yes-trust {}", fp)),
            TrustError::Persist { path, .. } => Some(format!("ls -l {}", path.display())),
            TrustError::Command(_) => Some("sudo apt-get install -y openssh-client".to_string()),
        }
    }
}

/// A classified connection failure
#[derive(Debug, Error)]
#[error("{kind} for {target}: {stderr}")]
pub struct ConnectivityError {
    /// Target host
    pub target: HostTarget,
    /// Classification
    pub kind: FailureKind,
    /// Captured error text
    pub stderr: String,
}

impl ConnectivityError {
    /// The hint for this failure kind
    pub fn remediation(&self) -> Option<String> {
        Some(self.kind.hint(&self.target))
    }
}

/// Errors from deploying to a host or running a fleet
#[derive(Debug, Error)]
pub enum Error {
    /// Trust bootstrap failed
    #[error(transparent)]
    Trust(#[from] TrustError),

    /// The host could not be talked to
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    /// A remote step ran but did not succeed
    #[error("{stage} step failed on {host} (exit {}): {stderr}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    RemoteFailed {
        /// Target host
        host: String,
        /// Stage being attempted
        stage: HostState,
        /// Exit code, if the process exited
        code: Option<i32>,
        /// Captured error text
        stderr: String,
    },

    /// A local command could not be run
    #[error(transparent)]
    Command(#[from] command_executor::Error),

    /// Parallel mode needs every confirmation up front
    #[error("Parallel deployment requires non-interactive trust confirmation")]
    InteractiveParallel,
}

impl Error {
    /// A copy-pasteable command that addresses the error, when one is known
    pub fn remediation(&self) -> Option<String> {
        match self {
            Error::Trust(e) => e.remediation(),
            Error::Connectivity(e) => e.remediation(),
            Error::RemoteFailed { host, .. } => {
                Some(format!("ssh {} sudo journalctl -n 50 --no-pager", host))
            }
            Error::Command(_) => None,
            Error::InteractiveParallel => {
                Some("pass --unattended with one --yes-trust per new host".to_string())
            }
        }
    }

    /// The failure classification, for connection problems
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Error::Connectivity(e) => Some(e.kind),
            _ => None,
        }
    }
}

/// Result type for fleet orchestration
pub type Result<T> = std::result::Result<T, Error>;
