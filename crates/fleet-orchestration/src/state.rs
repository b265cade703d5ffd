//! Per-host deployment state
//!
//! A host moves through the stages in a fixed order. Every stage can fail,
//! and a failed host never advances again.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Where a host is in its deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HostState {
    /// Nothing has been checked yet
    Unverified,
    /// The host key is in the known hosts file
    HostKeyTrusted,
    /// A trivial remote command succeeded
    Reachable,
    /// Configuration and binary were copied to the staging directory
    Syncing,
    /// The role ran to completion on the host
    RoleExecuted,
    /// The host is finished
    Done,
    /// The host stopped at a stage
    Failed {
        /// Stage that could not be reached
        stage: Box<HostState>,
        /// Captured reason
        reason: String,
    },
}

impl HostState {
    /// The stage that follows this one on success
    pub fn next(&self) -> Option<HostState> {
        match self {
            HostState::Unverified => Some(HostState::HostKeyTrusted),
            HostState::HostKeyTrusted => Some(HostState::Reachable),
            HostState::Reachable => Some(HostState::Syncing),
            HostState::Syncing => Some(HostState::RoleExecuted),
            HostState::RoleExecuted => Some(HostState::Done),
            HostState::Done | HostState::Failed { .. } => None,
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, HostState::Done | HostState::Failed { .. })
    }

    /// Whether `to` is a legal transition from this state
    pub fn can_transition(&self, to: &HostState) -> bool {
        match to {
            HostState::Failed { .. } => !self.is_terminal(),
            to => self.next().as_ref() == Some(to),
        }
    }

    /// Short lower-case name
    pub fn name(&self) -> &'static str {
        match self {
            HostState::Unverified => "unverified",
            HostState::HostKeyTrusted => "host-key-trusted",
            HostState::Reachable => "reachable",
            HostState::Syncing => "syncing",
            HostState::RoleExecuted => "role-executed",
            HostState::Done => "done",
            HostState::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostState::Failed { stage, reason } => {
                write!(f, "failed at {}: {}", stage.name(), reason)
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Whether a host's identity key is trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrustState {
    /// Not yet checked or not in the known hosts file
    Unverified,
    /// Present in the known hosts file
    Trusted,
}

/// A host to deploy to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    /// Host name or address
    pub address: String,
    /// Login user; the ssh default if unset
    pub user: Option<String>,
    /// ssh port; 22 if unset
    pub port: Option<u16>,
    /// Private key to authenticate with
    pub identity: Option<PathBuf>,
    /// Trust in the host key
    pub trust: TrustState,
}

impl HostTarget {
    /// An unverified target at `address`
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            user: None,
            port: None,
            identity: None,
            trust: TrustState::Unverified,
        }
    }

    /// Set the login user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the ssh port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the identity file
    pub fn with_identity(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity = Some(path.into());
        self
    }

    /// `user@address`, or just the address
    pub fn login(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.address),
            None => self.address.clone(),
        }
    }

    /// The name the host is recorded under in a known hosts file
    pub fn known_hosts_name(&self) -> String {
        match self.port {
            Some(port) if port != 22 => format!("[{}]:{}", self.address, port),
            _ => self.address.clone(),
        }
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.login())?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

impl FromStr for HostTarget {
    type Err = String;

    /// Parse `[user@]host[:port]`; IPv6 addresses go in brackets
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (user, rest) = match s.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user), rest),
            Some(_) => return Err(format!("empty user in host '{}'", s)),
            None => (None, s),
        };

        let (address, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (address, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| format!("unclosed '[' in host '{}'", s))?;
            match tail.strip_prefix(':') {
                Some(port) => (address, Some(port)),
                None if tail.is_empty() => (address, None),
                None => return Err(format!("unexpected '{}' after address in '{}'", tail, s)),
            }
        } else if rest.matches(':').count() == 1 {
            let (address, port) = rest.split_once(':').unwrap_or((rest, ""));
            (address, Some(port))
        } else {
            (rest, None)
        };

        if address.is_empty() {
            return Err(format!("empty address in host '{}'", s));
        }
        let mut target = HostTarget::new(address);
        if let Some(user) = user {
            target = target.with_user(user);
        }
        if let Some(port) = port {
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("invalid port '{}' in host '{}'", port, s))?;
            target = target.with_port(port);
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_order() {
        let mut state = HostState::Unverified;
        let mut seen = vec![state.name()];
        while let Some(next) = state.next() {
            assert!(state.can_transition(&next));
            state = next;
            seen.push(state.name());
        }
        assert_eq!(
            seen,
            [
                "unverified",
                "host-key-trusted",
                "reachable",
                "syncing",
                "role-executed",
                "done"
            ]
        );
    }

    #[test]
    fn test_no_skipping_and_failed_is_final() {
        assert!(!HostState::Unverified.can_transition(&HostState::Reachable));
        let failed = HostState::Failed {
            stage: Box::new(HostState::Syncing),
            reason: "rsync exited 12".to_string(),
        };
        assert!(HostState::Reachable.can_transition(&failed));
        assert!(!HostState::Done.can_transition(&failed));
        assert!(failed.is_terminal());
        assert_eq!(failed.to_string(), "failed at syncing: rsync exited 12");
    }

    #[test]
    fn test_parse_targets() {
        let t: HostTarget = "pi@kitchen.local".parse().unwrap();
        assert_eq!(t.login(), "pi@kitchen.local");
        assert_eq!(t.known_hosts_name(), "kitchen.local");

        let t: HostTarget = "10.0.0.5:2222".parse().unwrap();
        assert_eq!(t.port, Some(2222));
        assert_eq!(t.known_hosts_name(), "[10.0.0.5]:2222");

        let t: HostTarget = "root@[fe80::1]:22".parse().unwrap();
        assert_eq!(t.address, "fe80::1");
        assert_eq!(t.known_hosts_name(), "fe80::1");

        let t: HostTarget = "fe80::2".parse().unwrap();
        assert_eq!(t.address, "fe80::2");
        assert_eq!(t.port, None);

        assert!("@host".parse::<HostTarget>().is_err());
        assert!("host:ssh".parse::<HostTarget>().is_err());
        assert!("".parse::<HostTarget>().is_err());
        assert_eq!(t.trust, TrustState::Unverified);
    }
}
