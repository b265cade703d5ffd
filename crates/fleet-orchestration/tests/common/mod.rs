//! Scripted transport and confirmer for fleet tests

use async_trait::async_trait;
use command_executor::{Command, Output};
use fleet_orchestration::{Confirmer, HostKey, HostTarget, RemoteTransport, TrustError};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;

/// Remote operations a test can make fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    Probe,
    Stage,
    Sync,
    Role,
    Cleanup,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::Probe => "probe",
            Op::Stage => "stage",
            Op::Sync => "sync",
            Op::Role => "role",
            Op::Cleanup => "cleanup",
        }
    }
}

/// A scripted failure; `once` failures are consumed by the first call
#[derive(Clone)]
struct Failure {
    output: Output,
    once: bool,
}

/// In-memory transport that records every call as `<op> <address>`
#[derive(Default)]
pub struct FakeTransport {
    known: Mutex<BTreeSet<String>>,
    keys: BTreeMap<String, String>,
    failures: Mutex<BTreeMap<(String, Op), Failure>>,
    calls: Mutex<Vec<String>>,
    commands: Mutex<Vec<String>>,
    synced_to: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `address`'s key as already trusted
    pub fn known(self, address: &str) -> Self {
        self.known.lock().unwrap().insert(address.to_string());
        self
    }

    /// Offer a key with `fingerprint` for `address`
    pub fn with_key(mut self, address: &str, fingerprint: &str) -> Self {
        self.keys.insert(address.to_string(), fingerprint.to_string());
        self
    }

    /// Make every `op` on `address` return `output`
    pub fn fail(self, address: &str, op: Op, output: Output) -> Self {
        self.script(address, op, output, false)
    }

    /// Make only the next `op` on `address` return `output`
    pub fn fail_once(self, address: &str, op: Op, output: Output) -> Self {
        self.script(address, op, output, true)
    }

    fn script(self, address: &str, op: Op, output: Output, once: bool) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert((address.to_string(), op), Failure { output, once });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, address: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.ends_with(&format!(" {}", address)))
            .collect()
    }

    /// Shell lines of every command run through `exec`
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Remote directories files were synced into
    pub fn synced_to(&self) -> Vec<String> {
        self.synced_to.lock().unwrap().clone()
    }

    pub fn is_trusted(&self, address: &str) -> bool {
        self.known.lock().unwrap().contains(address)
    }

    fn respond(&self, host: &HostTarget, op: Op) -> Output {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", op.name(), host.address));

        let key = (host.address.clone(), op);
        let mut failures = self.failures.lock().unwrap();
        if let Some(failure) = failures.get(&key).cloned() {
            if failure.once {
                failures.remove(&key);
            }
            return failure.output;
        }
        match op {
            Op::Stage => Output::ok(format!("/tmp/snapfleet.{}\n", host.address)),
            _ => Output::ok(""),
        }
    }
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn is_known(&self, host: &HostTarget) -> Result<bool, TrustError> {
        Ok(self.is_trusted(&host.address))
    }

    async fn fetch_host_key(&self, host: &HostTarget) -> Result<HostKey, TrustError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("keyscan {}", host.address));
        match self.keys.get(&host.address) {
            Some(fp) => Ok(HostKey {
                lines: vec![format!("{} ssh-ed25519 AAAAC3Nza", host.address)],
                fingerprints: vec![fp.clone()],
            }),
            None => Err(TrustError::KeyUnavailable {
                host: host.address.clone(),
                reason: "no keys returned".to_string(),
            }),
        }
    }

    async fn trust(&self, host: &HostTarget, _key: &HostKey) -> Result<(), TrustError> {
        self.known.lock().unwrap().insert(host.address.clone());
        Ok(())
    }

    async fn exec(
        &self,
        host: &HostTarget,
        command: &Command,
    ) -> command_executor::Result<Output> {
        self.commands.lock().unwrap().push(command.to_shell_line());
        let op = match command.get_program().to_string_lossy().as_ref() {
            "true" => Op::Probe,
            "mktemp" => Op::Stage,
            "rm" => Op::Cleanup,
            _ => Op::Role,
        };
        Ok(self.respond(host, op))
    }

    async fn sync(
        &self,
        host: &HostTarget,
        _sources: &[PathBuf],
        remote_dir: &str,
    ) -> command_executor::Result<Output> {
        self.synced_to.lock().unwrap().push(remote_dir.to_string());
        Ok(self.respond(host, Op::Sync))
    }
}

/// Stands in for an operator at the terminal
pub struct OperatorConfirmer {
    auth_ready: bool,
    asked: Mutex<Vec<String>>,
}

impl OperatorConfirmer {
    /// Answers `auth_ready` when asked whether authentication was set up
    pub fn new(auth_ready: bool) -> Self {
        Self {
            auth_ready,
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Setup commands the operator was shown
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl Confirmer for OperatorConfirmer {
    async fn confirm(&self, _host: &HostTarget, _fingerprints: &[String]) -> bool {
        false
    }

    async fn confirm_auth_setup(&self, _host: &HostTarget, setup: &str) -> bool {
        self.asked.lock().unwrap().push(setup.to_string());
        self.auth_ready
    }

    fn is_interactive(&self) -> bool {
        true
    }
}
