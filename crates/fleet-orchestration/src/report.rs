//! Per-host outcomes and the fleet summary

use crate::classify::FailureKind;
use crate::error::Error;
use crate::state::HostState;
use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, Table};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// The outcome of deploying to one host
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentResult {
    /// Host as given on the command line
    pub host: String,
    /// Role that was applied
    pub role: String,
    /// Terminal state, `Done` or `Failed`
    pub status: HostState,
    /// Stages reached, in order
    pub history: Vec<HostState>,
    /// Classification, for connection failures
    pub kind: Option<FailureKind>,
    /// Captured error text
    pub diagnostic: String,
    /// Copy-pasteable remediation
    pub hint: Option<String>,
    /// When work on the host started
    pub started_at: DateTime<Utc>,
    /// When the host reached its terminal state
    pub finished_at: DateTime<Utc>,
}

impl DeploymentResult {
    pub(crate) fn start(host: impl Into<String>, role: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            host: host.into(),
            role: role.into(),
            status: HostState::Unverified,
            history: vec![HostState::Unverified],
            kind: None,
            diagnostic: String::new(),
            hint: None,
            started_at: now,
            finished_at: now,
        }
    }

    pub(crate) fn reached(&mut self, state: HostState) {
        self.history.push(state.clone());
        self.status = state;
        self.finished_at = Utc::now();
    }

    pub(crate) fn fail(&mut self, stage: HostState, error: &Error) {
        self.kind = error.kind();
        self.hint = error.remediation();
        self.diagnostic = error.to_string();
        self.status = HostState::Failed {
            stage: Box::new(stage),
            reason: self.diagnostic.clone(),
        };
        self.finished_at = Utc::now();
    }

    /// Whether the host ended in `Failed`
    pub fn is_failed(&self) -> bool {
        matches!(self.status, HostState::Failed { .. })
    }

    /// The stage the host failed to reach, if it failed
    pub fn failed_stage(&self) -> Option<&HostState> {
        match &self.status {
            HostState::Failed { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

/// Every host's outcome for one fleet run
#[derive(Debug, Clone, Serialize)]
pub struct FleetReport {
    /// Identifier shared by every log line of the run
    pub run_id: Uuid,
    /// Results in host order
    pub results: Vec<DeploymentResult>,
}

impl FleetReport {
    /// Number of failed hosts
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.is_failed()).count()
    }

    /// Non-zero if any host failed
    pub fn exit_code(&self) -> i32 {
        if self.failed() == 0 { 0 } else { 1 }
    }

    /// The result for `host`
    pub fn result(&self, host: &str) -> Option<&DeploymentResult> {
        self.results.iter().find(|r| r.host == host)
    }

    /// Summary table, one row per host
    pub fn table(&self) -> Table {
        let mut table = Table::new();
        table.set_header(vec!["HOST", "ROLE", "STATUS", "FAILED AT", "CLASS", "HINT"]);
        for result in &self.results {
            let (status, color) = if result.is_failed() {
                ("failed", Color::Red)
            } else {
                ("done", Color::Green)
            };
            table.add_row(vec![
                Cell::new(&result.host),
                Cell::new(&result.role),
                Cell::new(status).fg(color),
                Cell::new(result.failed_stage().map(HostState::name).unwrap_or("-")),
                Cell::new(
                    result
                        .kind
                        .map(|k| k.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                ),
                Cell::new(result.hint.as_deref().unwrap_or("-")),
            ]);
        }
        table
    }
}

impl fmt::Display for FleetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.table())?;
        for result in self.results.iter().filter(|r| r.is_failed()) {
            writeln!(f, "{}: {}", result.host, result.diagnostic)?;
        }
        write!(
            f,
            "run {}: {} host(s), {} failed",
            self.run_id,
            self.results.len(),
            self.failed()
        )
    }
}
