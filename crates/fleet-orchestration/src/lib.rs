//! Fleet-wide reconciliation over SSH
//!
//! The orchestrator copies the reconciler binary and its configuration to
//! each host and runs a role there, one host at a time or all at once. Each
//! host moves through an explicit [`HostState`] machine; a failure is
//! recorded with the stage it happened at, a [`FailureKind`] and a
//! copy-pasteable hint, and never stops the other hosts.
//!
//! Host keys are never trusted silently. An unknown key is fetched, its
//! fingerprints are shown, and it is recorded only once a [`Confirmer`]
//! accepts it.
//!
//! # Example
//!
//! ```no_run
//! use command_executor::LocalRunner;
//! use fleet_orchestration::{
//!     FleetOrchestrator, HostTarget, PresuppliedConfirmer, RemotePlan, SshTransport,
//! };
//!
//! # async fn example() -> fleet_orchestration::Result<()> {
//! let transport = SshTransport::new(LocalRunner::new(), "/home/op/.ssh/known_hosts");
//! let confirmer = PresuppliedConfirmer::new(["SHA256:q3Xf0kV7"]);
//! let plan = RemotePlan::new("client", "/usr/local/bin/snapfleet", "/etc/snapfleet/config.yaml");
//!
//! let hosts: Vec<HostTarget> = vec!["pi@10.0.0.5".parse().unwrap()];
//! let report = FleetOrchestrator::new(transport, confirmer, plan)
//!     .parallel(true)
//!     .run(&hosts)
//!     .await?;
//! println!("{}", report);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod classify;
pub mod error;
pub mod orchestrator;
pub mod report;
pub mod state;
pub mod transport;
pub mod trust;

pub use classify::{FailureKind, classify};
pub use error::{ConnectivityError, Error, Result, TrustError};
pub use orchestrator::{DEFAULT_STAGING_DIR, FleetOrchestrator, ROLE_TIMEOUT, RemotePlan};
pub use report::{DeploymentResult, FleetReport};
pub use state::{HostState, HostTarget, TrustState};
pub use transport::{HostKey, PROBE_TIMEOUT, RemoteTransport, SYNC_TIMEOUT, SshTransport};
pub use trust::{Confirmer, PresuppliedConfirmer, TerminalConfirmer, establish_trust};
