//! Single-host reconciliation for snapfleet
//!
//! This crate converges one Debian-family host to a role (server, client or
//! both). It owns the host-side building blocks and the pipeline that runs
//! them in order:
//!
//! - [`legacy`] and [`policy`] find units that conflict with the role
//! - [`quarantine`] moves conflicting files aside without deleting anything
//! - [`package`] installs the exact desired package version
//! - [`template`] renders configuration and unit files only when they change
//! - [`service`] enables, starts and verifies the canonical units
//! - [`doctor`] and [`preflight`] report host health without changing it
//!
//! All host access goes through the [`ServiceManager`], [`PackageManager`]
//! and [`Downloader`] traits, so the whole pipeline runs against in-memory
//! fakes in tests.

#![warn(missing_docs)]

pub mod doctor;
#[cfg(any(test, feature = "test-utils"))]
pub mod fakes;
pub mod legacy;
pub mod package;
pub mod pipeline;
pub mod policy;
pub mod preflight;
pub mod product;
pub mod quarantine;
pub mod service;
pub mod template;

pub use doctor::{Doctor, Finding, PortProbe, Report, Severity, TcpConnect};
pub use package::{
    Apt, CurlDownloader, Downloader, PackageError, PackageManager, PackageOutcome,
    PackageReconciler, PackageSpec,
};
pub use pipeline::{Pipeline, PipelineReport};
pub use policy::RoleConflictPolicy;
pub use preflight::Preflight;
pub use product::{Component, HostPaths, Role};
pub use quarantine::{Quarantine, QuarantineError, QuarantineRecord};
pub use service::{
    Enablement, ServiceAction, ServiceError, ServiceLifecycle, ServiceManager, Systemctl,
};
pub use template::{RenderOutcome, TemplateError};

use thiserror::Error;

/// Errors from a reconciliation run
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be resolved
    #[error(transparent)]
    Config(#[from] snapfleet_config::ConfigError),

    /// Template rendering or writing failed
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Package reconciliation failed
    #[error(transparent)]
    Package(#[from] PackageError),

    /// A service could not be brought to the desired state
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Conflict resolution failed
    #[error(transparent)]
    Quarantine(#[from] QuarantineError),
}

impl Error {
    /// A copy-pasteable command that addresses the error, when one is known
    pub fn remediation(&self) -> Option<String> {
        match self {
            Error::Config(e) => e.remediation(),
            Error::Template(e) => e.remediation(),
            Error::Package(e) => e.remediation(),
            Error::Service(e) => e.remediation(),
            Error::Quarantine(e) => e.remediation(),
        }
    }

    /// Whether the error came from configuration rather than the host
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Template(TemplateError::UndefinedVariable { .. })
        )
    }
}

/// Result type for reconciliation
pub type Result<T> = std::result::Result<T, Error>;
