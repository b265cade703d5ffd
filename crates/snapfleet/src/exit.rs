//! Exit codes and error reporting

use snapfleet_config::ConfigError;

/// An unresolved failure
pub const FAILURE: u8 = 1;

/// Configuration could not be resolved; nothing was changed
pub const CONFIG_ERROR: u8 = 2;

/// Clamp a report's exit code into a process exit code
pub fn code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(FAILURE)
}

/// Print the error and its fix, returning the exit code for it
pub fn report(err: &anyhow::Error) -> u8 {
    eprintln!("error: {:#}", err);
    if let Some(fix) = remediation(err) {
        eprintln!("  fix: {}", fix);
    }
    if is_config_error(err) {
        CONFIG_ERROR
    } else {
        FAILURE
    }
}

fn remediation(err: &anyhow::Error) -> Option<String> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<ConfigError>() {
            e.remediation()
        } else if let Some(e) = cause.downcast_ref::<host_reconcile::Error>() {
            e.remediation()
        } else if let Some(e) = cause.downcast_ref::<fleet_orchestration::Error>() {
            e.remediation()
        } else if let Some(e) = cause.downcast_ref::<fleet_orchestration::TrustError>() {
            e.remediation()
        } else {
            None
        }
    })
}

fn is_config_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<ConfigError>().is_some()
            || cause
                .downcast_ref::<host_reconcile::Error>()
                .is_some_and(host_reconcile::Error::is_config)
    })
}
