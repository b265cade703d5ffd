//! # Snapfleet Configuration
//!
//! Layered configuration resolver for snapfleet.
//!
//! Each configuration source (the base document, the generated override
//! document, CLI overrides) is a [`ConfigLayer`] with a precedence rank.
//! Layers are parsed into nested YAML, flattened into `SECTION__KEY` form with
//! normalised keys and values, and merged from lowest to highest rank into one
//! immutable [`ResolvedConfig`]. Every other component receives that value by
//! reference; nothing reads configuration from the process environment.

#![warn(missing_docs)]

use std::path::PathBuf;
use thiserror::Error;

pub mod layer;
pub mod overrides;
pub mod resolver;

pub use layer::{ConfigLayer, LayerSource, LoadedLayer, BASE_RANK, CLI_RANK, GENERATED_RANK};
pub use overrides::{CliOverrides, OverrideKey, update_generated, write_generated};
pub use resolver::{ConfigResolver, ResolvedConfig};

/// Separator placed between nested key segments after flattening
pub const KEY_SEPARATOR: &str = "__";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required configuration file does not exist
    #[error("Configuration file not found: {}", path.display())]
    SourceMissing {
        /// The missing file
        path: PathBuf,
    },

    /// Failed to read configuration file
    #[error("Failed to read config file {}: {source}", path.display())]
    ReadError {
        /// The file that could not be read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid YAML or has an unsupported shape
    #[error("Malformed configuration in {origin}: {reason}")]
    Malformed {
        /// Layer name or file path
        origin: String,
        /// What is wrong with it
        reason: String,
    },

    /// A top-level lookup named a key that also exists as a section
    #[error("Ambiguous key '{key}': a nested section with that name exists ({nested}); use a nested lookup")]
    AmbiguousKey {
        /// The requested top-level key
        key: String,
        /// One of the nested keys it collides with
        nested: String,
    },

    /// A CLI override outside the whitelist
    #[error("Unknown override '{0}'")]
    UnknownOverride(String),

    /// A value could not be interpreted as the expected type
    #[error("Invalid value for {key}: '{value}' is not {expected}")]
    InvalidValue {
        /// Canonical key
        key: String,
        /// The offending value
        value: String,
        /// Description of what was expected
        expected: &'static str,
    },

    /// Failed to write the generated override document
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// Destination file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// A copy-pasteable command that addresses the error, when one is known
    pub fn remediation(&self) -> Option<String> {
        match self {
            ConfigError::SourceMissing { path } => Some(format!(
                "sudo install -D -m 0644 /usr/share/snapfleet/config.yaml {}",
                path.display()
            )),
            ConfigError::ReadError { path, .. } => Some(format!("sudo ls -l {}", path.display())),
            ConfigError::UnknownOverride(_) => Some("snapfleet --help".to_string()),
            ConfigError::WriteError { path, .. } => path
                .parent()
                .map(|dir| format!("sudo mkdir -p {}", dir.display())),
            _ => None,
        }
    }
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Normalise a key written as `a.b-c` or `A__B_C` into canonical `A__B_C` form
pub fn normalize_key(key: &str) -> String {
    key.split('.')
        .flat_map(|part| part.split(KEY_SEPARATOR))
        .map(normalize_segment)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(KEY_SEPARATOR)
}

/// Normalise a single key segment: trimmed, upper-cased, `-` and spaces become `_`
pub(crate) fn normalize_segment(segment: &str) -> String {
    segment
        .trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

/// Final key segments that hold booleans, alone or after a `_`
const BOOLEAN_SUFFIXES: &[&str] = &["ENABLED", "DISABLED", "MUTE", "MUTED"];

/// Whether canonical `key` holds a boolean
pub fn is_boolean_key(key: &str) -> bool {
    let last = key.rsplit(KEY_SEPARATOR).next().unwrap_or(key);
    BOOLEAN_SUFFIXES
        .iter()
        .any(|suffix| last == *suffix || last.ends_with(&format!("_{}", suffix)))
}

/// Normalise a scalar value stored under canonical `key`
///
/// Boolean spellings collapse to `"true"`/`"false"` only for boolean keys;
/// any other value is kept as written.
pub fn normalize_value(key: &str, value: &str) -> String {
    if !is_boolean_key(key) {
        return value.to_string();
    }
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => "true".to_string(),
        "false" | "no" | "off" => "false".to_string(),
        _ => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("server.stream_port"), "SERVER__STREAM_PORT");
        assert_eq!(normalize_key("client.server-host"), "CLIENT__SERVER_HOST");
        assert_eq!(normalize_key("CLIENT__NAME"), "CLIENT__NAME");
        assert_eq!(normalize_key("profile"), "PROFILE");
    }

    #[test]
    fn test_normalize_value() {
        assert_eq!(normalize_value("SERVER__HTTP_ENABLED", "True"), "true");
        assert_eq!(normalize_value("CLIENT__MUTE", "no"), "false");
        assert_eq!(normalize_value("ENABLED", "OFF"), "false");
        assert_eq!(normalize_value("SERVER__STREAM_PORT", "1704"), "1704");
        assert_eq!(normalize_value("CLIENT__NAME", "Living Room"), "Living Room");
    }

    #[test]
    fn test_boolean_spellings_kept_for_other_keys() {
        assert_eq!(normalize_value("CLIENT__NAME", "Off"), "Off");
        assert_eq!(normalize_value("CLIENT__NAME", "yes"), "yes");
        assert_eq!(normalize_value("CLIENT__DEVICE", "on"), "on");
        assert_eq!(normalize_value("SERVER__HTTP_ENABLED", "maybe"), "maybe");
        assert!(is_boolean_key("SERVER__HTTP__ENABLED"));
        assert!(!is_boolean_key("CLIENT__UNMUTED_NAME"));
    }
}
