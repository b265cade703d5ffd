//! Roles and the managed product data
//!
//! Everything role-specific (unit names, binaries, packages, templates and
//! defaults) lives here as data so the rest of the crate stays generic.

use crate::template::TemplateJob;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Directories holding distro-shipped unit files
pub const SYSTEM_UNIT_DIRS: [&str; 2] = ["/lib/systemd/system", "/usr/lib/systemd/system"];

/// A host's assigned function
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Runs the audio server only
    Server,
    /// Runs the audio client only
    Client,
    /// Runs server and client on the same host
    Combined,
}

impl Role {
    /// Every role
    pub const ALL: [Role; 3] = [Role::Server, Role::Client, Role::Combined];

    /// Components deployed for this role, server first
    pub fn components(&self) -> &'static [Component] {
        match self {
            Role::Server => &[Component::Server],
            Role::Client => &[Component::Client],
            Role::Combined => &[Component::Server, Component::Client],
        }
    }

    /// Lowercase name used on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
            Role::Combined => "combined",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            "combined" | "both" => Ok(Role::Combined),
            other => Err(format!(
                "unknown role '{}', expected server, client or combined",
                other
            )),
        }
    }
}

/// One managed service and everything that belongs to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    /// The audio server
    Server,
    /// The audio client
    Client,
}

impl Component {
    /// Configuration section holding this component's keys
    pub fn section(&self) -> &'static str {
        match self {
            Component::Server => "server",
            Component::Client => "client",
        }
    }

    /// The unit this tool manages
    pub fn canonical_unit(&self) -> &'static str {
        match self {
            Component::Server => "snapfleet-server.service",
            Component::Client => "snapfleet-client.service",
        }
    }

    /// The unit the distribution package ships
    pub fn distro_unit(&self) -> &'static str {
        match self {
            Component::Server => "snapserver.service",
            Component::Client => "snapclient.service",
        }
    }

    /// Unit names left behind by older hand-made installs
    pub fn known_legacy_units(&self) -> &'static [&'static str] {
        match self {
            Component::Server => &["snapcast-server.service"],
            Component::Client => &["snapcast-client.service"],
        }
    }

    /// Package providing the binary
    pub fn package(&self) -> &'static str {
        match self {
            Component::Server => "snapserver",
            Component::Client => "snapclient",
        }
    }

    /// Path of the package-managed binary
    pub fn binary(&self) -> &'static str {
        match self {
            Component::Server => "/usr/bin/snapserver",
            Component::Client => "/usr/bin/snapclient",
        }
    }

    /// Hand-installed locations that would shadow the packaged binary on `PATH`
    pub fn shadow_candidates(&self) -> Vec<PathBuf> {
        let name = Path::new(self.binary())
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_default();
        vec![Path::new("/usr/local/bin").join(&name)]
    }

    /// Rendered files for this component, configuration first
    pub fn templates(&self, paths: &HostPaths) -> Vec<TemplateJob> {
        let (config_name, required): (&str, &[&str]) = match self {
            Component::Server => (
                "server.conf",
                &[
                    "SERVER__STREAM_PORT",
                    "SERVER__CONTROL_PORT",
                    "SERVER__HTTP_PORT",
                    "SERVER__FIFO_PATH",
                ],
            ),
            Component::Client => (
                "client.env",
                &["CLIENT__SERVER_HOST", "CLIENT__NAME", "SERVER__STREAM_PORT"],
            ),
        };
        let unit = self.canonical_unit();
        vec![
            TemplateJob::new(
                paths.template_dir.join(format!("{}.tmpl", config_name)),
                paths.config_dir.join(config_name),
            )
            .require(required.iter().copied()),
            TemplateJob::new(
                paths.template_dir.join(format!("{}.tmpl", unit)),
                paths.unit_dir.join(unit),
            )
            .require(["PATHS__CONFIG_DIR"]),
        ]
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.section())
    }
}

/// Default stream port
pub const DEFAULT_STREAM_PORT: u16 = 1704;
/// Default control port
pub const DEFAULT_CONTROL_PORT: u16 = 1705;
/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 1780;
/// Default FIFO the server reads audio from
pub const DEFAULT_FIFO_PATH: &str = "/tmp/snapfifo";

/// Values used when the resolved configuration does not set a key
pub fn defaults(role: Role) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = [
        ("SERVER__STREAM_PORT", DEFAULT_STREAM_PORT.to_string()),
        ("SERVER__CONTROL_PORT", DEFAULT_CONTROL_PORT.to_string()),
        ("SERVER__HTTP_PORT", DEFAULT_HTTP_PORT.to_string()),
        ("SERVER__HTTP_ENABLED", "true".to_string()),
        ("SERVER__FIFO_PATH", DEFAULT_FIFO_PATH.to_string()),
        ("CLIENT__NAME", "snapclient".to_string()),
        ("CLIENT__SOUNDCARD", "default".to_string()),
        ("CLIENT__VOLUME", "100".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    // A combined host plays its own stream
    if role == Role::Combined {
        map.insert("CLIENT__SERVER_HOST".to_string(), "127.0.0.1".to_string());
    }
    map
}

/// Host locations the reconciler reads and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    /// Filesystem root that binary paths are resolved against
    pub root: PathBuf,
    /// Template sources
    pub template_dir: PathBuf,
    /// Rendered configuration files
    pub config_dir: PathBuf,
    /// Managed unit files
    pub unit_dir: PathBuf,
    /// Snapshots, quarantine and the quarantine ledger
    pub backup_dir: PathBuf,
    /// Downloaded package artifacts
    pub cache_dir: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            template_dir: PathBuf::from("/usr/share/snapfleet/templates"),
            config_dir: PathBuf::from("/etc/snapfleet"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            backup_dir: PathBuf::from("/var/backups/snapfleet"),
            cache_dir: PathBuf::from("/var/cache/snapfleet"),
        }
    }
}

impl HostPaths {
    /// All paths rooted under `root`, for tests and chroots
    pub fn under(root: &Path) -> Self {
        let base = Self::default();
        let reroot = |p: &Path| root.join(p.strip_prefix("/").unwrap_or(p));
        Self {
            root: root.to_path_buf(),
            template_dir: reroot(&base.template_dir),
            config_dir: reroot(&base.config_dir),
            unit_dir: reroot(&base.unit_dir),
            backup_dir: reroot(&base.backup_dir),
            cache_dir: reroot(&base.cache_dir),
        }
    }

    /// An absolute host path resolved against [`root`](Self::root)
    pub fn host_path(&self, path: &Path) -> PathBuf {
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }

    /// Replace the backup directory
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }
}
