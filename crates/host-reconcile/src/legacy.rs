//! Detection of units that conflict with the managed ones

use crate::product::{Component, SYSTEM_UNIT_DIRS};
use crate::service::{Result, ServiceError, ServiceManager};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// How a discovered unit relates to the managed set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnitClass {
    /// One of the units this tool manages
    Canonical,
    /// A well-known conflicting unit name
    KnownLegacy,
    /// Shipped by the distribution under a system unit directory
    DistroProvided,
    /// Custom unit found only because it starts a managed binary
    Alternate,
}

/// A unit found by the scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredUnit {
    /// Unit name
    pub name: String,
    /// Classification
    pub class: UnitClass,
    /// Component whose binary or name it matched
    pub component: Component,
    /// Unit file the service manager loaded
    pub source: Option<PathBuf>,
}

impl DiscoveredUnit {
    /// Whether the unit file lives in a system unit directory
    pub fn is_system_file(&self) -> bool {
        self.source.as_deref().is_some_and(is_system_unit_path)
    }
}

/// Whether `path` is under one of the distribution's unit directories
pub fn is_system_unit_path(path: &Path) -> bool {
    SYSTEM_UNIT_DIRS.iter().any(|dir| path.starts_with(dir))
}

/// Scans the service manager's unit inventory
pub struct LegacyScanner<S> {
    manager: S,
}

impl<S: ServiceManager> LegacyScanner<S> {
    /// Scan through `manager`
    pub fn new(manager: S) -> Self {
        Self { manager }
    }

    /// Classify every installed unit related to `components`
    ///
    /// A unit that is neither canonical nor known by name is reported only if
    /// its start command references a managed binary.
    pub async fn scan(&self, components: &[Component]) -> Result<Vec<DiscoveredUnit>> {
        let units = self.manager.list_units().await?;
        let mut found = Vec::new();

        for unit in units {
            if let Some((component, class)) = self.classify(&unit, components).await? {
                let source = self.manager.unit_source(&unit).await?;
                let class = match class {
                    // Content matches are split by where the unit file lives
                    UnitClass::Alternate if source.as_deref().is_some_and(is_system_unit_path) => {
                        UnitClass::DistroProvided
                    }
                    other => other,
                };
                debug!(unit = %unit, ?class, "classified unit");
                found.push(DiscoveredUnit {
                    name: unit,
                    class,
                    component,
                    source,
                });
            }
        }

        let conflicts = found
            .iter()
            .filter(|u| u.class != UnitClass::Canonical)
            .count();
        info!(units = found.len(), conflicts, "legacy scan complete");
        Ok(found)
    }

    async fn classify(
        &self,
        unit: &str,
        components: &[Component],
    ) -> Result<Option<(Component, UnitClass)>> {
        for component in components {
            if unit == component.canonical_unit() {
                return Ok(Some((*component, UnitClass::Canonical)));
            }
            if component.known_legacy_units().contains(&unit) {
                return Ok(Some((*component, UnitClass::KnownLegacy)));
            }
        }

        // Template units have no start command of their own
        if unit.contains("@.") {
            return Ok(None);
        }
        let exec = match self.manager.start_command(unit).await {
            Ok(exec) => exec,
            Err(ServiceError::CommandFailed { stderr, .. }) => {
                debug!(unit, %stderr, "could not read start command");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        for component in components {
            if references_binary(&exec, component.binary()) {
                return Ok(Some((*component, UnitClass::Alternate)));
            }
        }
        Ok(None)
    }
}

/// Whether a start command line runs `binary`, by full path or file name
pub fn references_binary(exec: &str, binary: &str) -> bool {
    let name = Path::new(binary)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(binary);
    exec.split(|c: char| c.is_whitespace() || c == '=' || c == ';' || c == '{' || c == '}')
        .any(|token| {
            token == binary || Path::new(token).file_name().and_then(|n| n.to_str()) == Some(name)
        })
}
