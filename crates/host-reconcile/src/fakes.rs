//! In-memory host collaborators for tests
//!
//! Each fake keeps its state behind a mutex and records the calls made to it
//! as `"<verb> <argument>"` strings.

use crate::doctor::PortProbe;
use crate::package::{self, ArtifactName, Downloader, PackageError, PackageManager};
use crate::service::{self, Enablement, ServiceError, ServiceManager};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// State of one fake unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeUnit {
    /// Enablement state
    pub enablement: Enablement,
    /// Whether the unit is running
    pub active: bool,
    /// Unit file path
    pub source: Option<PathBuf>,
    /// Start command line
    pub exec: String,
    /// Log lines returned by `recent_logs`
    pub logs: Vec<String>,
    /// Whether start and restart leave the unit inactive
    pub fails_to_start: bool,
}

impl Default for FakeUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeUnit {
    /// A disabled, inactive unit
    pub fn new() -> Self {
        Self {
            enablement: Enablement::Disabled,
            active: false,
            source: None,
            exec: String::new(),
            logs: Vec::new(),
            fails_to_start: false,
        }
    }

    /// Mark enabled
    pub fn enabled(mut self) -> Self {
        self.enablement = Enablement::Enabled;
        self
    }

    /// Mark masked
    pub fn masked(mut self) -> Self {
        self.enablement = Enablement::Masked;
        self
    }

    /// Mark running
    pub fn active(mut self) -> Self {
        self.active = true;
        self
    }

    /// Set the unit file path
    pub fn source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(path.into());
        self
    }

    /// Set the start command line
    pub fn exec(mut self, exec: impl Into<String>) -> Self {
        self.exec = exec.into();
        self
    }

    /// Never become active, and log `lines`
    pub fn broken(mut self, lines: &[&str]) -> Self {
        self.fails_to_start = true;
        self.logs = lines.iter().map(|l| l.to_string()).collect();
        self
    }
}

#[derive(Default)]
struct ServiceState {
    units: BTreeMap<String, FakeUnit>,
    calls: Vec<String>,
}

/// A [`ServiceManager`] that keeps unit state in memory
#[derive(Default)]
pub struct FakeServiceManager {
    state: Mutex<ServiceState>,
}

impl FakeServiceManager {
    /// No units
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a unit
    pub fn with_unit(self, name: &str, unit: FakeUnit) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.units.insert(name.to_string(), unit);
        }
        self
    }

    /// Add or replace a unit after construction, as a package install would
    pub fn insert_unit(&self, name: &str, unit: FakeUnit) {
        if let Ok(mut state) = self.state.lock() {
            state.units.insert(name.to_string(), unit);
        }
    }

    /// Current state of a unit
    pub fn unit(&self, name: &str) -> Option<FakeUnit> {
        self.state.lock().ok()?.units.get(name).cloned()
    }

    /// Every mutating call, in order
    pub fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    /// Number of calls starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.calls.clear();
        }
    }

    fn mutate<F>(&self, verb: &str, unit: &str, f: F) -> service::Result<()>
    where
        F: FnOnce(&mut FakeUnit) -> std::result::Result<(), String>,
    {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.calls.push(format!("{} {}", verb, unit).trim_end().to_string());
        let entry = state.units.entry(unit.to_string()).or_default();
        f(entry).map_err(|stderr| ServiceError::CommandFailed {
            verb: verb.to_string(),
            unit: unit.to_string(),
            stderr,
        })
    }

    fn read<T>(&self, unit: &str, f: impl FnOnce(Option<&FakeUnit>) -> T) -> service::Result<T> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        Ok(f(state.units.get(unit)))
    }
}

fn poisoned() -> ServiceError {
    ServiceError::Command(command_executor::Error::spawn_failed("fake state poisoned"))
}

fn start_unit(unit: &mut FakeUnit) -> std::result::Result<(), String> {
    if unit.enablement == Enablement::Masked {
        return Err("Unit is masked.".to_string());
    }
    unit.active = !unit.fails_to_start;
    Ok(())
}

#[async_trait]
impl ServiceManager for FakeServiceManager {
    async fn enable(&self, unit: &str) -> service::Result<()> {
        self.mutate("enable", unit, |u| {
            if u.enablement == Enablement::Masked {
                return Err("Unit is masked.".to_string());
            }
            u.enablement = Enablement::Enabled;
            Ok(())
        })
    }

    async fn disable(&self, unit: &str) -> service::Result<()> {
        self.mutate("disable", unit, |u| {
            if u.enablement != Enablement::Masked {
                u.enablement = Enablement::Disabled;
            }
            Ok(())
        })
    }

    async fn mask(&self, unit: &str) -> service::Result<()> {
        self.mutate("mask", unit, |u| {
            u.enablement = Enablement::Masked;
            Ok(())
        })
    }

    async fn unmask(&self, unit: &str) -> service::Result<()> {
        self.mutate("unmask", unit, |u| {
            if u.enablement == Enablement::Masked {
                u.enablement = Enablement::Disabled;
            }
            Ok(())
        })
    }

    async fn start(&self, unit: &str) -> service::Result<()> {
        self.mutate("start", unit, start_unit)
    }

    async fn stop(&self, unit: &str) -> service::Result<()> {
        self.mutate("stop", unit, |u| {
            u.active = false;
            Ok(())
        })
    }

    async fn restart(&self, unit: &str) -> service::Result<()> {
        self.mutate("restart", unit, start_unit)
    }

    async fn is_active(&self, unit: &str) -> service::Result<bool> {
        self.read(unit, |u| u.is_some_and(|u| u.active))
    }

    async fn enablement(&self, unit: &str) -> service::Result<Enablement> {
        self.read(unit, |u| {
            u.map(|u| u.enablement.clone())
                .unwrap_or(Enablement::NotFound)
        })
    }

    async fn unit_source(&self, unit: &str) -> service::Result<Option<PathBuf>> {
        self.read(unit, |u| u.and_then(|u| u.source.clone()))
    }

    async fn start_command(&self, unit: &str) -> service::Result<String> {
        self.read(unit, |u| u.map(|u| u.exec.clone()).unwrap_or_default())
    }

    async fn list_units(&self) -> service::Result<Vec<String>> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        Ok(state.units.keys().cloned().collect())
    }

    async fn daemon_reload(&self) -> service::Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.calls.push("daemon-reload".to_string());
        Ok(())
    }

    async fn recent_logs(&self, unit: &str, lines: usize) -> service::Result<Vec<String>> {
        self.read(unit, |u| {
            u.map(|u| u.logs.iter().rev().take(lines).rev().cloned().collect())
                .unwrap_or_default()
        })
    }
}

#[derive(Default)]
struct PackageState {
    installed: BTreeMap<String, String>,
    candidates: BTreeMap<String, String>,
    artifact_versions: BTreeMap<String, Option<String>>,
    owned: BTreeSet<PathBuf>,
    fix_broken_fails: bool,
    calls: Vec<String>,
}

/// A [`PackageManager`] that keeps the package database in memory
#[derive(Default)]
pub struct FakePackageManager {
    state: Mutex<PackageState>,
}

impl FakePackageManager {
    /// Nothing installed, no candidates
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `package` installed at `version`
    pub fn installed(self, package: &str, version: &str) -> Self {
        self.edit(|s| {
            s.installed.insert(package.to_string(), version.to_string());
        })
    }

    /// Offer `version` as the repository candidate
    pub fn candidate(self, package: &str, version: &str) -> Self {
        self.edit(|s| {
            s.candidates.insert(package.to_string(), version.to_string());
        })
    }

    /// Make the artifact with file name `file` declare `version`
    ///
    /// Without an entry, artifacts declare the version in their file name.
    pub fn artifact_declares(self, file: &str, version: Option<&str>) -> Self {
        self.edit(|s| {
            s.artifact_versions
                .insert(file.to_string(), version.map(str::to_string));
        })
    }

    /// Mark `path` as owned by a package
    pub fn owning(self, path: &Path) -> Self {
        self.edit(|s| {
            s.owned.insert(path.to_path_buf());
        })
    }

    /// Make the dependency-fix pass fail
    pub fn failing_fix_broken(self) -> Self {
        self.edit(|s| s.fix_broken_fails = true)
    }

    /// Installed version of `package`
    pub fn version_of(&self, package: &str) -> Option<String> {
        self.state.lock().ok()?.installed.get(package).cloned()
    }

    /// Every call, in order
    pub fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    /// Number of calls starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn edit(self, f: impl FnOnce(&mut PackageState)) -> Self {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
        self
    }

    fn with_state<T>(
        &self,
        call: String,
        f: impl FnOnce(&mut PackageState) -> package::Result<T>,
    ) -> package::Result<T> {
        let mut state = self.state.lock().map_err(|_| {
            PackageError::Command(command_executor::Error::spawn_failed("fake state poisoned"))
        })?;
        state.calls.push(call);
        f(&mut state)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl PackageManager for FakePackageManager {
    async fn installed_version(&self, package: &str) -> package::Result<Option<String>> {
        self.with_state(format!("installed {}", package), |s| {
            Ok(s.installed.get(package).cloned())
        })
    }

    async fn candidate_version(&self, package: &str) -> package::Result<Option<String>> {
        self.with_state(format!("candidate {}", package), |s| {
            Ok(s.candidates.get(package).cloned())
        })
    }

    async fn artifact_version(&self, artifact: &Path) -> package::Result<Option<String>> {
        let file = file_name_of(artifact);
        self.with_state(format!("inspect {}", file), |s| {
            Ok(match s.artifact_versions.get(&file) {
                Some(declared) => declared.clone(),
                None => ArtifactName::parse(&file).ok().map(|a| a.full_version()),
            })
        })
    }

    async fn install_version(&self, package: &str, version: &str) -> package::Result<()> {
        self.with_state(format!("install {}={}", package, version), |s| {
            s.installed.insert(package.to_string(), version.to_string());
            Ok(())
        })
    }

    async fn install_artifact(&self, artifact: &Path) -> package::Result<()> {
        let file = file_name_of(artifact);
        self.with_state(format!("install {}", file), |s| {
            let parsed = ArtifactName::parse(&file)?;
            let version = s
                .artifact_versions
                .get(&file)
                .cloned()
                .flatten()
                .unwrap_or_else(|| parsed.full_version());
            s.installed.insert(parsed.name, version);
            Ok(())
        })
    }

    async fn fix_broken(&self) -> package::Result<()> {
        self.with_state("fix-broken".to_string(), |s| {
            if s.fix_broken_fails {
                Err(PackageError::FixBrokenFailed {
                    reason: "unmet dependencies".to_string(),
                })
            } else {
                Ok(())
            }
        })
    }

    async fn owns_path(&self, path: &Path) -> package::Result<bool> {
        self.with_state(format!("owns {}", path.display()), |s| {
            Ok(s.owned.contains(path))
        })
    }
}

/// A [`Downloader`] that writes fixed bytes, or fails after a partial write
#[derive(Default)]
pub struct FakeDownloader {
    fail: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeDownloader {
    /// A downloader that always succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// A downloader that writes a partial file and then fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// URLs fetched so far
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn fetch(&self, url: &str, dest: &Path) -> package::Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(url.to_string());
        }
        let io_err = |source: std::io::Error| PackageError::Cache {
            path: dest.to_path_buf(),
            source,
        };
        if self.fail {
            std::fs::write(dest, b"trunc").map_err(io_err)?;
            return Err(PackageError::DownloadFailed {
                url: url.to_string(),
                reason: "connection reset".to_string(),
            });
        }
        std::fs::write(dest, b"!<arch>\ndebian-binary\n").map_err(io_err)?;
        Ok(())
    }
}

/// A [`PortProbe`] answering from a fixed set of listeners
#[derive(Default)]
pub struct FakePortProbe {
    listening: BTreeSet<(String, u16)>,
}

impl FakePortProbe {
    /// Nothing listening
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener
    pub fn listening(mut self, host: &str, port: u16) -> Self {
        self.listening.insert((host.to_string(), port));
        self
    }
}

#[async_trait]
impl PortProbe for FakePortProbe {
    async fn is_listening(&self, host: &str, port: u16) -> bool {
        self.listening.contains(&(host.to_string(), port))
    }
}
