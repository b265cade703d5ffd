//! The single-host reconciliation pipeline
//!
//! Stages run strictly in order and each one's effects are complete before
//! the next starts: legacy scan, packages, conflict policy, templates,
//! services. Any stage error aborts the run; only atomically written files
//! remain.
//!
//! The inventory scan for legacy units runs once per role, before the first
//! installation. The role's conflict table is enforced on every run after
//! packages are installed, so units a package ships and units left over from
//! an earlier role are neutralized too.

use crate::legacy::{LegacyScanner, UnitClass, is_system_unit_path};
use crate::package::{Downloader, PackageManager, PackageOutcome, PackageReconciler, PackageSpec};
use crate::policy::RoleConflictPolicy;
use crate::product::{Component, HostPaths, Role, defaults};
use crate::quarantine::{Quarantine, QuarantineRecord, ShadowOutcome};
use crate::service::{DEFAULT_SETTLE, Enablement, ServiceAction, ServiceLifecycle, ServiceManager};
use crate::template::{RenderOutcome, render_job, write_if_changed};
use crate::{Error, Result};
use snapfleet_config::ResolvedConfig;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// What one pipeline run did
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    /// Role that was applied
    pub role: Role,
    /// Unit files moved into quarantine
    pub quarantined: Vec<QuarantineRecord>,
    /// Units stopped, disabled and masked in place
    pub neutralized: Vec<String>,
    /// Shadowing binaries that were examined
    pub shadows: Vec<(PathBuf, ShadowOutcome)>,
    /// Package outcomes by package name
    pub packages: Vec<(String, PackageOutcome)>,
    /// Render outcomes by destination
    pub templates: Vec<(PathBuf, RenderOutcome)>,
    /// Lifecycle actions by unit
    pub services: Vec<(String, ServiceAction)>,
}

impl PipelineReport {
    fn new(role: Role) -> Self {
        Self {
            role,
            quarantined: Vec::new(),
            neutralized: Vec::new(),
            shadows: Vec::new(),
            packages: Vec::new(),
            templates: Vec::new(),
            services: Vec::new(),
        }
    }

    /// Whether the run changed anything on the host
    pub fn changed(&self) -> bool {
        !self.quarantined.is_empty()
            || !self.neutralized.is_empty()
            || self.packages.iter().any(|(_, o)| o.changed())
            || self.templates.iter().any(|(_, o)| o.changed())
            || self
                .services
                .iter()
                .any(|(_, a)| *a != ServiceAction::AlreadyRunning)
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "role: {}", self.role)?;
        for record in &self.quarantined {
            writeln!(
                f,
                "  quarantined {} -> {}",
                record.original.display(),
                record.destination.display()
            )?;
        }
        for unit in &self.neutralized {
            writeln!(f, "  masked {}", unit)?;
        }
        for (name, outcome) in &self.packages {
            writeln!(f, "  package {}: {:?}", name, outcome)?;
        }
        for (path, outcome) in &self.templates {
            writeln!(f, "  {}: {:?}", path.display(), outcome)?;
        }
        for (unit, action) in &self.services {
            writeln!(f, "  {}: {:?}", unit, action)?;
        }
        write!(
            f,
            "{}",
            if self.changed() { "host changed" } else { "host already converged" }
        )
    }
}

/// Reconciles one host to one role
pub struct Pipeline<'a> {
    config: &'a ResolvedConfig,
    services: &'a dyn ServiceManager,
    packages: &'a dyn PackageManager,
    downloader: &'a dyn Downloader,
    paths: HostPaths,
    policy: RoleConflictPolicy,
    settle: Duration,
    snapshots: bool,
}

impl<'a> Pipeline<'a> {
    /// A pipeline over the given host collaborators
    pub fn new(
        config: &'a ResolvedConfig,
        services: &'a dyn ServiceManager,
        packages: &'a dyn PackageManager,
        downloader: &'a dyn Downloader,
        paths: HostPaths,
    ) -> Self {
        Self {
            config,
            services,
            packages,
            downloader,
            paths,
            policy: RoleConflictPolicy::default(),
            settle: DEFAULT_SETTLE,
            snapshots: true,
        }
    }

    /// Replace the conflict policy
    pub fn with_policy(mut self, policy: RoleConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the wait between active-state checks
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Enable or disable snapshots before quarantine
    pub fn with_snapshots(mut self, enabled: bool) -> Self {
        self.snapshots = enabled;
        self
    }

    /// Full reconciliation of `role`
    pub async fn run(&self, role: Role) -> Result<PipelineReport> {
        info!(%role, profile = self.config.profile().unwrap_or("-"), "reconciling host");
        let mut report = PipelineReport::new(role);

        // Rendering up front surfaces configuration errors before any mutation
        let rendered = self.render_all(role)?;

        self.scan_legacy(role, &mut report).await?;
        self.reconcile_packages(role, &mut report).await?;
        self.enforce_conflicts(role, &mut report).await?;
        self.resolve_shadows(role, &mut report).await?;

        let mut changed: BTreeMap<Component, bool> = BTreeMap::new();
        let mut unit_files_changed = false;
        for (component, destination, bytes) in rendered {
            let outcome = write_if_changed(&destination, bytes.as_bytes())?;
            let package_changed = report
                .packages
                .iter()
                .any(|(name, o)| name == component.package() && o.changed());
            let entry = changed.entry(component).or_insert(package_changed);
            if outcome.changed() {
                *entry = true;
                if destination.starts_with(&self.paths.unit_dir) {
                    unit_files_changed = true;
                }
            }
            report.templates.push((destination, outcome));
        }

        if unit_files_changed {
            self.services.daemon_reload().await?;
        }

        let lifecycle = ServiceLifecycle::new(self.services).with_settle(self.settle);
        for component in role.components() {
            let unit = component.canonical_unit();
            let action = lifecycle
                .apply(unit, changed.get(component).copied().unwrap_or(false))
                .await?;
            report.services.push((unit.to_string(), action));
        }

        info!(%role, changed = report.changed(), "reconciliation complete");
        Ok(report)
    }

    /// Package reconciliation only, restarting units whose package changed
    pub async fn upgrade(&self, role: Role) -> Result<PipelineReport> {
        info!(%role, "upgrading packages");
        let mut report = PipelineReport::new(role);
        self.reconcile_packages(role, &mut report).await?;

        let lifecycle = ServiceLifecycle::new(self.services).with_settle(self.settle);
        for component in role.components() {
            let changed = report
                .packages
                .iter()
                .any(|(name, o)| name == component.package() && o.changed());
            if changed {
                let unit = component.canonical_unit();
                let action = lifecycle.enable_restart(unit).await?;
                report.services.push((unit.to_string(), action));
            }
        }
        Ok(report)
    }

    /// Resolved configuration overlaid on the built-in defaults, plus host paths
    pub fn template_vars(&self, role: Role) -> BTreeMap<String, String> {
        let mut vars = defaults(role);
        vars.extend(
            self.config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        vars.insert(
            "PATHS__CONFIG_DIR".to_string(),
            self.paths.config_dir.display().to_string(),
        );
        vars
    }

    /// Package spec for a component; `<section>.package_url` selects an artifact
    pub fn package_spec(&self, component: Component) -> PackageSpec {
        match self.config.nested(component.section(), "package_url") {
            Some(url) if !url.trim().is_empty() => PackageSpec::artifact(component.package(), url),
            _ => PackageSpec::repository(component.package()),
        }
    }

    /// Every file the role needs, rendered but not written
    pub fn render_all(&self, role: Role) -> Result<Vec<(Component, PathBuf, String)>> {
        let vars = self.template_vars(role);
        let mut rendered = Vec::new();
        for component in role.components() {
            for job in component.templates(&self.paths) {
                let text = render_job(&job, &vars)?;
                rendered.push((*component, job.destination, text));
            }
        }
        Ok(rendered)
    }

    fn scan_marker(&self, role: Role) -> PathBuf {
        self.paths.backup_dir.join(format!(".legacy-scan-{}", role))
    }

    async fn scan_legacy(&self, role: Role, report: &mut PipelineReport) -> Result<()> {
        let marker = self.scan_marker(role);
        if marker.exists() {
            debug!(%role, "legacy scan already done for this role");
            return Ok(());
        }

        let discovered = LegacyScanner::new(self.services)
            .scan(role.components())
            .await?;
        let mut candidates = self.policy_conflicts(role).await?;
        for unit in discovered {
            if unit.class != UnitClass::Canonical && !candidates.contains(&unit.name) {
                candidates.push(unit.name);
            }
        }
        self.neutralize_all(candidates, report).await?;

        write_marker(&marker)?;
        Ok(())
    }

    async fn enforce_conflicts(&self, role: Role, report: &mut PipelineReport) -> Result<()> {
        let candidates = self.policy_conflicts(role).await?;
        self.neutralize_all(candidates, report).await
    }

    async fn policy_conflicts(&self, role: Role) -> Result<Vec<String>> {
        let mut present = Vec::new();
        for unit in self.policy.conflicts(role) {
            if self.services.enablement(unit).await? != Enablement::NotFound {
                present.push(unit.to_string());
            }
        }
        Ok(present)
    }

    async fn neutralize_all(&self, units: Vec<String>, report: &mut PipelineReport) -> Result<()> {
        let quarantine =
            Quarantine::new(self.services, &self.paths.backup_dir).with_snapshots(self.snapshots);
        for unit in units {
            if self.services.enablement(&unit).await? == Enablement::Masked {
                debug!(unit = %unit, "already masked");
                continue;
            }
            match self.services.unit_source(&unit).await? {
                Some(source) if !is_system_unit_path(&source) && source.exists() => {
                    let record = quarantine.quarantine_unit(&unit, &source).await?;
                    report.quarantined.push(record);
                }
                _ => {
                    quarantine.neutralize(&unit).await?;
                    report.neutralized.push(unit);
                }
            }
        }
        Ok(())
    }

    async fn reconcile_packages(&self, role: Role, report: &mut PipelineReport) -> Result<()> {
        let reconciler =
            PackageReconciler::new(self.packages, self.downloader, &self.paths.cache_dir);
        for component in role.components() {
            let spec = self.package_spec(*component);
            let outcome = reconciler.reconcile(&spec).await?;
            report.packages.push((spec.name, outcome));
        }
        Ok(())
    }

    async fn resolve_shadows(&self, role: Role, report: &mut PipelineReport) -> Result<()> {
        let quarantine = Quarantine::new(self.services, &self.paths.backup_dir);
        for component in role.components() {
            let packaged = self.paths.host_path(Path::new(component.binary()));
            for candidate in component.shadow_candidates() {
                let shadow = self.paths.host_path(&candidate);
                let outcome = quarantine
                    .resolve_shadowed_binary(&shadow, &packaged, &self.packages)
                    .await?;
                if outcome != ShadowOutcome::Absent {
                    report.shadows.push((shadow, outcome));
                }
            }
        }
        Ok(())
    }
}

fn write_marker(path: &Path) -> Result<()> {
    let stamp = chrono::Utc::now().to_rfc3339();
    crate::template::write_atomic(path, stamp.as_bytes()).map_err(Error::from)
}
