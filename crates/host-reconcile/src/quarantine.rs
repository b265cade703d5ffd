//! Non-destructive quarantine of conflicting units and binaries
//!
//! Nothing is ever deleted. Unit files are moved into a timestamped directory
//! under the backup directory and every move is appended to a JSON-lines
//! ledger, which is never truncated.

use crate::package::{PackageError, PackageManager};
use crate::service::{ServiceError, ServiceManager};
use chrono::{DateTime, Utc};
use command_executor::shell_escape;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Ledger file name inside the backup directory
pub const LEDGER_FILE: &str = "quarantine.jsonl";

/// Quarantine errors
#[derive(Debug, Error)]
pub enum QuarantineError {
    /// A file could not be moved into or out of quarantine
    #[error("Failed to move {} to {}: {source}", from.display(), to.display())]
    MoveFailed {
        /// Source path
        from: PathBuf,
        /// Destination path
        to: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The pre-quarantine snapshot could not be taken
    #[error("Failed to snapshot {}: {source}", path.display())]
    SnapshotFailed {
        /// File being snapshotted
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The ledger could not be read or appended to
    #[error("Quarantine ledger {} is unusable: {reason}", path.display())]
    Ledger {
        /// Ledger path
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Restoring would overwrite an existing file
    #[error("Refusing to restore over existing {}", path.display())]
    RestoreConflict {
        /// The occupied original path
        path: PathBuf,
    },

    /// Stopping, disabling or masking failed
    #[error("Service manager error during quarantine: {0}")]
    Service(#[from] ServiceError),

    /// Package ownership could not be determined
    #[error("Package query failed during quarantine: {0}")]
    Package(#[from] PackageError),
}

impl QuarantineError {
    /// A copy-pasteable command that addresses the error, when one is known
    pub fn remediation(&self) -> Option<String> {
        match self {
            QuarantineError::MoveFailed { from, .. } => {
                Some(format!("sudo ls -l {}", shell_escape(&from.display().to_string())))
            }
            QuarantineError::SnapshotFailed { .. } | QuarantineError::Ledger { .. } => None,
            QuarantineError::RestoreConflict { path } => Some(format!(
                "sudo mv {} {}.bak",
                shell_escape(&path.display().to_string()),
                shell_escape(&path.display().to_string())
            )),
            QuarantineError::Service(e) => e.remediation(),
            QuarantineError::Package(e) => e.remediation(),
        }
    }
}

/// Result type for quarantine operations
pub type Result<T> = std::result::Result<T, QuarantineError>;

/// One quarantined file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// Unit the file belonged to; `None` for binaries
    pub unit: Option<String>,
    /// Where the file was
    pub original: PathBuf,
    /// Where the file is now
    pub destination: PathBuf,
    /// When it was moved
    pub timestamp: DateTime<Utc>,
    /// Copy taken before any change, if snapshots are enabled
    pub snapshot: Option<PathBuf>,
    /// Shell command that undoes the quarantine
    pub restore_command: String,
}

/// What happened to a binary shadowing the packaged one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowOutcome {
    /// Nothing at the shadow path
    Absent,
    /// Moved into quarantine
    Removed(QuarantineRecord),
    /// Left in place
    Kept {
        /// Why it was kept
        reason: String,
    },
}

/// Moves conflicting artifacts aside and records them
pub struct Quarantine<S> {
    manager: S,
    backup_dir: PathBuf,
    snapshots: bool,
}

impl<S: ServiceManager> Quarantine<S> {
    /// Quarantine into `backup_dir`, with snapshots enabled
    pub fn new(manager: S, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            backup_dir: backup_dir.into(),
            snapshots: true,
        }
    }

    /// Enable or disable pre-quarantine snapshots
    pub fn with_snapshots(mut self, enabled: bool) -> Self {
        self.snapshots = enabled;
        self
    }

    /// Path of the ledger
    pub fn ledger_path(&self) -> PathBuf {
        self.backup_dir.join(LEDGER_FILE)
    }

    /// Stop, disable and mask a unit whose file stays where it is
    pub async fn neutralize(&self, unit: &str) -> Result<()> {
        self.manager.stop(unit).await?;
        self.manager.disable(unit).await?;
        self.manager.mask(unit).await?;
        info!(unit, "neutralized conflicting unit");
        Ok(())
    }

    /// Stop, disable and move a unit's file into quarantine, then mask it
    ///
    /// The mask is applied after the move because the service manager
    /// refuses to mask a unit whose file occupies the mask location.
    pub async fn quarantine_unit(&self, unit: &str, source: &Path) -> Result<QuarantineRecord> {
        let now = Utc::now();
        let snapshot = if self.snapshots {
            Some(self.snapshot(source, now)?)
        } else {
            None
        };

        self.manager.stop(unit).await?;
        self.manager.disable(unit).await?;

        let destination = self.destination_for(source, now);
        move_file(source, &destination)?;

        let restore_command = unit_restore_command(
            unit,
            snapshot.as_deref().unwrap_or(&destination),
            source,
            snapshot.is_some(),
        );
        let record = QuarantineRecord {
            unit: Some(unit.to_string()),
            original: source.to_path_buf(),
            destination,
            timestamp: now,
            snapshot,
            restore_command,
        };
        // Recorded before masking: a failure from here on must stay restorable
        if let Err(e) = self.append(&record) {
            warn!(unit, error = %e, "ledger unwritable, putting unit file back");
            move_file(&record.destination, source)?;
            return Err(e);
        }
        info!(
            unit,
            original = %record.original.display(),
            destination = %record.destination.display(),
            "quarantined unit file"
        );

        self.manager.mask(unit).await?;
        self.manager.daemon_reload().await?;
        Ok(record)
    }

    /// Move a plain file into quarantine
    pub fn quarantine_file(&self, path: &Path) -> Result<QuarantineRecord> {
        let now = Utc::now();
        let destination = self.destination_for(path, now);
        move_file(path, &destination)?;
        let record = QuarantineRecord {
            unit: None,
            original: path.to_path_buf(),
            restore_command: format!(
                "sudo mv {} {}",
                shell_escape(&destination.display().to_string()),
                shell_escape(&path.display().to_string())
            ),
            destination,
            timestamp: now,
            snapshot: None,
        };
        self.append(&record)?;
        info!(original = %path.display(), destination = %record.destination.display(), "quarantined file");
        Ok(record)
    }

    /// Every record in the ledger, oldest first
    pub fn records(&self) -> Result<Vec<QuarantineRecord>> {
        let path = self.ledger_path();
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(QuarantineError::Ledger {
                    path,
                    reason: e.to_string(),
                });
            }
        };

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| QuarantineError::Ledger {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| QuarantineError::Ledger {
                path: path.clone(),
                reason: format!("line {}: {}", index + 1, e),
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Put a quarantined file back and unmask its unit
    ///
    /// Falls back to the snapshot when the quarantined copy is gone. The
    /// ledger entry is kept.
    pub async fn restore(&self, record: &QuarantineRecord) -> Result<()> {
        if is_occupied(&record.original) {
            return Err(QuarantineError::RestoreConflict {
                path: record.original.clone(),
            });
        }
        if let Some(unit) = &record.unit {
            // The mask link sits where the unit file goes back
            self.manager.unmask(unit).await?;
        }

        if record.destination.exists() {
            move_file(&record.destination, &record.original)?;
        } else if let Some(snapshot) = &record.snapshot {
            copy_file(snapshot, &record.original)?;
        } else {
            return Err(QuarantineError::MoveFailed {
                from: record.destination.clone(),
                to: record.original.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        if record.unit.is_some() {
            self.manager.daemon_reload().await?;
        }
        info!(original = %record.original.display(), "restored from quarantine");
        Ok(())
    }

    /// Deal with a hand-installed binary that shadows a packaged one
    ///
    /// The shadow is moved into quarantine only if the packaged binary exists
    /// and is executable and the shadow itself is not owned by any package.
    pub async fn resolve_shadowed_binary<P: PackageManager>(
        &self,
        shadow: &Path,
        packaged: &Path,
        packages: &P,
    ) -> Result<ShadowOutcome> {
        if std::fs::symlink_metadata(shadow).is_err() {
            return Ok(ShadowOutcome::Absent);
        }

        if !is_executable(packaged) {
            let reason = format!("{} is missing or not executable", packaged.display());
            warn!(shadow = %shadow.display(), %reason, "keeping shadowing binary");
            return Ok(ShadowOutcome::Kept { reason });
        }
        if packages.owns_path(shadow).await? {
            let reason = format!("{} is owned by a package", shadow.display());
            warn!(shadow = %shadow.display(), %reason, "keeping shadowing binary");
            return Ok(ShadowOutcome::Kept { reason });
        }

        Ok(ShadowOutcome::Removed(self.quarantine_file(shadow)?))
    }

    fn snapshot(&self, source: &Path, now: DateTime<Utc>) -> Result<PathBuf> {
        let dir = self.backup_dir.join("snapshots").join(stamp(now));
        let dest = unique_path(&dir.join(file_name(source)));
        std::fs::create_dir_all(&dir)
            .and_then(|_| std::fs::copy(source, &dest))
            .map_err(|source_err| QuarantineError::SnapshotFailed {
                path: source.to_path_buf(),
                source: source_err,
            })?;
        Ok(dest)
    }

    fn destination_for(&self, source: &Path, now: DateTime<Utc>) -> PathBuf {
        unique_path(
            &self
                .backup_dir
                .join("quarantine")
                .join(stamp(now))
                .join(file_name(source)),
        )
    }

    fn append(&self, record: &QuarantineRecord) -> Result<()> {
        let path = self.ledger_path();
        let ledger_err = |reason: String| QuarantineError::Ledger {
            path: path.clone(),
            reason,
        };
        let line = serde_json::to_string(record).map_err(|e| ledger_err(e.to_string()))?;
        std::fs::create_dir_all(&self.backup_dir).map_err(|e| ledger_err(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ledger_err(e.to_string()))?;
        writeln!(file, "{}", line).map_err(|e| ledger_err(e.to_string()))?;
        file.sync_all().map_err(|e| ledger_err(e.to_string()))?;
        Ok(())
    }
}

fn stamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%SZ").to_string()
}

fn file_name(path: &Path) -> PathBuf {
    path.file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("unnamed"))
}

fn unique_path(path: &Path) -> PathBuf {
    if std::fs::symlink_metadata(path).is_err() {
        return path.to_path_buf();
    }
    let mut n = 1;
    loop {
        let candidate = PathBuf::from(format!("{}.{}", path.display(), n));
        if std::fs::symlink_metadata(&candidate).is_err() {
            return candidate;
        }
        n += 1;
    }
}

/// Whether `path` holds anything other than a mask link to `/dev/null`
fn is_occupied(path: &Path) -> bool {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => std::fs::read_link(path)
            .map(|target| target != Path::new("/dev/null"))
            .unwrap_or(true),
        Ok(_) => true,
        Err(_) => false,
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn unit_restore_command(unit: &str, from: &Path, to: &Path, copy: bool) -> String {
    format!(
        "sudo systemctl unmask {} && sudo {} {} {} && sudo systemctl daemon-reload",
        shell_escape(unit),
        if copy { "cp -a" } else { "mv" },
        shell_escape(&from.display().to_string()),
        shell_escape(&to.display().to_string())
    )
}

/// Rename, falling back to copy and remove across filesystems
fn move_file(from: &Path, to: &Path) -> Result<()> {
    let move_err = |source: std::io::Error| QuarantineError::MoveFailed {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };
    if let Some(dir) = to.parent() {
        std::fs::create_dir_all(dir).map_err(move_err)?;
    }
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to).map_err(move_err)?;
    std::fs::remove_file(from).map_err(move_err)?;
    Ok(())
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    let copy_err = |source: std::io::Error| QuarantineError::MoveFailed {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };
    if let Some(dir) = to.parent() {
        std::fs::create_dir_all(dir).map_err(copy_err)?;
    }
    std::fs::copy(from, to).map_err(copy_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakePackageManager, FakeServiceManager, FakeUnit};
    use crate::service::Enablement;

    fn unit_file(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join("etc/systemd/system").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[Service]\nExecStart=/usr/bin/snapserver\n").unwrap();
        path
    }

    #[smol_potat::test]
    async fn test_quarantine_moves_masks_and_records() {
        let root = tempfile::tempdir().unwrap();
        let source = unit_file(root.path(), "snapcast-server.service");
        let services = FakeServiceManager::new().with_unit(
            "snapcast-server.service",
            FakeUnit::new().enabled().active().source(&source),
        );
        let quarantine = Quarantine::new(&services, root.path().join("backup"));

        let record = quarantine
            .quarantine_unit("snapcast-server.service", &source)
            .await
            .unwrap();

        assert!(!source.exists());
        assert!(record.destination.exists());
        assert!(record.snapshot.as_ref().unwrap().exists());
        let unit = services.unit("snapcast-server.service").unwrap();
        assert_eq!(unit.enablement, Enablement::Masked);
        assert!(!unit.active);
        assert_eq!(
            services.calls(),
            vec![
                "stop snapcast-server.service",
                "disable snapcast-server.service",
                "mask snapcast-server.service",
                "daemon-reload",
            ]
        );
        assert_eq!(quarantine.records().unwrap(), vec![record]);
    }

    #[smol_potat::test]
    async fn test_ledger_is_append_only() {
        let root = tempfile::tempdir().unwrap();
        let a = unit_file(root.path(), "a.service");
        let b = unit_file(root.path(), "b.service");
        let services = FakeServiceManager::new()
            .with_unit("a.service", FakeUnit::new())
            .with_unit("b.service", FakeUnit::new());
        let quarantine =
            Quarantine::new(&services, root.path().join("backup")).with_snapshots(false);

        let first = quarantine.quarantine_unit("a.service", &a).await.unwrap();
        let second = quarantine.quarantine_unit("b.service", &b).await.unwrap();
        quarantine.restore(&first).await.unwrap();

        // Restoring keeps the history
        assert_eq!(quarantine.records().unwrap(), vec![first, second]);
    }

    #[smol_potat::test]
    async fn test_restore_puts_file_back_and_unmasks() {
        let root = tempfile::tempdir().unwrap();
        let source = unit_file(root.path(), "snapclient.service");
        let services =
            FakeServiceManager::new().with_unit("snapclient.service", FakeUnit::new().enabled());
        let quarantine = Quarantine::new(&services, root.path().join("backup"));

        let record = quarantine
            .quarantine_unit("snapclient.service", &source)
            .await
            .unwrap();
        quarantine.restore(&record).await.unwrap();

        assert!(source.exists());
        assert!(!record.destination.exists());
        assert_ne!(
            services.unit("snapclient.service").unwrap().enablement,
            Enablement::Masked
        );
        assert!(record.restore_command.contains("systemctl unmask snapclient.service"));
    }

    #[smol_potat::test]
    async fn test_restore_refuses_to_overwrite() {
        let root = tempfile::tempdir().unwrap();
        let source = unit_file(root.path(), "x.service");
        let services = FakeServiceManager::new().with_unit("x.service", FakeUnit::new());
        let quarantine = Quarantine::new(&services, root.path().join("backup"));

        let record = quarantine.quarantine_unit("x.service", &source).await.unwrap();
        std::fs::write(&source, "replacement").unwrap();

        services.clear_calls();
        assert!(matches!(
            quarantine.restore(&record).await,
            Err(QuarantineError::RestoreConflict { .. })
        ));
        assert!(record.destination.exists());
        // A refused restore leaves the unit masked
        assert_eq!(
            services.unit("x.service").unwrap().enablement,
            Enablement::Masked
        );
        assert!(services.calls().is_empty(), "{:?}", services.calls());
    }

    #[smol_potat::test]
    async fn test_mask_link_is_not_a_restore_conflict() {
        let root = tempfile::tempdir().unwrap();
        let source = unit_file(root.path(), "x.service");
        let services = FakeServiceManager::new().with_unit("x.service", FakeUnit::new());
        let quarantine =
            Quarantine::new(&services, root.path().join("backup")).with_snapshots(false);

        let record = quarantine.quarantine_unit("x.service", &source).await.unwrap();
        std::os::unix::fs::symlink("/dev/null", &source).unwrap();

        quarantine.restore(&record).await.unwrap();
        let restored = std::fs::symlink_metadata(&source).unwrap();
        assert!(restored.file_type().is_file());
        assert!(std::fs::read_to_string(&source).unwrap().contains("ExecStart"));
    }

    #[smol_potat::test]
    async fn test_failed_mask_leaves_a_restorable_record() {
        use crate::service::Systemctl;
        use command_executor::{Output, ScriptedRunner};

        let root = tempfile::tempdir().unwrap();
        let source = unit_file(root.path(), "snapcast-server.service");
        let runner = ScriptedRunner::new()
            .on(
                "systemctl mask",
                Output::failed(1, "Failed to mask unit: Access denied"),
            )
            .with_fallback(Output::ok(""));
        let quarantine = Quarantine::new(Systemctl::new(&runner), root.path().join("backup"));

        let result = quarantine
            .quarantine_unit("snapcast-server.service", &source)
            .await;

        assert!(matches!(result, Err(QuarantineError::Service(_))));
        assert!(!source.exists());
        let records = quarantine.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original, source);
        assert!(records[0].destination.exists());
        assert!(records[0].restore_command.contains("systemctl unmask"));

        quarantine.restore(&records[0]).await.unwrap();
        assert!(source.exists());
    }

    #[smol_potat::test]
    async fn test_shadowed_binary_rules() {
        use std::os::unix::fs::PermissionsExt;
        let root = tempfile::tempdir().unwrap();
        let packaged = root.path().join("usr/bin/snapserver");
        let shadow = root.path().join("usr/local/bin/snapserver");
        std::fs::create_dir_all(packaged.parent().unwrap()).unwrap();
        std::fs::create_dir_all(shadow.parent().unwrap()).unwrap();
        std::fs::write(&shadow, "#!/bin/sh\n").unwrap();

        let services = FakeServiceManager::new();
        let packages = FakePackageManager::new();
        let quarantine = Quarantine::new(&services, root.path().join("backup"));

        // Packaged binary missing: keep the shadow
        let outcome = quarantine
            .resolve_shadowed_binary(&shadow, &packaged, &packages)
            .await
            .unwrap();
        assert!(matches!(outcome, ShadowOutcome::Kept { .. }));

        // Packaged binary present but not executable: keep
        std::fs::write(&packaged, "binary").unwrap();
        std::fs::set_permissions(&packaged, std::fs::Permissions::from_mode(0o644)).unwrap();
        let outcome = quarantine
            .resolve_shadowed_binary(&shadow, &packaged, &packages)
            .await
            .unwrap();
        assert!(matches!(outcome, ShadowOutcome::Kept { .. }));

        // Shadow tracked by a package: keep
        std::fs::set_permissions(&packaged, std::fs::Permissions::from_mode(0o755)).unwrap();
        let tracked = FakePackageManager::new().owning(&shadow);
        let outcome = quarantine
            .resolve_shadowed_binary(&shadow, &packaged, &tracked)
            .await
            .unwrap();
        assert!(matches!(outcome, ShadowOutcome::Kept { .. }));
        assert!(shadow.exists());

        // Both conditions hold: moved aside, not deleted
        let outcome = quarantine
            .resolve_shadowed_binary(&shadow, &packaged, &packages)
            .await
            .unwrap();
        let record = match outcome {
            ShadowOutcome::Removed(record) => record,
            other => panic!("expected removal, got {other:?}"),
        };
        assert!(!shadow.exists());
        assert!(record.destination.exists());

        let outcome = quarantine
            .resolve_shadowed_binary(&shadow, &packaged, &packages)
            .await
            .unwrap();
        assert_eq!(outcome, ShadowOutcome::Absent);
    }
}
