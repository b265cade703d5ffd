//! Package reconciliation
//!
//! A package is only touched when its installed version differs from the
//! desired one. The desired version always comes from the package manager's
//! own metadata: the repository candidate, or the version a downloaded
//! artifact declares about itself.

use async_trait::async_trait;
use command_executor::{Command, Output, Runner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Connect timeout passed to the downloader
pub const DOWNLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall limit for one artifact download
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Package reconciliation errors
#[derive(Debug, Error)]
pub enum PackageError {
    /// The package manager reported no version for the desired artifact
    #[error("Could not resolve a version for {package} from package metadata")]
    VersionUnresolved {
        /// Package name
        package: String,
    },

    /// An artifact file name does not follow `<name>_<version>-<revision>_<arch>_<codename>`
    #[error("Unrecognised artifact name '{file}': {reason}")]
    ArtifactName {
        /// Offending file name
        file: String,
        /// What is wrong with it
        reason: String,
    },

    /// The artifact could not be downloaded
    #[error("Download of {url} failed: {reason}")]
    DownloadFailed {
        /// Source URL
        url: String,
        /// Captured diagnostic text
        reason: String,
    },

    /// The dependency-fix pass failed
    #[error("Fixing broken dependencies failed: {reason}")]
    FixBrokenFailed {
        /// Captured diagnostic text
        reason: String,
    },

    /// A package manager command failed
    #[error("{action} {package} failed: {stderr}")]
    CommandFailed {
        /// What was being done
        action: String,
        /// Package name
        package: String,
        /// Captured diagnostic text
        stderr: String,
    },

    /// The installed version differs from the desired one after installation
    #[error("{package} is at {found:?} after install, expected {expected}")]
    VersionMismatch {
        /// Package name
        package: String,
        /// Desired version
        expected: String,
        /// Installed version afterwards
        found: Option<String>,
    },

    /// Filesystem error in the artifact cache
    #[error("Artifact cache error at {}: {source}", path.display())]
    Cache {
        /// Path involved
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The command could not be run at all
    #[error("Command execution error: {0}")]
    Command(#[from] command_executor::Error),
}

impl PackageError {
    /// A copy-pasteable command that addresses the error, when one is known
    pub fn remediation(&self) -> Option<String> {
        match self {
            PackageError::VersionUnresolved { package } => Some(format!(
                "sudo apt-get update && apt-cache policy {}",
                package
            )),
            PackageError::DownloadFailed { url, .. } => {
                Some(format!("curl -fI --connect-timeout 10 {}", url))
            }
            PackageError::FixBrokenFailed { .. } => {
                Some("sudo apt-get -f install -y".to_string())
            }
            PackageError::CommandFailed { .. } | PackageError::VersionMismatch { .. } => {
                Some("sudo dpkg --audit".to_string())
            }
            PackageError::Cache { path, .. } => path
                .parent()
                .map(|dir| format!("sudo mkdir -p {}", dir.display())),
            PackageError::ArtifactName { .. } | PackageError::Command(_) => None,
        }
    }
}

/// Result type for package operations
pub type Result<T> = std::result::Result<T, PackageError>;

/// Where a package's desired version comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// The package manager's repository candidate
    Repository,
    /// A downloadable archive whose file name encodes its version
    Artifact {
        /// Download URL; the last path segment is the file name
        url: String,
    },
}

/// A package and where to get it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    /// Package name
    pub name: String,
    /// Source of the desired version
    pub source: PackageSource,
}

impl PackageSpec {
    /// Install from the repository candidate
    pub fn repository(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: PackageSource::Repository,
        }
    }

    /// Install from a downloaded artifact
    pub fn artifact(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: PackageSource::Artifact { url: url.into() },
        }
    }
}

/// Fields of an artifact file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    /// Package name
    pub name: String,
    /// Upstream version
    pub version: String,
    /// Packaging revision
    pub revision: String,
    /// Architecture
    pub arch: String,
    /// Distribution codename
    pub codename: String,
    /// Extension after the codename, without the dot
    pub extension: String,
}

impl ArtifactName {
    /// Parse `<name>_<version>-<revision>_<arch>_<codename>.<ext>` positionally
    pub fn parse(file: &str) -> Result<Self> {
        let bad = |reason: &str| PackageError::ArtifactName {
            file: file.to_string(),
            reason: reason.to_string(),
        };
        let (stem, extension) = file.rsplit_once('.').ok_or_else(|| bad("no extension"))?;
        let fields: Vec<&str> = stem.split('_').collect();
        let [name, full_version, arch, codename] = fields.as_slice() else {
            return Err(bad("expected four '_'-separated fields"));
        };
        let (version, revision) = full_version
            .rsplit_once('-')
            .ok_or_else(|| bad("version has no '-<revision>' suffix"))?;
        if [*name, version, revision, *arch, *codename]
            .iter()
            .any(|f| f.is_empty())
        {
            return Err(bad("empty field"));
        }
        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            revision: revision.to_string(),
            arch: arch.to_string(),
            codename: codename.to_string(),
            extension: extension.to_string(),
        })
    }

    /// `<version>-<revision>`, the form the package database reports
    pub fn full_version(&self) -> String {
        format!("{}-{}", self.version, self.revision)
    }
}

/// Last path segment of a URL
pub fn url_file_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

/// The host's package manager
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Installed version, `None` when not installed
    async fn installed_version(&self, package: &str) -> Result<Option<String>>;
    /// Repository candidate version, `None` when there is none
    async fn candidate_version(&self, package: &str) -> Result<Option<String>>;
    /// Version an artifact declares in its own metadata
    async fn artifact_version(&self, artifact: &Path) -> Result<Option<String>>;
    /// Install `package` at `version` from the repository
    async fn install_version(&self, package: &str, version: &str) -> Result<()>;
    /// Install a local artifact
    async fn install_artifact(&self, artifact: &Path) -> Result<()>;
    /// Resolve broken or missing dependencies
    async fn fix_broken(&self) -> Result<()>;
    /// Whether any installed package owns `path`
    async fn owns_path(&self, path: &Path) -> Result<bool>;
}

#[async_trait]
impl<P: PackageManager + ?Sized> PackageManager for &P {
    async fn installed_version(&self, package: &str) -> Result<Option<String>> {
        (**self).installed_version(package).await
    }

    async fn candidate_version(&self, package: &str) -> Result<Option<String>> {
        (**self).candidate_version(package).await
    }

    async fn artifact_version(&self, artifact: &Path) -> Result<Option<String>> {
        (**self).artifact_version(artifact).await
    }

    async fn install_version(&self, package: &str, version: &str) -> Result<()> {
        (**self).install_version(package, version).await
    }

    async fn install_artifact(&self, artifact: &Path) -> Result<()> {
        (**self).install_artifact(artifact).await
    }

    async fn fix_broken(&self) -> Result<()> {
        (**self).fix_broken().await
    }

    async fn owns_path(&self, path: &Path) -> Result<bool> {
        (**self).owns_path(path).await
    }
}

#[async_trait]
impl<P: PackageManager + ?Sized> PackageManager for Arc<P> {
    async fn installed_version(&self, package: &str) -> Result<Option<String>> {
        (**self).installed_version(package).await
    }

    async fn candidate_version(&self, package: &str) -> Result<Option<String>> {
        (**self).candidate_version(package).await
    }

    async fn artifact_version(&self, artifact: &Path) -> Result<Option<String>> {
        (**self).artifact_version(artifact).await
    }

    async fn install_version(&self, package: &str, version: &str) -> Result<()> {
        (**self).install_version(package, version).await
    }

    async fn install_artifact(&self, artifact: &Path) -> Result<()> {
        (**self).install_artifact(artifact).await
    }

    async fn fix_broken(&self) -> Result<()> {
        (**self).fix_broken().await
    }

    async fn owns_path(&self, path: &Path) -> Result<bool> {
        (**self).owns_path(path).await
    }
}

/// Fetches a URL to a local file
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download `url` into `dest`
    ///
    /// Implementations may leave a partial file behind on failure; the
    /// reconciler removes it.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

#[async_trait]
impl<D: Downloader + ?Sized> Downloader for &D {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        (**self).fetch(url, dest).await
    }
}

#[async_trait]
impl<D: Downloader + ?Sized> Downloader for Arc<D> {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        (**self).fetch(url, dest).await
    }
}

/// [`PackageManager`] backed by dpkg and apt
pub struct Apt<R> {
    runner: R,
}

impl<R: Runner> Apt<R> {
    /// Issue commands through `runner`
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    async fn apt_get(&self, args: &[&str], package: &str, action: &str) -> Result<()> {
        let cmd = Command::builder("apt-get")
            .args(args)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .build();
        info!(command = %cmd, "running package manager");
        let output = self.runner.run(&cmd).await?;
        check(output, action, package)
    }
}

fn check(output: Output, action: &str, package: &str) -> Result<()> {
    if output.success() {
        Ok(())
    } else {
        Err(PackageError::CommandFailed {
            action: action.to_string(),
            package: package.to_string(),
            stderr: output.diagnostic().to_string(),
        })
    }
}

/// Pull the `Candidate:` line out of `apt-cache policy` output
pub fn parse_candidate(policy: &str) -> Option<String> {
    policy
        .lines()
        .find_map(|line| line.trim().strip_prefix("Candidate:"))
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != "(none)")
        .map(str::to_string)
}

#[async_trait]
impl<R: Runner> PackageManager for Apt<R> {
    async fn installed_version(&self, package: &str) -> Result<Option<String>> {
        let cmd = Command::builder("dpkg-query")
            .args(["-W", "-f=${Status}|${Version}", package])
            .build();
        let output = self.runner.run(&cmd).await?;
        if !output.success() {
            return Ok(None);
        }
        let (status, version) = output
            .stdout_trimmed()
            .split_once('|')
            .unwrap_or(("", ""));
        Ok((status.ends_with(" installed") && !version.is_empty()).then(|| version.to_string()))
    }

    async fn candidate_version(&self, package: &str) -> Result<Option<String>> {
        let cmd = Command::builder("apt-cache")
            .args(["policy", package])
            .build();
        let output = self.runner.run(&cmd).await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(parse_candidate(&output.stdout))
    }

    async fn artifact_version(&self, artifact: &Path) -> Result<Option<String>> {
        let cmd = Command::builder("dpkg-deb")
            .arg("-f")
            .arg(artifact)
            .arg("Version")
            .build();
        let output = self.runner.run(&cmd).await?;
        let version = output.stdout_trimmed();
        Ok((output.success() && !version.is_empty()).then(|| version.to_string()))
    }

    async fn install_version(&self, package: &str, version: &str) -> Result<()> {
        let pinned = format!("{}={}", package, version);
        self.apt_get(
            &["install", "-y", "--allow-downgrades", &pinned],
            package,
            "install",
        )
        .await
    }

    async fn install_artifact(&self, artifact: &Path) -> Result<()> {
        let path = artifact.display().to_string();
        self.apt_get(
            &["install", "-y", "--allow-downgrades", &path],
            &path,
            "install",
        )
        .await
    }

    async fn fix_broken(&self) -> Result<()> {
        self.apt_get(&["-f", "install", "-y"], "", "fix-broken")
            .await
            .map_err(|e| match e {
                PackageError::CommandFailed { stderr, .. } => {
                    PackageError::FixBrokenFailed { reason: stderr }
                }
                other => other,
            })
    }

    async fn owns_path(&self, path: &Path) -> Result<bool> {
        let cmd = Command::builder("dpkg").arg("-S").arg(path).build();
        Ok(self.runner.run(&cmd).await?.success())
    }
}

/// [`Downloader`] backed by curl with enforced timeouts
pub struct CurlDownloader<R> {
    runner: R,
}

impl<R: Runner> CurlDownloader<R> {
    /// Issue commands through `runner`
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl<R: Runner> Downloader for CurlDownloader<R> {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let cmd = Command::builder("curl")
            .args([
                "-fsSL",
                "--connect-timeout",
                &DOWNLOAD_CONNECT_TIMEOUT.as_secs().to_string(),
                "--max-time",
                &DOWNLOAD_TIMEOUT.as_secs().to_string(),
                "-o",
            ])
            .arg(dest)
            .arg(url)
            .timeout(DOWNLOAD_TIMEOUT + DOWNLOAD_CONNECT_TIMEOUT)
            .build();
        debug!(url, dest = %dest.display(), "downloading");
        let output = self.runner.run(&cmd).await?;
        if output.success() {
            Ok(())
        } else {
            Err(PackageError::DownloadFailed {
                url: url.to_string(),
                reason: output.diagnostic().to_string(),
            })
        }
    }
}

/// What reconciling a package did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageOutcome {
    /// Already at the desired version
    Unchanged {
        /// Installed version
        version: String,
    },
    /// Was absent and is now installed
    Installed {
        /// Installed version
        version: String,
    },
    /// Was at another version and is now at the desired one
    Upgraded {
        /// Previous version
        from: String,
        /// Installed version
        to: String,
    },
}

impl PackageOutcome {
    /// Whether the package database changed
    pub fn changed(&self) -> bool {
        !matches!(self, PackageOutcome::Unchanged { .. })
    }

    /// Version installed afterwards
    pub fn version(&self) -> &str {
        match self {
            PackageOutcome::Unchanged { version } | PackageOutcome::Installed { version } => {
                version
            }
            PackageOutcome::Upgraded { to, .. } => to,
        }
    }
}

/// Brings packages to their desired versions
pub struct PackageReconciler<P, D> {
    manager: P,
    downloader: D,
    cache_dir: PathBuf,
}

impl<P: PackageManager, D: Downloader> PackageReconciler<P, D> {
    /// Create a reconciler that caches artifacts in `cache_dir`
    pub fn new(manager: P, downloader: D, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            downloader,
            cache_dir: cache_dir.into(),
        }
    }

    /// Bring `spec` to its desired version
    pub async fn reconcile(&self, spec: &PackageSpec) -> Result<PackageOutcome> {
        let installed = self.manager.installed_version(&spec.name).await?;
        debug!(package = %spec.name, ?installed, "installed version");

        let desired = match &spec.source {
            PackageSource::Repository => self
                .manager
                .candidate_version(&spec.name)
                .await?
                .ok_or_else(|| PackageError::VersionUnresolved {
                    package: spec.name.clone(),
                })?,
            PackageSource::Artifact { url } => {
                let file = url_file_name(url);
                let artifact = ArtifactName::parse(file)?;
                if artifact.name != spec.name {
                    return Err(PackageError::ArtifactName {
                        file: file.to_string(),
                        reason: format!("names package '{}', expected '{}'", artifact.name, spec.name),
                    });
                }
                artifact.full_version()
            }
        };

        if installed.as_deref() == Some(desired.as_str()) {
            info!(package = %spec.name, version = %desired, "package up to date");
            return Ok(PackageOutcome::Unchanged { version: desired });
        }

        match &spec.source {
            PackageSource::Repository => {
                info!(package = %spec.name, from = ?installed, to = %desired, "installing from repository");
                self.manager.install_version(&spec.name, &desired).await?;
            }
            PackageSource::Artifact { url } => {
                let artifact = self.cached_artifact(url).await?;
                if let Err(e) = self.verify_artifact(spec, url, &artifact, &desired).await {
                    evict(&artifact);
                    return Err(e);
                }
                info!(package = %spec.name, from = ?installed, to = %desired, "installing artifact");
                self.manager.install_artifact(&artifact).await?;
            }
        }

        self.manager.fix_broken().await?;

        let after = self.manager.installed_version(&spec.name).await?;
        if after.as_deref() != Some(desired.as_str()) {
            return Err(PackageError::VersionMismatch {
                package: spec.name.clone(),
                expected: desired,
                found: after,
            });
        }

        Ok(match installed {
            None => PackageOutcome::Installed { version: desired },
            Some(from) => PackageOutcome::Upgraded { from, to: desired },
        })
    }

    /// Check that the archive declares the version its file name promises
    async fn verify_artifact(
        &self,
        spec: &PackageSpec,
        url: &str,
        artifact: &Path,
        desired: &str,
    ) -> Result<()> {
        let declared = self
            .manager
            .artifact_version(artifact)
            .await?
            .ok_or_else(|| PackageError::VersionUnresolved {
                package: spec.name.clone(),
            })?;
        if declared != desired {
            return Err(PackageError::ArtifactName {
                file: url_file_name(url).to_string(),
                reason: format!("archive declares version {}", declared),
            });
        }
        Ok(())
    }

    /// Path of the cached artifact for `url`, downloading it if absent
    ///
    /// Downloads land in a `.partial` file that is renamed on success and
    /// removed on failure, so the cache never holds a truncated artifact.
    pub async fn cached_artifact(&self, url: &str) -> Result<PathBuf> {
        let file = url_file_name(url);
        let path = self.cache_dir.join(file);
        if std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false) {
            debug!(artifact = %path.display(), "using cached artifact");
            return Ok(path);
        }

        std::fs::create_dir_all(&self.cache_dir).map_err(|source| PackageError::Cache {
            path: self.cache_dir.clone(),
            source,
        })?;
        let partial = self.cache_dir.join(format!("{}.partial", file));
        if let Err(e) = self.downloader.fetch(url, &partial).await {
            match std::fs::remove_file(&partial) {
                Err(rm) if rm.kind() != std::io::ErrorKind::NotFound => {
                    warn!(path = %partial.display(), error = %rm, "could not remove partial download");
                }
                _ => {}
            }
            return Err(e);
        }
        std::fs::rename(&partial, &path).map_err(|source| PackageError::Cache {
            path: path.clone(),
            source,
        })?;
        info!(artifact = %path.display(), "downloaded artifact");
        Ok(path)
    }
}

/// Drop a cached artifact that failed verification so the next run fetches it again
fn evict(artifact: &Path) {
    match std::fs::remove_file(artifact) {
        Ok(()) => warn!(artifact = %artifact.display(), "evicted unusable cached artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(artifact = %artifact.display(), error = %e, "could not evict cached artifact")
        }
    }
}
