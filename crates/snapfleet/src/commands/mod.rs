use anyhow::{Context, Result};
use command_executor::LocalRunner;
use host_reconcile::{Apt, CurlDownloader, HostPaths, Pipeline, Systemctl};
use snapfleet_config::{CliOverrides, ConfigLayer, ConfigResolver, ResolvedConfig};
use std::path::PathBuf;

pub mod doctor;
pub mod init;
pub mod preflight;
pub mod reconcile;
pub mod upgrade;
pub mod version;

/// Locations shared by every subcommand
pub struct Environment {
    pub config: PathBuf,
    pub overrides: PathBuf,
    pub root: PathBuf,
    pub backup_dir: Option<PathBuf>,
}

impl Environment {
    /// Base document, generated overrides, then the command line
    pub fn resolver(&self, overrides: &CliOverrides) -> ConfigResolver {
        ConfigResolver::new()
            .layer(ConfigLayer::base(self.config.clone()))
            .layer(ConfigLayer::generated(self.overrides.clone()))
            .layer(overrides.to_layer())
    }

    pub fn resolve(&self, overrides: &CliOverrides) -> Result<ResolvedConfig> {
        self.resolver(overrides)
            .resolve()
            .context("Failed to resolve configuration")
    }

    pub fn paths(&self) -> HostPaths {
        let paths = HostPaths::under(&self.root);
        match &self.backup_dir {
            Some(dir) => paths.with_backup_dir(dir.clone()),
            None => paths,
        }
    }
}

/// The real host collaborators
pub struct LocalHost {
    services: Systemctl<LocalRunner>,
    packages: Apt<LocalRunner>,
    downloader: CurlDownloader<LocalRunner>,
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHost {
    pub fn new() -> Self {
        Self {
            services: Systemctl::new(LocalRunner::new()),
            packages: Apt::new(LocalRunner::new()),
            downloader: CurlDownloader::new(LocalRunner::new()),
        }
    }

    pub fn pipeline<'a>(&'a self, config: &'a ResolvedConfig, paths: HostPaths) -> Pipeline<'a> {
        Pipeline::new(
            config,
            &self.services,
            &self.packages,
            &self.downloader,
            paths,
        )
    }
}
