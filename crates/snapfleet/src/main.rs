//! Command line entry point for snapfleet

use clap::{Args, Parser, Subcommand};
use fleet_orchestration::DEFAULT_STAGING_DIR;
use host_reconcile::Role;
use snapfleet_config::{CliOverrides, OverrideKey};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod exit;
mod logging;

#[derive(Parser)]
#[command(name = "snapfleet")]
#[command(about = "Snapfleet - reconcile audio servers and clients across a fleet")]
#[command(version)]
struct Cli {
    /// Base configuration document
    #[arg(long, global = true, default_value = "/etc/snapfleet/config.yaml")]
    config: PathBuf,

    /// Generated override document
    #[arg(long, global = true, default_value = "/etc/snapfleet/generated.yaml")]
    overrides: PathBuf,

    /// Filesystem root the managed paths live under
    #[arg(long, global = true, default_value = "/")]
    root: PathBuf,

    /// Directory for snapshots and quarantined files
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,

    /// More logging; -v for debug, -vv for trace
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the generated override document and install templates
    Init {
        #[command(flatten)]
        values: OverrideArgs,
    },

    /// Check host tools, privileges and configuration without changing anything
    Preflight {
        /// Report only; always exit 0
        #[arg(long)]
        advisory: bool,
    },

    /// Reconcile the server role
    Server {
        /// Also run the client on this host
        #[arg(long)]
        combined: bool,

        #[command(flatten)]
        values: OverrideArgs,

        #[command(flatten)]
        fleet: FleetArgs,
    },

    /// Reconcile the client role
    Client {
        #[command(flatten)]
        values: OverrideArgs,

        #[command(flatten)]
        fleet: FleetArgs,
    },

    /// Upgrade packages and restart what changed
    Upgrade {
        /// Role of this host
        #[arg(long)]
        role: Role,
    },

    /// Read-only health checks
    Doctor {
        /// Role of this host
        #[arg(long)]
        role: Role,

        /// Report only; always exit 0
        #[arg(long)]
        advisory: bool,
    },

    /// Show snapfleet and installed package versions
    Version,
}

impl Commands {
    fn is_advisory(&self) -> bool {
        matches!(
            self,
            Commands::Preflight { advisory: true } | Commands::Doctor { advisory: true, .. }
        )
    }
}

/// Whitelisted configuration overrides
#[derive(Args, Debug, Clone, Default)]
pub struct OverrideArgs {
    /// Address of the server clients connect to
    #[arg(long)]
    pub server: Option<String>,

    /// Display name of the client
    #[arg(long)]
    pub name: Option<String>,

    /// Audio output device
    #[arg(long)]
    pub device: Option<String>,

    /// Output level in percent
    #[arg(long)]
    pub level: Option<String>,
}

impl OverrideArgs {
    fn pairs(&self) -> [(OverrideKey, Option<&str>); 4] {
        [
            (OverrideKey::ServerHost, self.server.as_deref()),
            (OverrideKey::DeviceName, self.name.as_deref()),
            (OverrideKey::SoundCard, self.device.as_deref()),
            (OverrideKey::OutputLevel, self.level.as_deref()),
        ]
    }

    /// Validated overrides
    pub fn to_overrides(&self) -> snapfleet_config::Result<CliOverrides> {
        let mut overrides = CliOverrides::new();
        for (key, value) in self.pairs() {
            overrides.set_opt(key, value)?;
        }
        Ok(overrides)
    }

    /// The same flags, for passing to a remote run
    pub fn to_args(&self) -> Vec<String> {
        self.pairs()
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| [format!("--{}", key.flag()), v.to_string()]))
            .flatten()
            .collect()
    }
}

/// Fleet mode options
#[derive(Args, Debug, Clone)]
pub struct FleetArgs {
    /// Reconcile these hosts over ssh instead of this host ([user@]host[:port], comma separated)
    #[arg(long, value_delimiter = ',')]
    pub hosts: Vec<String>,

    /// Accept an unknown host key with this fingerprint (repeatable)
    #[arg(long = "yes-trust", value_name = "FINGERPRINT")]
    pub yes_trust: Vec<String>,

    /// Never prompt; unknown host keys need a matching --yes-trust
    #[arg(long)]
    pub unattended: bool,

    /// Reconcile all hosts concurrently
    #[arg(long)]
    pub parallel: bool,

    /// ssh private key
    #[arg(long)]
    pub identity: Option<PathBuf>,

    /// Remote directory each run creates its private staging directory in
    #[arg(long, default_value = DEFAULT_STAGING_DIR)]
    pub staging_dir: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match logging::init(cli.verbose, cli.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(exit::FAILURE);
        }
    };

    let advisory = cli.command.is_advisory();
    let env = commands::Environment {
        config: cli.config,
        overrides: cli.overrides,
        root: cli.root,
        backup_dir: cli.backup_dir,
    };

    let result = smol::block_on(async {
        match cli.command {
            Commands::Init { values } => commands::init::run(&env, &values).await,
            Commands::Preflight { advisory } => commands::preflight::run(&env, advisory).await,
            Commands::Server {
                combined,
                values,
                fleet,
            } => {
                let role = if combined { Role::Combined } else { Role::Server };
                commands::reconcile::run(&env, role, &values, &fleet).await
            }
            Commands::Client { values, fleet } => {
                commands::reconcile::run(&env, Role::Client, &values, &fleet).await
            }
            Commands::Upgrade { role } => commands::upgrade::run(&env, role).await,
            Commands::Doctor { role, advisory } => commands::doctor::run(&env, role, advisory).await,
            Commands::Version => commands::version::run().await,
        }
    });

    let code = match result {
        Ok(code) => code,
        Err(e) => exit::report(&e),
    };
    if advisory {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(code)
    }
}
