use super::{Environment, LocalHost};
use crate::{FleetArgs, OverrideArgs, exit};
use anyhow::{Context, Result};
use command_executor::LocalRunner;
use fleet_orchestration::{
    Confirmer, FleetOrchestrator, HostTarget, PresuppliedConfirmer, RemotePlan, SshTransport,
    TerminalConfirmer,
};
use host_reconcile::Role;
use host_reconcile::template::install_builtin_templates;
use tracing::info;

pub async fn run(
    env: &Environment,
    role: Role,
    values: &OverrideArgs,
    fleet: &FleetArgs,
) -> Result<u8> {
    if fleet.hosts.is_empty() {
        local(env, role, values).await
    } else {
        remote(env, role, values, fleet).await
    }
}

async fn local(env: &Environment, role: Role, values: &OverrideArgs) -> Result<u8> {
    let config = env.resolve(&values.to_overrides()?)?;
    if let Some(profile) = config.profile() {
        info!(profile, "profile is informational and does not change reconciliation");
    }

    let paths = env.paths();
    install_builtin_templates(&paths.template_dir).context("Failed to install templates")?;

    let host = LocalHost::new();
    let report = host
        .pipeline(&config, paths)
        .run(role)
        .await
        .with_context(|| format!("Failed to reconcile {} role", role))?;
    println!("{}", report);
    Ok(0)
}

async fn remote(
    env: &Environment,
    role: Role,
    values: &OverrideArgs,
    fleet: &FleetArgs,
) -> Result<u8> {
    // Catch configuration mistakes once, before touching any host
    env.resolve(&values.to_overrides()?)?;

    let hosts = fleet
        .hosts
        .iter()
        .map(|spec| {
            let host: HostTarget = spec.parse().map_err(anyhow::Error::msg)?;
            Ok(match &fleet.identity {
                Some(identity) => host.with_identity(identity.clone()),
                None => host,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let binary = std::env::current_exe().context("Failed to locate the snapfleet binary")?;
    let (subcommand, mut args) = match role {
        Role::Server => ("server", Vec::new()),
        Role::Client => ("client", Vec::new()),
        Role::Combined => ("server", vec!["--combined".to_string()]),
    };
    args.extend(values.to_args());
    let mut plan = RemotePlan::new(subcommand, binary, env.config.clone())
        .with_staging_dir(fleet.staging_dir.clone())
        .with_args(args);
    if env.overrides.exists() {
        plan = plan.with_overrides(env.overrides.clone());
    }

    let known_hosts = dirs::home_dir()
        .context("Failed to determine the home directory for known_hosts")?
        .join(".ssh")
        .join("known_hosts");
    let transport = SshTransport::new(LocalRunner::new(), known_hosts);

    let presupplied = PresuppliedConfirmer::new(fleet.yes_trust.iter().cloned());
    let confirmer: &dyn Confirmer = if fleet.unattended || !fleet.yes_trust.is_empty() {
        &presupplied
    } else {
        &TerminalConfirmer
    };

    let orchestrator =
        FleetOrchestrator::new(transport, confirmer, plan).parallel(fleet.parallel);
    info!(run_id = %orchestrator.run_id(), hosts = hosts.len(), "deploying {} role", role);
    let report = orchestrator.run(&hosts).await?;
    println!("{}", report);
    Ok(exit::code(report.exit_code()))
}
