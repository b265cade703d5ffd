use super::{Environment, LocalHost};
use anyhow::{Context, Result};
use host_reconcile::Role;
use snapfleet_config::CliOverrides;

pub async fn run(env: &Environment, role: Role) -> Result<u8> {
    let config = env.resolve(&CliOverrides::new())?;
    let host = LocalHost::new();
    let report = host
        .pipeline(&config, env.paths())
        .upgrade(role)
        .await
        .with_context(|| format!("Failed to upgrade {} role", role))?;
    println!("{}", report);
    Ok(0)
}
