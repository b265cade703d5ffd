use super::Environment;
use crate::exit;
use anyhow::Result;
use host_reconcile::Preflight;
use snapfleet_config::CliOverrides;

pub async fn run(env: &Environment, advisory: bool) -> Result<u8> {
    let report = Preflight::from_env().run(&env.resolver(&CliOverrides::new()));
    println!("{}", report);
    Ok(exit::code(report.exit_code(advisory)))
}
