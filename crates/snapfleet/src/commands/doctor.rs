use super::Environment;
use crate::exit;
use anyhow::Result;
use command_executor::LocalRunner;
use host_reconcile::{Doctor, Role, Systemctl, TcpConnect};
use snapfleet_config::CliOverrides;

pub async fn run(env: &Environment, role: Role, advisory: bool) -> Result<u8> {
    let config = env.resolve(&CliOverrides::new())?;
    let doctor = Doctor::new(Systemctl::new(LocalRunner::new()), TcpConnect::default());

    println!("Checking {} role...", role);
    let report = doctor.check(role, &config).await;
    println!("{}", report);
    Ok(exit::code(report.exit_code(advisory)))
}
