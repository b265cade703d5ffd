use anyhow::Result;
use command_executor::LocalRunner;
use host_reconcile::{Apt, Component, PackageManager};
use tracing::debug;

pub async fn run() -> Result<u8> {
    println!("snapfleet {}", env!("CARGO_PKG_VERSION"));

    let apt = Apt::new(LocalRunner::new());
    for component in [Component::Server, Component::Client] {
        let package = component.package();
        match apt.installed_version(package).await {
            Ok(Some(version)) => println!("{} {}", package, version),
            Ok(None) => println!("{} not installed", package),
            Err(e) => {
                debug!(package, error = %e, "could not query installed version");
                println!("{} unknown", package);
            }
        }
    }
    Ok(0)
}
