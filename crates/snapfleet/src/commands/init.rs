use super::Environment;
use crate::OverrideArgs;
use anyhow::{Context, Result};
use host_reconcile::template::install_builtin_templates;
use snapfleet_config::update_generated;

pub async fn run(env: &Environment, values: &OverrideArgs) -> Result<u8> {
    let overrides = values.to_overrides()?;
    let merged = update_generated(&env.overrides, &overrides.to_flat())?;
    println!(
        "✓ Wrote {} ({} key(s))",
        env.overrides.display(),
        merged.len()
    );

    let paths = env.paths();
    let written =
        install_builtin_templates(&paths.template_dir).context("Failed to install templates")?;
    for path in &written {
        println!("  installed template {}", path.display());
    }
    Ok(0)
}
