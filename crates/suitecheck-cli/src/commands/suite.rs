//! `suitecheck suite`: lifecycle primitives for hand-written test scripts.

use suitecheck_core::config::HarnessConfig;
use suitecheck_core::suite::instance_name;

/// Install `template`; prints the instance name on stdout so shell scripts
/// can capture it.
pub fn install(config: &HarnessConfig, template: &str, name: Option<&str>) -> Result<i32, String> {
    let installer = config.installer();
    let name = name.map(str::to_string).unwrap_or_else(|| instance_name(template));
    let instance = installer.install(template, &name).map_err(|e| e.to_string())?;
    tracing::info!(
        "[suite] Installed {} at {}",
        instance.name,
        instance.path.display()
    );
    println!("{}", instance.name);
    Ok(0)
}

pub fn purge(config: &HarnessConfig, name: &str) -> Result<i32, String> {
    let removed = config.installer().purge(name).map_err(|e| e.to_string())?;
    if removed {
        tracing::info!("[suite] Purged {}", name);
    } else {
        tracing::info!("[suite] {} was not installed", name);
    }
    Ok(0)
}

pub fn list(config: &HarnessConfig) -> Result<i32, String> {
    let installer = config.installer();
    let names = installer.list().map_err(|e| e.to_string())?;
    if names.is_empty() {
        eprintln!("No suite instances under {}", installer.run_dir().display());
    }
    for name in names {
        match installer.load(&name) {
            Ok(instance) => println!(
                "{:<40} {}  {}",
                instance.name,
                instance.installed_at.format("%Y-%m-%d %H:%M:%S"),
                instance.source.display()
            ),
            Err(_) => println!("{:<40} (no install manifest)", name),
        }
    }
    Ok(0)
}
