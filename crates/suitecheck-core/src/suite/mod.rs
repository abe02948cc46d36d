//! Suite lifecycle: install fixture templates as uniquely named instances
//! under an isolated runtime root, and purge them afterwards.
//!
//! Layout of an installed instance:
//!
//! ```text
//! <run_dir>/<instance>/
//!   ├── flow.cylc            (copied from <templates_dir>/<template>/)
//!   ├── log/                 (engine logs)
//!   └── .service/
//!       └── install.json     (instance, source, installed_at)
//! ```
//!
//! Everything the engine writes for an instance (logs, contact files,
//! sockets, lock files) lives under the instance directory, so purging is a
//! single recursive removal.

pub mod guard;

pub use guard::SuiteGuard;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

const SERVICE_DIR: &str = ".service";
const LOG_DIR: &str = "log";
const INSTALL_MANIFEST: &str = "install.json";

/// An installed copy of a fixture template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteInstance {
    /// Unique instance name (directory name under the runtime root)
    pub name: String,
    /// Template directory the instance was copied from
    pub source: PathBuf,
    /// Installed location
    pub path: PathBuf,
    pub installed_at: DateTime<Utc>,
}

/// Derive a collision-free instance name from a scenario's base name.
///
/// The base is sanitised to `[A-Za-z0-9._-]` and suffixed with eight hex
/// characters from a v4 UUID, e.g. `02-conflicting-syntax-3f9a1c0e`.
pub fn instance_name(scenario_base: &str) -> String {
    let mut base: String = scenario_base
        .chars()
        .map(|c| if is_name_char(c) { c } else { '-' })
        .collect();
    base = base.trim_start_matches('.').to_string();
    if base.is_empty() {
        base = "suite".to_string();
    }
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", base, &suffix[..8])
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

fn is_valid_instance_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && name.chars().all(is_name_char)
}

/// Installs and purges suite instances.
#[derive(Debug, Clone)]
pub struct SuiteInstaller {
    templates_dir: PathBuf,
    run_dir: PathBuf,
}

impl SuiteInstaller {
    pub fn new(templates_dir: impl Into<PathBuf>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            run_dir: run_dir.into(),
        }
    }

    pub fn templates_dir(&self) -> &Path {
        &self.templates_dir
    }

    /// The isolated runtime root.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Location an instance would occupy.
    pub fn instance_path(&self, instance: &str) -> PathBuf {
        self.run_dir.join(instance)
    }

    /// Copy `<templates_dir>/<template>` to `<run_dir>/<instance>`.
    ///
    /// Fails with `TemplateNotFound` for a missing template and `Collision`
    /// if the instance directory already exists. Partially copied state is
    /// removed before an error is returned.
    pub fn install(&self, template: &str, instance: &str) -> HarnessResult<SuiteInstance> {
        if !is_valid_instance_name(instance) {
            return Err(HarnessError::Install {
                instance: instance.to_string(),
                reason: "instance names may only contain [A-Za-z0-9._-] and must not start with '.'"
                    .to_string(),
            });
        }

        let source = self.templates_dir.join(template);
        if !source.is_dir() {
            return Err(HarnessError::TemplateNotFound(source));
        }

        fs::create_dir_all(&self.run_dir)?;
        let dest = self.instance_path(instance);

        // create_dir (not create_dir_all) so two installers racing for the
        // same name cannot both succeed.
        match fs::create_dir(&dest) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(HarnessError::Collision(instance.to_string()));
            }
            Err(e) => return Err(HarnessError::Io(e)),
        }

        let installed_at = Utc::now();
        let populate = || -> io::Result<()> {
            copy_dir_recursive(&source, &dest)?;
            fs::create_dir_all(dest.join(LOG_DIR))?;
            fs::create_dir_all(dest.join(SERVICE_DIR))?;
            let manifest = serde_json::json!({
                "instance": instance,
                "source": source,
                "installedAt": installed_at,
            });
            fs::write(
                dest.join(SERVICE_DIR).join(INSTALL_MANIFEST),
                serde_json::to_vec_pretty(&manifest)?,
            )
        };

        if let Err(e) = populate() {
            tracing::warn!("[SuiteInstaller] Install of {} failed, purging partial state", instance);
            if let Err(purge_err) = self.purge(instance) {
                tracing::warn!("[SuiteInstaller] Purge after failed install: {}", purge_err);
            }
            return Err(HarnessError::Install {
                instance: instance.to_string(),
                reason: e.to_string(),
            });
        }

        tracing::info!(
            "[SuiteInstaller] Installed {} from {}",
            instance,
            source.display()
        );

        Ok(SuiteInstance {
            name: instance.to_string(),
            source,
            path: dest,
            installed_at,
        })
    }

    /// Remove all runtime state for an instance.
    ///
    /// Returns `Ok(true)` if something was removed and `Ok(false)` if the
    /// instance did not exist. Never errors for a missing instance.
    pub fn purge(&self, instance: &str) -> HarnessResult<bool> {
        if !is_valid_instance_name(instance) {
            return Ok(false);
        }
        let path = self.instance_path(instance);
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                tracing::info!("[SuiteInstaller] Purged {}", instance);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("[SuiteInstaller] Nothing to purge for {}", instance);
                Ok(false)
            }
            Err(e) => Err(HarnessError::Io(e)),
        }
    }

    /// Names of currently installed instances, sorted.
    pub fn list(&self) -> HarnessResult<Vec<String>> {
        let entries = match fs::read_dir(&self.run_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(HarnessError::Io(e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if is_valid_instance_name(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Read the install manifest of a live instance.
    pub fn load(&self, instance: &str) -> HarnessResult<SuiteInstance> {
        let path = self.instance_path(instance);
        let manifest = fs::read(path.join(SERVICE_DIR).join(INSTALL_MANIFEST))?;
        let value: serde_json::Value = serde_json::from_slice(&manifest)
            .map_err(|e| HarnessError::Parse(format!("Bad install manifest for '{}': {}", instance, e)))?;
        let installed_at = value["installedAt"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Ok(SuiteInstance {
            name: instance.to_string(),
            source: PathBuf::from(value["source"].as_str().unwrap_or_default()),
            path,
            installed_at,
        })
    }
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target)?;
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
