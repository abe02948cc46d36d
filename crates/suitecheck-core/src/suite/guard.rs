//! Scoped ownership of an installed suite instance.
//!
//! `SuiteGuard` purges its instance when dropped, so every exit path out of
//! a scenario (early return, `?`, panic unwinding) releases runtime state.

use crate::error::HarnessResult;
use crate::suite::{SuiteInstaller, SuiteInstance};

pub struct SuiteGuard {
    installer: SuiteInstaller,
    instance: SuiteInstance,
    purged: bool,
}

impl SuiteGuard {
    /// Install `template` as `instance` and take ownership of it.
    pub fn install(installer: &SuiteInstaller, template: &str, instance: &str) -> HarnessResult<Self> {
        let instance = installer.install(template, instance)?;
        Ok(Self {
            installer: installer.clone(),
            instance,
            purged: false,
        })
    }

    pub fn instance(&self) -> &SuiteInstance {
        &self.instance
    }

    pub fn name(&self) -> &str {
        &self.instance.name
    }

    /// Purge now and report the result. Later calls (and the drop) are no-ops.
    pub fn purge(&mut self) -> HarnessResult<bool> {
        if self.purged {
            return Ok(false);
        }
        self.purged = true;
        self.installer.purge(&self.instance.name)
    }
}

impl Drop for SuiteGuard {
    fn drop(&mut self) {
        if self.purged {
            return;
        }
        if let Err(e) = self.installer.purge(&self.instance.name) {
            tracing::warn!("[SuiteGuard] Failed to purge {}: {}", self.instance.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn installer(tmp: &TempDir) -> SuiteInstaller {
        let template = tmp.path().join("templates").join("basic");
        fs::create_dir_all(&template).unwrap();
        fs::write(template.join("flow.cylc"), "[scheduling]\n").unwrap();
        SuiteInstaller::new(tmp.path().join("templates"), tmp.path().join("run"))
    }

    #[test]
    fn test_drop_purges() {
        let tmp = TempDir::new().unwrap();
        let installer = installer(&tmp);
        {
            let guard = SuiteGuard::install(&installer, "basic", "scoped").unwrap();
            assert!(guard.instance().path.is_dir());
        }
        assert!(!installer.instance_path("scoped").exists());
    }

    #[test]
    fn test_drop_purges_on_panic() {
        let tmp = TempDir::new().unwrap();
        let installer = installer(&tmp);
        let inner = installer.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = SuiteGuard::install(&inner, "basic", "panicky").unwrap();
            panic!("scenario blew up");
        });
        assert!(result.is_err());
        assert!(!installer.instance_path("panicky").exists());
    }

    #[test]
    fn test_explicit_purge_then_drop() {
        let tmp = TempDir::new().unwrap();
        let installer = installer(&tmp);
        let mut guard = SuiteGuard::install(&installer, "basic", "explicit").unwrap();
        assert!(guard.purge().unwrap());
        assert!(!guard.purge().unwrap());
        drop(guard);
        assert!(installer.list().unwrap().is_empty());
    }
}
