//! Scenario file discovery.
//!
//! Arguments may be files or directories. Directories are searched
//! recursively for `*.yaml` / `*.yml`; results are sorted so runs are
//! reproducible. Hidden directories are skipped.

use std::path::{Path, PathBuf};

use crate::error::{HarnessError, HarnessResult};

const SCENARIO_PATTERNS: &[&str] = &["**/*.yaml", "**/*.yml"];

pub fn discover(paths: &[PathBuf]) -> HarnessResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    for path in paths {
        if path.is_file() {
            found.push(path.clone());
        } else if path.is_dir() {
            found.extend(discover_in_dir(path)?);
        } else {
            return Err(HarnessError::Parse(format!(
                "Scenario path '{}' does not exist",
                path.display()
            )));
        }
    }
    found.dedup();
    Ok(found)
}

fn discover_in_dir(dir: &Path) -> HarnessResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    for pattern in SCENARIO_PATTERNS {
        let full = dir.join(pattern);
        let entries = glob::glob(&full.to_string_lossy())
            .map_err(|e| HarnessError::Parse(format!("Bad glob '{}': {}", full.display(), e)))?;
        for entry in entries.flatten() {
            let hidden = entry
                .strip_prefix(dir)
                .map(|rel| {
                    rel.components()
                        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
                })
                .unwrap_or(false);
            if entry.is_file() && !hidden {
                found.push(entry);
            }
        }
    }
    found.sort();
    tracing::debug!("[Discovery] {} scenario file(s) under {}", found.len(), dir.display());
    Ok(found)
}
