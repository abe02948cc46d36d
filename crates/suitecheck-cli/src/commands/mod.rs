//! CLI command implementations.
//!
//! Each submodule backs one top-level command. Commands return the process
//! exit code on success and a message on failure; `main` prints the message
//! and exits 1.

pub mod pipeline;
pub mod scenario;
pub mod suite;

use serde::Serialize;

/// Pretty-print any serializable value as JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", text);
    Ok(())
}
