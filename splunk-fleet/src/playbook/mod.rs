// SPDX-License-Identifier: AGPL-3.0-or-later
//! Playbook parsing and execution module
//!
//! A playbook is an ordered list of plays. Each play targets an inventory
//! group and invokes the `linux`, `enterprise` and `core` roles in
//! dependency order.

mod executor;
mod parser;

pub use executor::{HostSource, PlaybookExecutor, PlaybookResult, TaskResult};
pub use parser::{Play, Playbook, Role, RoleInvocation, RoleTask};

use crate::error::Result;
use std::path::Path;

/// Load a playbook from a file
///
/// # Arguments
///
/// * `path` - Path to the playbook file
///
/// # Returns
///
/// The parsed playbook or an error
pub fn load_playbook<P: AsRef<Path>>(path: P) -> Result<Playbook> {
    parser::Playbook::from_file(path)
}

/// List all available playbooks in a directory
///
/// # Arguments
///
/// * `dir` - Directory containing playbook files
///
/// # Returns
///
/// A sorted vector of playbook names
pub fn list_playbooks<P: AsRef<Path>>(dir: P) -> Result<Vec<String>> {
    let dir = dir.as_ref();
    let mut playbooks = Vec::new();

    if !dir.exists() {
        return Ok(playbooks);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();

        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            if let Some(stem) = path.file_stem() {
                playbooks.push(stem.to_string_lossy().to_string());
            }
        }
    }

    playbooks.sort();
    Ok(playbooks)
}
