//! Dependency discovery for one translation unit.
//!
//! Runs the compiler in dependency-listing mode (`-M`) and hashes every
//! file the preprocessor touched. Paths are normalized to the absolute form
//! the server will re-parent, so client and server agree on the include
//! layout byte for byte.

use crate::error::ClientError;
use homcc_common::arguments::CompilerArgs;
use homcc_common::hashing::digest_file;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Run the preprocessor and return `absolute path -> digest` for every
/// dependency of the translation unit, including its sources.
pub async fn scan_dependencies(
    args: &CompilerArgs,
    cwd: &Path,
) -> Result<BTreeMap<String, String>, ClientError> {
    let argv = args.dependency_argv();
    debug!(argv = ?argv, "dependency scan");

    let output = Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        return Err(ClientError::DependencyScan(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }

    let listing = String::from_utf8_lossy(&output.stdout);
    let mut dependencies = BTreeMap::new();
    for entry in parse_makefile_rule(&listing) {
        let absolute = if Path::new(&entry).is_absolute() {
            Path::new(&entry).to_path_buf()
        } else {
            cwd.join(&entry)
        };
        let digest = digest_file(&absolute)?;
        dependencies.insert(absolute.to_string_lossy().into_owned(), digest);
    }

    debug!(count = dependencies.len(), "dependencies hashed");
    Ok(dependencies)
}

/// Extract the prerequisite list from a Make-style rule: drop the target up
/// to the first `:`, join backslash-newline continuations, and unescape
/// `\ ` inside paths.
pub fn parse_makefile_rule(listing: &str) -> Vec<String> {
    let joined = listing.replace("\\\r\n", " ").replace("\\\n", " ");
    let prerequisites = match joined.split_once(':') {
        Some((_target, rest)) => rest.to_string(),
        None => joined,
    };

    let mut entries = Vec::new();
    let mut current = String::new();
    let mut chars = prerequisites.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&' ') => {
                chars.next();
                current.push(' ');
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    entries.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        entries.push(current);
    }
    entries
}

// =========================================================================
// Tests
// =========================================================================
