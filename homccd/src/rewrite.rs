//! Argument rewriting for sandboxed execution.
//!
//! Client paths are re-parented under the job's root directory preserving
//! the absolute layout (`/usr/include/x.h` → `<root>/usr/include/x.h`), so
//! `#include` resolution inside the sandbox sees exactly the paths the
//! client preprocessor saw. Relative paths stay relative: the compiler runs
//! from the re-parented working directory.

use homcc_common::arguments::{CompilerArgs, PATH_FLAGS, flag_takes_value, is_source_file};
use homcc_common::error::ArgvError;
use std::path::{Path, PathBuf};

/// Where one produced artifact lives on the server, and where the client
/// expects it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMapping {
    pub server_path: PathBuf,
    pub client_path: String,
}

/// A compiler invocation rewritten for execution inside a job tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenJob {
    pub remote_argv: Vec<String>,
    pub outputs: Vec<OutputMapping>,
}

/// Re-parent the client working directory under the job root.
pub fn map_cwd(root: &Path, client_cwd: &str) -> PathBuf {
    root.join(client_cwd.trim_start_matches('/'))
}

/// Re-parent one client path: absolute paths keep their layout under the
/// root, relative paths resolve against the mapped working directory.
pub fn map_client_path(root: &Path, mapped_cwd: &Path, path: &str) -> PathBuf {
    match path.strip_prefix('/') {
        Some(rel) => root.join(rel),
        None => mapped_cwd.join(path),
    }
}

/// Rewrite an argv for execution under `root`.
///
/// Dependency-generation flags are dropped (the client already scanned),
/// include and output paths are re-parented, `-c` is preserved, and the
/// produced object files are mapped back to the client paths they belong
/// to.
pub fn rewrite(args: &CompilerArgs, root: &Path, client_cwd: &str) -> Result<RewrittenJob, ArgvError> {
    args.validate_remote()?;
    let mapped_cwd = map_cwd(root, client_cwd);

    let mut remote_argv = vec![args.compiler().to_string()];
    let mut client_output: Option<String> = None;

    let mut iter = args.args().iter();
    while let Some(arg) = iter.next() {
        let arg = arg.as_str();

        // Output: remembered, re-appended mapped at the end.
        if arg == "-o" {
            client_output = iter.next().cloned();
            continue;
        }
        if let Some(joined) = arg.strip_prefix("-o")
            && !joined.is_empty()
            && !arg.starts_with("-openmp")
        {
            client_output = Some(joined.to_string());
            continue;
        }

        // Dependency generation already happened on the client.
        if matches!(arg, "-MF" | "-MT" | "-MQ") {
            iter.next();
            continue;
        }
        if arg.starts_with("-M") {
            continue;
        }

        // Include-path flags, separate form.
        if PATH_FLAGS.contains(&arg) {
            let value = iter.next().ok_or_else(|| ArgvError::MissingValue(arg.to_string()))?;
            remote_argv.push(arg.to_string());
            remote_argv.push(path_to_string(map_client_path(root, &mapped_cwd, value)));
            continue;
        }

        // Include-path flags, joined form; longest prefix first so
        // `-isystem/x` is not read as `-i` + garbage.
        if let Some((flag, value)) = split_joined_path_flag(arg) {
            remote_argv.push(format!(
                "{flag}{}",
                path_to_string(map_client_path(root, &mapped_cwd, value))
            ));
            continue;
        }

        if !arg.starts_with('-') && is_source_file(arg) {
            remote_argv.push(path_to_string(map_client_path(root, &mapped_cwd, arg)));
            continue;
        }

        if flag_takes_value(arg) {
            remote_argv.push(arg.to_string());
            if let Some(value) = iter.next() {
                remote_argv.push(value.clone());
            }
            continue;
        }

        remote_argv.push(arg.to_string());
    }

    let outputs = match client_output {
        Some(client_path) => {
            let server_path = map_client_path(root, &mapped_cwd, &client_path);
            remote_argv.push("-o".to_string());
            remote_argv.push(path_to_string(server_path.clone()));
            vec![OutputMapping {
                server_path,
                client_path,
            }]
        }
        None => {
            // Without -o the compiler drops `<stem>.o` into the working
            // directory, which is the mapped cwd.
            args.source_files()
                .iter()
                .map(|source| {
                    let stem = Path::new(source)
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| source.to_string());
                    let object = format!("{stem}.o");
                    OutputMapping {
                        server_path: mapped_cwd.join(&object),
                        client_path: object,
                    }
                })
                .collect()
        }
    };

    Ok(RewrittenJob {
        remote_argv,
        outputs,
    })
}

fn split_joined_path_flag(arg: &str) -> Option<(&'static str, &str)> {
    // Longest first: "-isystem" before "-iquote" before "-I".
    const JOINED: &[&str] = &["-idirafter", "-isystem", "-imacros", "-include", "-iquote", "-I"];
    for flag in JOINED {
        if let Some(value) = arg.strip_prefix(flag)
            && !value.is_empty()
        {
            return Some((flag, value));
        }
    }
    None
}

fn path_to_string(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

// =========================================================================
// Tests
// =========================================================================
