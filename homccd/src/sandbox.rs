//! Sandboxed compiler execution.
//!
//! Three interchangeable back-ends behind one contract: run an argv in a
//! working directory with captured output. Selection is by data from the
//! request, not by type; a request naming a profile gets schroot, a request
//! naming a container gets docker, everything else runs directly.

use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Requested sandbox cannot serve this job.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct SandboxUnavailable(pub String);

/// Outcome of one sandboxed command.
#[derive(Debug)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Execution back-end for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sandbox {
    /// Direct process spawn on the server.
    None,
    /// `schroot` environment named by a profile.
    Schroot { profile: String },
    /// Named docker container with /tmp bind-mounted.
    Docker { container: String },
}

impl Sandbox {
    /// Select the back-end from the request fields.
    pub fn from_request(
        profile: Option<&str>,
        container: Option<&str>,
    ) -> Result<Self, SandboxUnavailable> {
        match (profile, container) {
            (Some(_), Some(_)) => Err(SandboxUnavailable(
                "request names both a schroot profile and a docker container".to_string(),
            )),
            (Some(profile), None) => Ok(Sandbox::Schroot {
                profile: profile.to_string(),
            }),
            (None, Some(container)) => Ok(Sandbox::Docker {
                container: container.to_string(),
            }),
            (None, None) => Ok(Sandbox::None),
        }
    }

    /// Verify the selected back-end can actually run jobs right now.
    pub async fn ensure_available(&self) -> Result<(), SandboxUnavailable> {
        match self {
            Sandbox::None => Ok(()),
            Sandbox::Schroot { profile } => {
                if which::which("schroot").is_err() {
                    return Err(SandboxUnavailable(format!(
                        "profile '{profile}' requested but schroot is not installed"
                    )));
                }
                let output = Command::new("schroot")
                    .arg("-l")
                    .stdin(Stdio::null())
                    .output()
                    .await
                    .map_err(|e| SandboxUnavailable(format!("schroot -l failed: {e}")))?;
                let listing = String::from_utf8_lossy(&output.stdout);
                let known = listing.lines().any(|line| {
                    let line = line.trim();
                    line == profile || line.strip_prefix("chroot:") == Some(profile)
                });
                if known {
                    Ok(())
                } else {
                    Err(SandboxUnavailable(format!(
                        "profile '{profile}' is not among the provided schroot environments"
                    )))
                }
            }
            Sandbox::Docker { container } => {
                if which::which("docker").is_err() {
                    return Err(SandboxUnavailable(format!(
                        "container '{container}' requested but docker is not installed"
                    )));
                }
                let output = Command::new("docker")
                    .args(["inspect", "-f", "{{.State.Running}}", container])
                    .stdin(Stdio::null())
                    .output()
                    .await
                    .map_err(|e| SandboxUnavailable(format!("docker inspect failed: {e}")))?;
                if output.status.success()
                    && String::from_utf8_lossy(&output.stdout).trim() == "true"
                {
                    Ok(())
                } else {
                    Err(SandboxUnavailable(format!(
                        "container '{container}' is not running"
                    )))
                }
            }
        }
    }

    /// Run an argv under this back-end with stdin closed and both output
    /// streams captured. A signal death maps to exit code -1.
    pub async fn run(
        &self,
        argv: &[String],
        cwd: &Path,
        envs: &[(String, String)],
    ) -> std::io::Result<RunOutput> {
        debug!(sandbox = ?self, argv = ?argv, cwd = %cwd.display(), "spawning compiler");

        let mut command = match self {
            Sandbox::None => {
                let mut command = Command::new(&argv[0]);
                command.args(&argv[1..]).current_dir(cwd);
                command
            }
            Sandbox::Schroot { profile } => {
                let mut command = Command::new("schroot");
                command
                    .arg("-c")
                    .arg(profile)
                    .arg("-d")
                    .arg(cwd)
                    .arg("--")
                    .args(argv);
                command
            }
            Sandbox::Docker { container } => {
                let quoted: Vec<String> = argv.iter().map(|a| shell_quote(a)).collect();
                let script = format!("cd {} && exec {}", shell_quote(&cwd.display().to_string()), quoted.join(" "));
                let mut command = Command::new("docker");
                command.args(["exec", container, "sh", "-c", &script]);
                command
            }
        };

        for (key, value) in envs {
            command.env(key, value);
        }

        let output = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(RunOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Minimal POSIX single-quote escaping for the docker `sh -c` script.
fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '/' | '_' | '-' | '+' | '=' | ':'))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_follows_request_fields() {
        assert_eq!(Sandbox::from_request(None, None), Ok(Sandbox::None));
        assert_eq!(
            Sandbox::from_request(Some("bookworm"), None),
            Ok(Sandbox::Schroot {
                profile: "bookworm".into()
            })
        );
        assert_eq!(
            Sandbox::from_request(None, Some("builder")),
            Ok(Sandbox::Docker {
                container: "builder".into()
            })
        );
        assert!(Sandbox::from_request(Some("p"), Some("c")).is_err());
    }

    #[test]
    fn shell_quote_passes_safe_strings() {
        assert_eq!(shell_quote("/usr/bin/g++"), "/usr/bin/g++");
        assert_eq!(shell_quote("-O2"), "-O2");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[tokio::test]
    async fn none_sandbox_is_always_available() {
        assert_eq!(Sandbox::None.ensure_available().await, Ok(()));
    }

    #[tokio::test]
    async fn direct_run_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let output = Sandbox::None
            .run(
                &["sh".into(), "-c".into(), "echo out; echo err >&2; exit 3".into()],
                dir.path(),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "out");
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "err");
    }

    #[tokio::test]
    async fn direct_run_applies_cwd_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let output = Sandbox::None
            .run(
                &["sh".into(), "-c".into(), "pwd; printf %s \"$HOMCC_PROBE\"".into()],
                dir.path(),
                &[("HOMCC_PROBE".into(), "yes".into())],
            )
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("yes"));
        let canonical = dir.path().canonicalize().unwrap();
        assert!(stdout.contains(&canonical.display().to_string()));
    }

    #[tokio::test]
    async fn missing_schroot_or_profile_is_unavailable() {
        // Either schroot is absent, or it is present and this profile
        // does not exist; both must refuse.
        let sandbox = Sandbox::Schroot {
            profile: "homcc-test-no-such-profile".into(),
        };
        assert!(sandbox.ensure_available().await.is_err());
    }
}
