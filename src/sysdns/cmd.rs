//! Subprocess plumbing for platform reconfiguration commands.
//!
//! Every privileged OS invocation goes through [`run`], which applies a hard
//! deadline and classifies permission failures so callers can tell the user
//! to elevate instead of showing a raw exit status.

use std::time::Duration;

use tokio::process::Command;

use super::SysDnsError;

/// Deadline for a single subprocess invocation.
pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a command and return its stdout as UTF-8.
///
/// Arguments must be built from validated interface names and IP literals
/// only — never from untrusted input.
pub(crate) async fn run(program: &str, args: &[&str]) -> Result<String, SysDnsError> {
    let rendered = rendered(program, args);
    tracing::debug!(command = %rendered, "running");

    let output = tokio::time::timeout(COMMAND_TIMEOUT, Command::new(program).args(args).output())
        .await
        .map_err(|_| SysDnsError::CommandTimeout {
            command: rendered.clone(),
        })?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                SysDnsError::PermissionDenied {
                    command: rendered.clone(),
                }
            } else {
                SysDnsError::CommandFailed {
                    command: rendered.clone(),
                    detail: e.to_string(),
                }
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if looks_like_permission_error(&stderr) {
            return Err(SysDnsError::PermissionDenied { command: rendered });
        }
        return Err(SysDnsError::CommandFailed {
            command: rendered,
            detail: format!("{}: {}", output.status, stderr.trim()),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn rendered(program: &str, args: &[&str]) -> String {
    let mut s = String::from(program);
    for arg in args {
        s.push(' ');
        s.push_str(arg);
    }
    s
}

fn looks_like_permission_error(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("permission denied")
        || lower.contains("access is denied")
        || lower.contains("operation not permitted")
        || lower.contains("requires elevation")
        || lower.contains("must be run as root")
}
