//! Process spawning and quoting shared by every command channel.
//!
//! Values interpolated into remote command lines always go through
//! [`shellquote`]. Each spawn carries a timeout; on expiry the child is
//! killed and the caller gets [`CacheMgrError::Timeout`].

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{CacheMgrError, CacheMgrResult};

/// Path to the POSIX shell used for local execution.
pub const SH_CMD: &str = "/bin/sh";

/// Path to the `ssh` client used for remote execution.
pub const SSH_CMD: &str = "/usr/bin/ssh";

/// `systemctl` for service lifecycle.
pub const SYSTEMCTL_CMD: &str = "systemctl";

/// `curl` for HTTP-level invalidation requests.
pub const CURL_CMD: &str = "curl";

/// `varnishadm` for the daemon's administrative channel.
pub const VARNISHADM_CMD: &str = "varnishadm";

/// `$`, backtick, `"` and `\` keep their meaning inside double quotes. A
/// newline is literal there and must stay unescaped: backslash-newline is a
/// line continuation and the shell would drop both characters.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\])"#).expect("Invalid regex pattern"));

/// Wraps `s` in double quotes with the remaining special characters escaped.
///
/// ```
/// use cachemgr_common::shell::shellquote;
///
/// assert_eq!(shellquote("/etc/varnish/sites/shop.vcl"), "\"/etc/varnish/sites/shop.vcl\"");
/// assert_eq!(shellquote("req.url ~ \"^/$\""), "\"req.url ~ \\\"^/\\$\\\"\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Exit status and output of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Exit status; -1 when the process died from a signal.
    pub exit_code: i32,
    /// Raw stdout output, untrimmed (file reads depend on exact bytes).
    pub stdout: String,
    /// Trimmed stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Creates a successful result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Creates a failed result.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Zero exit status.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stdout followed by stderr, for error reports.
    pub fn combined_output(&self) -> String {
        let stdout = self.stdout.trim();
        if self.stderr.is_empty() {
            stdout.to_string()
        } else if stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", stdout, self.stderr)
        }
    }

    /// Converts a non-zero exit into [`CacheMgrError::ShellCommandFailed`],
    /// returning trimmed stdout on success.
    pub fn into_stdout(self, command: &str) -> CacheMgrResult<String> {
        if self.success() {
            Ok(self.stdout.trim().to_string())
        } else {
            Err(CacheMgrError::ShellCommandFailed {
                command: command.to_string(),
                exit_code: self.exit_code,
                output: self.combined_output(),
            })
        }
    }
}

/// Runs a program with arguments, optional stdin, and a timeout.
///
/// This is the single spawn point for both local and ssh execution. The
/// child is killed if the timeout elapses (`kill_on_drop`).
pub async fn run(
    program: &str,
    args: &[String],
    input: Option<&[u8]>,
    timeout: Duration,
) -> CacheMgrResult<ExecResult> {
    let command_line = format!("{} {}", program, args.join(" "));
    tracing::debug!(command = %command_line, timeout = ?timeout, "Executing shell command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CacheMgrError::ShellExec {
            command: command_line.clone(),
            source: e,
        })?;

    if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
        let data = bytes.to_vec();
        // Feed stdin concurrently so a large payload cannot deadlock against
        // a full stdout pipe.
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&data).await {
                tracing::warn!(error = %e, "Failed to write command stdin");
            }
            let _ = stdin.shutdown().await;
        });
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| CacheMgrError::ShellExec {
            command: command_line.clone(),
            source: e,
        })?,
        Err(_) => {
            tracing::warn!(command = %command_line, timeout = ?timeout, "Command timed out");
            return Err(CacheMgrError::Timeout {
                command: command_line,
                timeout,
            });
        }
    };

    // Stdout carries file contents; a lossy decode would write back altered
    // bytes, so anything that is not UTF-8 is refused.
    let stdout = String::from_utf8(output.stdout).map_err(|e| {
        tracing::warn!(command = %command_line, "Command output is not UTF-8");
        CacheMgrError::NonUtf8Output {
            command: command_line.clone(),
            offset: e.utf8_error().valid_up_to(),
        }
    })?;

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if result.success() {
        tracing::trace!(command = %command_line, "Command succeeded");
    } else {
        tracing::warn!(
            command = %command_line,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}
