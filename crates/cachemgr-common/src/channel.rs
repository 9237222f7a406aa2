//! One-shot command channel to a host.
//!
//! A [`CommandChannel`] runs a single command on a host and returns its
//! output. There is no session state and no transaction across calls;
//! callers that need atomic file replacement get it from
//! [`CommandChannel::write_file`], which writes a temporary sibling and
//! renames it into place.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{CacheMgrError, CacheMgrResult};
use crate::shell::{self, shellquote, ExecResult, SH_CMD, SSH_CMD};

/// Exit status used by the read probe to signal a missing file.
pub const ABSENT_EXIT_CODE: i32 = 44;

/// Exit status ssh uses for its own (transport) failures.
pub const SSH_TRANSPORT_EXIT_CODE: i32 = 255;

/// Suffix of the temporary file used for atomic writes.
pub const TMP_SUFFIX: &str = ".cachemgrd.tmp";

/// Executes commands and moves file content to and from a host.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Host identifier, used for logging and error messages.
    fn host(&self) -> &str;

    /// Runs a command and returns the raw result, whatever its exit code.
    ///
    /// Errors are reserved for the channel itself (spawn, timeout,
    /// connection failure).
    async fn run(&self, command: &str, timeout: Duration) -> CacheMgrResult<ExecResult>;

    /// Reads a file; `None` if it does not exist.
    async fn read_file(&self, path: &str, timeout: Duration) -> CacheMgrResult<Option<String>>;

    /// Replaces a file's content atomically (temporary file, then rename).
    async fn write_file(&self, path: &str, content: &str, timeout: Duration)
        -> CacheMgrResult<()>;

    /// Removes a file; removing an absent file succeeds.
    async fn remove_file(&self, path: &str, timeout: Duration) -> CacheMgrResult<()> {
        self.execute(&format!("rm -f -- {}", shellquote(path)), timeout)
            .await
            .map(|_| ())
    }

    /// Runs a command and fails on non-zero exit, returning trimmed stdout.
    async fn execute(&self, command: &str, timeout: Duration) -> CacheMgrResult<String> {
        self.run(command, timeout).await?.into_stdout(command)
    }
}

/// How commands reach the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Run through the local `/bin/sh`.
    Local,
    /// Run through the `ssh` client in batch mode.
    Ssh {
        /// `user@host` or `host`.
        destination: String,
        /// Optional non-default port.
        port: Option<u16>,
        /// Optional identity file.
        identity: Option<String>,
    },
}

/// Production channel backed by `/bin/sh` or `ssh`.
#[derive(Debug, Clone)]
pub struct ShellChannel {
    host: String,
    transport: Transport,
}

impl ShellChannel {
    /// Creates a channel for `host` over the given transport.
    pub fn new(host: impl Into<String>, transport: Transport) -> Self {
        Self {
            host: host.into(),
            transport,
        }
    }

    /// Creates a channel that runs commands on this machine.
    pub fn local(host: impl Into<String>) -> Self {
        Self::new(host, Transport::Local)
    }

    /// Returns the transport in use.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Builds the program and argument vector for a command string.
    pub fn command_line(&self, command: &str) -> (String, Vec<String>) {
        match &self.transport {
            Transport::Local => (
                SH_CMD.to_string(),
                vec!["-c".to_string(), command.to_string()],
            ),
            Transport::Ssh {
                destination,
                port,
                identity,
            } => {
                let mut args = vec![
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                    "-o".to_string(),
                    "ConnectTimeout=10".to_string(),
                ];
                if let Some(port) = port {
                    args.push("-p".to_string());
                    args.push(port.to_string());
                }
                if let Some(identity) = identity {
                    args.push("-i".to_string());
                    args.push(identity.clone());
                }
                args.push(destination.clone());
                args.push("--".to_string());
                args.push(command.to_string());
                (SSH_CMD.to_string(), args)
            }
        }
    }

    async fn run_with_input(
        &self,
        command: &str,
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> CacheMgrResult<ExecResult> {
        let (program, args) = self.command_line(command);
        let result = shell::run(&program, &args, input, timeout).await?;

        if result.exit_code == SSH_TRANSPORT_EXIT_CODE
            && matches!(self.transport, Transport::Ssh { .. })
        {
            return Err(CacheMgrError::channel(&self.host, result.combined_output()));
        }
        Ok(result)
    }
}

#[async_trait]
impl CommandChannel for ShellChannel {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str, timeout: Duration) -> CacheMgrResult<ExecResult> {
        self.run_with_input(command, None, timeout).await
    }

    async fn read_file(&self, path: &str, timeout: Duration) -> CacheMgrResult<Option<String>> {
        let command = build_read_file_cmd(path);
        let result = self.run(&command, timeout).await?;
        if result.exit_code == ABSENT_EXIT_CODE {
            return Ok(None);
        }
        if !result.success() {
            return Err(CacheMgrError::ShellCommandFailed {
                command,
                exit_code: result.exit_code,
                output: result.combined_output(),
            });
        }
        Ok(Some(result.stdout))
    }

    async fn write_file(
        &self,
        path: &str,
        content: &str,
        timeout: Duration,
    ) -> CacheMgrResult<()> {
        let command = build_write_file_cmd(path);
        self.run_with_input(&command, Some(content.as_bytes()), timeout)
            .await?
            .into_stdout(&command)
            .map(|_| ())
    }
}

/// Builds the read probe: prints the file or exits with [`ABSENT_EXIT_CODE`].
pub fn build_read_file_cmd(path: &str) -> String {
    let quoted = shellquote(path);
    format!(
        "if [ -f {q} ]; then cat -- {q}; else exit {code}; fi",
        q = quoted,
        code = ABSENT_EXIT_CODE
    )
}

/// Builds the atomic write: stdin to a unique temporary sibling, then rename.
pub fn build_write_file_cmd(path: &str) -> String {
    let tmp = format!("{}.{}{}", path, uuid::Uuid::new_v4().simple(), TMP_SUFFIX);
    let parent = match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => ".".to_string(),
    };
    format!(
        "mkdir -p -- {parent} && cat > {tmp} && mv -f -- {tmp} {path}",
        parent = shellquote(&parent),
        tmp = shellquote(&tmp),
        path = shellquote(path)
    )
}
