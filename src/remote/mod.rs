//! Running command sequences on remote hosts.

pub mod ssh;

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use thiserror::Error;

use crate::deploy::log::DeploymentLog;
use crate::model::{LogStream, Server};

pub use self::ssh::SshExecutor;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Cannot reach {server}: {message}")]
    Transport { server: String, message: String },

    #[error("Command failed on {server} (exit {}): {command}\n{output}", .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    CommandFailed {
        server: String,
        command: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("Command timed out on {server} after {}s: {command}", .timeout.as_secs())]
    Timeout {
        server: String,
        command: String,
        timeout: Duration,
    },
}

impl RemoteError {
    pub fn is_transport(&self) -> bool {
        matches!(self, RemoteError::Transport { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    /// Use a fresh connection instead of the shared one
    pub disable_multiplexing: bool,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run one command. A nonzero exit is reported in the output, not as an error.
    async fn exec(
        &self,
        server: &Server,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecOutput, RemoteError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub command: String,
    /// Contains secrets: neither the command nor its output is shown by default
    pub hidden: bool,
    pub ignore_errors: bool,
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            hidden: false,
            ignore_errors: false,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn ignore_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    fn display(&self) -> &str {
        if self.hidden {
            "[hidden]"
        } else {
            &self.command
        }
    }
}

/// Where a command sequence reports its lines.
pub struct LogTarget<'a> {
    pub log: &'a DeploymentLog,
    pub batch: u32,
}

/// Run `commands` in order on `server` and return their combined stdout.
///
/// Stops at the first command that exits nonzero unless it was marked
/// `ignore_errors`. Transport failures always propagate; retrying them is the
/// caller's business.
pub async fn execute(
    executor: &dyn RemoteExecutor,
    server: &Server,
    commands: &[RemoteCommand],
    options: &ExecOptions,
    log: Option<LogTarget<'_>>,
) -> Result<String, RemoteError> {
    let mut combined = String::new();

    for cmd in commands {
        if let Some(target) = &log {
            if !cmd.hidden {
                target
                    .log
                    .line(format!("$ {}", cmd.command), LogStream::Info, true, target.batch)
                    .await;
            }
        }

        let output = executor
            .exec(server, &cmd.command, options)
            .await
            .map_err(|e| redact(e, cmd))?;

        if let Some(target) = &log {
            for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
                target
                    .log
                    .line(line, LogStream::Stdout, cmd.hidden, target.batch)
                    .await;
            }
            for line in output.stderr.lines().filter(|l| !l.trim().is_empty()) {
                target
                    .log
                    .line(line, LogStream::Stderr, cmd.hidden, target.batch)
                    .await;
            }
        }

        if !output.success() && !cmd.ignore_errors {
            let detail = if cmd.hidden {
                String::new()
            } else {
                format!("{}\n{}", output.stdout.trim(), output.stderr.trim())
                    .trim()
                    .to_string()
            };
            return Err(RemoteError::CommandFailed {
                server: server.label(),
                command: cmd.display().to_string(),
                exit_code: output.exit_code,
                output: detail,
            });
        }

        combined.push_str(&output.stdout);
    }

    Ok(combined)
}

fn redact(err: RemoteError, cmd: &RemoteCommand) -> RemoteError {
    match err {
        RemoteError::Timeout {
            server, timeout, ..
        } if cmd.hidden => RemoteError::Timeout {
            server,
            command: cmd.display().to_string(),
            timeout,
        },
        other => other,
    }
}

/// Single-quote `s` for a POSIX shell.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Wrap `cmd` so it runs inside `container`.
pub fn in_container(container: &str, cmd: &str) -> String {
    format!("docker exec {} bash -c {}", container, quote(cmd))
}

/// Command that writes `content` to `path`, replacing it atomically.
pub fn write_file(path: &str, content: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(content);
    let dir = match path.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir,
        _ => "/",
    };
    format!(
        "mkdir -p {dir} && echo '{encoded}' | base64 -d > {path}.tmp && mv -f {path}.tmp {path}",
        dir = quote(dir),
        encoded = encoded,
        path = quote(path),
    )
}
