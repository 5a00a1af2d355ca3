//! External command execution.
//!
//! Every tool invocation goes through [`CommandRunner`] so the runbook can be
//! driven against a scripted runner in tests. [`SystemRunner`] is the real
//! implementation on top of `tokio::process`.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// A command line plus an optional execution ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// `None` means the command may run for as long as it needs.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output carrying `stdout`.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and `stderr`.
    #[must_use]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Errors from running an external command.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The process could not be started.
    #[error("Failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exceeded its ceiling and was killed.
    #[error("'{command}' timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    /// The process exited unsuccessfully.
    #[error("'{command}' exited with status {}: {}", exit_label(*code), stderr.trim())]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

fn exit_label(code: Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

/// Seam between the runbook and the operating system.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command and capture its output regardless of exit status.
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;

    /// Synchronous variant for cleanup paths that cannot await (`Drop`).
    fn output_blocking(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;

    /// Run a command and treat a non-zero exit as an error.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let output = self.output(spec).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(CommandError::Failed {
                command: spec.to_string(),
                code: output.code,
                stderr: output.stderr,
            })
        }
    }
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        debug!(
            command = %spec,
            timeout_secs = spec.timeout.map(|t| t.as_secs()),
            "Running command"
        );

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let result = match spec.timeout {
            Some(limit) => match timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(command = %spec, secs = limit.as_secs(), "Command timed out, killed");
                    return Err(CommandError::Timeout {
                        command: spec.to_string(),
                        secs: limit.as_secs(),
                    });
                }
            },
            None => child.wait_with_output().await,
        };

        let output = result.map_err(|source| CommandError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn output_blocking(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let output = std::process::Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| CommandError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
