//! Centralized command execution with consistent error handling.
//!
//! Every external tool crucible drives (sfdisk, wipefs, mkfs, dd, ...) goes
//! through [`Cmd`] so failures always carry the tool's stderr.

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution.
#[derive(Debug)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, OsString)>,
    stdin: Option<Vec<u8>>,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    /// Custom error message prefix.
    error_prefix: Option<String>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin: None,
            allow_fail: false,
            error_prefix: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl AsRef<str>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.as_ref().to_string(), value.into()));
        self
    }

    /// Feed `data` to the child's stdin (e.g. an sfdisk script).
    pub fn stdin_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Allow non-zero exit codes without failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Render the command line for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        // Terminal SIGINT must not reach a child mid-write; cancellation is
        // handled between stages.
        cmd.process_group(0);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        tracing::debug!(command = %self.display(), "running");

        let mut cmd = self.command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.program))?;

        if let Some(data) = &self.stdin {
            // Dropping the handle closes the pipe so the child sees EOF.
            let mut stdin = child
                .stdin
                .take()
                .context("child stdin was not captured")?;
            stdin
                .write_all(data)
                .with_context(|| format!("writing stdin of '{}'", self.program))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("waiting for '{}'", self.program))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !self.allow_fail && !result.success() {
            let prefix = self
                .error_prefix
                .unwrap_or_else(|| format!("'{}' failed", self.program));

            let stderr = result.stderr_trimmed();
            if stderr.is_empty() {
                bail!("{} (exit code {})", prefix, result.code());
            } else {
                bail!("{} (exit code {}):\n{}", prefix, result.code(), stderr);
            }
        }

        Ok(result)
    }
}

// =============================================================================
// Convenience functions
// =============================================================================

/// Check if a program exists in PATH.
///
/// Returns the full path if found, None otherwise.
pub fn which(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

/// Check if a program exists in PATH (bool version).
pub fn exists(program: &str) -> bool {
    which(program).is_some()
}
