//! Local process execution for the SSH deployer.
//!
//! The deployer never talks to a host directly; it shells out to the `ssh`
//! client through a [`CommandRunner`] so tests can script exit codes.

use std::ffi::OsString;
use std::process::{Command, Stdio};

use tracing::debug;

use super::DeployError;

/// Lines of stderr kept when a failure is reported.
const STDERR_EXCERPT_LINES: usize = 20;

/// Exit status and captured streams of an `ssh` invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code, absent when the process was killed by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the remote command exited with status zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Exit status as text, `unknown` when the process was killed.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }

    /// The trailing lines of stderr, trimmed.
    #[must_use]
    pub fn stderr_excerpt(&self) -> String {
        let lines: Vec<&str> = self.stderr.trim().lines().collect();
        let skip = lines.len().saturating_sub(STDERR_EXCERPT_LINES);
        lines.get(skip..).unwrap_or_default().join("\n")
    }
}

/// Runs local programs on behalf of the deployer.
pub trait CommandRunner {
    /// Runs `program` with `args` to completion, capturing both streams.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Spawn`] if the program cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, DeployError>;
}

/// Spawns real processes with stdin closed, so a prompt can never block.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, DeployError> {
        debug!(program, argc = args.len(), "spawning");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| DeployError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_keeps_the_last_lines() {
        let stderr: String = (1..=25).map(|line| format!("line {line}\n")).collect();
        let output = CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr,
        };
        let excerpt = output.stderr_excerpt();
        assert_eq!(excerpt.lines().count(), STDERR_EXCERPT_LINES);
        assert!(excerpt.starts_with("line 6"));
        assert!(excerpt.ends_with("line 25"));
    }

    #[test]
    fn killed_process_has_unknown_status() {
        let output = CommandOutput {
            code: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(!output.is_success());
        assert_eq!(output.status_text(), "unknown");
    }
}
