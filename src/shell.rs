//! The built-in `shell` handler.

use crate::BackgroundJob;
use crate::job::JobError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, warn};

/// Bytes of stderr kept in the error message of a failed command.
const STDERR_TAIL: usize = 2048;

/// Runs a program without a shell.
///
/// A non-zero exit is retried; a program that cannot be found fails the job
/// straight away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellJob {
    /// Executable name or path.
    pub program: String,
    /// Arguments passed verbatim.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl ShellJob {
    /// Run `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl BackgroundJob for ShellJob {
    const JOB_NAME: &'static str = "shell";
    type Context = ();

    async fn run(&self, _ctx: Self::Context) -> Result<(), JobError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env).kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let output = match command.output().await {
            Ok(output) => output,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(JobError::terminal(format!(
                    "program not found: {}",
                    self.program
                )));
            }
            Err(error) => return Err(JobError::Retryable(error.into())),
        };

        if output.status.success() {
            debug!(program = %self.program, "Command succeeded");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = tail(stderr.trim_end(), STDERR_TAIL);
        warn!(program = %self.program, status = %output.status, "Command failed");
        Err(JobError::retryable(format!(
            "{} exited with {}: {tail}",
            self.program, output.status
        )))
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    #[tokio::test]
    async fn successful_command() {
        assert_ok!(ShellJob::new("true").run(()).await);
    }

    #[tokio::test]
    async fn non_zero_exit_is_retryable() {
        let job = ShellJob::new("sh").arg("-c").arg("echo nope >&2; exit 3");
        let error = assert_err!(job.run(()).await);
        assert!(error.is_retryable());
        assert!(error.to_string().contains("nope"), "{error}");
    }

    #[tokio::test]
    async fn missing_program_is_terminal() {
        let error = assert_err!(ShellJob::new("workforce-no-such-program").run(()).await);
        assert!(!error.is_retryable());
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("aé", 1), "");
        assert_eq!(tail("abcdef", 2), "ef");
    }
}
