//! External command execution.
//!
//! Used for every operation without a native client: the service manager,
//! `kubeadm`, raw `kubectl` applies, and the helm CLI behind
//! [`HelmChartInstaller`](crate::charts::HelmChartInstaller).

use crate::errors::CommandError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// A program plus its argument vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program name, resolved through `PATH`.
    pub program: String,
    /// Arguments passed verbatim.
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Creates a command with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Creates a `bash -c <script>` command.
    #[must_use]
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("bash").arg("-c").arg(script)
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
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

/// Output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output alone, for callers that parse it.
    pub stdout: String,
    /// Stdout and stderr interleaved line by line in arrival order.
    pub combined: String,
}

/// Runs external processes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the command to completion.
    ///
    /// Returns the captured output on exit status 0. Any other exit, or a
    /// launch failure, is an error that still carries the captured output.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// Runs commands as child processes of this one.
///
/// Children inherit the working directory and environment. No timeout is
/// applied; callers bound the time themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        debug!(command = %spec, "Running command");

        let launch_error = |source: std::io::Error| CommandError::Launch {
            command: spec.to_string(),
            source,
        };
        let read_error = |source: std::io::Error| CommandError::Output {
            command: spec.to_string(),
            source,
        };

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(launch_error)?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(launch_error(std::io::Error::other("child stdio was not captured")));
        };
        let mut stdout = BufReader::new(stdout);
        let mut stderr = BufReader::new(stderr);
        let (mut out_line, mut err_line) = (Vec::new(), Vec::new());
        let (mut out_open, mut err_open) = (true, true);
        let mut output = CommandOutput::default();

        while out_open || err_open {
            tokio::select! {
                read = stdout.read_until(b'\n', &mut out_line), if out_open => {
                    if read.map_err(read_error)? == 0 {
                        out_open = false;
                    } else {
                        let line = String::from_utf8_lossy(&out_line);
                        output.stdout.push_str(&line);
                        output.combined.push_str(&line);
                        out_line.clear();
                    }
                }
                read = stderr.read_until(b'\n', &mut err_line), if err_open => {
                    if read.map_err(read_error)? == 0 {
                        err_open = false;
                    } else {
                        output.combined.push_str(&String::from_utf8_lossy(&err_line));
                        err_line.clear();
                    }
                }
            }
        }

        let status = child.wait().await.map_err(read_error)?;
        if status.success() {
            Ok(output)
        } else {
            Err(CommandError::Failed {
                command: spec.to_string(),
                exit_code: status.code(),
                output: output.combined,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_display() {
        let spec = CommandSpec::new("kubeadm").args(["init", "--config", "/root/clusterconfig.yaml"]);
        assert_eq!(spec.to_string(), "kubeadm init --config /root/clusterconfig.yaml");
    }

    #[test]
    fn test_shell_spec() {
        let spec = CommandSpec::shell("systemctl enable --now kubelet crio");
        assert_eq!(spec.program, "bash");
        assert_eq!(spec.args, vec!["-c", "systemctl enable --now kubelet crio"]);
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let output = SystemCommandRunner
            .run(&CommandSpec::new("echo").arg("hello"))
            .await
            .expect("echo should succeed");

        assert!(output.combined.contains("hello"));
    }

    #[tokio::test]
    async fn test_run_keeps_stdout_apart_and_interleaves_combined() {
        let spec = CommandSpec::shell("echo out; sleep 0.2; echo err >&2; sleep 0.2; echo out2");
        let output = SystemCommandRunner.run(&spec).await.unwrap();

        assert_eq!(output.stdout, "out\nout2\n");
        assert_eq!(output.combined, "out\nerr\nout2\n");
    }

    #[tokio::test]
    async fn test_run_merges_stderr_and_reports_exit_code() {
        let spec = CommandSpec::new("sh").arg("-c").arg("echo out; echo err >&2; exit 3");
        let err = SystemCommandRunner.run(&spec).await.unwrap_err();

        match err {
            CommandError::Failed { exit_code, output, .. } => {
                assert_eq!(exit_code, Some(3));
                assert!(output.contains("out"));
                assert!(output.contains("err"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_missing_program_is_launch_error() {
        let err = SystemCommandRunner
            .run(&CommandSpec::new("clusterseed-no-such-binary"))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Launch { .. }));
    }
}
