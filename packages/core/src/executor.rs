//! Command execution abstraction with privilege escalation support.
//!
//! Every external tool (discovery probes, mount, umount, unlock, hooks) is
//! run through an [`ExecutionContext`]. The context decides whether the
//! command is wrapped with `pkexec` (GUI) or `sudo` (TTY) and delegates the
//! actual process handling to a [`CommandRunner`], which tests replace with
//! a scripted double.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};

/// Privilege escalation method for executing commands that require root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeEscalation {
    /// Execute directly without privilege escalation.
    #[default]
    None,
    /// Use `pkexec` for GUI-based privilege escalation (polkit).
    Pkexec,
    /// Use `sudo` for TTY-based privilege escalation.
    Sudo,
}

impl PrivilegeEscalation {
    fn wrapper(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Pkexec => Some("pkexec"),
            Self::Sudo => Some("sudo"),
        }
    }
}

/// Captured result of one tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let mut combined = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        combined.push_str(self.stdout.trim_end());
        if !combined.is_empty() && !self.stderr.trim().is_empty() {
            combined.push('\n');
        }
        combined.push_str(self.stderr.trim_end());
        combined
    }
}

/// Runs an external program to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Runs `program` with `args`, optionally feeding `stdin`, and captures
    /// its output. Spawn failures (missing binary) are errors; non-zero exit
    /// codes are not.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ToolOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ToolOutput> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command.spawn().command_context(program)?;

        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input).await.command_context(program)?;
            pipe.shutdown().await.command_context(program)?;
        }

        let output = child.wait_with_output().await.command_context(program)?;

        Ok(ToolOutput {
            code: output.status.code(),
            stdout: into_text(output.stdout),
            stderr: into_text(output.stderr),
        })
    }
}

/// Reuses the buffer when it is valid UTF-8. Otherwise the raw bytes are
/// wiped after the lossy copy, since stdout may carry a secret.
fn into_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => {
            let mut bytes = err.into_bytes();
            let text = String::from_utf8_lossy(&bytes).into_owned();
            bytes.fill(0);
            std::hint::black_box(&bytes);
            text
        }
    }
}

/// Execution context for running system commands.
///
/// This struct holds the configuration for how commands should be executed,
/// particularly whether they need privilege escalation.
///
/// # Example
///
/// ```
/// use automount_core::executor::{ExecutionContext, PrivilegeEscalation};
///
/// // Default: no privilege escalation
/// let ctx = ExecutionContext::default();
/// assert_eq!(ctx.escalation(), PrivilegeEscalation::None);
///
/// // For terminal sessions
/// let tty_ctx = ExecutionContext::with_sudo();
/// assert_eq!(tty_ctx.escalation(), PrivilegeEscalation::Sudo);
/// ```
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    escalation: PrivilegeEscalation,
    runner: Arc<dyn CommandRunner>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            escalation: PrivilegeEscalation::None,
            runner: Arc::new(ProcessRunner),
        }
    }
}

impl ExecutionContext {
    /// Creates a new execution context with no privilege escalation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an execution context that uses `pkexec` for privileged commands.
    pub fn with_pkexec() -> Self {
        Self::with_escalation(PrivilegeEscalation::Pkexec)
    }

    /// Creates an execution context that uses `sudo` for privileged commands.
    pub fn with_sudo() -> Self {
        Self::with_escalation(PrivilegeEscalation::Sudo)
    }

    /// Creates an execution context with a specific escalation method.
    pub fn with_escalation(escalation: PrivilegeEscalation) -> Self {
        Self {
            escalation,
            ..Self::default()
        }
    }

    /// Replaces the process runner.
    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Returns the current privilege escalation method.
    pub fn escalation(&self) -> PrivilegeEscalation {
        self.escalation
    }

    /// Runs an unprivileged command and returns its output regardless of
    /// exit status.
    pub async fn run<S: AsRef<str> + Sync>(&self, cmd: &str, args: &[S]) -> Result<ToolOutput> {
        let args = to_owned_args(args);
        debug!(command = cmd, ?args, "running command");
        self.runner.run(cmd, &args, None).await
    }

    /// Runs an unprivileged command and fails on non-zero exit.
    pub async fn run_checked<S: AsRef<str> + Sync>(
        &self,
        cmd: &str,
        args: &[S],
    ) -> Result<ToolOutput> {
        let output = self.run(cmd, args).await?;
        check_exit(cmd, &output, PrivilegeEscalation::None)?;
        Ok(output)
    }

    /// Executes a command that requires root privileges.
    ///
    /// The command will be wrapped with the appropriate privilege escalation
    /// method based on the context configuration.
    pub async fn run_privileged<S: AsRef<str> + Sync>(
        &self,
        cmd: &str,
        args: &[S],
    ) -> Result<ToolOutput> {
        let (program, args) = self.wrap(cmd, args);
        debug!(command = %program, ?args, "running privileged command");
        self.runner.run(&program, &args, None).await
    }

    /// Executes a privileged command, feeding `input` on its stdin.
    ///
    /// The input is never logged.
    pub async fn run_privileged_with_stdin<S: AsRef<str> + Sync>(
        &self,
        cmd: &str,
        args: &[S],
        input: &[u8],
    ) -> Result<ToolOutput> {
        let (program, args) = self.wrap(cmd, args);
        debug!(command = %program, ?args, "running privileged command with stdin");
        self.runner.run(&program, &args, Some(input)).await
    }

    /// Maps a failed privileged invocation to an error.
    ///
    /// pkexec reports a dismissed authentication dialog with exit code 126.
    pub fn check_privileged(&self, cmd: &str, output: &ToolOutput) -> Result<()> {
        check_exit(cmd, output, self.escalation)
    }

    fn wrap<S: AsRef<str>>(&self, cmd: &str, args: &[S]) -> (String, Vec<String>) {
        match self.escalation.wrapper() {
            None => (cmd.to_string(), to_owned_args(args)),
            Some(wrapper) => {
                let mut wrapped = Vec::with_capacity(args.len() + 1);
                wrapped.push(cmd.to_string());
                wrapped.extend(args.iter().map(|a| a.as_ref().to_string()));
                (wrapper.to_string(), wrapped)
            }
        }
    }
}

fn to_owned_args<S: AsRef<str>>(args: &[S]) -> Vec<String> {
    args.iter().map(|a| a.as_ref().to_string()).collect()
}

fn check_exit(cmd: &str, output: &ToolOutput, escalation: PrivilegeEscalation) -> Result<()> {
    if output.success() {
        return Ok(());
    }

    if escalation == PrivilegeEscalation::Pkexec && output.code == Some(126) {
        return Err(Error::AuthenticationCancelled);
    }

    Err(Error::CommandExit {
        command: cmd.to_string(),
        code: output.code.unwrap_or(-1),
        output: output.combined(),
    })
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedRunner, context};
    use super::*;

    #[test]
    fn test_default_context() {
        let ctx = ExecutionContext::default();
        assert_eq!(ctx.escalation(), PrivilegeEscalation::None);
    }

    #[test]
    fn test_pkexec_context() {
        let ctx = ExecutionContext::with_pkexec();
        assert_eq!(ctx.escalation(), PrivilegeEscalation::Pkexec);
    }

    #[test]
    fn test_sudo_context() {
        let ctx = ExecutionContext::with_sudo();
        assert_eq!(ctx.escalation(), PrivilegeEscalation::Sudo);
    }

    #[test]
    fn test_combined_output() {
        let output = ToolOutput {
            code: Some(1),
            stdout: "partial\n".to_string(),
            stderr: "mount: /dev/da0p1: Operation not permitted\n".to_string(),
        };
        assert_eq!(
            output.combined(),
            "partial\nmount: /dev/da0p1: Operation not permitted"
        );
        assert_eq!(ToolOutput::failed(1, "only stderr").combined(), "only stderr");
    }

    #[test]
    fn test_output_text_reuses_valid_buffer() {
        let bytes = b"hunter2\n".to_vec();
        let buffer = bytes.as_ptr();
        let text = into_text(bytes);
        assert_eq!(text.as_ptr(), buffer);

        assert_eq!(into_text(vec![b'o', b'k', 0xff]), "ok\u{fffd}");
    }

    #[tokio::test]
    async fn test_privileged_commands_are_wrapped() {
        let runner = ScriptedRunner::new();
        runner.on("sudo", ToolOutput::ok(""));
        let ctx = ExecutionContext {
            escalation: PrivilegeEscalation::Sudo,
            ..context(&runner)
        };

        ctx.run_privileged("umount", &["/media/USB"]).await.unwrap();
        ctx.run("lsblk", &["-J"]).await.unwrap_err();

        let calls = runner.calls();
        assert_eq!(calls[0].program, "sudo");
        assert_eq!(calls[0].args, vec!["umount", "/media/USB"]);
        // Discovery probes never escalate.
        assert_eq!(calls[1].program, "lsblk");
    }

    #[tokio::test]
    async fn test_pkexec_dismissal_maps_to_cancellation() {
        let ctx = ExecutionContext::with_pkexec();
        let output = ToolOutput::failed(126, "");
        assert!(matches!(
            ctx.check_privileged("mount", &output),
            Err(Error::AuthenticationCancelled)
        ));

        let plain = ExecutionContext::new();
        assert!(matches!(
            plain.check_privileged("mount", &output),
            Err(Error::CommandExit { code: 126, .. })
        ));
    }

    #[tokio::test]
    async fn test_process_runner_feeds_stdin() {
        let output = ProcessRunner
            .run("cat", &[], Some(b"secret\n"))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "secret\n");
    }
}
