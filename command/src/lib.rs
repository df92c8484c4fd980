//! A thin "command" abstraction (§9 Design Notes): every place that used to
//! shell out to `ip`, `bridge`, `tc`, `iptables` or `vtysh` goes through this
//! trait instead of `std::process::Command` directly, so tests can swap in
//! [`RecordingCommandRunner`] and assert on exactly what would have been
//! run, without a kernel or a container around.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// One fully-rendered invocation, as seen by a [`CommandRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Renders the way it would read on a terminal, for logging.
    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Convenience for the common case where failure should abort the
    /// caller; logs stderr either way, per §7.4 ("log stderr, continue").
    async fn run_checked(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let out = self.run(program, args).await?;

        if !out.success() {
            anyhow::bail!(
                "`{} {}` exited with status {}: {}",
                program,
                args.join(" "),
                out.status,
                out.stderr.trim()
            );
        }

        Ok(out)
    }
}

/// Shells out for real via `tokio::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        tracing::debug!(program, ?args, "running command");

        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to spawn `{program}`"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            tracing::warn!(program, ?args, status = ?output.status, %stderr, "command failed");
        }

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

/// Records every invocation and hands back pre-scripted responses, in order.
/// Once the script is exhausted, further calls succeed with empty output --
/// most call sites only care that the right command was *issued*.
#[derive(Default)]
pub struct RecordingCommandRunner {
    invocations: Mutex<Vec<Invocation>>,
    scripted: Mutex<VecDeque<CommandOutput>>,
}

impl RecordingCommandRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_response(&self, output: CommandOutput) {
        self.scripted.lock().push_back(output);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    pub fn was_run(&self, program: &str, args: &[&str]) -> bool {
        self.invocations()
            .iter()
            .any(|i| i.program == program && i.args == args)
    }
}

#[async_trait]
impl CommandRunner for RecordingCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.invocations.lock().push(Invocation {
            program: program.to_owned(),
            args: args.iter().map(|a| a.to_string()).collect(),
        });

        Ok(self.scripted.lock().pop_front().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_invocations_in_order() {
        let runner = RecordingCommandRunner::new();

        runner.run("ip", &["link", "add", "foo"]).await.unwrap();
        runner.run("tc", &["qdisc", "show"]).await.unwrap();

        assert!(runner.was_run("ip", &["link", "add", "foo"]));
        assert_eq!(runner.invocations().len(), 2);
    }

    #[tokio::test]
    async fn run_checked_surfaces_nonzero_status() {
        let runner = RecordingCommandRunner::new();
        runner.push_response(CommandOutput {
            status: 1,
            stdout: String::new(),
            stderr: "no such device".to_owned(),
        });

        let err = runner.run_checked("ip", &["link", "del", "foo"]).await.unwrap_err();
        assert!(err.to_string().contains("no such device"));
    }
}
