//! Rollback hook capability interface.
//!
//! Hooks are named external actions run around a rollback switch. They are
//! best-effort: a failing hook is logged by the caller and never aborts the
//! rollback. Modeling them as a trait keeps the executor agnostic to how a
//! hook is delivered (command, HTTP call, queue message).

use crate::types::VersionId;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;

/// Context handed to every hook invocation.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Rollout name the rollback belongs to, if any.
    pub rollout: String,
    /// Why the rollback is happening.
    pub reason: String,
    /// Version being rolled back from, when known.
    pub from_version: Option<VersionId>,
    /// Version being rolled back to.
    pub to_version: VersionId,
}

/// A named external action invoked around a rollback.
#[async_trait]
pub trait RollbackHook: Send + Sync {
    fn name(&self) -> &str;

    /// Run the hook. Errors are reported to the caller but carry no
    /// structured contract beyond success/failure.
    async fn execute(&self, ctx: &HookContext) -> Result<()>;
}

/// Hook that runs a configured command with rollback context in its
/// environment.
///
/// The command line is split on whitespace; no shell interpolation is
/// performed. A hook needing shell features should invoke a script.
#[derive(Debug, Clone)]
pub struct CommandHook {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandHook {
    /// Parse a configured command line. Returns `None` for blank input.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next()?.to_string();
        Some(Self {
            name: command_line.trim().to_string(),
            program,
            args: parts.map(str::to_string).collect(),
        })
    }
}

#[async_trait]
impl RollbackHook for CommandHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &HookContext) -> Result<()> {
        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("PDC_ROLLOUT", &ctx.rollout)
            .env("PDC_REASON", &ctx.reason)
            .env(
                "PDC_FROM_VERSION",
                ctx.from_version.as_ref().map(VersionId::as_str).unwrap_or(""),
            )
            .env("PDC_TO_VERSION", ctx.to_version.as_str())
            .status()
            .await
            .with_context(|| format!("failed to spawn hook `{}`", self.name))?;

        if !status.success() {
            bail!("hook `{}` exited with {}", self.name, status);
        }
        Ok(())
    }
}

/// Build hooks from configured command lines, skipping blank entries.
pub fn hooks_from_commands(commands: &[String]) -> Vec<Box<dyn RollbackHook>> {
    commands
        .iter()
        .filter_map(|line| CommandHook::parse(line))
        .map(|hook| Box::new(hook) as Box<dyn RollbackHook>)
        .collect()
}
