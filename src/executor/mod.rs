//! Command Executor
//!
//! The only boundary between operations and remote hosts: run a batch of
//! shell commands on one host, with a timeout, and report per-command
//! results. Implementations:
//!
//! - [`LocalExecutor`]: runs every command through the local shell
//! - [`FakeCluster`]: in-memory LVM / gluster simulation
//! - [`InjectExecutor`]: wraps any executor and applies fault hooks
//!
//! A batch stops at the first failed command; later commands are reported
//! as not completed.

pub mod commands;
pub mod fake;
pub mod inject;
pub mod local;

pub use fake::FakeCluster;
pub use inject::{CmdHook, InjectConfig, InjectExecutor, Reaction, ResultHook};
pub use local::LocalExecutor;

use crate::config::{Config, ExecutorKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// =============================================================================
// Commands and results
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub command: String,
    /// Keep output out of the logs (credentials)
    pub quiet: bool,
}

impl Cmd {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            quiet: false,
        }
    }

    pub fn quiet(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            quiet: true,
        }
    }
}

impl From<String> for Cmd {
    fn from(command: String) -> Self {
        Cmd::new(command)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdResult {
    /// The command ran to completion (successfully or not)
    pub completed: bool,
    pub output: String,
    pub err_output: String,
    pub exit_status: i32,
    pub error: Option<String>,
}

impl CmdResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            completed: true,
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failure(exit_status: i32, err_output: impl Into<String>) -> Self {
        let err_output = err_output.into();
        Self {
            completed: true,
            output: String::new(),
            error: Some(format!("exit status {}", exit_status)),
            err_output,
            exit_status,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.completed && self.error.is_none()
    }

    /// Stdout if present, otherwise stderr
    pub fn any_output(&self) -> &str {
        if self.output.trim().is_empty() {
            &self.err_output
        } else {
            &self.output
        }
    }

    /// Short description of the failure for error messages
    pub fn failure_reason(&self) -> String {
        if !self.completed {
            return self
                .error
                .clone()
                .unwrap_or_else(|| "command did not run".to_string());
        }
        let detail = self.err_output.trim();
        match (&self.error, detail.is_empty()) {
            (Some(err), true) => err.clone(),
            (Some(err), false) => format!("{}: {}", err, detail),
            (None, _) => "ok".to_string(),
        }
    }
}

/// Turn the first failed result of a batch into an error
pub fn check_results(host: &str, commands: &[Cmd], results: &[CmdResult]) -> Result<()> {
    for (cmd, result) in commands.iter().zip(results) {
        if !result.is_ok() {
            return Err(Error::command(host, &cmd.command, result.failure_reason()));
        }
    }
    if results.len() < commands.len() {
        return Err(Error::command(
            host,
            &commands[results.len()].command,
            "no result returned",
        ));
    }
    Ok(())
}

// =============================================================================
// Executor contract
// =============================================================================

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `commands` in order on `host`, stopping at the first failure.
    ///
    /// Returns one result per command. `Err` is reserved for failures that
    /// prevent running anything at all (unknown host, transport down).
    /// `timeout` bounds the whole batch.
    async fn exec_commands(
        &self,
        host: &str,
        commands: &[Cmd],
        timeout: Duration,
    ) -> Result<Vec<CmdResult>>;
}

/// One in-flight batch per host
#[derive(Default)]
pub struct HostThrottle {
    permits: DashMap<String, Arc<Semaphore>>,
}

impl HostThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, host: &str) -> Result<OwnedSemaphorePermit> {
        let semaphore = self
            .permits
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();
        semaphore
            .acquire_owned()
            .await
            .map_err(|e| Error::Internal(format!("host throttle closed for {}: {}", host, e)))
    }
}

/// Executor selected by configuration, wrapped with the fault injector
pub fn from_config(config: &Config) -> Result<Arc<InjectExecutor>> {
    let base: Arc<dyn CommandExecutor> = match config.executor.kind {
        ExecutorKind::Local => Arc::new(LocalExecutor::new()),
        ExecutorKind::Fake => Arc::new(FakeCluster::new()),
    };
    Ok(Arc::new(InjectExecutor::new(base, &config.inject)?))
}
