//! Local shell executor
//!
//! Runs each command with `sh -c` on the machine hosting the engine. The
//! host argument only selects the throttle slot, which is enough for single
//! node deployments and for driving the commands under a wrapper such as
//! `ssh <host>` configured as `lvm_wrapper`.

use super::{Cmd, CmdResult, CommandExecutor, HostThrottle};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

pub struct LocalExecutor {
    throttle: HostThrottle,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            throttle: HostThrottle::new(),
        }
    }

    async fn run_one(cmd: &Cmd, deadline: Instant, timeout: Duration) -> CmdResult {
        let child = Command::new("sh")
            .arg("-c")
            .arg(&cmd.command)
            .kill_on_drop(true)
            .output();

        match timeout_at(deadline, child).await {
            Err(_) => CmdResult {
                completed: false,
                error: Some(format!("timed out after {:?}", timeout)),
                exit_status: -1,
                ..Default::default()
            },
            Ok(Err(e)) => CmdResult {
                completed: false,
                error: Some(format!("unable to spawn shell: {}", e)),
                exit_status: -1,
                ..Default::default()
            },
            Ok(Ok(output)) => {
                let exit_status = output.status.code().unwrap_or(-1);
                CmdResult {
                    completed: true,
                    output: String::from_utf8_lossy(&output.stdout).into_owned(),
                    err_output: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_status,
                    error: (!output.status.success())
                        .then(|| format!("exit status {}", exit_status)),
                }
            }
        }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn exec_commands(
        &self,
        host: &str,
        commands: &[Cmd],
        timeout: Duration,
    ) -> Result<Vec<CmdResult>> {
        let _permit = self.throttle.acquire(host).await?;
        let deadline = Instant::now() + timeout;
        let mut results = Vec::with_capacity(commands.len());

        for cmd in commands {
            let result = Self::run_one(cmd, deadline, timeout).await;
            if cmd.quiet {
                debug!(host, "ran quiet command (exit {})", result.exit_status);
            } else {
                debug!(
                    host,
                    command = %cmd.command,
                    stdout = %result.output.trim(),
                    "exit {}",
                    result.exit_status
                );
            }

            let failed = !result.is_ok();
            if failed {
                if cmd.quiet {
                    warn!(host, "quiet command failed: {}", result.failure_reason());
                } else {
                    warn!(
                        host,
                        command = %cmd.command,
                        stderr = %result.err_output.trim(),
                        "command failed: {}",
                        result.failure_reason()
                    );
                }
            }
            results.push(result);
            if failed {
                break;
            }
        }

        results.resize(commands.len(), CmdResult::default());
        Ok(results)
    }
}
