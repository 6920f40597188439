//! Storage command vocabulary
//!
//! Builds the literal shell commands sent to storage hosts (LVM, xfs,
//! fstab, gluster, gluster-block) and parses their structured output into
//! typed responses. Unparsable output is always an error.

mod block_volume;
mod brick;
mod device;
mod volume;

pub use block_volume::{BlockVolumeCreated, BlockVolumeInfo, BlockVolumeRequest};
pub use device::DeviceInfo;
pub use volume::{VolumeInfo, VolumeRequest};

use super::{check_results, Cmd, CmdResult, CommandExecutor};
use crate::config::ExecutorConfig;
use crate::error::Result;
use std::sync::Arc;

/// Typed front end over a [`CommandExecutor`]
#[derive(Clone)]
pub struct StorageCommands {
    executor: Arc<dyn CommandExecutor>,
    config: ExecutorConfig,
}

impl StorageCommands {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: ExecutorConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run a batch and fail on the first failed command
    async fn run(&self, host: &str, commands: Vec<Cmd>) -> Result<Vec<CmdResult>> {
        let results = self
            .executor
            .exec_commands(host, &commands, self.config.command_timeout())
            .await?;
        check_results(host, &commands, &results)?;
        Ok(results)
    }

    /// Run one command and hand back its raw result, failed or not
    async fn run_raw(&self, host: &str, cmd: Cmd) -> Result<CmdResult> {
        let results = self
            .executor
            .exec_commands(host, std::slice::from_ref(&cmd), self.config.command_timeout())
            .await?;
        Ok(results.into_iter().next().unwrap_or_default())
    }

    fn lvm(&self, args: &str) -> String {
        let backup = if self.config.backup_lvm_metadata {
            "y"
        } else {
            "n"
        };
        let cmd = args.replacen(' ', &format!(" -qq --autobackup={} ", backup), 1);
        if self.config.lvm_wrapper.is_empty() {
            cmd
        } else {
            format!("{} {}", self.config.lvm_wrapper, cmd)
        }
    }

    fn lvm_query(&self, args: &str) -> String {
        if self.config.lvm_wrapper.is_empty() {
            args.to_string()
        } else {
            format!("{} {}", self.config.lvm_wrapper, args)
        }
    }

    fn gluster(&self, args: &str) -> String {
        format!(
            "gluster --mode=script --timeout={} {}",
            self.config.gluster_cli_timeout, args
        )
    }
}

/// Quote a value for a POSIX shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
