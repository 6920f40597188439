//! Fault injection decorator
//!
//! Wraps another executor and intercepts commands matching configured
//! hooks. A command hook fires before the command reaches the wrapped
//! executor; a result hook fires after it ran, when both the command and its
//! output match. A reaction may pause, replace the result with canned
//! output and/or an error, or abort the process. Abort is only honoured
//! when `allow_abort` is set, so it can never fire outside a test harness
//! that asked for it.

use super::{Cmd, CmdResult, CommandExecutor};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

// =============================================================================
// Hook configuration
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reaction {
    /// Canned stdout
    pub result: Option<String>,
    /// Error to report; also used as stderr
    pub err: Option<String>,
    /// Seconds to sleep before reacting
    pub pause: u64,
    /// Abort the process
    pub abort: bool,
}

impl Reaction {
    pub fn error(err: impl Into<String>) -> Self {
        Self {
            err: Some(err.into()),
            ..Default::default()
        }
    }

    pub fn output(result: impl Into<String>, err: Option<&str>) -> Self {
        Self {
            result: Some(result.into()),
            err: err.map(str::to_string),
            ..Default::default()
        }
    }

    fn replaces_result(&self) -> bool {
        self.result.is_some() || self.err.is_some()
    }

    fn to_result(&self) -> CmdResult {
        CmdResult {
            completed: true,
            output: self.result.clone().unwrap_or_default(),
            err_output: self.err.clone().unwrap_or_default(),
            exit_status: if self.err.is_some() { 1 } else { 0 },
            error: self.err.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdHook {
    /// Regex matched against the full command line
    pub cmd: String,
    pub reaction: Reaction,
}

impl CmdHook {
    pub fn new(cmd: impl Into<String>, reaction: Reaction) -> Self {
        Self {
            cmd: cmd.into(),
            reaction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultHook {
    pub cmd: String,
    /// Regex matched against the command's stdout
    pub result: String,
    pub reaction: Reaction,
}

impl ResultHook {
    pub fn new(cmd: impl Into<String>, result: impl Into<String>, reaction: Reaction) -> Self {
        Self {
            cmd: cmd.into(),
            result: result.into(),
            reaction,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectConfig {
    pub cmd_hooks: Vec<CmdHook>,
    pub result_hooks: Vec<ResultHook>,
    pub allow_abort: bool,
}

impl InjectConfig {
    pub fn is_empty(&self) -> bool {
        self.cmd_hooks.is_empty() && self.result_hooks.is_empty()
    }
}

struct Compiled {
    cmd: Regex,
    result: Option<Regex>,
    reaction: Reaction,
}

#[derive(Default)]
struct HookSet {
    cmd: Vec<Compiled>,
    result: Vec<Compiled>,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| Error::Config(format!("invalid hook pattern '{}': {}", pattern, e)))
}

impl HookSet {
    fn build(config: &InjectConfig) -> Result<Self> {
        let mut set = HookSet::default();
        for hook in &config.cmd_hooks {
            set.cmd.push(Compiled {
                cmd: compile(&hook.cmd)?,
                result: None,
                reaction: hook.reaction.clone(),
            });
        }
        for hook in &config.result_hooks {
            set.result.push(Compiled {
                cmd: compile(&hook.cmd)?,
                result: Some(compile(&hook.result)?),
                reaction: hook.reaction.clone(),
            });
        }
        let aborts = set
            .cmd
            .iter()
            .chain(&set.result)
            .any(|h| h.reaction.abort);
        if aborts && !config.allow_abort {
            return Err(Error::Config(
                "abort reactions require inject.allow_abort".into(),
            ));
        }
        Ok(set)
    }

    fn match_cmd(&self, command: &str) -> Option<Reaction> {
        self.cmd
            .iter()
            .find(|h| h.cmd.is_match(command))
            .map(|h| h.reaction.clone())
    }

    fn match_result(&self, command: &str, output: &str) -> Option<Reaction> {
        self.result
            .iter()
            .find(|h| {
                h.cmd.is_match(command) && h.result.as_ref().is_some_and(|r| r.is_match(output))
            })
            .map(|h| h.reaction.clone())
    }
}

// =============================================================================
// Executor
// =============================================================================

pub struct InjectExecutor {
    inner: Arc<dyn CommandExecutor>,
    hooks: RwLock<HookSet>,
    allow_abort: bool,
}

impl InjectExecutor {
    pub fn new(inner: Arc<dyn CommandExecutor>, config: &InjectConfig) -> Result<Self> {
        if !config.is_empty() {
            info!(
                "Fault injection enabled: {} command hooks, {} result hooks",
                config.cmd_hooks.len(),
                config.result_hooks.len()
            );
        }
        Ok(Self {
            inner,
            hooks: RwLock::new(HookSet::build(config)?),
            allow_abort: config.allow_abort,
        })
    }

    /// Replace the active hooks. `allow_abort` stays as constructed.
    pub fn set_hooks(&self, config: &InjectConfig) -> Result<()> {
        let config = InjectConfig {
            allow_abort: self.allow_abort,
            ..config.clone()
        };
        *self.hooks.write() = HookSet::build(&config)?;
        Ok(())
    }

    pub fn clear_hooks(&self) {
        *self.hooks.write() = HookSet::default();
    }

    async fn react(&self, host: &str, cmd: &Cmd, reaction: &Reaction) {
        warn!(host, command = %cmd.command, "injected reaction: {:?}", reaction);
        if reaction.pause > 0 {
            tokio::time::sleep(Duration::from_secs(reaction.pause)).await;
        }
        if reaction.abort && self.allow_abort {
            error!(host, command = %cmd.command, "injected abort");
            std::process::abort();
        }
    }

    async fn run_one(&self, host: &str, cmd: &Cmd, timeout: Duration) -> Result<CmdResult> {
        let before = self.hooks.read().match_cmd(&cmd.command);
        if let Some(reaction) = before {
            self.react(host, cmd, &reaction).await;
            if reaction.replaces_result() {
                return Ok(reaction.to_result());
            }
        }

        let mut result = self
            .inner
            .exec_commands(host, std::slice::from_ref(cmd), timeout)
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let after = self
            .hooks
            .read()
            .match_result(&cmd.command, &result.output);
        if let Some(reaction) = after {
            self.react(host, cmd, &reaction).await;
            if reaction.replaces_result() {
                result = reaction.to_result();
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl CommandExecutor for InjectExecutor {
    async fn exec_commands(
        &self,
        host: &str,
        commands: &[Cmd],
        timeout: Duration,
    ) -> Result<Vec<CmdResult>> {
        let mut results = Vec::with_capacity(commands.len());
        for cmd in commands {
            let result = self.run_one(host, cmd, timeout).await?;
            let failed = !result.is_ok();
            results.push(result);
            if failed {
                break;
            }
        }
        results.resize(commands.len(), CmdResult::default());
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    const MINUTE: Duration = Duration::from_secs(60);

    /// Records every command and succeeds with the command text as output
    #[derive(Default)]
    struct Echo {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandExecutor for Echo {
        async fn exec_commands(
            &self,
            _host: &str,
            commands: &[Cmd],
            _timeout: Duration,
        ) -> Result<Vec<CmdResult>> {
            let mut seen = self.seen.lock();
            Ok(commands
                .iter()
                .map(|c| {
                    seen.push(c.command.clone());
                    CmdResult::success(c.command.clone())
                })
                .collect())
        }
    }

    fn cmds(list: &[&str]) -> Vec<Cmd> {
        list.iter().map(|c| Cmd::new(*c)).collect()
    }

    #[tokio::test]
    async fn test_cmd_hook_stops_before_delegating() {
        let echo = Arc::new(Echo::default());
        let config = InjectConfig {
            cmd_hooks: vec![CmdHook::new(".*lvremove.*", Reaction::error("thwack!"))],
            ..Default::default()
        };
        let exec = InjectExecutor::new(echo.clone(), &config).unwrap();

        let results = exec
            .exec_commands("h1", &cmds(&["umount /x", "lvremove -f vg/lv", "rmdir /x"]), MINUTE)
            .await
            .unwrap();

        assert!(results[0].is_ok());
        assert_eq!(results[1].error.as_deref(), Some("thwack!"));
        assert_eq!(results[1].err_output, "thwack!");
        assert!(!results[2].completed);
        assert_eq!(*echo.seen.lock(), vec!["umount /x".to_string()]);
    }

    #[tokio::test]
    async fn test_result_hook_runs_after_command() {
        let echo = Arc::new(Echo::default());
        let config = InjectConfig {
            result_hooks: vec![ResultHook::new(
                ".*volume replace-brick.*",
                ".*",
                Reaction::error("thwack!"),
            )],
            ..Default::default()
        };
        let exec = InjectExecutor::new(echo.clone(), &config).unwrap();

        let results = exec
            .exec_commands("h1", &cmds(&["gluster volume replace-brick v a b"]), MINUTE)
            .await
            .unwrap();
        assert!(!results[0].is_ok());
        assert_eq!(echo.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_canned_output_with_error() {
        let echo = Arc::new(Echo::default());
        let config = InjectConfig {
            cmd_hooks: vec![CmdHook::new(
                "gluster-block modify.*",
                Reaction::output("{\"RESULT\": \"FAIL\"}", Some("partial")),
            )],
            ..Default::default()
        };
        let exec = InjectExecutor::new(echo, &config).unwrap();
        let results = exec
            .exec_commands("h1", &cmds(&["gluster-block modify hv/b size 2GiB --json"]), MINUTE)
            .await
            .unwrap();
        assert_eq!(results[0].output, "{\"RESULT\": \"FAIL\"}");
        assert_eq!(results[0].exit_status, 1);
    }

    #[tokio::test]
    async fn test_hooks_replaced_at_runtime() {
        let echo = Arc::new(Echo::default());
        let config = InjectConfig {
            cmd_hooks: vec![CmdHook::new("mkfs.*", Reaction::error("bad disk"))],
            ..Default::default()
        };
        let exec = InjectExecutor::new(echo, &config).unwrap();
        exec.clear_hooks();
        let results = exec.exec_commands("h1", &cmds(&["mkfs.xfs /dev/x"]), MINUTE).await.unwrap();
        assert!(results[0].is_ok());
    }

    #[test]
    fn test_abort_requires_opt_in() {
        let config = InjectConfig {
            cmd_hooks: vec![CmdHook::new(
                "lvcreate.*",
                Reaction {
                    abort: true,
                    ..Default::default()
                },
            )],
            ..Default::default()
        };
        let err = InjectExecutor::new(Arc::new(Echo::default()), &config)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_bad_pattern() {
        let config = InjectConfig {
            cmd_hooks: vec![CmdHook::new("(", Reaction::error("x"))],
            ..Default::default()
        };
        assert!(InjectExecutor::new(Arc::new(Echo::default()), &config).is_err());
    }
}
