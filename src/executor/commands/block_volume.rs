use super::StorageCommands;
use crate::error::{Error, Result};
use crate::executor::{Cmd, CmdResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct BlockVolumeRequest {
    pub hosting_volume: String,
    pub name: String,
    /// GiB
    pub size: u64,
    /// Storage hostnames exporting the target
    pub hosts: Vec<String>,
    pub auth: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockVolumeCreated {
    pub iqn: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub portals: Vec<String>,
}

/// Parsed `gluster-block info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockVolumeInfo {
    pub name: String,
    /// Nominal size, GiB
    pub size: u64,
    /// Smallest size any exporting host has applied, GiB
    pub usable_size: u64,
    pub exported_on: Vec<String>,
}

/// Every `gluster-block ... --json` reply shares this shape
#[derive(Debug, Default, Deserialize)]
struct BlockReply {
    #[serde(rename = "RESULT", default)]
    result: String,
    #[serde(rename = "errCode", default)]
    err_code: i64,
    #[serde(rename = "errMsg", default)]
    err_msg: String,
    #[serde(rename = "IQN", default)]
    iqn: Option<String>,
    #[serde(rename = "USERNAME", default)]
    username: Option<String>,
    #[serde(rename = "PASSWORD", default)]
    password: Option<String>,
    #[serde(rename = "PORTAL(S)", default)]
    portals: Vec<String>,
    #[serde(rename = "NAME", default)]
    name: Option<String>,
    #[serde(rename = "SIZE", default)]
    size: Option<String>,
    #[serde(rename = "EXPORTED ON", default)]
    exported_on: Vec<String>,
    #[serde(rename = "RESIZE FAILED ON", default)]
    resize_failed_on: BTreeMap<String, String>,
    #[serde(default)]
    blocks: Vec<String>,
}

impl BlockReply {
    fn failed(&self) -> bool {
        self.result == "FAIL"
    }
}

/// Parse a size such as `2.0 GiB` or `512.0 MiB` into whole GiB
pub fn parse_size_gib(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(value.len());
    let number: f64 = value[..split].trim().parse().ok()?;
    let unit = value[split..].trim();
    let gib = match unit {
        "B" => number / (1u64 << 30) as f64,
        "KiB" => number / (1u64 << 20) as f64,
        "MiB" => number / 1024.0,
        "" | "GiB" => number,
        "TiB" => number * 1024.0,
        "PiB" => number * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((gib + 1e-9).floor() as u64)
}

fn parse_reply(host: &str, command: &str, result: &CmdResult) -> Result<BlockReply> {
    if !result.completed {
        return Err(Error::command(host, command, result.failure_reason()));
    }
    match serde_json::from_str::<BlockReply>(result.any_output().trim()) {
        Ok(reply) => Ok(reply),
        Err(_) if !result.is_ok() => Err(Error::command(host, command, result.failure_reason())),
        Err(e) => Err(Error::parse(command, e)),
    }
}

fn reply_error(host: &str, command: &str, reply: &BlockReply) -> Error {
    Error::command(
        host,
        command,
        format!("{} (errCode {})", reply.err_msg, reply.err_code),
    )
}

impl StorageCommands {
    async fn block_call(&self, host: &str, cmd: Cmd) -> Result<BlockReply> {
        let result = self.run_raw(host, cmd.clone()).await?;
        let reply = parse_reply(host, &cmd.command, &result)?;
        if reply.failed() || !result.is_ok() {
            return Err(reply_error(host, &cmd.command, &reply));
        }
        Ok(reply)
    }

    pub async fn block_volume_create(
        &self,
        host: &str,
        request: &BlockVolumeRequest,
    ) -> Result<BlockVolumeCreated> {
        let cmd = Cmd::quiet(format!(
            "gluster-block create {}/{} ha {} auth {} prealloc {} {} {}GiB --json",
            request.hosting_volume,
            request.name,
            request.hosts.len(),
            if request.auth { "enable" } else { "disable" },
            self.config.block_prealloc,
            request.hosts.join(","),
            request.size
        ));
        let reply = self.block_call(host, cmd).await?;
        let iqn = reply
            .iqn
            .ok_or_else(|| Error::parse("gluster-block create", "reply without IQN"))?;
        info!(host, block_volume = %request.name, "block volume created");
        Ok(BlockVolumeCreated {
            iqn,
            username: reply.username.filter(|u| !u.is_empty()),
            password: reply.password.filter(|p| !p.is_empty()),
            portals: reply.portals,
        })
    }

    /// Delete a block volume; one that does not exist is done
    pub async fn block_volume_delete(
        &self,
        host: &str,
        hosting_volume: &str,
        name: &str,
    ) -> Result<()> {
        let cmd = Cmd::new(format!(
            "gluster-block delete {}/{} --json",
            hosting_volume, name
        ));
        let result = self.run_raw(host, cmd.clone()).await?;
        let reply = parse_reply(host, &cmd.command, &result)?;
        if reply.failed() || !result.is_ok() {
            if reply.err_msg.contains("doesn't exist") || reply.err_msg.contains("does not exist")
            {
                debug!(host, block_volume = name, "block volume already deleted");
                return Ok(());
            }
            return Err(reply_error(host, &cmd.command, &reply));
        }
        info!(host, block_volume = name, "block volume deleted");
        Ok(())
    }

    pub async fn block_volume_expand(
        &self,
        host: &str,
        hosting_volume: &str,
        name: &str,
        new_size: u64,
    ) -> Result<()> {
        let cmd = Cmd::new(format!(
            "gluster-block modify {}/{} size {}GiB --json",
            hosting_volume, name, new_size
        ));
        self.block_call(host, cmd).await?;
        info!(host, block_volume = name, new_size, "block volume resized");
        Ok(())
    }

    pub async fn block_volume_info(
        &self,
        host: &str,
        hosting_volume: &str,
        name: &str,
    ) -> Result<BlockVolumeInfo> {
        let command = format!("gluster-block info {}/{} --json", hosting_volume, name);
        let reply = self.block_call(host, Cmd::new(command.clone())).await?;

        let size_text = reply
            .size
            .as_deref()
            .ok_or_else(|| Error::parse(&command, "reply without SIZE"))?;
        let size = parse_size_gib(size_text)
            .ok_or_else(|| Error::parse(&command, format!("bad SIZE '{}'", size_text)))?;

        let mut usable_size = size;
        for (failed_host, applied) in &reply.resize_failed_on {
            let applied = parse_size_gib(applied).ok_or_else(|| {
                Error::parse(
                    &command,
                    format!("bad size '{}' for {}", applied, failed_host),
                )
            })?;
            usable_size = usable_size.min(applied);
        }

        Ok(BlockVolumeInfo {
            name: reply.name.unwrap_or_else(|| name.to_string()),
            size,
            usable_size,
            exported_on: reply.exported_on,
        })
    }

    pub async fn block_volume_list(&self, host: &str, hosting_volume: &str) -> Result<Vec<String>> {
        let cmd = Cmd::new(format!("gluster-block list {} --json", hosting_volume));
        Ok(self.block_call(host, cmd).await?.blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size_gib("2.0 GiB"), Some(2));
        assert_eq!(parse_size_gib("1.0 GiB"), Some(1));
        assert_eq!(parse_size_gib("1024.0 MiB"), Some(1));
        assert_eq!(parse_size_gib("1.5 TiB"), Some(1536));
        assert_eq!(parse_size_gib("3"), Some(3));
        assert_eq!(parse_size_gib("lots"), None);
        assert_eq!(parse_size_gib("2.0 XB"), None);
    }

    #[test]
    fn test_partial_resize_reply() {
        let out = r#"{ "NAME": "blk", "VOLUME": "hv", "GBID": "x", "SIZE": "2.0 GiB", "HA": 3,
            "PASSWORD": "", "EXPORTED ON": [ "HOST1", "HOST2", "HOST3" ],
            "RESIZE FAILED ON": { "HOST3": "1.0 GiB" } }"#;
        let reply = parse_reply("h", "info", &CmdResult::success(out)).unwrap();
        assert!(!reply.failed());
        assert_eq!(reply.resize_failed_on["HOST3"], "1.0 GiB");
        assert_eq!(reply.exported_on.len(), 3);
    }

    #[test]
    fn test_fail_reply_from_stderr() {
        let result = CmdResult::failure(
            255,
            r#"{ "RESULT": "FAIL", "errCode": 255, "errMsg": "block volume resize failed: HOST3:[1.0 GiB]" }"#,
        );
        let reply = parse_reply("h", "modify", &result).unwrap();
        assert!(reply.failed());
        let err = reply_error("h", "modify", &reply);
        assert!(err.to_string().contains("resize failed"));
    }

    #[test]
    fn test_unparsable_success_is_parse_error() {
        let err = parse_reply("h", "info", &CmdResult::success("not json")).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        let err = parse_reply("h", "info", &CmdResult::failure(1, "ssh died")).unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
    }
}
