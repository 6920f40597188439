use super::StorageCommands;
use crate::error::{Error, Result};
use crate::executor::Cmd;
use crate::model::Durability;
use serde::Deserialize;
use tracing::{debug, info};

/// Volume layout handed to `volume create` / `add-brick`
#[derive(Debug, Clone)]
pub struct VolumeRequest {
    pub name: String,
    pub durability: Durability,
    /// `host:/path` in set order
    pub bricks: Vec<String>,
}

/// Parsed `volume info --xml`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub id: String,
    pub status: String,
    pub replica_count: u32,
    /// `host:/path` in volume order
    pub bricks: Vec<String>,
}

impl VolumeInfo {
    pub fn has_brick(&self, brick: &str) -> bool {
        self.bricks.iter().any(|b| b == brick)
    }
}

// =============================================================================
// XML shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct CliOutput {
    #[serde(rename = "opRet")]
    op_ret: i32,
    #[serde(rename = "opErrstr", default)]
    op_errstr: String,
    #[serde(rename = "volInfo", default)]
    vol_info: Option<VolInfoXml>,
}

#[derive(Debug, Deserialize)]
struct VolInfoXml {
    volumes: VolumesXml,
}

#[derive(Debug, Deserialize)]
struct VolumesXml {
    #[serde(rename = "volume", default)]
    volume: Vec<VolumeXml>,
}

#[derive(Debug, Deserialize)]
struct VolumeXml {
    name: String,
    #[serde(default)]
    id: String,
    #[serde(rename = "statusStr", default)]
    status_str: String,
    #[serde(rename = "replicaCount", default)]
    replica_count: u32,
    #[serde(default)]
    bricks: Option<BricksXml>,
}

#[derive(Debug, Deserialize)]
struct BricksXml {
    #[serde(rename = "brick", default)]
    brick: Vec<BrickXml>,
}

#[derive(Debug, Deserialize)]
struct BrickXml {
    name: String,
}

fn parse_volume_info(command: &str, name: &str, xml: &str) -> Result<VolumeInfo> {
    let out: CliOutput = quick_xml::de::from_str(xml).map_err(|e| Error::parse(command, e))?;
    if out.op_ret != 0 {
        if out.op_errstr.contains("does not exist") {
            return Err(Error::VolumeDoesNotExist(name.to_string()));
        }
        return Err(Error::parse(
            command,
            format!("opRet {}: {}", out.op_ret, out.op_errstr),
        ));
    }
    let volume = out
        .vol_info
        .and_then(|v| v.volumes.volume.into_iter().find(|v| v.name == name))
        .ok_or_else(|| Error::VolumeDoesNotExist(name.to_string()))?;
    Ok(VolumeInfo {
        name: volume.name,
        id: volume.id,
        status: volume.status_str,
        replica_count: volume.replica_count,
        bricks: volume
            .bricks
            .map(|b| b.brick.into_iter().map(|b| b.name).collect())
            .unwrap_or_default(),
    })
}

// =============================================================================
// Commands
// =============================================================================

impl StorageCommands {
    fn brick_batches(&self, durability: &Durability, bricks: &[String]) -> Vec<String> {
        let per_command = durability.set_size() * durability.max_sets_per_command();
        bricks
            .chunks(per_command.max(1))
            .map(|chunk| chunk.join(" "))
            .collect()
    }

    fn layout_args(durability: &Durability) -> String {
        let args = durability.create_args();
        if args.is_empty() {
            args
        } else {
            format!("{} ", args)
        }
    }

    /// Create and start a volume from already created bricks
    pub async fn volume_create(&self, host: &str, request: &VolumeRequest) -> Result<()> {
        let layout = Self::layout_args(&request.durability);
        let mut commands = Vec::new();
        for (idx, batch) in self
            .brick_batches(&request.durability, &request.bricks)
            .into_iter()
            .enumerate()
        {
            let verb = if idx == 0 { "create" } else { "add-brick" };
            commands.push(Cmd::new(self.gluster(&format!(
                "volume {} {} {}{}",
                verb, request.name, layout, batch
            ))));
        }
        commands.push(Cmd::new(
            self.gluster(&format!("volume start {}", request.name)),
        ));

        self.run(host, commands).await?;
        info!(host, volume = %request.name, bricks = request.bricks.len(), "volume started");
        Ok(())
    }

    /// Add brick sets to a running volume
    pub async fn volume_expand(&self, host: &str, request: &VolumeRequest) -> Result<()> {
        let layout = Self::layout_args(&request.durability);
        let commands = self
            .brick_batches(&request.durability, &request.bricks)
            .into_iter()
            .map(|batch| {
                Cmd::new(self.gluster(&format!(
                    "volume add-brick {} {}{}",
                    request.name, layout, batch
                )))
            })
            .collect();
        self.run(host, commands).await?;
        info!(host, volume = %request.name, "volume expanded");
        Ok(())
    }

    /// Stop and delete a volume; a volume that does not exist is done
    pub async fn volume_destroy(&self, host: &str, name: &str) -> Result<()> {
        match self.volume_info(host, name).await {
            Err(Error::VolumeDoesNotExist(_)) => {
                debug!(host, volume = name, "volume already deleted");
                return Ok(());
            }
            Err(e) => return Err(e),
            Ok(_) => {}
        }

        let stop = Cmd::new(self.gluster(&format!("volume stop {} force", name)));
        let result = self.run_raw(host, stop.clone()).await?;
        if !result.is_ok() && !result.any_output().contains("not in the started state") {
            return Err(Error::command(host, stop.command, result.failure_reason()));
        }

        self.run(
            host,
            vec![Cmd::new(self.gluster(&format!("volume delete {}", name)))],
        )
        .await?;
        info!(host, volume = name, "volume deleted");
        Ok(())
    }

    pub async fn volume_info(&self, host: &str, name: &str) -> Result<VolumeInfo> {
        let command = self.gluster(&format!("volume info {} --xml", name));
        let result = self.run_raw(host, Cmd::new(command.clone())).await?;
        if !result.completed {
            return Err(Error::command(host, command, result.failure_reason()));
        }
        match parse_volume_info(&command, name, &result.output) {
            Err(Error::Parse { .. }) if !result.is_ok() => {
                Err(Error::command(host, command, result.failure_reason()))
            }
            other => other,
        }
    }

    pub async fn volume_replace_brick(
        &self,
        host: &str,
        name: &str,
        old_brick: &str,
        new_brick: &str,
    ) -> Result<()> {
        self.run(
            host,
            vec![Cmd::new(self.gluster(&format!(
                "volume replace-brick {} {} {} commit force",
                name, old_brick, new_brick
            )))],
        )
        .await?;
        info!(host, volume = name, old_brick, new_brick, "brick replaced");
        Ok(())
    }
}
