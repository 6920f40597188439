use super::StorageCommands;
use crate::error::{Error, Result};
use crate::executor::{Cmd, CmdResult};
use crate::model::BrickEntry;
use tracing::{debug, info, warn};

const MOUNT_OPTIONS: &str = "rw,inode64,noatime,nouuid";

impl StorageCommands {
    /// Create, format and mount a thin provisioned brick
    pub async fn brick_create(&self, host: &str, brick: &BrickEntry) -> Result<()> {
        let mount_dir = brick.mount_dir();
        let device = brick.device_path();
        let mut commands = vec![
            Cmd::new(format!("mkdir -p {}", mount_dir)),
            Cmd::new(self.lvm(&format!(
                "lvcreate --poolmetadatasize {}K --chunksize 256K --size {}K --thin {}/{} --virtualsize {}K --name {}",
                brick.pool_metadata_size,
                brick.tp_size,
                brick.vg_name(),
                brick.tp_name(),
                brick.size,
                brick.lv_name()
            ))),
            Cmd::new(format!("mkfs.xfs -i size=512 -n size=8192 {}", device)),
            Cmd::new(format!(
                "echo \"{} {} xfs {} 1 2\" >> {}",
                device,
                mount_dir,
                MOUNT_OPTIONS,
                self.config.fstab
            )),
            Cmd::new(format!("mount -o {} {} {}", MOUNT_OPTIONS, device, mount_dir)),
            Cmd::new(format!("mkdir {}", brick.path())),
        ];
        if let Some(gid) = brick.gid {
            commands.push(Cmd::new(format!("chown :{} {}", gid, brick.path())));
            commands.push(Cmd::new(format!("chmod 2775 {}", brick.path())));
        }

        self.run(host, commands).await?;
        info!(host, brick = %brick.id, "brick created");
        Ok(())
    }

    /// Unmount and remove a brick. Steps already undone are skipped, so a
    /// destroy interrupted halfway can simply be repeated.
    ///
    /// Returns true when the thin pool was removed and its space reclaimed.
    pub async fn brick_destroy(&self, host: &str, brick: &BrickEntry) -> Result<bool> {
        let mount_dir = brick.mount_dir();

        self.tolerant(
            host,
            Cmd::new(format!("umount {}", mount_dir)),
            &["not mounted", "no mount point", "not found"],
        )
        .await?;

        self.run(
            host,
            vec![Cmd::new(format!(
                "sed -i.save \"/{}/d\" {}",
                brick.lv_name(),
                self.config.fstab
            ))],
        )
        .await?;

        self.tolerant(
            host,
            Cmd::new(self.lvm(&format!("lvremove -f {}/{}", brick.vg_name(), brick.lv_name()))),
            &["Failed to find logical volume"],
        )
        .await?;

        let reclaimed = match self.thin_count(host, brick).await? {
            Some(0) => {
                self.tolerant(
                    host,
                    Cmd::new(self.lvm(&format!(
                        "lvremove -f {}/{}",
                        brick.vg_name(),
                        brick.tp_name()
                    ))),
                    &["Failed to find logical volume"],
                )
                .await?;
                true
            }
            // pool already removed by an earlier attempt
            None => true,
            Some(n) => {
                warn!(host, brick = %brick.id, "thin pool still holds {} volumes", n);
                false
            }
        };

        self.tolerant(
            host,
            Cmd::new(format!("rmdir {}", mount_dir)),
            &["No such file or directory"],
        )
        .await?;

        info!(host, brick = %brick.id, reclaimed, "brick destroyed");
        Ok(reclaimed)
    }

    /// Thin volumes left in the brick's pool, `None` when the pool is gone
    async fn thin_count(&self, host: &str, brick: &BrickEntry) -> Result<Option<u64>> {
        let command = self.lvm_query(&format!(
            "lvs --noheadings --options=thin_count {}/{}",
            brick.vg_name(),
            brick.tp_name()
        ));
        let result = self.run_raw(host, Cmd::new(command.clone())).await?;
        if !result.is_ok() {
            if result.err_output.contains("Failed to find logical volume") {
                return Ok(None);
            }
            return Err(Error::command(host, command, result.failure_reason()));
        }
        result
            .output
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::parse(command, e))
    }

    /// Run a command treating failures whose stderr matches `benign` as done
    async fn tolerant(&self, host: &str, cmd: Cmd, benign: &[&str]) -> Result<CmdResult> {
        let result = self.run_raw(host, cmd.clone()).await?;
        if result.is_ok() {
            return Ok(result);
        }
        let text = format!("{} {}", result.err_output, result.error.as_deref().unwrap_or(""));
        if benign.iter().any(|b| text.contains(b)) {
            debug!(host, command = %cmd.command, "already done: {}", result.err_output.trim());
            return Ok(result);
        }
        Err(Error::command(host, cmd.command, result.failure_reason()))
    }
}
