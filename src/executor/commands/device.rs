use super::{shell_quote, StorageCommands};
use crate::error::{Error, Result};
use crate::executor::Cmd;
use tracing::{info, warn};

/// Volume group capacity reported by `vgdisplay -c`, KiB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub size: u64,
    pub extent_size: u64,
}

impl DeviceInfo {
    /// Parse the colon separated `vgdisplay -c` line
    pub fn parse(command: &str, output: &str) -> Result<Self> {
        let line = output
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| Error::parse(command, "empty output"))?;
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 17 {
            return Err(Error::parse(
                command,
                format!("expected at least 17 fields, got {}", fields.len()),
            ));
        }
        let number = |idx: usize, what: &str| -> Result<u64> {
            fields[idx]
                .trim()
                .parse::<u64>()
                .map_err(|e| Error::parse(command, format!("bad {} '{}': {}", what, fields[idx], e)))
        };
        let extent_size = number(12, "extent size")?;
        let free_extents = number(15, "free extent count")?;
        Ok(Self {
            size: free_extents * extent_size,
            extent_size,
        })
    }
}

impl StorageCommands {
    /// Initialize a physical volume and its volume group, return capacity
    pub async fn device_setup(&self, host: &str, device: &str, vg: &str) -> Result<DeviceInfo> {
        let commands = vec![
            Cmd::new(self.lvm(&format!(
                "pvcreate --metadatasize=128M --dataalignment=256K {}",
                shell_quote(device)
            ))),
            Cmd::new(self.lvm(&format!("vgcreate {} {}", vg, shell_quote(device)))),
        ];
        self.run(host, commands).await?;
        info!(host, device, vg, "device initialized");
        self.device_info(host, vg).await
    }

    pub async fn device_info(&self, host: &str, vg: &str) -> Result<DeviceInfo> {
        let command = self.lvm_query(&format!("vgdisplay -c {}", vg));
        let results = self.run(host, vec![Cmd::new(command.clone())]).await?;
        DeviceInfo::parse(&command, &results[0].output)
    }

    /// Remove the volume group and physical volume. Missing pieces are fine.
    pub async fn device_teardown(&self, host: &str, device: &str, vg: &str) -> Result<()> {
        let vgremove = Cmd::new(self.lvm(&format!("vgremove {}", vg)));
        let result = self.run_raw(host, vgremove.clone()).await?;
        if !result.is_ok() && !result.err_output.contains("not found") {
            return Err(Error::command(host, vgremove.command, result.failure_reason()));
        }

        let pvremove = Cmd::new(self.lvm(&format!("pvremove {}", shell_quote(device))));
        let result = self.run_raw(host, pvremove.clone()).await?;
        if !result.is_ok() {
            let missing = result.err_output.contains("No PV")
                || result.err_output.contains("not found");
            if !missing {
                return Err(Error::command(host, pvremove.command, result.failure_reason()));
            }
            warn!(host, device, "physical volume already gone");
        }
        Ok(())
    }
}
