//! Typed wrapper over the `lvm` multiplexer and `dmsetup status`.
//!
//! Activation, deactivation and monitoring changes carry the configured
//! ceiling because they hang indefinitely on a damaged pool. A timeout is
//! returned as an error like any other failure.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::RecoveryConfig;
use crate::exec::{CommandRunner, CommandSpec};

/// Health of a running thin pool as reported by `dmsetup status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolHealth {
    /// Pool running read-write with no pending check.
    Healthy { transaction_id: u64 },
    /// Pool running but flagged (read-only, needs_check, out of space).
    Degraded(String),
    /// Device-mapper reports the pool as failed.
    Failed,
}

/// Parse one `thin-pool` status line:
/// `<start> <len> thin-pool <txn> <meta used/total> <data used/total> <held root> rw|ro|out_of_data_space ... needs_check|- ...`
#[must_use]
pub fn parse_pool_status(line: &str) -> Option<PoolHealth> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.get(2) != Some(&"thin-pool") {
        return None;
    }
    if fields.get(3) == Some(&"Fail") {
        return Some(PoolHealth::Failed);
    }

    let transaction_id = fields.get(3)?.parse::<u64>().ok()?;
    let mode = fields.get(7).copied().unwrap_or("rw");
    if mode != "rw" {
        return Some(PoolHealth::Degraded(format!("pool mode is {mode}")));
    }
    if fields.iter().any(|f| *f == "needs_check") {
        return Some(PoolHealth::Degraded("needs_check flag set".into()));
    }
    Some(PoolHealth::Healthy { transaction_id })
}

/// Parse a `--units b --nosuffix` size column.
fn parse_bytes(stdout: &str) -> Result<u64> {
    let value = stdout.trim();
    value
        .parse::<u64>()
        .with_context(|| format!("Unexpected size value '{value}'"))
}

/// LVM operations scoped to one volume group.
pub struct Lvm<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a RecoveryConfig,
    vg: &'a str,
}

impl<'a> Lvm<'a> {
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, config: &'a RecoveryConfig, vg: &'a str) -> Self {
        Self { runner, config, vg }
    }

    fn lvm(sub: &str) -> CommandSpec {
        CommandSpec::new("lvm").arg(sub)
    }

    fn bounded(&self, spec: CommandSpec) -> CommandSpec {
        spec.with_timeout(self.config.activation_timeout())
    }

    fn lv_path(&self, lv: &str) -> String {
        format!("{}/{lv}", self.vg)
    }

    pub async fn vg_exists(&self) -> Result<bool> {
        let out = self
            .runner
            .output(&Self::lvm("vgs").args(["--noheadings", "-o", "vg_name", self.vg]))
            .await?;
        Ok(out.success() && out.stdout.trim() == self.vg)
    }

    pub async fn activate_vg(&self) -> Result<()> {
        info!(vg = self.vg, "Activating volume group");
        self.runner
            .run(&self.bounded(Self::lvm("vgchange").args(["-ay", self.vg])))
            .await?;
        Ok(())
    }

    pub async fn deactivate_vg(&self) -> Result<()> {
        info!(vg = self.vg, "Deactivating volume group");
        self.runner
            .run(&self.bounded(Self::lvm("vgchange").args(["-an", self.vg])))
            .await?;
        Ok(())
    }

    /// Toggle dmeventd monitoring for every LV in the group.
    pub async fn set_monitoring(&self, enabled: bool) -> Result<()> {
        let flag = if enabled { "y" } else { "n" };
        self.runner
            .run(&self.bounded(Self::lvm("vgchange").args(["--monitor", flag, self.vg])))
            .await?;
        Ok(())
    }

    /// Activate a single LV; for `_tmeta` this is LVM's read-only component activation.
    pub async fn activate_lv(&self, lv: &str) -> Result<()> {
        debug!(lv, "Activating LV");
        let path = self.lv_path(lv);
        self.runner
            .run(&self.bounded(Self::lvm("lvchange").args(["-ay", "-y", path.as_str()])))
            .await?;
        Ok(())
    }

    pub async fn deactivate_lv(&self, lv: &str) -> Result<()> {
        debug!(lv, "Deactivating LV");
        let path = self.lv_path(lv);
        self.runner
            .run(&self.bounded(Self::lvm("lvchange").args(["-an", path.as_str()])))
            .await?;
        Ok(())
    }

    pub async fn lv_exists(&self, lv: &str) -> Result<bool> {
        let out = self
            .runner
            .run(&Self::lvm("lvs").args(["-a", "--noheadings", "-o", "lv_name", self.vg]))
            .await?;
        Ok(out
            .stdout
            .lines()
            .map(|l| l.trim().trim_start_matches('[').trim_end_matches(']'))
            .any(|name| name == lv))
    }

    pub async fn lv_size_bytes(&self, lv: &str) -> Result<u64> {
        let path = self.lv_path(lv);
        let out = self
            .runner
            .run(&Self::lvm("lvs").args([
                "-a",
                "--noheadings",
                "--units",
                "b",
                "--nosuffix",
                "-o",
                "lv_size",
                path.as_str(),
            ]))
            .await?;
        parse_bytes(&out.stdout).with_context(|| format!("Failed to read size of {path}"))
    }

    pub async fn vg_free_bytes(&self) -> Result<u64> {
        let out = self
            .runner
            .run(&Self::lvm("vgs").args([
                "--noheadings",
                "--units",
                "b",
                "--nosuffix",
                "-o",
                "vg_free",
                self.vg,
            ]))
            .await?;
        parse_bytes(&out.stdout)
            .with_context(|| format!("Failed to read free space of {}", self.vg))
    }

    pub async fn remove_lv(&self, lv: &str) -> Result<()> {
        let path = self.lv_path(lv);
        info!(lv = %path, "Removing LV");
        self.runner
            .run(&Self::lvm("lvremove").args(["-f", path.as_str()]))
            .await?;
        Ok(())
    }

    /// Create an LV from every free extent in the group.
    pub async fn create_reservation(&self, name: &str) -> Result<()> {
        info!(lv = name, vg = self.vg, "Creating reservation volume");
        self.runner
            .run(&Self::lvm("lvcreate").args(["-y", "-l", "100%FREE", "-n", name, self.vg]))
            .await?;
        Ok(())
    }

    /// `vgcfgbackup` into an explicit file.
    pub async fn backup_config(&self, dest: &Path) -> Result<()> {
        let dest = dest.to_string_lossy();
        self.runner
            .run(&Self::lvm("vgcfgbackup").args(["-f", &*dest, self.vg]))
            .await?;
        Ok(())
    }

    /// Forced `vgcfgrestore` (required for groups holding thin pools).
    pub async fn restore_config(&self, src: &Path) -> Result<()> {
        let src = src.to_string_lossy();
        info!(vg = self.vg, file = %src, "Restoring LVM configuration");
        self.runner
            .run(&Self::lvm("vgcfgrestore").args(["--force", "-f", &*src, self.vg]))
            .await?;
        Ok(())
    }

    /// Human-readable listing of every LV, for the backup directory.
    pub async fn describe_volumes(&self) -> Result<String> {
        let out = self
            .runner
            .run(&Self::lvm("lvs").args(["-a", "-o", "+devices,lv_health_status", self.vg]))
            .await?;
        Ok(out.stdout)
    }

    /// Health of the running pool; an absent pool device counts as failed.
    pub async fn pool_health(&self) -> Result<PoolHealth> {
        let name = self.config.pool_dm_name(self.vg);
        let out = self
            .runner
            .output(&CommandSpec::new("dmsetup").args(["status", name.as_str()]))
            .await?;
        if !out.success() {
            debug!(device = %name, stderr = %out.stderr.trim(), "Pool device not present");
            return Ok(PoolHealth::Failed);
        }
        Ok(out
            .stdout
            .lines()
            .find_map(parse_pool_status)
            .unwrap_or(PoolHealth::Failed))
    }
}
