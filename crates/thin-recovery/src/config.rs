//! Recovery configuration types.
//!
//! Defaults match a stock Portworx node: the pool lives in `pxpool`, the
//! reservation volume is `pxreserve`, scratch copies go to tmpfs and
//! everything meant to outlive the container goes under `/var/cores`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// External tools the recovery drives. All of them must resolve on `PATH`.
pub const REQUIRED_TOOLS: &[&str] = &[
    "lvm",
    "dmsetup",
    "thin_check",
    "thin_repair",
    "thin_dump",
    "pxctl",
];

/// Full recovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Thin pool LV name inside the target volume group.
    pub pool_name: String,
    /// Reservation LV that soaks up free extents in the group.
    pub reservation_name: String,

    // Paths
    /// Directory holding one `<vg>.state` file per target.
    pub state_dir: PathBuf,
    /// Parent of the timestamped per-session backup directories.
    pub backup_root: PathBuf,
    /// Parent of the per-target scratch directory (expected to be tmpfs).
    pub scratch_root: PathBuf,
    /// Where LVM exposes `/<vg>/<lv>` device nodes.
    pub device_root: PathBuf,
    /// Where device-mapper exposes named devices.
    pub mapper_root: PathBuf,

    // Limits
    /// Ceiling for activation, deactivation and monitoring calls.
    pub activation_timeout_secs: u64,
    /// Required free memory as a multiple of the metadata volume size.
    pub memory_safety_factor: u64,

    // Execution context
    /// Accepted `comm` values for PID 1 (the Portworx container).
    pub container_init_names: Vec<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            pool_name: "pxpool".into(),
            reservation_name: "pxreserve".into(),
            state_dir: PathBuf::from("/var/cores/px-thin-recovery"),
            backup_root: PathBuf::from("/var/cores/px-thin-recovery"),
            scratch_root: PathBuf::from("/dev/shm/px-thin-recovery"),
            device_root: PathBuf::from("/dev"),
            mapper_root: PathBuf::from("/dev/mapper"),
            activation_timeout_secs: 30,
            memory_safety_factor: 3,
            container_init_names: vec!["px-ns".into(), "px-oci-mon".into()],
        }
    }
}

impl RecoveryConfig {
    /// Load overrides from a TOML file on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Timeout applied to calls known to hang on a damaged pool.
    #[must_use]
    pub fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.activation_timeout_secs)
    }

    /// Hidden metadata sub-volume of the pool.
    #[must_use]
    pub fn metadata_lv(&self) -> String {
        format!("{}_tmeta", self.pool_name)
    }

    /// State file path for a volume group.
    #[must_use]
    pub fn state_file(&self, vg: &str) -> PathBuf {
        self.state_dir.join(format!("{vg}.state"))
    }

    /// Scratch directory for a volume group.
    #[must_use]
    pub fn scratch_dir(&self, vg: &str) -> PathBuf {
        self.scratch_root.join(vg)
    }

    /// Device node of the component-activated metadata volume.
    #[must_use]
    pub fn metadata_device(&self, vg: &str) -> PathBuf {
        self.device_root.join(vg).join(self.metadata_lv())
    }

    /// Device-mapper name LVM gives the metadata volume.
    #[must_use]
    pub fn metadata_dm_name(&self, vg: &str) -> String {
        format!("{}-{}", dm_escape(vg), dm_escape(&self.metadata_lv()))
    }

    /// Device-mapper name of the running thin pool.
    #[must_use]
    pub fn pool_dm_name(&self, vg: &str) -> String {
        format!("{}-{}-tpool", dm_escape(vg), dm_escape(&self.pool_name))
    }

    /// Name of the temporary mapping used for the metadata write.
    #[must_use]
    pub fn recovery_dm_name(&self, vg: &str) -> String {
        format!("{}-px-recovery-tmeta", dm_escape(vg))
    }
}

/// LVM doubles every `-` in VG/LV names when building device-mapper names.
fn dm_escape(name: &str) -> String {
    name.replace('-', "--")
}
