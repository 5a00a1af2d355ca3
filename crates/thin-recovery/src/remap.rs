//! Device remapping layer.
//!
//! The metadata LV is only component-activated read-only, so writes go
//! through a temporary device-mapper device built from the LV's own live
//! table. Same table means same physical extents, so every byte lands where
//! LVM will look for it.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::RecoveryConfig;
use crate::error::RecoveryError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::lvm::Lvm;
use crate::session::RecoverySession;
use crate::ui;

/// Bytes per device-mapper sector.
pub const SECTOR_SIZE: u64 = 512;

/// Errors parsing a `dmsetup table` listing.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SegmentMapError {
    #[error("device table is empty")]
    Empty,

    #[error("malformed table line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("segment at line {line} starts at sector {found}, expected {expected}")]
    NotContiguous {
        line: usize,
        expected: u64,
        found: u64,
    },
}

/// One line of a device-mapper table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Logical start, in sectors.
    pub start: u64,
    /// Length, in sectors.
    pub length: u64,
    /// Target type (`linear`, `striped`, ...).
    pub target: String,
    /// Target arguments, verbatim.
    pub args: Vec<String>,
}

impl Segment {
    /// `(device, physical offset in sectors)` for linear segments.
    #[must_use]
    pub fn physical(&self) -> Option<(&str, u64)> {
        match (self.target.as_str(), self.args.as_slice()) {
            ("linear", [device, offset]) => offset.parse().ok().map(|o| (device.as_str(), o)),
            _ => None,
        }
    }

    fn to_line(&self) -> String {
        let mut line = format!("{} {} {}", self.start, self.length, self.target);
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Ordered logical-to-physical mapping of the metadata volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSegmentMap {
    segments: Vec<Segment>,
}

impl DeviceSegmentMap {
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[must_use]
    pub fn total_sectors(&self) -> u64 {
        self.segments.iter().map(|s| s.length).sum()
    }

    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.total_sectors() * SECTOR_SIZE
    }

    /// Table text accepted by `dmsetup create`.
    #[must_use]
    pub fn to_table(&self) -> String {
        let mut table = self
            .segments
            .iter()
            .map(Segment::to_line)
            .collect::<Vec<_>>()
            .join("\n");
        table.push('\n');
        table
    }

    /// Read a table persisted by [`DeviceRemapper::capture_segment_map`].
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read device table {}", path.display()))?;
        Ok(text.parse()?)
    }
}

impl FromStr for DeviceSegmentMap {
    type Err = SegmentMapError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        let mut expected = 0u64;

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let fields: Vec<&str> = raw.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() < 3 {
                return Err(SegmentMapError::Malformed {
                    line,
                    reason: format!("expected '<start> <length> <target> ...', got '{raw}'"),
                });
            }

            let parse = |value: &str, what: &str| {
                value.parse::<u64>().map_err(|_| SegmentMapError::Malformed {
                    line,
                    reason: format!("invalid {what} '{value}'"),
                })
            };
            let start = parse(fields[0], "start")?;
            let length = parse(fields[1], "length")?;
            if length == 0 {
                return Err(SegmentMapError::Malformed {
                    line,
                    reason: "zero-length segment".into(),
                });
            }
            if start != expected {
                return Err(SegmentMapError::NotContiguous {
                    line,
                    expected,
                    found: start,
                });
            }
            expected = start + length;

            segments.push(Segment {
                start,
                length,
                target: fields[2].to_string(),
                args: fields[3..].iter().map(ToString::to_string).collect(),
            });
        }

        if segments.is_empty() {
            return Err(SegmentMapError::Empty);
        }
        Ok(Self { segments })
    }
}

/// Captures the live table of the metadata volume.
pub struct DeviceRemapper<'a> {
    runner: &'a dyn CommandRunner,
    session: &'a RecoverySession,
}

impl<'a> DeviceRemapper<'a> {
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, session: &'a RecoverySession) -> Self {
        Self { runner, session }
    }

    /// Activate the metadata LV, read and persist its table, deactivate.
    pub async fn capture_segment_map(&self) -> Result<DeviceSegmentMap> {
        let config = self.session.config();
        let lvm = Lvm::new(self.runner, config, self.session.target());
        let metadata_lv = config.metadata_lv();
        let dm_name = config.metadata_dm_name(self.session.target());

        lvm.activate_lv(&metadata_lv)
            .await
            .context("Failed to activate metadata volume to read its table")?;

        let captured = self.read_table(&dm_name).await;

        lvm.deactivate_lv(&metadata_lv)
            .await
            .context("Failed to deactivate metadata volume after reading its table")?;

        let map = captured?;
        for segment in map.segments() {
            if let Some((device, offset)) = segment.physical() {
                debug!(device, offset_sectors = offset, "Metadata segment");
            }
        }
        info!(
            segments = map.segments().len(),
            sectors = map.total_sectors(),
            "Captured metadata device table"
        );
        Ok(map)
    }

    async fn read_table(&self, dm_name: &str) -> Result<DeviceSegmentMap> {
        let out = self
            .runner
            .output(&CommandSpec::new("dmsetup").args(["table", dm_name]))
            .await?;
        if !out.success() {
            return Err(RecoveryError::SegmentTable(out.stderr.trim().to_string()).into());
        }

        let map: DeviceSegmentMap = out
            .stdout
            .parse()
            .map_err(|e: SegmentMapError| RecoveryError::SegmentTable(e.to_string()))?;

        let path = self.session.table_file();
        tokio::fs::write(&path, map.to_table())
            .await
            .with_context(|| format!("Failed to persist device table to {}", path.display()))?;
        Ok(map)
    }
}

/// Temporary device-mapper device mirroring the metadata LV.
///
/// Call [`release`](Self::release) on every path. If the owner is dropped
/// without releasing (cancelled future), `Drop` removes the mapping with a
/// blocking call.
pub struct MappedDevice {
    name: String,
    path: PathBuf,
    runner: Arc<dyn CommandRunner>,
    released: bool,
}

impl MappedDevice {
    /// `dmsetup create <name> <table file>`; removes a stale mapping of the
    /// same name left by an earlier crashed run first.
    pub async fn create(
        runner: Arc<dyn CommandRunner>,
        config: &RecoveryConfig,
        name: &str,
        table_file: &Path,
    ) -> Result<Self> {
        let info = runner
            .output(&CommandSpec::new("dmsetup").args(["info", name]))
            .await?;
        if info.success() {
            warn!(device = name, "Removing stale mapping from a previous run");
            runner.run(&remove_spec(name)).await?;
        }

        runner
            .run(
                &CommandSpec::new("dmsetup")
                    .args(["create", name])
                    .arg(table_file.to_string_lossy()),
            )
            .await
            .with_context(|| format!("Failed to create temporary mapping {name}"))?;

        info!(device = name, "Temporary metadata mapping created");
        Ok(Self {
            name: name.to_string(),
            path: config.mapper_root.join(name),
            runner,
            released: false,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the mapping.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.runner
            .run(&remove_spec(&self.name))
            .await
            .with_context(|| format!("Failed to remove temporary mapping {}", self.name))?;
        info!(device = %self.name, "Temporary metadata mapping removed");
        Ok(())
    }
}

impl Drop for MappedDevice {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(device = %self.name, "Mapping dropped without release, removing");
        match self.runner.output_blocking(&remove_spec(&self.name)) {
            Ok(out) if out.success() => {}
            Ok(out) => {
                error!(
                    device = %self.name,
                    stderr = %out.stderr.trim(),
                    "Failed to remove mapping"
                );
                ui::print_error(&format!(
                    "Temporary mapping {} is still present; remove it with: dmsetup remove {}",
                    self.name, self.name
                ));
            }
            Err(e) => {
                error!(device = %self.name, error = %e, "Failed to remove mapping");
                ui::print_error(&format!(
                    "Temporary mapping {} may still be present; remove it with: dmsetup remove {}",
                    self.name, self.name
                ));
            }
        }
    }
}

fn remove_spec(name: &str) -> CommandSpec {
    CommandSpec::new("dmsetup").args(["remove", "--retry", name])
}
