//! Recovery state persistence.
//!
//! One plain-text file per volume group holds the label of the step in
//! progress. The file survives every failure and interruption so the next
//! invocation can tell how far the previous one got; it is removed only
//! after a fully successful run.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::info;

/// Recovery steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StepState {
    /// Validation passed, nothing touched yet.
    Starting,
    /// LVM event monitoring disabled for the group.
    LvmStopped,
    /// Configuration snapshots written to the backup directory.
    BackupDone,
    /// Reservation volume removed or confirmed absent.
    PxreserveChecked,
    /// Every LV in the group deactivated.
    VgDeactivated,
    /// Original metadata copied to tmpfs.
    MetadataCopiedToTmpfs,
    /// Repaired metadata produced and verified.
    RepairComplete,
    /// Live device table of the metadata volume captured.
    TableObtained,
    /// Repaired metadata is being written to the device.
    WritingMetadata,
    /// Write finished and temporary mapping removed.
    MetadataWritten,
    /// Reconciling the LVM transaction id.
    TxnIdFixing,
    /// Activating the group.
    Activating,
    /// Recreating the reservation volume.
    RecreatingPxreserve,
    /// Recovery finished.
    Complete,
}

impl StepState {
    /// Every state in order.
    pub const ALL: [Self; 14] = [
        Self::Starting,
        Self::LvmStopped,
        Self::BackupDone,
        Self::PxreserveChecked,
        Self::VgDeactivated,
        Self::MetadataCopiedToTmpfs,
        Self::RepairComplete,
        Self::TableObtained,
        Self::WritingMetadata,
        Self::MetadataWritten,
        Self::TxnIdFixing,
        Self::Activating,
        Self::RecreatingPxreserve,
        Self::Complete,
    ];

    /// Total number of steps.
    pub const TOTAL_STEPS: u8 = 14;

    /// Label persisted in the state file.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::LvmStopped => "lvm_stopped",
            Self::BackupDone => "backup_done",
            Self::PxreserveChecked => "pxreserve_checked",
            Self::VgDeactivated => "vg_deactivated",
            Self::MetadataCopiedToTmpfs => "metadata_copied_to_tmpfs",
            Self::RepairComplete => "repair_complete",
            Self::TableObtained => "table_obtained",
            Self::WritingMetadata => "writing_metadata",
            Self::MetadataWritten => "metadata_written",
            Self::TxnIdFixing => "txn_id_fixing",
            Self::Activating => "activating",
            Self::RecreatingPxreserve => "recreating_pxreserve",
            Self::Complete => "complete",
        }
    }

    /// Human-readable description of the step.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Starting => "Validating environment",
            Self::LvmStopped => "Stopping LVM monitoring",
            Self::BackupDone => "Backing up LVM configuration",
            Self::PxreserveChecked => "Checking reservation volume",
            Self::VgDeactivated => "Deactivating volume group",
            Self::MetadataCopiedToTmpfs => "Copying metadata to tmpfs",
            Self::RepairComplete => "Repairing metadata",
            Self::TableObtained => "Capturing metadata device table",
            Self::WritingMetadata => "Writing repaired metadata",
            Self::MetadataWritten => "Metadata written",
            Self::TxnIdFixing => "Reconciling transaction id",
            Self::Activating => "Activating volume group",
            Self::RecreatingPxreserve => "Recreating reservation volume",
            Self::Complete => "Complete",
        }
    }

    /// 1-based position for progress display.
    #[must_use]
    pub fn step_number(self) -> u8 {
        Self::ALL
            .iter()
            .position(|s| *s == self)
            .map_or(0, |i| i as u8 + 1)
    }

    /// The following step; `Complete` is terminal.
    #[must_use]
    pub fn next(self) -> Self {
        let idx = self.step_number() as usize;
        Self::ALL.get(idx).copied().unwrap_or(Self::Complete)
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A state file held something that is not a known label.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unknown recovery state label '{0}'")]
pub struct UnknownStateLabel(pub String);

impl FromStr for StepState {
    type Err = UnknownStateLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim();
        Self::ALL
            .into_iter()
            .find(|state| state.label() == label)
            .ok_or_else(|| UnknownStateLabel(label.to_string()))
    }
}

/// Risk of restarting after an interrupted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeBand {
    /// On-disk metadata untouched; restart from scratch.
    PreWrite,
    /// Interrupted during the device write; on-disk metadata may be torn.
    DuringWrite,
    /// The risky phase completed; remaining steps can be finished.
    PostWrite,
}

impl ResumeBand {
    #[must_use]
    pub fn classify(state: StepState) -> Self {
        match state.cmp(&StepState::WritingMetadata) {
            std::cmp::Ordering::Less => Self::PreWrite,
            std::cmp::Ordering::Equal => Self::DuringWrite,
            std::cmp::Ordering::Greater => Self::PostWrite,
        }
    }

    /// Operator-facing explanation of the band.
    #[must_use]
    pub fn explanation(self) -> &'static str {
        match self {
            Self::PreWrite => {
                "Interrupted before the metadata write. Original metadata is untouched; \
                 it is safe to restart the recovery from the beginning."
            }
            Self::DuringWrite => {
                "CRITICAL: interrupted while writing repaired metadata to disk. \
                 On-disk metadata may be corrupted. Check the scratch directory for a \
                 surviving repaired copy before doing anything else."
            }
            Self::PostWrite => {
                "Interrupted after the metadata write completed. The risky phase is done; \
                 it is safe to resume and finish the remaining steps."
            }
        }
    }
}

/// Persists the current step for one volume group.
#[derive(Debug, Clone)]
pub struct StateTracker {
    path: PathBuf,
}

impl StateTracker {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `state`, replacing any previous label.
    ///
    /// Writes to a sibling temp file and renames so a crash never leaves a
    /// half-written label behind.
    pub fn set_state(&self, previous: Option<StepState>, state: StepState) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create state directory {}", dir.display()))?;
        }

        let tmp = self.path.with_extension("state.tmp");
        std::fs::write(&tmp, format!("{}\n", state.label()))
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to persist state file {}", self.path.display()))?;

        match previous {
            Some(prev) => info!(from = %prev, to = %state, "State transition"),
            None => info!(to = %state, "State transition"),
        }
        Ok(())
    }

    /// Last persisted state, if a state file exists.
    pub fn read_previous_state(&self) -> Result<Option<StepState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file {}", self.path.display()))?;
        let state = content
            .parse::<StepState>()
            .with_context(|| format!("Corrupt state file {}", self.path.display()))?;
        Ok(Some(state))
    }

    /// Remove the state file. Missing file is not an error.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "State file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove state file {}", self.path.display())),
        }
    }
}
