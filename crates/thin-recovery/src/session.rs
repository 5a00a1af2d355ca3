//! Per-invocation recovery context.

use std::path::{Path, PathBuf};

use crate::config::RecoveryConfig;
use crate::state::{StateTracker, StepState};

const ORIGINAL_BLOB: &str = "metadata.orig";
const REPAIRED_BLOB: &str = "metadata.repaired";
const TABLE_FILE: &str = "tmeta.table";
const TRANSACTION_FILE: &str = "transaction_id";

/// One recovery run against one volume group.
#[derive(Debug)]
pub struct RecoverySession {
    target: String,
    config: RecoveryConfig,
    tracker: StateTracker,
    state: Option<StepState>,
    scratch_dir: PathBuf,
    backup_dir: Option<PathBuf>,
}

impl RecoverySession {
    #[must_use]
    pub fn new(target: impl Into<String>, config: RecoveryConfig) -> Self {
        let target = target.into();
        let tracker = StateTracker::new(config.state_file(&target));
        let scratch_dir = config.scratch_dir(&target);
        Self {
            target,
            config,
            tracker,
            state: None,
            scratch_dir,
            backup_dir: None,
        }
    }

    /// Volume group under recovery.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    #[must_use]
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    #[must_use]
    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    /// State persisted by this process, `None` before the first transition.
    #[must_use]
    pub fn state(&self) -> Option<StepState> {
        self.state
    }

    /// Persist a transition. Only the orchestrator calls this.
    pub(crate) fn transition(&mut self, next: StepState) -> anyhow::Result<()> {
        self.tracker.set_state(self.state, next)?;
        self.state = Some(next);
        Ok(())
    }

    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Backup directory, set once validation has created it.
    #[must_use]
    pub fn backup_dir(&self) -> Option<&Path> {
        self.backup_dir.as_deref()
    }

    pub(crate) fn set_backup_dir(&mut self, dir: PathBuf) {
        self.backup_dir = Some(dir);
    }

    #[must_use]
    pub fn original_blob(&self) -> PathBuf {
        self.scratch_dir.join(ORIGINAL_BLOB)
    }

    #[must_use]
    pub fn repaired_blob(&self) -> PathBuf {
        self.scratch_dir.join(REPAIRED_BLOB)
    }

    #[must_use]
    pub fn table_file(&self) -> PathBuf {
        self.scratch_dir.join(TABLE_FILE)
    }

    #[must_use]
    pub fn transaction_file(&self) -> PathBuf {
        self.scratch_dir.join(TRANSACTION_FILE)
    }
}
