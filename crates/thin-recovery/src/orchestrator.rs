//! Recovery orchestration.
//!
//! Drives the step sequence for one volume group:
//! - pre-flight validation and the already-healthy short circuit
//! - resume planning from a previous run's persisted state
//! - the step loop, persisting each label before the work that follows it
//! - failure and interruption reporting

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::error::RecoveryError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::lvm::{Lvm, PoolHealth};
use crate::prompt::Confirmer;
use crate::remap::{DeviceRemapper, DeviceSegmentMap, MappedDevice};
use crate::repair::RepairEngine;
use crate::session::RecoverySession;
use crate::state::{ResumeBand, StateTracker, StepState};
use crate::txn::{Reconciliation, TransactionReconciler};
use crate::ui;
use crate::validator::{EnvironmentValidator, HostProbe};

/// Exit status for a completed or already-healthy run.
pub const EXIT_SUCCESS: u8 = 0;
/// Exit status for any failure.
pub const EXIT_FAILURE: u8 = 1;
/// Exit status after SIGINT/SIGTERM.
pub const EXIT_INTERRUPTED: u8 = 130;

/// Switches that change validation, not the step sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub skip_container_check: bool,
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Pool was already healthy; nothing was touched.
    AlreadyHealthy,
    /// Every step ran to completion.
    Completed,
}

pub struct Orchestrator {
    session: RecoverySession,
    runner: Arc<dyn CommandRunner>,
    confirmer: Arc<dyn Confirmer>,
    probe: Arc<dyn HostProbe>,
    options: RunOptions,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        session: RecoverySession,
        runner: Arc<dyn CommandRunner>,
        confirmer: Arc<dyn Confirmer>,
        probe: Arc<dyn HostProbe>,
        options: RunOptions,
    ) -> Self {
        Self {
            session,
            runner,
            confirmer,
            probe,
            options,
        }
    }

    #[must_use]
    pub fn session(&self) -> &RecoverySession {
        &self.session
    }

    /// Run the recovery to completion or to the first fatal error.
    ///
    /// The state file is left behind on every error so the next run can
    /// resume; it is removed only on success.
    pub async fn run(&mut self) -> Result<Outcome> {
        ui::print_banner(self.session.target());

        let result = self.run_inner().await;
        if let Err(e) = &result {
            self.report_failure(e);
        }
        result
    }

    async fn run_inner(&mut self) -> Result<Outcome> {
        ui::print_section("Pre-flight checks");
        if self.validate().await? {
            self.session.tracker().clear()?;
            ui::print_success(&format!(
                "Thin pool in {} is healthy, no action needed",
                self.session.target()
            ));
            return Ok(Outcome::AlreadyHealthy);
        }

        let start = self.plan_resume().await?;
        self.execute_from(start).await?;
        self.finish().await?;
        Ok(Outcome::Completed)
    }

    /// Returns `true` when the pool is already healthy.
    async fn validate(&mut self) -> Result<bool> {
        let backup_dir = {
            let validator = EnvironmentValidator::new(
                self.runner.as_ref(),
                self.probe.as_ref(),
                self.confirmer.as_ref(),
                self.session.config(),
                self.session.target(),
            );

            validator.check_tools()?;
            if self.options.skip_container_check {
                warn!("Container check skipped");
                ui::print_warning("Skipping Portworx container check (--skip-container-check)");
            } else {
                validator.check_context()?;
            }
            validator.check_group_exists().await?;

            if validator.is_already_healthy().await? {
                return Ok(true);
            }

            validator.check_maintenance().await?;
            validator.check_terminal()?;
            validator.check_memory().await?;
            validator.create_backup_dir()?
        };

        ui::print_kv("Backup directory", &backup_dir.display().to_string());
        self.session.set_backup_dir(backup_dir);
        Ok(false)
    }

    /// Pick the first state to persist, based on what a previous run left.
    async fn plan_resume(&self) -> Result<StepState> {
        let Some(previous) = self.session.tracker().read_previous_state()? else {
            return Ok(StepState::Starting);
        };

        let band = ResumeBand::classify(previous);
        info!(state = %previous, band = ?band, "Previous run detected");
        ui::print_section("Previous run detected");
        ui::print_kv("Last state", previous.label());
        ui::print_kv("State file", &self.session.tracker().path().display().to_string());

        match band {
            ResumeBand::PreWrite => {
                ui::print_info(band.explanation());
                self.require("Restart the recovery from the beginning?", true)?;
                Ok(StepState::Starting)
            }
            ResumeBand::DuringWrite => {
                let scratch =
                    format!("Scratch directory: {}", self.session.scratch_dir().display());
                ui::print_critical(&[band.explanation(), scratch.as_str()]);
                self.require(
                    "On-disk metadata may be torn. Continue the recovery anyway?",
                    false,
                )?;

                let repaired = self.session.repaired_blob();
                let table = self.session.table_file();
                if repaired.is_file() && table.is_file() {
                    ui::print_info("Repaired metadata and device table survived; rewriting them");
                    self.prepare_for_write().await?;
                    Ok(StepState::WritingMetadata)
                } else {
                    warn!("Scratch artifacts missing, restarting from the beginning");
                    ui::print_warning(
                        "Repaired metadata or device table is missing from scratch; \
                         restarting from the beginning",
                    );
                    Ok(StepState::Starting)
                }
            }
            ResumeBand::PostWrite => {
                ui::print_info(band.explanation());
                self.require(&format!("Resume the recovery at '{previous}'?"), true)?;
                Ok(previous)
            }
        }
    }

    /// Put the group back into the state the write step expects.
    ///
    /// The health gate may have left the pool active with monitoring on,
    /// and the metadata extents must not be owned by a live pool target
    /// while they are rewritten.
    async fn prepare_for_write(&self) -> Result<()> {
        let lvm = self.lvm();
        lvm.set_monitoring(false)
            .await
            .context("Failed to disable LVM monitoring")?;
        lvm.deactivate_vg()
            .await
            .context("Failed to deactivate volume group")?;
        info!("Volume group deactivated for metadata rewrite");
        Ok(())
    }

    async fn execute_from(&mut self, start: StepState) -> Result<()> {
        ui::print_section("Recovery");
        let mut state = start;
        loop {
            self.session.transition(state)?;
            ui::print_progress_step(
                state.step_number(),
                StepState::TOTAL_STEPS,
                state.description(),
            );
            if state == StepState::Complete {
                return Ok(());
            }

            self.work_after(state)
                .await
                .with_context(|| format!("Recovery step failed at state '{state}'"))?;
            state = state.next();
        }
    }

    /// Work performed while `state` is the persisted label.
    async fn work_after(&self, state: StepState) -> Result<()> {
        match state {
            StepState::Starting => self
                .lvm()
                .set_monitoring(false)
                .await
                .context("Failed to disable LVM monitoring"),
            StepState::LvmStopped => self.backup().await,
            StepState::BackupDone => self.check_reservation().await,
            StepState::PxreserveChecked => self
                .lvm()
                .deactivate_vg()
                .await
                .context("Failed to deactivate volume group"),
            StepState::VgDeactivated => self.engine().snapshot_to_scratch().await.map(|_| ()),
            StepState::MetadataCopiedToTmpfs => self.repair().await,
            StepState::RepairComplete => self.capture_table().await,
            StepState::TableObtained => self.require_write_confirmation(),
            StepState::WritingMetadata => self.write_metadata().await,
            StepState::MetadataWritten | StepState::Complete => Ok(()),
            StepState::TxnIdFixing => self.reconcile().await,
            StepState::Activating => self.activate().await,
            StepState::RecreatingPxreserve => self.recreate_reservation().await,
        }
    }

    fn lvm(&self) -> Lvm<'_> {
        Lvm::new(
            self.runner.as_ref(),
            self.session.config(),
            self.session.target(),
        )
    }

    fn engine(&self) -> RepairEngine<'_> {
        RepairEngine::new(self.runner.as_ref(), &self.session)
    }

    fn backup_dir(&self) -> Result<&Path> {
        self.session
            .backup_dir()
            .context("Backup directory not initialized")
    }

    fn require(&self, prompt: &str, default: bool) -> Result<()> {
        if self.confirmer.confirm(prompt, default)? {
            Ok(())
        } else {
            Err(RecoveryError::OperatorDeclined(prompt.to_string()).into())
        }
    }

    async fn backup(&self) -> Result<()> {
        let dir = self.backup_dir()?;
        let vg = self.session.target();
        let lvm = self.lvm();

        lvm.backup_config(&dir.join(format!("{vg}.vg")))
            .await
            .context("Failed to back up LVM configuration")?;

        let listing = lvm.describe_volumes().await?;
        tokio::fs::write(dir.join("lvs.txt"), listing).await?;

        for (sub, file) in [("table", "dmsetup-table.txt"), ("status", "dmsetup-status.txt")] {
            let out = self
                .runner
                .output(&CommandSpec::new("dmsetup").arg(sub))
                .await?;
            tokio::fs::write(dir.join(file), out.stdout).await?;
        }

        ui::print_success(&format!("LVM configuration backed up to {}", dir.display()));
        Ok(())
    }

    async fn check_reservation(&self) -> Result<()> {
        let name = &self.session.config().reservation_name;
        let lvm = self.lvm();
        if !lvm.lv_exists(name).await? {
            info!(lv = %name, "No reservation volume present");
            ui::print_success(&format!("No {name} volume present"));
            return Ok(());
        }

        ui::print_warning(&format!(
            "Reservation volume {}/{name} holds the group's free extents. \
             It must be removed before repair and is recreated at the end.",
            self.session.target()
        ));
        self.require(&format!("Remove {}/{name}?", self.session.target()), true)?;
        lvm.remove_lv(name).await
    }

    async fn repair(&self) -> Result<()> {
        let engine = self.engine();
        let repaired = self.session.repaired_blob();

        let size = engine.repair().await?;
        if !engine.verify(&repaired).await? {
            return Err(RecoveryError::RepairedMetadataInvalid.into());
        }
        ui::print_success(&format!("Repaired metadata verified ({size} bytes)"));

        match engine.extract_transaction_id(&repaired).await? {
            Some(id) => {
                let path = self.session.transaction_file();
                tokio::fs::write(&path, format!("{id}\n"))
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                ui::print_kv("Repaired transaction id", &id.to_string());
            }
            None => {
                ui::print_warning("Repaired metadata has no readable transaction id");
            }
        }
        Ok(())
    }

    async fn capture_table(&self) -> Result<()> {
        let map = DeviceRemapper::new(self.runner.as_ref(), &self.session)
            .capture_segment_map()
            .await?;

        let repaired = self.session.repaired_blob();
        let blob_len = tokio::fs::metadata(&repaired)
            .await
            .with_context(|| format!("Repaired metadata missing: {}", repaired.display()))?
            .len();
        if map.size_bytes() != blob_len {
            return Err(RecoveryError::SegmentTable(format!(
                "table covers {} bytes but repaired metadata is {blob_len} bytes",
                map.size_bytes()
            ))
            .into());
        }

        ui::print_success(&format!(
            "Metadata device table captured ({} segment(s))",
            map.segments().len()
        ));
        Ok(())
    }

    fn require_write_confirmation(&self) -> Result<()> {
        let config = self.session.config();
        ui::print_warning(&format!(
            "About to overwrite the on-disk metadata of {}/{}. \
             The original copy is kept in {}.",
            self.session.target(),
            config.metadata_lv(),
            self.session.original_blob().display()
        ));
        self.require("Write the repaired metadata now?", false)
    }

    async fn write_metadata(&self) -> Result<()> {
        let config = self.session.config();
        let table_file = self.session.table_file();
        let map = DeviceSegmentMap::load(&table_file)?;
        let name = config.recovery_dm_name(self.session.target());

        let device =
            MappedDevice::create(Arc::clone(&self.runner), config, &name, &table_file).await?;
        let engine = self.engine();

        let written = match engine.write_to_device(device.path()).await {
            Ok(written) => written,
            Err(e) => {
                if let Err(release) = device.release().await {
                    error!(error = %release, "Failed to remove mapping after write failure");
                }
                return Err(e);
            }
        };
        if written != map.size_bytes() {
            device.release().await?;
            return Err(RecoveryError::WriteFailed(format!(
                "wrote {written} bytes, device is {} bytes",
                map.size_bytes()
            ))
            .into());
        }
        info!(bytes = written, "Repaired metadata written");

        match engine.verify(device.path()).await {
            Ok(true) => ui::print_success("Written metadata passes thin_check"),
            Ok(false) => ui::print_warning(
                "Written metadata failed thin_check on the device; continuing, \
                 activation will report the final pool state",
            ),
            Err(e) => {
                warn!(error = %e, "Post-write verification could not run");
                ui::print_warning("Post-write verification could not run");
            }
        }

        device.release().await
    }

    async fn reconcile(&self) -> Result<()> {
        let path = self.session.transaction_file();
        let repaired = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text.trim().parse::<u64>().ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };

        let lvm = self.lvm();
        let reconciler = TransactionReconciler::new(
            &lvm,
            self.confirmer.as_ref(),
            self.session.target(),
            &self.session.config().pool_name,
            self.backup_dir()?.to_path_buf(),
        );
        match reconciler.reconcile(repaired).await? {
            Reconciliation::Fixed { from, to } => {
                ui::print_success(&format!("Transaction id updated from {from} to {to}"));
            }
            Reconciliation::AlreadyMatching(_) | Reconciliation::Skipped => {}
        }
        Ok(())
    }

    async fn activate(&self) -> Result<()> {
        let lvm = self.lvm();
        lvm.activate_vg()
            .await
            .context("Failed to activate volume group")?;

        match lvm.pool_health().await? {
            PoolHealth::Healthy { transaction_id } => {
                ui::print_success(&format!(
                    "Thin pool is healthy (transaction id {transaction_id})"
                ));
            }
            PoolHealth::Degraded(reason) => {
                return Err(RecoveryError::PoolUnhealthy(reason).into());
            }
            PoolHealth::Failed => {
                return Err(
                    RecoveryError::PoolUnhealthy("pool device failed or missing".into()).into(),
                );
            }
        }

        if let Err(e) = lvm.set_monitoring(true).await {
            warn!(error = %e, "Failed to re-enable LVM monitoring");
            ui::print_warning(&format!(
                "Could not re-enable LVM monitoring; run: vgchange --monitor y {}",
                self.session.target()
            ));
        }
        Ok(())
    }

    async fn recreate_reservation(&self) -> Result<()> {
        let name = &self.session.config().reservation_name;
        let lvm = self.lvm();

        let free = lvm.vg_free_bytes().await?;
        if free == 0 {
            info!("No free extents, reservation volume not recreated");
            ui::print_info(&format!("No free space left in the group; {name} not recreated"));
            return Ok(());
        }
        if lvm.lv_exists(name).await? {
            ui::print_info(&format!("{name} already exists"));
            return Ok(());
        }

        lvm.create_reservation(name).await?;
        ui::print_success(&format!("{name} recreated ({free} bytes)"));
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        self.session.tracker().clear()?;

        ui::print_section("Recovery complete");
        if let Some(dir) = self.session.backup_dir() {
            ui::print_kv("Backups", &dir.display().to_string());
        }

        let scratch = self.session.scratch_dir();
        let prompt = format!("Remove scratch copies in {}?", scratch.display());
        if self.confirmer.confirm(&prompt, false)? {
            tokio::fs::remove_dir_all(scratch)
                .await
                .with_context(|| format!("Failed to remove {}", scratch.display()))?;
            ui::print_success("Scratch copies removed");
        } else {
            ui::print_info(&format!("Scratch copies kept in {}", scratch.display()));
        }
        Ok(())
    }

    fn report_failure(&self, err: &anyhow::Error) {
        error!(state = ?self.session.state(), error = %format!("{err:#}"), "Recovery failed");

        let Some(state) = self.session.state() else {
            ui::print_error(&format!("{err:#}"));
            return;
        };

        ui::print_error(&format!("Recovery failed after '{state}': {err:#}"));
        ui::print_kv("State left at", state.label());
        ui::print_kv("State file", &self.session.tracker().path().display().to_string());
        ui::print_kv("Scratch", &self.session.scratch_dir().display().to_string());

        if state == StepState::WritingMetadata {
            let name = self
                .session
                .config()
                .recovery_dm_name(self.session.target());
            let mapping = format!("Temporary mapping: {name}");
            let remove = format!("If it is still present, run: dmsetup remove {name}");
            ui::print_critical(&[
                "The metadata write did not complete.",
                mapping.as_str(),
                remove.as_str(),
                "State remains writing_metadata; re-run to retry the write.",
            ]);
        }

        ui::print_info(&format!(
            "Re-run px-thin-recovery {} to resume",
            self.session.target()
        ));
    }
}

/// Run to completion unless `shutdown` resolves first; returns the exit status.
///
/// Dropping the run future kills child processes and removes any temporary
/// mapping. Failures were already reported by [`Orchestrator::run`].
pub async fn run_until_signal<F>(orchestrator: &mut Orchestrator, shutdown: F) -> u8
where
    F: Future<Output = ()>,
{
    let finished = tokio::select! {
        result = orchestrator.run() => Some(result),
        () = shutdown => None,
    };

    match finished {
        Some(Ok(Outcome::AlreadyHealthy | Outcome::Completed)) => EXIT_SUCCESS,
        Some(Err(_)) => EXIT_FAILURE,
        None => {
            let session = orchestrator.session();
            report_interruption(session.tracker(), session.scratch_dir());
            EXIT_INTERRUPTED
        }
    }
}

/// Report after SIGINT/SIGTERM. Nothing is rolled back.
fn report_interruption(tracker: &StateTracker, scratch_dir: &Path) {
    warn!("Interrupted by signal");
    ui::print_error("Interrupted");

    match tracker.read_previous_state() {
        Ok(Some(state)) => {
            let band = ResumeBand::classify(state);
            ui::print_kv("Last state", state.label());
            if band == ResumeBand::DuringWrite {
                ui::print_critical(&[band.explanation()]);
            } else {
                ui::print_info(band.explanation());
            }
        }
        Ok(None) => ui::print_info("No recovery step had started; nothing was changed"),
        Err(e) => ui::print_warning(&format!("Could not read state file: {e:#}")),
    }

    ui::print_kv("Scratch (preserved)", &scratch_dir.display().to_string());
}
