use std::path::PathBuf;

use anyhow::{Context, Result};
use colored::Colorize;
use sysinfo::System;
use tracing::{debug, info, warn};

use crate::config::{RecoveryConfig, REQUIRED_TOOLS};
use crate::error::RecoveryError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::lvm::{Lvm, PoolHealth};
use crate::prompt::Confirmer;
use crate::ui;

/// Facts about the host the validator needs, behind a seam for tests.
pub trait HostProbe: Send + Sync {
    /// `comm` of PID 1.
    fn init_process_name(&self) -> Option<String>;
    /// Memory available for new allocations (tmpfs included), in bytes.
    fn available_memory_bytes(&self) -> u64;
    /// Running inside tmux or screen.
    fn in_detachable_terminal(&self) -> bool;
    /// Resolve a tool on `PATH`.
    fn resolve_tool(&self, name: &str) -> Option<PathBuf>;
}

/// Probes the real host.
#[derive(Debug, Default)]
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn init_process_name(&self) -> Option<String> {
        std::fs::read_to_string("/proc/1/comm")
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn available_memory_bytes(&self) -> u64 {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.available_memory()
    }

    fn in_detachable_terminal(&self) -> bool {
        std::env::var_os("TMUX").is_some() || std::env::var_os("STY").is_some()
    }

    fn resolve_tool(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }
}

/// Gate in front of every destructive step.
///
/// Hard checks return an error; soft checks state the risk and ask the
/// operator, failing only if the operator declines.
pub struct EnvironmentValidator<'a> {
    runner: &'a dyn CommandRunner,
    probe: &'a dyn HostProbe,
    confirmer: &'a dyn Confirmer,
    config: &'a RecoveryConfig,
    vg: &'a str,
}

impl<'a> EnvironmentValidator<'a> {
    #[must_use]
    pub fn new(
        runner: &'a dyn CommandRunner,
        probe: &'a dyn HostProbe,
        confirmer: &'a dyn Confirmer,
        config: &'a RecoveryConfig,
        vg: &'a str,
    ) -> Self {
        Self {
            runner,
            probe,
            confirmer,
            config,
            vg,
        }
    }

    fn lvm(&self) -> Lvm<'a> {
        Lvm::new(self.runner, self.config, self.vg)
    }

    /// Every required tool resolves.
    pub fn check_tools(&self) -> Result<()> {
        let mut missing = Vec::new();
        for tool in REQUIRED_TOOLS {
            match self.probe.resolve_tool(tool) {
                Some(path) => {
                    debug!(tool, path = %path.display(), "Tool found");
                    ui::print_check_result(tool, true, None);
                }
                None => {
                    ui::print_check_result(tool, false, Some("not found on PATH"));
                    missing.push((*tool).to_string());
                }
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(RecoveryError::ToolsMissing(missing).into())
        }
    }

    /// PID 1 identifies the Portworx container.
    pub fn check_context(&self) -> Result<()> {
        let found = self.probe.init_process_name().unwrap_or_default();
        if self.config.container_init_names.iter().any(|n| *n == found) {
            ui::print_check_result("Portworx container", true, Some(&found));
            return Ok(());
        }

        ui::print_check_result("Portworx container", false, Some(&found));
        Err(RecoveryError::UnsupportedContext {
            found,
            expected: self.config.container_init_names.join(", "),
        }
        .into())
    }

    pub async fn check_group_exists(&self) -> Result<()> {
        if self.lvm().vg_exists().await? {
            ui::print_check_result(&format!("Volume group {}", self.vg), true, None);
            Ok(())
        } else {
            ui::print_check_result(&format!("Volume group {}", self.vg), false, None);
            Err(RecoveryError::GroupNotFound(self.vg.to_string()).into())
        }
    }

    /// Idempotency gate: bounded activation followed by a pool health check.
    ///
    /// Any failure here means "not healthy", never an error.
    pub async fn is_already_healthy(&self) -> Result<bool> {
        let lvm = self.lvm();
        if let Err(e) = lvm.activate_vg().await {
            info!(error = %e, "Activation attempt failed, pool needs recovery");
            return Ok(false);
        }

        match lvm.pool_health().await? {
            PoolHealth::Healthy { transaction_id } => {
                info!(transaction_id, "Thin pool is healthy");
                Ok(true)
            }
            PoolHealth::Degraded(reason) => {
                info!(%reason, "Thin pool is degraded");
                Ok(false)
            }
            PoolHealth::Failed => {
                info!("Thin pool is failed or absent");
                Ok(false)
            }
        }
    }

    /// Portworx should be in maintenance mode.
    pub async fn check_maintenance(&self) -> Result<()> {
        let out = self
            .runner
            .output(&CommandSpec::new("pxctl").arg("status"))
            .await?;
        let combined = format!("{}{}", out.stdout, out.stderr).to_lowercase();
        if combined.contains("maintenance mode") {
            ui::print_check_result("Portworx maintenance mode", true, None);
            return Ok(());
        }

        ui::print_check_result("Portworx maintenance mode", false, None);
        self.soft_gate(
            "Portworx is not in maintenance mode. It may still be using this pool, \
             and recovering underneath it can cause data loss. \
             Enter maintenance mode with: pxctl service maintenance --enter",
            "Continue without maintenance mode?",
        )
    }

    /// The run should survive a dropped SSH session.
    pub fn check_terminal(&self) -> Result<()> {
        if self.probe.in_detachable_terminal() {
            ui::print_check_result("Detachable terminal (tmux/screen)", true, None);
            return Ok(());
        }

        ui::print_check_result("Detachable terminal (tmux/screen)", false, None);
        self.soft_gate(
            "Not running inside tmux or screen. thin_repair can run for hours; \
             losing the terminal mid-run interrupts the recovery.",
            "Continue without a detachable terminal?",
        )
    }

    /// tmpfs holds two copies of the metadata; require headroom.
    pub async fn check_memory(&self) -> Result<()> {
        let metadata_size = self
            .lvm()
            .lv_size_bytes(&self.config.metadata_lv())
            .await
            .context("Failed to read metadata volume size")?;
        let required = metadata_size.saturating_mul(self.config.memory_safety_factor);
        let available = self.probe.available_memory_bytes();

        let detail = format!(
            "{} MiB available, {} MiB required",
            available / 1024 / 1024,
            required / 1024 / 1024
        );
        if available >= required {
            ui::print_check_result("Free memory", true, Some(&detail));
            return Ok(());
        }

        ui::print_check_result("Free memory", false, Some(&detail));
        self.soft_gate(
            &format!(
                "Free memory is below {}x the metadata size ({detail}). \
                 Copying metadata to tmpfs may exhaust memory.",
                self.config.memory_safety_factor
            ),
            "Continue with low memory?",
        )
    }

    /// Create `<backup_root>/<vg>-<timestamp>`.
    pub fn create_backup_dir(&self) -> Result<PathBuf> {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let dir = self.config.backup_root.join(format!("{}-{stamp}", self.vg));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create backup directory {}", dir.display()))?;
        info!(path = %dir.display(), "Backup directory created");
        Ok(dir)
    }

    fn soft_gate(&self, risk: &str, prompt: &str) -> Result<()> {
        ui::print_warning(risk);
        if self.confirmer.confirm(prompt, false)? {
            warn!(risk, "Operator accepted risk");
            Ok(())
        } else {
            println!("{}", "Recovery cancelled.".yellow());
            Err(RecoveryError::OperatorDeclined(prompt.to_string()).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandError, CommandOutput};
    use crate::prompt::{AutoConfirmer, MockConfirmer};
    use async_trait::async_trait;
    use serial_test::serial;

    struct Probe {
        init: Option<String>,
        tools: Vec<&'static str>,
    }

    impl HostProbe for Probe {
        fn init_process_name(&self) -> Option<String> {
            self.init.clone()
        }
        fn available_memory_bytes(&self) -> u64 {
            0
        }
        fn in_detachable_terminal(&self) -> bool {
            true
        }
        fn resolve_tool(&self, name: &str) -> Option<PathBuf> {
            self.tools
                .iter()
                .any(|tool| *tool == name)
                .then(|| PathBuf::from("/usr/sbin").join(name))
        }
    }

    struct NoCommands;

    #[async_trait]
    impl CommandRunner for NoCommands {
        async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
            panic!("unexpected command {spec}")
        }
        fn output_blocking(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
            panic!("unexpected command {spec}")
        }
    }

    #[test]
    fn test_missing_tools_are_all_reported() {
        let probe = Probe {
            init: Some("px-ns".into()),
            tools: vec!["lvm", "dmsetup", "thin_check", "pxctl"],
        };
        let config = RecoveryConfig::default();
        let validator =
            EnvironmentValidator::new(&NoCommands, &probe, &AutoConfirmer, &config, "pwx0");

        let err = validator.check_tools().unwrap_err();
        match err.downcast_ref::<RecoveryError>() {
            Some(RecoveryError::ToolsMissing(missing)) => {
                assert_eq!(missing, &vec!["thin_repair".to_string(), "thin_dump".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_context_requires_container_init() {
        let config = RecoveryConfig::default();
        let inside = Probe {
            init: Some("px-oci-mon".into()),
            tools: vec![],
        };
        let validator =
            EnvironmentValidator::new(&NoCommands, &inside, &AutoConfirmer, &config, "pwx0");
        assert!(validator.check_context().is_ok());

        let host = Probe {
            init: Some("systemd".into()),
            tools: vec![],
        };
        let validator =
            EnvironmentValidator::new(&NoCommands, &host, &AutoConfirmer, &config, "pwx0");
        let err = validator.check_context().unwrap_err();
        assert!(err.to_string().contains("PID 1 is 'systemd'"));
    }

    #[test]
    fn test_soft_gate_respects_decline() {
        let config = RecoveryConfig::default();
        let probe = Probe {
            init: None,
            tools: vec![],
        };
        let mut decline = MockConfirmer::new();
        decline
            .expect_confirm()
            .withf(|prompt, default| prompt == "Continue?" && !default)
            .times(1)
            .returning(|_, _| Ok(false));
        let validator = EnvironmentValidator::new(&NoCommands, &probe, &decline, &config, "pwx0");
        let err = validator.soft_gate("risky", "Continue?").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecoveryError>(),
            Some(RecoveryError::OperatorDeclined(_))
        ));

        let validator =
            EnvironmentValidator::new(&NoCommands, &probe, &AutoConfirmer, &config, "pwx0");
        assert!(validator.soft_gate("risky", "Continue?").is_ok());
    }

    #[test]
    fn test_backup_dir_is_timestamped_per_group() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = RecoveryConfig {
            backup_root: dir.path().to_path_buf(),
            ..RecoveryConfig::default()
        };
        let probe = Probe {
            init: None,
            tools: vec![],
        };
        let validator =
            EnvironmentValidator::new(&NoCommands, &probe, &AutoConfirmer, &config, "pwx0");
        let backup = validator.create_backup_dir().unwrap();
        assert!(backup.is_dir());
        let name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("pwx0-"));
        assert_eq!(name.len(), "pwx0-".len() + "YYYYmmdd-HHMMSS".len());
    }

    #[test]
    #[serial]
    fn test_system_probe_detects_tmux_and_screen() {
        // SAFETY: This test runs serially via #[serial] to avoid env var races
        unsafe {
            std::env::remove_var("TMUX");
            std::env::remove_var("STY");
        }
        assert!(!SystemProbe.in_detachable_terminal());

        unsafe {
            std::env::set_var("STY", "4242.pts-0.node");
        }
        assert!(SystemProbe.in_detachable_terminal());

        unsafe {
            std::env::remove_var("STY");
            std::env::set_var("TMUX", "/tmp/tmux-0/default,1234,0");
        }
        assert!(SystemProbe.in_detachable_terminal());

        unsafe {
            std::env::remove_var("TMUX");
        }
    }
}
