//! Metadata repair engine.
//!
//! Works on byte-exact copies in tmpfs: the original is read once and never
//! modified, the repaired copy must pass `thin_check` and keep the original
//! size before anything is written back.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

use crate::error::RecoveryError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::lvm::Lvm;
use crate::session::RecoverySession;

/// `transaction="N"` inside the first `<superblock ...>` element of a thin_dump.
static SUPERBLOCK_TRANSACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<superblock\b[^>]*?\btransaction="(\d+)""#).expect("valid regex")
});

const COPY_BUFFER: usize = 1 << 20;

/// Extract the transaction id from `thin_dump` output.
#[must_use]
pub fn parse_transaction_id(dump: &str) -> Option<u64> {
    SUPERBLOCK_TRANSACTION
        .captures(dump)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Stream `src` into `dst` and fsync. `dst` must already exist when
/// `create` is false (block devices).
pub async fn copy_blocks(src: &Path, dst: &Path, create: bool) -> std::io::Result<u64> {
    let input = File::open(src).await?;
    let output = OpenOptions::new()
        .write(true)
        .create(create)
        .truncate(create)
        .open(dst)
        .await?;

    let mut reader = BufReader::with_capacity(COPY_BUFFER, input);
    let mut writer = BufWriter::with_capacity(COPY_BUFFER, output);
    let copied = tokio::io::copy_buf(&mut reader, &mut writer).await?;
    writer.flush().await?;
    writer.get_mut().sync_all().await?;
    Ok(copied)
}

/// Repair operations for one session.
pub struct RepairEngine<'a> {
    runner: &'a dyn CommandRunner,
    session: &'a RecoverySession,
}

impl<'a> RepairEngine<'a> {
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, session: &'a RecoverySession) -> Self {
        Self { runner, session }
    }

    fn lvm(&self) -> Lvm<'a> {
        Lvm::new(self.runner, self.session.config(), self.session.target())
    }

    /// Copy the metadata volume into scratch storage.
    ///
    /// Returns the number of bytes copied. A failed or empty copy is fatal:
    /// a partial read must never be fed to the repair tool.
    pub async fn snapshot_to_scratch(&self) -> Result<u64> {
        let config = self.session.config();
        let metadata_lv = config.metadata_lv();
        let source = config.metadata_device(self.session.target());
        let dest = self.session.original_blob();

        tokio::fs::create_dir_all(self.session.scratch_dir())
            .await
            .with_context(|| {
                format!(
                    "Failed to create scratch directory {}",
                    self.session.scratch_dir().display()
                )
            })?;

        let lvm = self.lvm();
        lvm.activate_lv(&metadata_lv)
            .await
            .context("Failed to activate metadata volume for reading")?;

        info!(source = %source.display(), dest = %dest.display(), "Copying original metadata");
        let copied = copy_blocks(&source, &dest, true).await;
        let deactivated = lvm.deactivate_lv(&metadata_lv).await;

        let copied = match (copied, deactivated) {
            (Ok(bytes), Ok(())) => bytes,
            (Ok(_), Err(e)) => {
                return Err(e.context("Failed to deactivate metadata volume after copy"));
            }
            (Err(copy), Ok(())) => return Err(RecoveryError::MetadataCopy(copy.to_string()).into()),
            (Err(copy), Err(deactivate)) => {
                warn!(
                    error = %format!("{deactivate:#}"),
                    "Metadata volume left active after failed copy"
                );
                return Err(RecoveryError::MetadataCopy(format!(
                    "{copy}; deactivating {metadata_lv} also failed: {deactivate:#}"
                ))
                .into());
            }
        };
        if copied == 0 {
            return Err(RecoveryError::MetadataCopy(format!(
                "{} returned no data",
                source.display()
            ))
            .into());
        }

        info!(bytes = copied, "Original metadata copied");
        Ok(copied)
    }

    /// Run `thin_repair` from the original copy into a same-sized file.
    ///
    /// No timeout: repair of a large pool legitimately takes hours.
    pub async fn repair(&self) -> Result<u64> {
        let original = self.session.original_blob();
        let repaired = self.session.repaired_blob();

        let original_len = tokio::fs::metadata(&original)
            .await
            .with_context(|| format!("Original metadata copy missing: {}", original.display()))?
            .len();

        let target = File::create(&repaired)
            .await
            .with_context(|| format!("Failed to create {}", repaired.display()))?;
        target
            .set_len(original_len)
            .await
            .context("Failed to size repaired metadata file")?;
        drop(target);

        info!("Running thin_repair (this can take a long time on large pools)");
        let spec = CommandSpec::new("thin_repair").args([
            "-i".to_string(),
            original.to_string_lossy().into_owned(),
            "-o".to_string(),
            repaired.to_string_lossy().into_owned(),
        ]);
        let out = self.runner.output(&spec).await?;
        if !out.success() {
            return Err(RecoveryError::RepairFailed(out.stderr.trim().to_string()).into());
        }

        let repaired_len = tokio::fs::metadata(&repaired).await?.len();
        if repaired_len != original_len {
            return Err(RecoveryError::SizeMismatch {
                original: original_len,
                repaired: repaired_len,
            }
            .into());
        }
        Ok(repaired_len)
    }

    /// `thin_check` a blob or device; `true` when it passes.
    pub async fn verify(&self, blob: &Path) -> Result<bool> {
        let out = self
            .runner
            .output(&CommandSpec::new("thin_check").arg(blob.to_string_lossy()))
            .await?;
        if !out.success() {
            warn!(path = %blob.display(), stderr = %out.stderr.trim(), "thin_check failed");
        }
        Ok(out.success())
    }

    /// Transaction id recorded in a metadata blob's superblock.
    pub async fn extract_transaction_id(&self, blob: &Path) -> Result<Option<u64>> {
        let out = self
            .runner
            .output(
                &CommandSpec::new("thin_dump")
                    .arg("--skip-mappings")
                    .arg(blob.to_string_lossy()),
            )
            .await?;
        if !out.success() {
            warn!(path = %blob.display(), stderr = %out.stderr.trim(), "thin_dump failed");
            return Ok(None);
        }

        let id = parse_transaction_id(&out.stdout);
        match id {
            Some(id) => debug!(transaction_id = id, "Parsed superblock transaction id"),
            None => warn!(path = %blob.display(), "No transaction id in thin_dump output"),
        }
        Ok(id)
    }

    /// Write the repaired blob onto `device`; returns bytes written.
    pub async fn write_to_device(&self, device: &Path) -> Result<u64> {
        let repaired = self.session.repaired_blob();
        info!(device = %device.display(), "Writing repaired metadata");
        copy_blocks(&repaired, device, false)
            .await
            .map_err(|e| RecoveryError::WriteFailed(e.to_string()).into())
    }
}
