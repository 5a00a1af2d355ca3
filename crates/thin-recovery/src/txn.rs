//! Transaction id reconciliation.
//!
//! LVM mirrors the pool's metadata transaction id in the VG configuration
//! (`transaction_id` in the pool LV's segment). After repair the two can
//! disagree and activation then refuses the pool. The fix is to rewrite the
//! configuration record and restore it with `vgcfgrestore --force`.

use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use similar::TextDiff;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::RecoveryError;
use crate::lvm::Lvm;
use crate::prompt::Confirmer;
use crate::ui;

static SECTION_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Za-z0-9_.+\-]+)\s*\{\s*$").expect("valid regex"));
static SECTION_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\}\s*$").expect("valid regex"));
static TRANSACTION_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*transaction_id\s*=\s*)(\d+)(.*)$").expect("valid regex"));

/// Errors reading the pool's transaction id out of a VG config record.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VgConfigError {
    #[error("logical volume '{0}' not found in configuration record")]
    PoolNotFound(String),

    #[error("no transaction_id recorded for '{0}'")]
    TransactionIdMissing(String),

    #[error("more than one transaction_id recorded for '{0}'")]
    AmbiguousTransactionId(String),
}

/// Text of a `vgcfgbackup` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VgConfigRecord {
    text: String,
}

struct TransactionField {
    line: usize,
    value: u64,
}

impl VgConfigRecord {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Transaction id recorded for thin pool `pool`.
    pub fn pool_transaction_id(&self, pool: &str) -> Result<u64, VgConfigError> {
        self.locate(pool).map(|field| field.value)
    }

    /// Copy of this record with the pool's transaction id replaced. Every
    /// other byte is preserved.
    pub fn with_transaction_id(&self, pool: &str, id: u64) -> Result<Self, VgConfigError> {
        let field = self.locate(pool)?;
        let text = self
            .text
            .split_inclusive('\n')
            .enumerate()
            .map(|(idx, raw)| {
                if idx != field.line {
                    return raw.to_string();
                }
                let (body, newline) = match raw.strip_suffix('\n') {
                    Some(body) => (body, "\n"),
                    None => (raw, ""),
                };
                let replaced = TRANSACTION_LINE.replace(body, |caps: &regex::Captures<'_>| {
                    format!("{}{id}{}", &caps[1], &caps[3])
                });
                format!("{replaced}{newline}")
            })
            .collect();
        Ok(Self { text })
    }

    fn locate(&self, pool: &str) -> Result<TransactionField, VgConfigError> {
        let mut stack: Vec<String> = Vec::new();
        let mut pool_seen = false;
        let mut found: Option<TransactionField> = None;

        for (idx, raw) in self.text.split_inclusive('\n').enumerate() {
            let line = raw.trim_end_matches('\n');
            if let Some(caps) = SECTION_OPEN.captures(line) {
                stack.push(caps[1].to_string());
                continue;
            }
            if SECTION_CLOSE.is_match(line) {
                stack.pop();
                continue;
            }

            let in_pool = stack
                .windows(2)
                .any(|w| w[0] == "logical_volumes" && w[1] == pool);
            if !in_pool {
                continue;
            }
            pool_seen = true;

            if let Some(caps) = TRANSACTION_LINE.captures(line) {
                if found.is_some() {
                    return Err(VgConfigError::AmbiguousTransactionId(pool.to_string()));
                }
                let value = caps[2]
                    .parse()
                    .map_err(|_| VgConfigError::TransactionIdMissing(pool.to_string()))?;
                found = Some(TransactionField { line: idx, value });
            }
        }

        match found {
            Some(field) => Ok(field),
            None if pool_seen => Err(VgConfigError::TransactionIdMissing(pool.to_string())),
            None => Err(VgConfigError::PoolNotFound(pool.to_string())),
        }
    }
}

/// Unified diff between two records.
#[must_use]
pub fn render_diff(current: &VgConfigRecord, proposed: &VgConfigRecord, name: &str) -> String {
    TextDiff::from_lines(current.as_str(), proposed.as_str())
        .unified_diff()
        .context_radius(3)
        .header(&format!("{name} (current)"), &format!("{name} (proposed)"))
        .to_string()
}

/// What reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Repaired metadata carried no readable transaction id.
    Skipped,
    /// Ids already matched; nothing written.
    AlreadyMatching(u64),
    /// Configuration rewritten and restored.
    Fixed { from: u64, to: u64 },
}

/// Aligns the VG configuration with the repaired metadata.
pub struct TransactionReconciler<'a> {
    lvm: &'a Lvm<'a>,
    confirmer: &'a dyn Confirmer,
    pool: &'a str,
    vg: &'a str,
    backup_dir: PathBuf,
}

impl<'a> TransactionReconciler<'a> {
    #[must_use]
    pub fn new(
        lvm: &'a Lvm<'a>,
        confirmer: &'a dyn Confirmer,
        vg: &'a str,
        pool: &'a str,
        backup_dir: PathBuf,
    ) -> Self {
        Self {
            lvm,
            confirmer,
            pool,
            vg,
            backup_dir,
        }
    }

    pub async fn reconcile(&self, repaired: Option<u64>) -> Result<Reconciliation> {
        let Some(repaired) = repaired else {
            warn!("Repaired transaction id unknown, skipping reconciliation");
            ui::print_warning(
                "Could not read the transaction id from the repaired metadata; \
                 skipping transaction id reconciliation",
            );
            return Ok(Reconciliation::Skipped);
        };

        let current_path = self.backup_dir.join(format!("{}-current.vg", self.vg));
        self.lvm
            .backup_config(&current_path)
            .await
            .context("Failed to back up LVM configuration before reconciliation")?;
        let current = VgConfigRecord::new(
            tokio::fs::read_to_string(&current_path)
                .await
                .with_context(|| format!("Failed to read {}", current_path.display()))?,
        );
        let recorded = current.pool_transaction_id(self.pool)?;

        if recorded == repaired {
            info!(transaction_id = recorded, "Transaction ids match");
            ui::print_success(&format!("Transaction ids match ({recorded})"));
            return Ok(Reconciliation::AlreadyMatching(recorded));
        }

        warn!(lvm = recorded, metadata = repaired, "Transaction id mismatch");
        ui::print_warning(&format!(
            "LVM expects transaction id {recorded}, repaired metadata has {repaired}"
        ));

        let proposed = current.with_transaction_id(self.pool, repaired)?;
        let proposed_path = self.backup_dir.join(format!("{}-txn-fixed.vg", self.vg));
        tokio::fs::write(&proposed_path, proposed.as_str())
            .await
            .with_context(|| format!("Failed to write {}", proposed_path.display()))?;

        ui::print_diff(&render_diff(&current, &proposed, self.vg));
        ui::print_info(&format!(
            "Current record backed up to {}",
            current_path.display()
        ));

        let accepted = self.confirmer.confirm(
            &format!("Apply transaction id {repaired} to the LVM configuration of {}?", self.vg),
            false,
        )?;
        if !accepted {
            return Err(RecoveryError::TransactionMismatchDeclined {
                current: recorded,
                repaired,
            }
            .into());
        }

        self.lvm.restore_config(&proposed_path).await?;
        info!(from = recorded, to = repaired, "Transaction id updated");
        Ok(Reconciliation::Fixed {
            from: recorded,
            to: repaired,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &str = r#"# Generated by LVM2 version 2.03.11(2) (2021-01-08): Mon Oct 19 10:00:00 2026

contents = "Text Format Volume Group"
version = 1

pwx0 {
	id = "abc"
	seqno = 42

	physical_volumes {

		pv0 {
			id = "def"
			device = "/dev/sdb"
		}
	}

	logical_volumes {

		pxpool {
			id = "ghi"
			segment_count = 1

			segment1 {
				start_extent = 0
				extent_count = 2560
				type = "thin-pool"
				metadata = "pxpool_tmeta"
				pool = "pxpool_tdata"
				transaction_id = 17
				chunk_size = 128
			}
		}

		pxreserve {
			id = "jkl"
			segment_count = 1

			segment1 {
				start_extent = 0
				extent_count = 10
				type = "striped"
			}
		}
	}
}
"#;

    #[test]
    fn test_reads_pool_transaction_id() {
        let record = VgConfigRecord::new(RECORD);
        assert_eq!(record.pool_transaction_id("pxpool"), Ok(17));
    }

    #[test]
    fn test_missing_pool_and_missing_field() {
        let record = VgConfigRecord::new(RECORD);
        assert_eq!(
            record.pool_transaction_id("tank"),
            Err(VgConfigError::PoolNotFound("tank".into()))
        );
        assert_eq!(
            record.pool_transaction_id("pxreserve"),
            Err(VgConfigError::TransactionIdMissing("pxreserve".into()))
        );
    }

    #[test]
    fn test_rewrite_changes_only_the_transaction_line() {
        let record = VgConfigRecord::new(RECORD);
        let fixed = record.with_transaction_id("pxpool", 23).unwrap();

        assert_eq!(fixed.pool_transaction_id("pxpool"), Ok(23));
        let changed: Vec<(&str, &str)> = record
            .as_str()
            .lines()
            .zip(fixed.as_str().lines())
            .filter(|(a, b)| a != b)
            .collect();
        assert_eq!(
            changed,
            vec![("\t\t\t\ttransaction_id = 17", "\t\t\t\ttransaction_id = 23")]
        );
        assert_eq!(record.as_str().len(), fixed.as_str().len());
    }

    #[test]
    fn test_rewrite_with_same_id_is_byte_identical() {
        let record = VgConfigRecord::new(RECORD);
        assert_eq!(record.with_transaction_id("pxpool", 17).unwrap(), record);
    }

    #[test]
    fn test_diff_shows_both_values() {
        let record = VgConfigRecord::new(RECORD);
        let fixed = record.with_transaction_id("pxpool", 23).unwrap();
        let diff = render_diff(&record, &fixed, "pwx0");
        assert!(diff.contains("-\t\t\t\ttransaction_id = 17"));
        assert!(diff.contains("+\t\t\t\ttransaction_id = 23"));
    }
}
