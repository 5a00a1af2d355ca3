//! Operator confirmation gates.

use anyhow::{Context, Result};
use dialoguer::{theme::ColorfulTheme, Confirm};
use tracing::info;

/// Decides whether a risky step may proceed.
#[cfg_attr(test, mockall::automock)]
pub trait Confirmer: Send + Sync {
    /// Ask the operator `prompt`; `default` is what pressing enter means.
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool>;
}

/// Asks on the terminal.
#[derive(Debug, Default)]
pub struct InteractiveConfirmer;

impl Confirmer for InteractiveConfirmer {
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(default)
            .interact()
            .context("Failed to read confirmation from terminal")
    }
}

/// Accepts every prompt (`--yes`).
#[derive(Debug, Default)]
pub struct AutoConfirmer;

impl Confirmer for AutoConfirmer {
    fn confirm(&self, prompt: &str, _default: bool) -> Result<bool> {
        info!(prompt, "Auto-accepting confirmation (--yes)");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_confirmer_accepts_everything() {
        let confirmer = AutoConfirmer;
        assert!(confirmer.confirm("Write metadata?", false).unwrap());
        assert!(confirmer.confirm("Continue?", true).unwrap());
    }
}
