//! Crash-safe recovery of corrupted LVM thin-pool metadata on Portworx nodes.
//!
//! The runbook copies the pool's metadata volume to tmpfs, repairs it with
//! `thin_repair`, writes it back through a temporary device-mapper mapping,
//! reconciles LVM's transaction id and reactivates the pool. Every step is
//! persisted so an interrupted run can be classified and resumed.

pub mod config;
pub mod error;
pub mod exec;
pub mod lvm;
pub mod orchestrator;
pub mod prompt;
pub mod remap;
pub mod repair;
pub mod session;
pub mod state;
pub mod txn;
pub mod ui;
pub mod validator;

pub use config::RecoveryConfig;
pub use error::RecoveryError;
pub use exec::{CommandError, CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use orchestrator::{run_until_signal, Orchestrator, Outcome, RunOptions};
pub use prompt::{AutoConfirmer, Confirmer, InteractiveConfirmer};
pub use session::RecoverySession;
pub use state::{ResumeBand, StateTracker, StepState};
pub use validator::{HostProbe, SystemProbe};
