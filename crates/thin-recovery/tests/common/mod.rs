//! Shared fixtures for recovery scenarios.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use thin_recovery::validator::HostProbe;
use thin_recovery::{
    CommandError, CommandOutput, CommandRunner, CommandSpec, Confirmer, Orchestrator,
    RecoveryConfig, RecoverySession, RunOptions,
};

pub const VG: &str = "pwx0";
pub const METADATA_BYTES: usize = 8 * 512;
pub const ORIGINAL_BYTE: u8 = 0xA5;
pub const REPAIRED_BYTE: u8 = 0x5A;

/// What a scripted command does.
pub enum Reply {
    Output(CommandOutput),
    /// Never completes; models a hung tool.
    Hang,
}

type Handler = Box<dyn Fn(&CommandSpec) -> Reply + Send + Sync>;

struct Rule {
    prefix: String,
    handler: Handler,
}

/// Runner that answers from prefix rules and records every command line.
///
/// The most recently added matching rule wins; unmatched commands succeed
/// with empty output.
#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn on<F>(&self, prefix: &str, handler: F)
    where
        F: Fn(&CommandSpec) -> Reply + Send + Sync + 'static,
    {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            handler: Box::new(handler),
        });
    }

    pub fn ok(&self, prefix: &str, stdout: &str) {
        let stdout = stdout.to_string();
        self.on(prefix, move |_| Reply::Output(CommandOutput::ok(stdout.clone())));
    }

    pub fn fail(&self, prefix: &str, stderr: &str) {
        let stderr = stderr.to_string();
        self.on(prefix, move |_| Reply::Output(CommandOutput::failed(1, stderr.clone())));
    }

    pub fn hang(&self, prefix: &str) {
        self.on(prefix, |_| Reply::Hang);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.starts_with(prefix))
    }

    fn reply(&self, spec: &CommandSpec) -> Reply {
        let line = spec.to_string();
        self.calls.lock().unwrap().push(line.clone());
        let rules = self.rules.lock().unwrap();
        rules
            .iter()
            .rev()
            .find(|rule| line.starts_with(&rule.prefix))
            .map_or_else(
                || Reply::Output(CommandOutput::ok("")),
                |rule| (rule.handler)(spec),
            )
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        match self.reply(spec) {
            Reply::Output(out) => Ok(out),
            Reply::Hang => std::future::pending().await,
        }
    }

    fn output_blocking(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        match self.reply(spec) {
            Reply::Output(out) => Ok(out),
            Reply::Hang => Err(CommandError::Timeout {
                command: spec.to_string(),
                secs: 0,
            }),
        }
    }
}

/// Answers prompts from a queue, then falls back to a fixed answer.
pub struct ScriptedConfirmer {
    answers: Mutex<VecDeque<bool>>,
    fallback: bool,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedConfirmer {
    pub fn always(answer: bool) -> Self {
        Self {
            answers: Mutex::new(VecDeque::new()),
            fallback: answer,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Answer the first prompts from `answers`, every later one with `true`.
    pub fn answering(answers: &[bool]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            fallback: true,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl Confirmer for ScriptedConfirmer {
    fn confirm(&self, prompt: &str, _default: bool) -> anyhow::Result<bool> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self
            .answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback))
    }
}

/// Host inside the Portworx container with plenty of memory.
pub struct FakeProbe;

impl HostProbe for FakeProbe {
    fn init_process_name(&self) -> Option<String> {
        Some("px-oci-mon".into())
    }

    fn available_memory_bytes(&self) -> u64 {
        64 * 1024 * 1024 * 1024
    }

    fn in_detachable_terminal(&self) -> bool {
        true
    }

    fn resolve_tool(&self, name: &str) -> Option<PathBuf> {
        Some(PathBuf::from("/usr/sbin").join(name))
    }
}

pub const HEALTHY_STATUS: &str =
    "0 4194304 thin-pool 18 406/1024 0/2048 - rw no_discard_passdown queue_if_no_space - 1024\n";
pub const TABLE: &str = "0 8 linear 8:16 2048\n";

/// `vgcfgbackup` record with the pool at transaction id `txn`.
pub fn vg_record(txn: u64) -> String {
    format!(
        "contents = \"Text Format Volume Group\"\nversion = 1\n\n{VG} {{\n\tid = \"abc\"\n\n\tlogical_volumes {{\n\n\t\tpxpool {{\n\t\t\tid = \"ghi\"\n\n\t\t\tsegment1 {{\n\t\t\t\ttype = \"thin-pool\"\n\t\t\t\ttransaction_id = {txn}\n\t\t\t}}\n\t\t}}\n\t}}\n}}\n"
    )
}

/// Value following `flag` in a command's arguments.
pub fn arg_after<'a>(spec: &'a CommandSpec, flag: &str) -> Option<&'a str> {
    spec.args
        .iter()
        .position(|a| a == flag)
        .and_then(|i| spec.args.get(i + 1))
        .map(String::as_str)
}

/// Temporary filesystem layout standing in for a Portworx node.
pub struct Node {
    pub root: TempDir,
    pub config: RecoveryConfig,
}

impl Node {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let config = RecoveryConfig {
            state_dir: root.path().join("state"),
            backup_root: root.path().join("backups"),
            scratch_root: root.path().join("shm"),
            device_root: root.path().join("dev"),
            mapper_root: root.path().join("mapper"),
            ..RecoveryConfig::default()
        };

        let metadata = config.metadata_device(VG);
        std::fs::create_dir_all(metadata.parent().unwrap()).unwrap();
        std::fs::write(&metadata, vec![ORIGINAL_BYTE; METADATA_BYTES]).unwrap();
        std::fs::create_dir_all(&config.mapper_root).unwrap();

        Self { root, config }
    }

    pub fn state_file(&self) -> PathBuf {
        self.config.state_file(VG)
    }

    pub fn scratch(&self) -> PathBuf {
        self.config.scratch_dir(VG)
    }

    pub fn backups(&self) -> &Path {
        &self.config.backup_root
    }

    pub fn mapped_device(&self) -> PathBuf {
        self.config.mapper_root.join(self.config.recovery_dm_name(VG))
    }

    pub fn write_state(&self, label: &str) {
        std::fs::create_dir_all(&self.config.state_dir).unwrap();
        std::fs::write(self.state_file(), format!("{label}\n")).unwrap();
    }

    pub fn read_state(&self) -> Option<String> {
        std::fs::read_to_string(self.state_file())
            .ok()
            .map(|s| s.trim().to_string())
    }

    pub fn orchestrator(
        &self,
        runner: &Arc<FakeRunner>,
        confirmer: &Arc<ScriptedConfirmer>,
    ) -> Orchestrator {
        Orchestrator::new(
            RecoverySession::new(VG, self.config.clone()),
            Arc::clone(runner) as Arc<dyn CommandRunner>,
            Arc::clone(confirmer) as Arc<dyn Confirmer>,
            Arc::new(FakeProbe),
            RunOptions::default(),
        )
    }
}

/// Runner scripted for a damaged pool whose recovery succeeds.
///
/// Activation fails until the repaired metadata has been written through
/// the temporary mapping. Repaired metadata reports transaction id
/// `repaired_txn`; LVM records `recorded_txn`. A reservation volume exists
/// until removed and 1 GiB is free.
pub fn damaged_pool_runner(node: &Node, recorded_txn: u64, repaired_txn: u64) -> Arc<FakeRunner> {
    let runner = Arc::new(FakeRunner::default());
    let written = Arc::new(AtomicBool::new(false));
    let reserve_removed = Arc::new(AtomicBool::new(false));

    runner.ok("lvm vgs --noheadings -o vg_name", &format!("  {VG}\n"));
    runner.ok("pxctl status", "PX is in maintenance mode\n");
    runner.ok(
        "lvm lvs -a --noheadings --units b --nosuffix -o lv_size",
        &format!("  {METADATA_BYTES}\n"),
    );
    runner.ok(
        "lvm vgs --noheadings --units b --nosuffix -o vg_free",
        "  1073741824\n",
    );
    runner.ok("dmsetup table", TABLE);
    runner.fail("dmsetup info", "Device does not exist.");

    let removed = Arc::clone(&reserve_removed);
    runner.on("lvm lvs -a --noheadings -o lv_name", move |_| {
        let mut listing = String::from("  pxpool\n  [pxpool_tdata]\n  [pxpool_tmeta]\n");
        if !removed.load(Ordering::SeqCst) {
            listing.push_str("  pxreserve\n");
        }
        Reply::Output(CommandOutput::ok(listing))
    });
    let removed = Arc::clone(&reserve_removed);
    runner.on("lvm lvremove -f pwx0/pxreserve", move |_| {
        removed.store(true, Ordering::SeqCst);
        Reply::Output(CommandOutput::ok(""))
    });

    let done = Arc::clone(&written);
    runner.on("lvm vgchange -ay", move |_| {
        if done.load(Ordering::SeqCst) {
            Reply::Output(CommandOutput::ok(""))
        } else {
            Reply::Output(CommandOutput::failed(
                5,
                "Check of pool pwx0/pxpool failed (status:1). Manual repair required!",
            ))
        }
    });
    let done = Arc::clone(&written);
    runner.on("dmsetup status pwx0-pxpool-tpool", move |_| {
        if done.load(Ordering::SeqCst) {
            Reply::Output(CommandOutput::ok(HEALTHY_STATUS))
        } else {
            Reply::Output(CommandOutput::failed(1, "Device does not exist."))
        }
    });

    let record = vg_record(recorded_txn);
    runner.on("lvm vgcfgbackup", move |spec| {
        if let Some(dest) = arg_after(spec, "-f") {
            std::fs::write(dest, &record).unwrap();
        }
        Reply::Output(CommandOutput::ok(""))
    });

    runner.on("thin_repair", |spec| {
        if let Some(out) = arg_after(spec, "-o") {
            std::fs::write(out, vec![REPAIRED_BYTE; METADATA_BYTES]).unwrap();
        }
        Reply::Output(CommandOutput::ok(""))
    });

    let dump = format!(
        "<superblock uuid=\"\" time=\"1\" transaction=\"{repaired_txn}\" flags=\"0\" version=\"2\" data_block_size=\"128\" nr_data_blocks=\"0\">\n</superblock>\n"
    );
    runner.ok("thin_dump --skip-mappings", &dump);

    let mapped = node.mapped_device();
    let done = Arc::clone(&written);
    runner.on("dmsetup create", move |_| {
        std::fs::write(&mapped, vec![0u8; METADATA_BYTES]).unwrap();
        done.store(true, Ordering::SeqCst);
        Reply::Output(CommandOutput::ok(""))
    });

    runner
}

/// Runner for a pool that activates healthy straight away.
pub fn healthy_pool_runner() -> Arc<FakeRunner> {
    let runner = Arc::new(FakeRunner::default());
    runner.ok("lvm vgs --noheadings -o vg_name", &format!("  {VG}\n"));
    runner.ok("lvm vgchange -ay", "");
    runner.ok("dmsetup status pwx0-pxpool-tpool", HEALTHY_STATUS);
    runner
}
