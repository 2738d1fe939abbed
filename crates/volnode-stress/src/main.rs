// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::{rngs::SmallRng, Rng, RngCore, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};
use volnode_core::{
    FaultPolicy, FaultPolicySummary, FileInfo, FileNode, FileObject, FileObjectFlags, FsError,
    GrantedAccess, HandleId, LockContext, LockFlags, MemCacheEngine, ShareMode, Volume,
    VolumeConfig, WRITE_TO_END_OF_FILE,
};
use volnode_logging::CliLoggingArgs;

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.logging.init("volnode-stress")?;

    match cli.command {
        Command::Run(args) => {
            let context = run_workload(args)?;
            if let Some(path) = context.json_output.clone() {
                serde_json::to_writer_pretty(File::create(&path)?, &context.report)?;
            }
            write_json_to_stdout(&context.report)?;
            if context.report.status != "passed" {
                bail!("registry workload failed: {}", context.report.status);
            }
        }
    }
    Ok(())
}

fn write_json_to_stdout<T: serde::Serialize>(value: &T) -> Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    out.flush()?;
    Ok(())
}

#[derive(Parser)]
#[command(author, version, about = "volnode registry stress workload runner")]
struct Cli {
    #[command(flatten)]
    logging: CliLoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Run(RunArgs),
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Number of worker threads to spawn
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Number of distinct paths the workers contend on
    #[arg(long, default_value_t = 16)]
    paths: usize,

    /// Operations per worker
    #[arg(long, default_value_t = 10_000)]
    iterations: u64,

    /// Seed for the per-worker generators (default: time based)
    #[arg(long)]
    seed: Option<u64>,

    /// Volume configuration as JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Cache-engine fault policy as JSON
    #[arg(long)]
    fault_policy: Option<PathBuf>,

    /// Optional path for writing the JSON report
    #[arg(long)]
    json_output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Open,
    Close,
    Delete,
    Rename,
    SetInfo,
    Flush,
    Security,
}

#[derive(Default, Serialize, Clone)]
struct OperationStats {
    open: u64,
    close: u64,
    delete: u64,
    rename: u64,
    set_info: u64,
    flush: u64,
    security: u64,
}

impl OperationStats {
    fn increment(&mut self, op: Operation) {
        match op {
            Operation::Open => self.open += 1,
            Operation::Close => self.close += 1,
            Operation::Delete => self.delete += 1,
            Operation::Rename => self.rename += 1,
            Operation::SetInfo => self.set_info += 1,
            Operation::Flush => self.flush += 1,
            Operation::Security => self.security += 1,
        }
    }

    fn total(&self) -> u64 {
        self.open
            + self.close
            + self.delete
            + self.rename
            + self.set_info
            + self.flush
            + self.security
    }
}

impl std::ops::AddAssign<&OperationStats> for OperationStats {
    fn add_assign(&mut self, other: &OperationStats) {
        self.open += other.open;
        self.close += other.close;
        self.delete += other.delete;
        self.rename += other.rename;
        self.set_info += other.set_info;
        self.flush += other.flush;
        self.security += other.security;
    }
}

/// What is left in the registry once every worker closed its handles
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
struct LeakCheck {
    registered_names: usize,
    live_nodes: usize,
    live_file_descs: usize,
    sections_torn_down: u64,
}

impl LeakCheck {
    fn is_clean(&self) -> bool {
        self.registered_names == 0 && self.live_nodes == 0 && self.live_file_descs == 0
    }
}

#[derive(Serialize, Clone)]
struct RunReport {
    phase: String,
    threads: usize,
    paths: usize,
    iterations: u64,
    seed: u64,
    start_time: String,
    end_time: String,
    operations: OperationStats,
    total_ops: u64,
    benign_errors: HashMap<String, u64>,
    fatal_errors: HashMap<String, u64>,
    fault_policy: FaultPolicySummary,
    leak_check: LeakCheck,
    status: String,
}

struct RunContext {
    report: RunReport,
    json_output: Option<PathBuf>,
}

fn run_workload(args: RunArgs) -> Result<RunContext> {
    if args.threads == 0 || args.paths == 0 {
        bail!("--threads and --paths must be positive");
    }

    let config = match &args.config {
        Some(path) => VolumeConfig::from_json_file(path)
            .with_context(|| format!("failed to load volume config {}", path.display()))?,
        None => VolumeConfig::default(),
    };

    let engine = Arc::new(MemCacheEngine::new());
    if let Some(path) = &args.fault_policy {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read fault policy {}", path.display()))?;
        let policy = FaultPolicy::from_json_bytes(&bytes)
            .with_context(|| format!("invalid fault policy {}", path.display()))?;
        engine.faults().set_policy(policy);
    }
    let volume = Arc::new(Volume::new(config, engine.clone())?);

    let seed = args.seed.unwrap_or_else(|| {
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64
            ^ (u64::from(std::process::id()) << 32)
    });
    let paths: Arc<Vec<String>> = Arc::new(
        (0..args.paths)
            .map(|i| format!("\\stress\\dir{:02}\\file{:04}", i % 4, i))
            .collect(),
    );
    let next_handle = Arc::new(AtomicU64::new(1));

    info!(
        threads = args.threads,
        paths = args.paths,
        iterations = args.iterations,
        seed,
        "registry workload starting"
    );
    let start_time = chrono::Utc::now();

    let mut workers = Vec::with_capacity(args.threads);
    for worker_id in 0..args.threads {
        let worker = Worker {
            id: worker_id,
            volume: volume.clone(),
            paths: paths.clone(),
            next_handle: next_handle.clone(),
            iterations: args.iterations,
            rng_seed: seed ^ (worker_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
        };
        workers.push(thread::spawn(move || worker.run()));
    }

    let mut aggregate_stats = OperationStats::default();
    let mut benign_errors: HashMap<String, u64> = HashMap::new();
    let mut fatal_errors: HashMap<String, u64> = HashMap::new();

    for worker in workers {
        match worker.join() {
            Ok(result) => {
                aggregate_stats += &result.stats;
                merge_counts(&mut benign_errors, &result.benign_errors);
                merge_counts(&mut fatal_errors, &result.fatal_errors);
            }
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                *fatal_errors.entry("thread_panic".to_string()).or_insert(0) += 1;
                warn!("worker thread panicked: {}", msg);
            }
        }
    }

    let leak_check = LeakCheck {
        registered_names: volume.len(),
        live_nodes: volume.live_nodes(),
        live_file_descs: volume.live_file_descs(),
        sections_torn_down: engine.sections_torn_down(),
    };
    let end_time = chrono::Utc::now();

    let status = if !fatal_errors.is_empty() {
        "failed".to_string()
    } else if !leak_check.is_clean() {
        warn!(?leak_check, "registry not empty after all handles closed");
        "leaked".to_string()
    } else {
        "passed".to_string()
    };

    let report = RunReport {
        phase: "registry".to_string(),
        threads: args.threads,
        paths: args.paths,
        iterations: args.iterations,
        seed,
        start_time: start_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        end_time: end_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        operations: aggregate_stats.clone(),
        total_ops: aggregate_stats.total(),
        benign_errors,
        fatal_errors,
        fault_policy: engine.faults().summary(),
        leak_check,
        status,
    };

    Ok(RunContext {
        report,
        json_output: args.json_output,
    })
}

fn merge_counts(target: &mut HashMap<String, u64>, source: &HashMap<String, u64>) {
    for (key, value) in source {
        *target.entry(key.clone()).or_insert(0) += value;
    }
}

/// Registry outcomes a concurrent workload is expected to run into
fn classify_error(op: Operation, err: &FsError) -> OperationResult {
    let label = match err {
        FsError::SharingViolation => "sharing_violation",
        FsError::DeletePending => "delete_pending",
        FsError::ResourceExhausted => "resource_exhausted",
        FsError::Cache(_) => "cache_error",
        _ => {
            return OperationResult::Fatal {
                label: format!("{:?}", op).to_lowercase(),
                detail: err.to_string(),
            }
        }
    };
    OperationResult::Benign {
        label: label.to_string(),
    }
}

struct Handle {
    node: Arc<FileNode>,
    file_object: FileObject,
}

struct Worker {
    id: usize,
    volume: Arc<Volume>,
    paths: Arc<Vec<String>>,
    next_handle: Arc<AtomicU64>,
    iterations: u64,
    rng_seed: u64,
}

struct WorkerResult {
    stats: OperationStats,
    benign_errors: HashMap<String, u64>,
    fatal_errors: HashMap<String, u64>,
}

enum OperationResult {
    Completed,
    Benign { label: String },
    Fatal { label: String, detail: String },
}

impl Worker {
    fn run(self) -> WorkerResult {
        let mut rng = SmallRng::seed_from_u64(self.rng_seed);
        let mut stats = OperationStats::default();
        let mut benign_errors: HashMap<String, u64> = HashMap::new();
        let mut fatal_errors: HashMap<String, u64> = HashMap::new();
        let mut held: Vec<Handle> = Vec::new();

        for _ in 0..self.iterations {
            let op = self.pick_operation(&mut rng, held.len());
            let result = match op {
                Operation::Open => self.open(&mut rng, &mut held),
                Operation::Close => self.close(&mut rng, &mut held, false),
                Operation::Delete => self.close(&mut rng, &mut held, true),
                Operation::Rename => self.rename(&mut rng, &held),
                Operation::SetInfo => self.set_info(&mut rng, &held),
                Operation::Flush => self.flush(&mut rng, &held),
                Operation::Security => self.security(&mut rng, &held),
            };
            self.record(op, result, &mut stats, &mut benign_errors, &mut fatal_errors);
        }

        while let Some(handle) = held.pop() {
            let result = self.teardown(handle, false);
            self.record(
                Operation::Close,
                result,
                &mut stats,
                &mut benign_errors,
                &mut fatal_errors,
            );
        }

        WorkerResult {
            stats,
            benign_errors,
            fatal_errors,
        }
    }

    fn record(
        &self,
        op: Operation,
        result: OperationResult,
        stats: &mut OperationStats,
        benign_errors: &mut HashMap<String, u64>,
        fatal_errors: &mut HashMap<String, u64>,
    ) {
        match result {
            OperationResult::Completed => stats.increment(op),
            OperationResult::Benign { label } => {
                *benign_errors.entry(label).or_insert(0) += 1;
            }
            OperationResult::Fatal { label, detail } => {
                *fatal_errors.entry(label.clone()).or_insert(0) += 1;
                debug!("worker {} fatal {}: {}", self.id, label, detail);
            }
        }
    }

    fn pick_operation(&self, rng: &mut SmallRng, held: usize) -> Operation {
        if held == 0 {
            return Operation::Open;
        }
        match rng.gen_range(0..100) {
            0..=29 => Operation::Open,
            30..=49 => Operation::Close,
            50..=57 => Operation::Delete,
            58..=69 => Operation::Rename,
            70..=84 => Operation::SetInfo,
            85..=94 => Operation::Flush,
            _ => Operation::Security,
        }
    }

    fn pick<'a>(&self, rng: &mut SmallRng, held: &'a [Handle]) -> Option<&'a Handle> {
        (!held.is_empty()).then(|| &held[rng.gen_range(0..held.len())])
    }

    fn open(&self, rng: &mut SmallRng, held: &mut Vec<Handle>) -> OperationResult {
        let path = &self.paths[rng.gen_range(0..self.paths.len())];
        let (granted, share) = match rng.gen_range(0..4) {
            0 => (GrantedAccess::READ_DATA, ShareMode::READ),
            1 => (GrantedAccess::WRITE_DATA, ShareMode::READ | ShareMode::WRITE),
            2 => (GrantedAccess::READ_ATTRIBUTES, ShareMode::empty()),
            _ => (
                GrantedAccess::READ_DATA | GrantedAccess::DELETE,
                ShareMode::all(),
            ),
        };

        let candidate = match self.volume.create_node(path) {
            Ok(node) => node,
            Err(err) => return classify_error(Operation::Open, &err),
        };
        let id = HandleId::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut file_object = FileObject::new(id, FileObjectFlags::CACHE_SUPPORTED);
        match self.volume.create_file_desc() {
            Ok(desc) => file_object.attach_desc(desc),
            Err(err) => return classify_error(Operation::Open, &err),
        }

        match self.volume.open(&candidate, &mut file_object, granted, share) {
            Ok(node) => {
                held.push(Handle { node, file_object });
                OperationResult::Completed
            }
            Err(err) => classify_error(Operation::Open, &err),
        }
    }

    fn close(&self, rng: &mut SmallRng, held: &mut Vec<Handle>, delete: bool) -> OperationResult {
        if held.is_empty() {
            return OperationResult::Benign {
                label: "close_no_handle".into(),
            };
        }
        let handle = held.swap_remove(rng.gen_range(0..held.len()));
        self.teardown(handle, delete)
    }

    /// Cleanup (under Content exclusive), cleanup-complete and close. The
    /// handle is always torn down; a lock failure is still reported.
    fn teardown(&self, mut handle: Handle, delete: bool) -> OperationResult {
        let op = if delete {
            Operation::Delete
        } else {
            Operation::Close
        };
        if let Some(desc) = handle.file_object.desc_mut() {
            desc.delete_on_close |= delete;
        }

        let mut ctx = LockContext::new();
        let acquired = handle.node.acquire_exclusive(LockFlags::CONTENT, &mut ctx);
        let delete_now = self.volume.cleanup(&handle.node, &handle.file_object);
        let released = match acquired {
            Ok(()) => handle.node.release(LockFlags::CONTENT, &mut ctx),
            Err(err) => Err(err),
        };
        if delete_now {
            debug!(worker = self.id, node = handle.node.id().0, "last handle of deleted file");
        }

        self.volume.cleanup_complete(&handle.node, &mut handle.file_object);
        self.volume.close(handle.node, handle.file_object);

        match released {
            Ok(()) => OperationResult::Completed,
            Err(err) => classify_error(op, &err),
        }
    }

    fn rename(&self, rng: &mut SmallRng, held: &[Handle]) -> OperationResult {
        let Some(handle) = self.pick(rng, held) else {
            return OperationResult::Benign {
                label: "rename_no_handle".into(),
            };
        };
        let target = &self.paths[rng.gen_range(0..self.paths.len())];

        let mut table = self.volume.lock_table();
        if table.lookup(target).is_some() {
            return OperationResult::Benign {
                label: "rename_target_exists".into(),
            };
        }
        match table.rename(&handle.node, target) {
            Ok(()) => OperationResult::Completed,
            Err(err) => classify_error(Operation::Rename, &err),
        }
    }

    fn set_info(&self, rng: &mut SmallRng, held: &[Handle]) -> OperationResult {
        let Some(handle) = self.pick(rng, held) else {
            return OperationResult::Benign {
                label: "set_info_no_handle".into(),
            };
        };
        let node = &handle.node;
        let version = node.info_change_number();
        let info = FileInfo {
            file_size: rng.gen_range(0..1 << 20),
            ..node.get_file_info()
        };

        let mut ctx = LockContext::new();
        if let Err(err) = node.acquire_exclusive(LockFlags::CONTENT, &mut ctx) {
            return classify_error(Operation::SetInfo, &err);
        }
        let applied = node.try_set_file_info(Some(&handle.file_object), &info, version);
        if let Err(err) = node.release(LockFlags::CONTENT, &mut ctx) {
            return classify_error(Operation::SetInfo, &err);
        }

        if applied {
            OperationResult::Completed
        } else {
            OperationResult::Benign {
                label: "set_info_stale".into(),
            }
        }
    }

    fn flush(&self, rng: &mut SmallRng, held: &[Handle]) -> OperationResult {
        let Some(handle) = self.pick(rng, held) else {
            return OperationResult::Benign {
                label: "flush_no_handle".into(),
            };
        };
        let node = &handle.node;
        let offset = if rng.gen_bool(0.25) {
            WRITE_TO_END_OF_FILE
        } else {
            rng.gen_range(0..1 << 20)
        };
        let length = rng.gen_range(0..64 * 1024);
        let purge = rng.gen_bool(0.5);

        let mut ctx = LockContext::new();
        if let Err(err) = node.acquire_exclusive(LockFlags::FULL, &mut ctx) {
            return classify_error(Operation::Flush, &err);
        }
        let flushed = node.flush_and_purge_cache(offset, length, purge);
        if let Err(err) = node.release(LockFlags::FULL, &mut ctx) {
            return classify_error(Operation::Flush, &err);
        }

        match flushed {
            Ok(()) => OperationResult::Completed,
            Err(err) => classify_error(Operation::Flush, &err),
        }
    }

    fn security(&self, rng: &mut SmallRng, held: &[Handle]) -> OperationResult {
        let Some(handle) = self.pick(rng, held) else {
            return OperationResult::Benign {
                label: "security_no_handle".into(),
            };
        };
        let node = &handle.node;
        let mut descriptor = vec![0u8; rng.gen_range(16..128)];
        rng.fill_bytes(&mut descriptor);

        let version = node.security_change_number();
        if node.try_set_security(Some(&descriptor), version) {
            if node.reference_security().is_none() {
                debug!(worker = self.id, node = node.id().0, "security item already expired");
            }
            OperationResult::Completed
        } else {
            OperationResult::Benign {
                label: "security_stale".into(),
            }
        }
    }
}
