//! Partitioned, resumable checkpoint store.
//!
//! Epistemic foundation:
//! - K_i: Every finalized item lives in exactly one partition (tier1..tier4 or error)
//! - K_i: Partitions are keyed by item id and deduplicated on read and write
//! - K_i: JSON partitions are rewritten atomically (write-then-rename)
//! - B_i: A JSONL append may be torn by a crash → torn lines are skipped on read
//! - I^B: Crash mid-flush → write-ahead pending file is replayed on open

use crate::checkpoint::FlushTransaction;
use crate::models::{FinalizedItem, OutputFormat, Result, RunSummary, Tier, TierError};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

const SUMMARY_FILE: &str = "summary.json";
const PENDING_DIR: &str = ".pending";

/// Output partition of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Partition {
    Tier(Tier),
    Error,
}

impl Partition {
    pub const ALL: [Partition; 5] = [
        Partition::Tier(Tier::Tier1),
        Partition::Tier(Tier::Tier2),
        Partition::Tier(Tier::Tier3),
        Partition::Tier(Tier::Tier4),
        Partition::Error,
    ];

    /// Partition an item belongs to.
    pub fn of(item: &FinalizedItem) -> Self {
        item.tier().map(Partition::Tier).unwrap_or(Partition::Error)
    }

    pub fn stem(&self) -> &'static str {
        match self {
            Self::Tier(tier) => tier.as_str(),
            Self::Error => "error",
        }
    }

    pub fn is_tier(&self) -> bool {
        matches!(self, Self::Tier(_))
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stem())
    }
}

/// One partition file on disk.
struct PartitionFile {
    path: PathBuf,
    format: OutputFormat,
}

/// Contents of a partition read from disk.
struct Loaded {
    records: Vec<FinalizedItem>,
    /// Torn lines, duplicates or an unreadable file were found
    needs_repair: bool,
}

impl PartitionFile {
    /// Read all records, skipping unreadable ones and keeping the last copy of each id.
    fn load(&self) -> Result<Loaded> {
        if !self.path.exists() {
            return Ok(Loaded {
                records: Vec::new(),
                needs_repair: false,
            });
        }

        let (raw, mut needs_repair) = match self.format {
            OutputFormat::Jsonl => self.load_lines()?,
            OutputFormat::Json => self.load_array()?,
        };

        let mut positions: HashMap<String, usize> = HashMap::with_capacity(raw.len());
        let mut records: Vec<FinalizedItem> = Vec::with_capacity(raw.len());
        for record in raw {
            match positions.get(record.id()) {
                Some(&idx) => {
                    needs_repair = true;
                    records[idx] = record;
                }
                None => {
                    positions.insert(record.id().to_string(), records.len());
                    records.push(record);
                }
            }
        }

        Ok(Loaded {
            records,
            needs_repair,
        })
    }

    fn load_lines(&self) -> Result<(Vec<FinalizedItem>, bool)> {
        let file =
            File::open(&self.path).map_err(|e| TierError::io("opening partition file", e))?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut damaged = false;

        for (line_num, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    // Torn multi-byte sequence at the tail of a crashed append
                    warn!(path = %self.path.display(), line = line_num + 1, error = %e, "Skipping unreadable line");
                    damaged = true;
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FinalizedItem>(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %self.path.display(), line = line_num + 1, error = %e, "Skipping unreadable record");
                    damaged = true;
                }
            }
        }

        Ok((records, damaged))
    }

    fn load_array(&self) -> Result<(Vec<FinalizedItem>, bool)> {
        let content = fs::read_to_string(&self.path)
            .map_err(|e| TierError::io("reading partition file", e))?;
        if content.trim().is_empty() {
            return Ok((Vec::new(), false));
        }

        let values: Vec<serde_json::Value> = match serde_json::from_str(&content) {
            Ok(values) => values,
            Err(e) => {
                let quarantine = self.path.with_extension(format!(
                    "corrupt-{}.json",
                    chrono::Utc::now().format("%Y%m%d%H%M%S")
                ));
                warn!(
                    path = %self.path.display(),
                    moved_to = %quarantine.display(),
                    error = %e,
                    "Partition file is not a JSON array, setting it aside"
                );
                fs::rename(&self.path, &quarantine)
                    .map_err(|e| TierError::io("quarantining partition file", e))?;
                return Ok((Vec::new(), true));
            }
        };

        let mut damaged = false;
        let records = values
            .into_iter()
            .enumerate()
            .filter_map(|(idx, value)| match serde_json::from_value(value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(path = %self.path.display(), index = idx, error = %e, "Skipping unreadable record");
                    damaged = true;
                    None
                }
            })
            .collect();

        Ok((records, damaged))
    }

    /// Add records to the end of the partition.
    fn append(&self, records: &[FinalizedItem]) -> Result<()> {
        match self.format {
            OutputFormat::Jsonl => append_lines(&self.path, records),
            OutputFormat::Json => {
                let mut all = self.load()?.records;
                all.extend(records.iter().cloned());
                self.rewrite(&all)
            }
        }
    }

    /// Replace the whole partition atomically.
    fn rewrite(&self, records: &[FinalizedItem]) -> Result<()> {
        let bytes = match self.format {
            OutputFormat::Jsonl => {
                let mut buf = Vec::new();
                for record in records {
                    serde_json::to_writer(&mut buf, record).map_err(serialize_error)?;
                    buf.push(b'\n');
                }
                buf
            }
            OutputFormat::Json => serde_json::to_vec_pretty(records).map_err(serialize_error)?,
        };
        write_atomic(&self.path, &bytes)
    }
}

fn serialize_error(e: serde_json::Error) -> TierError {
    TierError::Internal(format!("Serializing record: {e}"))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Write a file atomically: temp file, fsync, rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut file =
            File::create(&tmp_path).map_err(|e| TierError::io("creating temp file", e))?;
        file.write_all(bytes)
            .map_err(|e| TierError::io("writing temp file", e))?;
        file.sync_all()
            .map_err(|e| TierError::io("syncing temp file", e))?;
    }

    fs::rename(&tmp_path, path).map_err(|e| TierError::io("renaming temp file", e))
}

/// Append one JSON line per record and fsync.
///
/// A torn final line from an earlier crash is terminated first so it
/// cannot swallow the next record.
fn append_lines(path: &Path, records: &[FinalizedItem]) -> Result<()> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record).map_err(serialize_error)?;
        buf.push(b'\n');
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| TierError::io("opening partition file", e))?;

    let len = file
        .metadata()
        .map_err(|e| TierError::io("reading partition metadata", e))?
        .len();
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))
            .and_then(|_| file.read_exact(&mut last))
            .map_err(|e| TierError::io("checking partition tail", e))?;
        if last[0] != b'\n' {
            buf.insert(0, b'\n');
        }
    }

    file.write_all(&buf)
        .map_err(|e| TierError::io("appending to partition", e))?;
    file.sync_all()
        .map_err(|e| TierError::io("syncing partition", e))
}

/// Outcome of applying one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Records written to a partition
    pub written: usize,
    /// Records dropped because the id was already classified
    pub duplicates: usize,
    /// Records moved out of the error partition
    pub promoted: usize,
}

/// Partitioned checkpoint store shared by all pipeline tasks.
///
/// Locks: `flush_gate` serializes flushes, `index` maps ids to partitions,
/// each partition file has its own mutex, `queue` buffers unflushed items.
/// Acquisition order is always flush_gate → index → partition.
pub struct CheckpointStore {
    dir: PathBuf,
    tx_dir: PathBuf,
    format: OutputFormat,
    batch_size: usize,
    partitions: BTreeMap<Partition, Mutex<PartitionFile>>,
    index: Mutex<HashMap<String, Partition>>,
    queue: Mutex<Vec<FinalizedItem>>,
    flush_gate: Mutex<()>,
}

impl CheckpointStore {
    /// Open a store, replaying pending transactions and loading the id index.
    pub fn open(dir: &Path, format: OutputFormat, batch_size: usize) -> Result<Self> {
        let tx_dir = dir.join(PENDING_DIR);
        fs::create_dir_all(&tx_dir)
            .map_err(|e| TierError::io("creating checkpoint directory", e))?;

        let partitions = Partition::ALL
            .iter()
            .map(|p| {
                let file = PartitionFile {
                    path: dir.join(format!("{}.{}", p.stem(), format.extension())),
                    format,
                };
                (*p, Mutex::new(file))
            })
            .collect();

        let store = Self {
            dir: dir.to_path_buf(),
            tx_dir,
            format,
            batch_size: batch_size.max(1),
            partitions,
            index: Mutex::new(HashMap::new()),
            queue: Mutex::new(Vec::new()),
            flush_gate: Mutex::new(()),
        };

        store.rebuild_index()?;

        let recovered = FlushTransaction::recover(&store.tx_dir)?;
        if !recovered.is_empty() {
            let _gate = lock(&store.flush_gate);
            for batch in recovered {
                let report = store.apply(&batch.records)?;
                info!(
                    tx_id = %batch.tx_id,
                    written = report.written,
                    duplicates = report.duplicates,
                    "Replayed pending flush"
                );
                batch.discard()?;
            }
        }

        let index = lock(&store.index);
        info!(
            dir = %store.dir.display(),
            format = format.extension(),
            persisted = index.len(),
            "Checkpoint store opened"
        );
        drop(index);

        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Path of a partition file.
    pub fn partition_path(&self, partition: Partition) -> PathBuf {
        self.dir
            .join(format!("{}.{}", partition.stem(), self.format.extension()))
    }

    fn partition(&self, partition: Partition) -> Result<MutexGuard<'_, PartitionFile>> {
        self.partitions
            .get(&partition)
            .map(lock)
            .ok_or_else(|| TierError::Internal(format!("unknown partition {partition}")))
    }

    /// Load every partition, repair damaged files, resolve cross-partition duplicates.
    fn rebuild_index(&self) -> Result<()> {
        let mut index: HashMap<String, Partition> = HashMap::new();

        // Tiers first so a classified copy always wins over an error copy
        for partition in Partition::ALL {
            let file = self.partition(partition)?;
            let loaded = file.load()?;
            let before = loaded.records.len();

            let kept: Vec<FinalizedItem> = loaded
                .records
                .into_iter()
                .filter(|r| Partition::of(r) == partition && !index.contains_key(r.id()))
                .collect();

            if loaded.needs_repair || kept.len() != before {
                warn!(
                    partition = %partition,
                    kept = kept.len(),
                    dropped = before - kept.len(),
                    "Compacting partition"
                );
                file.rewrite(&kept)?;
            }

            for record in &kept {
                index.insert(record.id().to_string(), partition);
            }
        }

        *lock(&self.index) = index;
        Ok(())
    }

    /// Partition holding an id from a committed flush.
    pub fn contains(&self, id: &str) -> Option<Partition> {
        lock(&self.index).get(id).copied()
    }

    /// Number of committed items per partition.
    pub fn counts(&self) -> BTreeMap<Partition, usize> {
        let mut counts: BTreeMap<Partition, usize> =
            Partition::ALL.iter().map(|p| (*p, 0)).collect();
        for partition in lock(&self.index).values() {
            *counts.entry(*partition).or_default() += 1;
        }
        counts
    }

    /// Items buffered but not yet flushed.
    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Read one partition from disk.
    pub fn read_partition(&self, partition: Partition) -> Result<Vec<FinalizedItem>> {
        Ok(self.partition(partition)?.load()?.records)
    }

    /// Items currently in the error partition.
    pub fn error_items(&self) -> Result<Vec<FinalizedItem>> {
        self.read_partition(Partition::Error)
    }

    /// Buffer a finalized item; flushes when the batch is full.
    ///
    /// On flush failure the batch stays buffered and the error is returned.
    pub fn persist(&self, item: FinalizedItem) -> Result<()> {
        let full = {
            let mut queue = lock(&self.queue);
            queue.push(item);
            queue.len() >= self.batch_size
        };
        if full {
            self.flush()?;
        }
        Ok(())
    }

    /// Write all buffered items as one all-or-nothing batch.
    pub fn flush(&self) -> Result<FlushReport> {
        let _gate = lock(&self.flush_gate);

        let batch = std::mem::take(&mut *lock(&self.queue));
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }

        let tx = match FlushTransaction::begin(&self.tx_dir, &batch) {
            Ok(tx) => tx,
            Err(e) => {
                warn!(records = batch.len(), error = %e, "Flush failed, batch retained");
                self.requeue(batch);
                return Err(e);
            }
        };

        match self.apply(&batch) {
            Ok(report) => {
                if let Err(e) = tx.commit() {
                    // Partitions are written; a leftover pending file replays as a no-op
                    warn!(error = %e, "Failed to clear pending transaction");
                }
                debug!(
                    written = report.written,
                    duplicates = report.duplicates,
                    promoted = report.promoted,
                    "Flushed batch"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(records = batch.len(), error = %e, "Flush failed, batch retained");
                if let Err(abort_err) = tx.abort() {
                    warn!(error = %abort_err, "Failed to clear pending transaction");
                }
                self.requeue(batch);
                Err(e)
            }
        }
    }

    fn requeue(&self, batch: Vec<FinalizedItem>) {
        let mut queue = lock(&self.queue);
        let newer = std::mem::take(&mut *queue);
        *queue = batch;
        queue.extend(newer);
    }

    /// Apply a batch to the partitions. Caller holds `flush_gate`.
    ///
    /// Idempotent: classified ids are never rewritten, error entries are replaced.
    fn apply(&self, batch: &[FinalizedItem]) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        let mut index = lock(&self.index);

        // Last copy of each id within the batch wins
        let mut latest: Vec<&FinalizedItem> = Vec::with_capacity(batch.len());
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for record in batch {
            match seen.get(record.id()) {
                Some(&idx) => {
                    latest[idx] = record;
                    report.duplicates += 1;
                }
                None => {
                    seen.insert(record.id(), latest.len());
                    latest.push(record);
                }
            }
        }

        let mut tier_writes: BTreeMap<Partition, Vec<FinalizedItem>> = BTreeMap::new();
        let mut error_writes: Vec<FinalizedItem> = Vec::new();
        let mut leaving_error: HashSet<String> = HashSet::new();

        for record in latest {
            let target = Partition::of(record);
            match (index.get(record.id()).copied(), target) {
                (Some(existing), _) if existing.is_tier() => {
                    debug!(item_id = %record.id(), partition = %existing, "Already classified, skipping");
                    report.duplicates += 1;
                }
                (Some(Partition::Error), Partition::Tier(_)) => {
                    leaving_error.insert(record.id().to_string());
                    tier_writes.entry(target).or_default().push(record.clone());
                    report.promoted += 1;
                }
                (Some(Partition::Error), Partition::Error) => {
                    leaving_error.insert(record.id().to_string());
                    error_writes.push(record.clone());
                }
                (_, Partition::Tier(_)) => {
                    tier_writes.entry(target).or_default().push(record.clone());
                }
                (_, Partition::Error) => error_writes.push(record.clone()),
            }
        }

        // Tiers first: a crash before the error rewrite leaves a tier copy, which wins on load
        for (partition, records) in &tier_writes {
            self.partition(*partition)?.append(records)?;
            for record in records {
                index.insert(record.id().to_string(), *partition);
            }
            report.written += records.len();
        }

        if !leaving_error.is_empty() || !error_writes.is_empty() {
            let file = self.partition(Partition::Error)?;
            if leaving_error.is_empty() {
                file.append(&error_writes)?;
            } else {
                let mut records: Vec<FinalizedItem> = file
                    .load()?
                    .records
                    .into_iter()
                    .filter(|r| !leaving_error.contains(r.id()))
                    .collect();
                records.extend(error_writes.iter().cloned());
                file.rewrite(&records)?;
            }
            for record in &error_writes {
                index.insert(record.id().to_string(), Partition::Error);
            }
            report.written += error_writes.len();
        }

        Ok(report)
    }

    /// Recompute `summary.json` from all partitions.
    pub fn write_summary(&self) -> Result<RunSummary> {
        let mut classified = Vec::new();
        for tier in Tier::ALL {
            classified.extend(self.read_partition(Partition::Tier(tier))?);
        }
        let error_items = self.read_partition(Partition::Error)?.len();

        let path = self.dir.join(SUMMARY_FILE);
        let previous_runs = fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<RunSummary>(&s).ok())
            .map(|s| s.runs);

        let summary = RunSummary::compute(&classified, error_items, previous_runs);
        let bytes = serde_json::to_vec_pretty(&summary)
            .map_err(|e| TierError::Internal(format!("Serializing summary: {e}")))?;
        write_atomic(&path, &bytes)?;

        info!(
            total = summary.total_items,
            errors = summary.error_items,
            runs = summary.runs,
            "Summary written"
        );
        Ok(summary)
    }
}

/// First output directory under `base` that holds no partitions yet.
///
/// `base` itself when unused, otherwise `base_v2`, `base_v3`, …
pub fn versioned_output_dir(base: &Path) -> PathBuf {
    let used = |dir: &Path| {
        Partition::ALL.iter().any(|p| {
            ["json", "jsonl"]
                .iter()
                .any(|ext| dir.join(format!("{}.{ext}", p.stem())).exists())
        })
    };

    if !used(base) {
        return base.to_path_buf();
    }

    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    (2u32..)
        .map(|n| base.with_file_name(format!("{name}_v{n}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| base.to_path_buf())
}

/// Output directory for a run over `base`.
///
/// Classified entries are final, so a run that must not reuse earlier results
/// (re-evaluation, or resume switched off) gets a fresh versioned directory.
pub fn run_output_dir(base: &Path, resume: bool, reevaluate: bool) -> PathBuf {
    if reevaluate || !resume {
        versioned_output_dir(base)
    } else {
        base.to_path_buf()
    }
}
