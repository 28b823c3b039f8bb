//! Backup planner: decides which source files need copying to a destination
//! volume, orders them by priority, and feeds the copy stage in bounded
//! batches.
//!
//! Priority is (fewest existing volume labels, largest size, path) so the
//! least-replicated data lands on the new volume first. Candidates buffer in
//! per-label-count buckets; when the aggregate count crosses the batch
//! threshold the lowest-count bucket is flushed to the copy stage, which
//! bounds memory under large fanouts.

use crate::checksum::{run_checksums_with, ChecksumEngine, ChecksumError, ChecksumOptions, DEFAULT_HASH_TOKENS};
use crate::config::{IgnoreRules, SourceRoot};
use crate::copy::{CopyAgent, CopyError, CopyRequest};
use crate::digest::Digest;
use crate::dirmap::{mtime_secs, DirectoryMap};
use crate::journal::{collect_journal, JournalError};
use crate::pool::CancelFlag;
use crate::tuner::TunerConfig;
use crate::volume::{self, VolumeError, VolumeLabel};
use crate::walk::{self, DirectoryHandler, WalkError, WalkOptions, WalkWarning};
use ahash::{HashMap, HashMapExt};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("source does not exist: {0}")]
    SourceMissing(PathBuf),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Checksum(#[from] ChecksumError),

    #[error(transparent)]
    Walk(#[from] WalkError),

    #[error(transparent)]
    Copy(#[from] CopyError),

    #[error(transparent)]
    Journal(#[from] JournalError),
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Do not copy to a new volume once a record carries this many labels.
    pub max_dests: usize,
    /// Aggregate candidate count that triggers a bucket flush.
    pub batch_threshold: usize,
    /// Concurrent copies; copies are I/O-bound on the destination, so this
    /// stays small and independent of the hash pool.
    pub copy_concurrency: usize,
    pub hash_concurrency: usize,
    pub tune: bool,
    pub tuner: TunerConfig,
    pub ignore_patterns: Vec<String>,
    /// Write a journal of all source metadata here after the backup.
    pub journal: Option<PathBuf>,
    pub cancel: CancelFlag,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            max_dests: 2,
            batch_threshold: 1000,
            copy_concurrency: 2,
            hash_concurrency: DEFAULT_HASH_TOKENS,
            tune: false,
            tuner: TunerConfig::default(),
            ignore_patterns: Vec::new(),
            journal: None,
            cancel: CancelFlag::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct BackupSummary {
    pub copied: usize,
    pub bytes_copied: u64,
    /// Source files whose content was already on the volume.
    pub already_present: usize,
    /// Candidates passed over because their records hold `max_dests` labels.
    pub at_max_dests: usize,
    /// Per-file copy failures a re-run can repair.
    pub failed: usize,
    pub orphans: usize,
    /// The destination filled up; the backup is partial but consistent.
    pub volume_full: bool,
    pub cancelled: bool,
    pub warnings: Vec<WalkWarning>,
}

/// A source file the copy stage should bring onto the volume.
#[derive(Debug, Clone)]
struct Candidate {
    src_dir: PathBuf,
    dst_dir: PathBuf,
    name: String,
    size: u64,
    labels: usize,
}

/// Candidates bucketed by current label count. Draining picks the
/// lowest-count bucket and orders it by size descending, then path.
#[derive(Default)]
struct BucketQueue {
    buckets: BTreeMap<usize, Vec<Candidate>>,
    total: usize,
}

impl BucketQueue {
    fn push(&mut self, candidate: Candidate) {
        self.buckets.entry(candidate.labels).or_default().push(candidate);
        self.total += 1;
    }

    fn len(&self) -> usize {
        self.total
    }

    fn drain_next(&mut self) -> Option<Vec<Candidate>> {
        let count = *self.buckets.keys().next()?;
        let mut batch = self.buckets.remove(&count).unwrap();
        self.total -= batch.len();
        batch.sort_by(|a, b| {
            b.size
                .cmp(&a.size)
                .then_with(|| (&a.src_dir, &a.name).cmp(&(&b.src_dir, &b.name)))
        });
        Some(batch)
    }
}

/// (size, digest) -> paths index of everything on the destination volume.
/// Duplicate content keeps every path, so two identical source files each
/// consume their own entry. Matched entries are consumed; whatever remains
/// at the end is the orphan set.
struct DestIndex {
    entries: Mutex<HashMap<(u64, Digest), Vec<PathBuf>>>,
}

impl DestIndex {
    fn build(dest: &Path, walk_opts: &WalkOptions) -> Result<Self, WalkError> {
        let index = Self { entries: Mutex::new(HashMap::new()) };
        walk::walk(dest, walk_opts, |dir: &Path| {
            let (map, warning) = DirectoryMap::load_lenient(dir);
            if let Some(w) = warning {
                warn!(dir = %dir.display(), error = %w, "destination metadata unreadable");
            }
            Ok(IndexHandler { map, index: &index })
        })?;
        Ok(index)
    }

    fn insert(&self, key: (u64, Digest), path: PathBuf) {
        self.entries.lock().unwrap().entry(key).or_default().push(path);
    }

    fn take(&self, key: &(u64, Digest)) -> Option<PathBuf> {
        let mut entries = self.entries.lock().unwrap();
        let paths = entries.get_mut(key)?;
        let path = paths.pop();
        if paths.is_empty() {
            entries.remove(key);
        }
        path
    }

    fn into_remaining(self) -> Vec<PathBuf> {
        let mut orphans: Vec<PathBuf> = self
            .entries
            .into_inner()
            .unwrap()
            .into_values()
            .flatten()
            .collect();
        orphans.sort();
        orphans
    }
}

struct IndexHandler<'a> {
    map: DirectoryMap,
    index: &'a DestIndex,
}

impl DirectoryHandler for IndexHandler<'_> {
    fn on_file(&mut self, name: &str, meta: &fs::Metadata) -> Result<(), WalkError> {
        if let Some(record) = self.map.get(name) {
            if let Some(digest) = record.digest {
                if record.matches_stat(meta.len(), mtime_secs(meta)) {
                    self.index
                        .insert((record.size, digest), self.map.dir().join(name));
                }
            }
        }
        Ok(())
    }

    fn on_finish(&mut self) -> Result<(), WalkError> {
        Ok(())
    }
}

/// Reconciles one source against the destination index: matched files gain
/// the destination label, unmatched files lose a stale claim to it.
struct FixupHandler<'a> {
    map: DirectoryMap,
    index: &'a DestIndex,
    label: &'a VolumeLabel,
    matched: &'a AtomicUsize,
}

impl DirectoryHandler for FixupHandler<'_> {
    fn on_file(&mut self, name: &str, meta: &fs::Metadata) -> Result<(), WalkError> {
        let (size, digest, stat_ok) = match self.map.get(name) {
            Some(record) => (
                record.size,
                record.digest,
                record.matches_stat(meta.len(), mtime_secs(meta)),
            ),
            None => return Ok(()),
        };
        let Some(digest) = digest else { return Ok(()) };
        if !stat_ok {
            // Changed since the checksum pass; the next run will catch it.
            return Ok(());
        }

        if self.index.take(&(size, digest)).is_some() {
            self.matched.fetch_add(1, Ordering::Relaxed);
            self.map.add_volume(name, self.label);
        } else if self.map.get(name).is_some_and(|r| r.has_volume(self.label)) {
            // The label claims a copy that the volume no longer holds.
            self.map.remove_volume(name, self.label);
        }
        Ok(())
    }

    fn on_finish(&mut self) -> Result<(), WalkError> {
        self.map.persist()?;
        Ok(())
    }
}

/// State shared between candidate enumeration and the copy workers.
struct CopyStage<'a> {
    copier: &'a dyn CopyAgent,
    label: &'a VolumeLabel,
    pool: rayon::ThreadPool,
    queue: Mutex<BucketQueue>,
    batch_threshold: usize,
    volume_full: AtomicBool,
    fatal: Mutex<Option<CopyError>>,
    copied: AtomicUsize,
    bytes: AtomicU64,
    failed: AtomicUsize,
    cancel: CancelFlag,
}

impl CopyStage<'_> {
    fn halted(&self) -> bool {
        self.volume_full.load(Ordering::Relaxed)
            || self.cancel.is_cancelled()
            || self.fatal.lock().unwrap().is_some()
    }

    fn submit(&self, candidate: Candidate) {
        let batch = {
            let mut queue = self.queue.lock().unwrap();
            queue.push(candidate);
            if queue.len() >= self.batch_threshold {
                queue.drain_next()
            } else {
                None
            }
        };
        if let Some(batch) = batch {
            self.run_batch(batch);
        }
    }

    fn drain(&self) {
        loop {
            if self.halted() {
                return;
            }
            let batch = self.queue.lock().unwrap().drain_next();
            match batch {
                Some(batch) => self.run_batch(batch),
                None => return,
            }
        }
    }

    fn run_batch(&self, batch: Vec<Candidate>) {
        self.pool.install(|| {
            batch.par_iter().for_each(|candidate| {
                if self.halted() {
                    return;
                }
                let req = CopyRequest {
                    src_dir: candidate.src_dir.clone(),
                    dst_dir: candidate.dst_dir.clone(),
                    name: candidate.name.clone(),
                    label: self.label.clone(),
                };
                match self.copier.copy(&req) {
                    Ok(()) => {
                        self.copied.fetch_add(1, Ordering::Relaxed);
                        self.bytes.fetch_add(candidate.size, Ordering::Relaxed);
                    }
                    Err(e) if e.is_no_space() => {
                        warn!(path = %req.dst_path().display(), "destination volume full");
                        self.volume_full.store(true, Ordering::Relaxed);
                    }
                    Err(e) if e.is_skippable() => {
                        warn!(path = %req.src_path().display(), error = %e, "copy failed, will retry next run");
                        self.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        let mut fatal = self.fatal.lock().unwrap();
                        if fatal.is_none() {
                            *fatal = Some(e);
                        }
                    }
                }
            });
        });
    }
}

/// Streams copy candidates from one source into the stage's bucket queue.
struct CandidateHandler<'a> {
    map: DirectoryMap,
    dst_dir: PathBuf,
    stage: &'a CopyStage<'a>,
    max_dests: usize,
    at_max: &'a AtomicUsize,
}

impl DirectoryHandler for CandidateHandler<'_> {
    fn on_file(&mut self, name: &str, meta: &fs::Metadata) -> Result<(), WalkError> {
        if self.stage.halted() {
            return Ok(());
        }
        let Some(record) = self.map.get(name) else { return Ok(()) };
        if record.digest.is_none() || !record.matches_stat(meta.len(), mtime_secs(meta)) {
            return Ok(());
        }
        if record.has_volume(self.stage.label) {
            return Ok(());
        }
        if record.volumes.len() >= self.max_dests {
            self.at_max.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.stage.submit(Candidate {
            src_dir: self.map.dir().to_path_buf(),
            dst_dir: self.dst_dir.clone(),
            name: name.to_string(),
            size: record.size,
            labels: record.volumes.len(),
        });
        Ok(())
    }

    fn on_finish(&mut self) -> Result<(), WalkError> {
        Ok(())
    }
}

fn lenient_maker(dir: &Path) -> DirectoryMap {
    let (map, warning) = DirectoryMap::load_lenient(dir);
    if let Some(w) = warning {
        warn!(dir = %dir.display(), error = %w, "metadata unreadable");
    }
    map
}

/// Back up `sources` onto the volume at `dest`.
///
/// With `copier == None` this is a scan: metadata is refreshed, labels are
/// reconciled and orphans are reported, but nothing is copied. Running the
/// same backup twice copies nothing the second time.
pub fn run_backup(
    sources: &[SourceRoot],
    dest: &Path,
    opts: &BackupOptions,
    orphan: Option<&(dyn Fn(&Path) + Sync)>,
    copier: Option<&dyn CopyAgent>,
) -> Result<BackupSummary, BackupError> {
    for source in sources {
        if !source.path.is_dir() {
            return Err(BackupError::SourceMissing(source.path.clone()));
        }
    }
    let label = volume::read_label(dest)?;
    let mut summary = BackupSummary::default();

    // 1. Refresh metadata, destination first so its index is trustworthy.
    let engine = if opts.tune {
        ChecksumEngine::with_tuner(opts.hash_concurrency, opts.tuner.clone())
    } else {
        ChecksumEngine::new(opts.hash_concurrency)
    };
    let scan_opts = ChecksumOptions {
        max_concurrent: opts.hash_concurrency,
        tune: opts.tune,
        tuner: opts.tuner.clone(),
        ignore_patterns: opts.ignore_patterns.clone(),
        cancel: opts.cancel.clone(),
        ..ChecksumOptions::default()
    };
    let mut dirs = vec![dest.to_path_buf()];
    dirs.extend(sources.iter().map(|s| s.path.clone()));
    let scan = run_checksums_with(&dirs, &scan_opts, &engine)?;
    summary.warnings.extend(scan.warnings);
    if scan.cancelled {
        summary.cancelled = true;
        return Ok(summary);
    }

    let walk_opts = |root: &Path| -> Result<WalkOptions, BackupError> {
        Ok(WalkOptions {
            threads: opts.hash_concurrency.max(2),
            ignore: IgnoreRules::compile(root, &opts.ignore_patterns)
                .map_err(ChecksumError::Config)?,
            cancel: opts.cancel.clone(),
        })
    };

    // 2. Index the destination volume's content.
    let index = DestIndex::build(dest, &walk_opts(dest)?)?;

    // 3. Reconcile every source against the index; matched entries are
    // consumed so the leftover is exactly the orphan set.
    let matched = AtomicUsize::new(0);
    for source in sources {
        walk::walk(&source.path, &walk_opts(&source.path)?, |dir: &Path| {
            Ok(FixupHandler {
                map: lenient_maker(dir),
                index: &index,
                label: &label,
                matched: &matched,
            })
        })?;
    }
    summary.already_present = matched.into_inner();

    // 4. Orphans: volume content no source claims any more.
    let orphans = index.into_remaining();
    summary.orphans = orphans.len();
    if let Some(callback) = orphan {
        for path in &orphans {
            callback(path);
        }
    }

    // 5. Scan-only mode stops here.
    let Some(copier) = copier else {
        return Ok(summary);
    };

    // 6-8. Stream candidates through the priority buckets into the copy
    // stage.
    let stage = CopyStage {
        copier,
        label: &label,
        pool: rayon::ThreadPoolBuilder::new()
            .num_threads(opts.copy_concurrency.max(1))
            .build()
            .map_err(WalkError::Pool)?,
        queue: Mutex::new(BucketQueue::default()),
        batch_threshold: opts.batch_threshold.max(1),
        volume_full: AtomicBool::new(false),
        fatal: Mutex::new(None),
        copied: AtomicUsize::new(0),
        bytes: AtomicU64::new(0),
        failed: AtomicUsize::new(0),
        cancel: opts.cancel.clone(),
    };
    let at_max = AtomicUsize::new(0);

    for source in sources {
        let source_root = source.path.clone();
        let dest_root = dest.to_path_buf();
        walk::walk(&source.path, &walk_opts(&source.path)?, |dir: &Path| {
            let rel = dir.strip_prefix(&source_root).unwrap_or(Path::new(""));
            Ok(CandidateHandler {
                map: lenient_maker(dir),
                dst_dir: dest_root.join(rel),
                stage: &stage,
                max_dests: opts.max_dests,
                at_max: &at_max,
            })
        })?;
    }
    stage.drain();

    if let Some(fatal) = stage.fatal.into_inner().unwrap() {
        return Err(BackupError::Copy(fatal));
    }
    summary.copied = stage.copied.into_inner();
    summary.bytes_copied = stage.bytes.into_inner();
    summary.failed = stage.failed.into_inner();
    summary.at_max_dests = at_max.into_inner();
    summary.volume_full = stage.volume_full.into_inner();
    summary.cancelled = opts.cancel.is_cancelled();

    // Journal of everything the sources now know, labels included.
    if let Some(journal_path) = &opts.journal {
        let journal = collect_journal(sources, &walk_opts(dest)?)?;
        journal.save(journal_path)?;
    }

    info!(
        copied = summary.copied,
        orphans = summary.orphans,
        failed = summary.failed,
        volume_full = summary.volume_full,
        "backup complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, size: u64, labels: usize) -> Candidate {
        Candidate {
            src_dir: PathBuf::from("/src"),
            dst_dir: PathBuf::from("/dst"),
            name: name.to_string(),
            size,
            labels,
        }
    }

    #[test]
    fn test_bucket_queue_orders_by_count_then_size() {
        let mut queue = BucketQueue::default();
        queue.push(candidate("small-unlabelled", 100, 0));
        queue.push(candidate("replicated", 9000, 1));
        queue.push(candidate("big-unlabelled", 5000, 0));

        let first = queue.drain_next().unwrap();
        assert_eq!(
            first.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["big-unlabelled", "small-unlabelled"]
        );

        let second = queue.drain_next().unwrap();
        assert_eq!(second[0].name, "replicated");
        assert!(queue.drain_next().is_none());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_bucket_queue_ties_break_on_path() {
        let mut queue = BucketQueue::default();
        queue.push(candidate("zeta", 10, 0));
        queue.push(candidate("alpha", 10, 0));

        let batch = queue.drain_next().unwrap();
        assert_eq!(batch[0].name, "alpha");
        assert_eq!(batch[1].name, "zeta");
    }

    #[test]
    fn test_bucket_queue_len_tracks_total() {
        let mut queue = BucketQueue::default();
        for i in 0..5 {
            queue.push(candidate(&format!("f{i}"), i, (i % 2) as usize));
        }
        assert_eq!(queue.len(), 5);
        let batch = queue.drain_next().unwrap();
        assert_eq!(queue.len(), 5 - batch.len());
    }
}
