//! Checksum engine: computes, refreshes and validates content digests under
//! a global concurrency cap.
//!
//! Every hash computation holds a token from the engine's pool for its full
//! duration; the optional adaptive tuner resizes that pool while a run is in
//! flight. The engine reports what it did per file as a [`ChecksumOutcome`]
//! rather than smuggling sentinels through the error path.

use crate::config::{ConfigError, IgnoreRules};
use crate::digest::{self, Digest};
use crate::dirmap::DirectoryMap;
use crate::pool::{CancelFlag, TokenPool};
use crate::tuner::{Tuner, TunerConfig};
use crate::walk::{self, DirectoryHandler, WalkError, WalkOptions, WalkWarning};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

/// Default cap on simultaneous hash computations.
pub const DEFAULT_HASH_TOKENS: usize = 2;

#[derive(Error, Debug)]
pub enum ChecksumError {
    #[error(transparent)]
    Walk(#[from] WalkError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// What one digest operation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumOutcome {
    /// A digest was computed and stored.
    Computed,
    /// The stored digest was present and trusted (or revalidated).
    AlreadyValid,
    /// The stored digest was empty and has now been filled in.
    FilledIn,
    /// Recomputation disagreed with the stored digest, which was left intact.
    Mismatch { expected: Digest, got: Digest },
}

/// Hash computations gated by a shared token pool.
pub struct ChecksumEngine {
    pool: Arc<TokenPool>,
    tuner: Option<Arc<Tuner>>,
}

impl ChecksumEngine {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            pool: TokenPool::new(max_concurrent.max(1)),
            tuner: None,
        }
    }

    /// An engine whose pool size is managed by an adaptive tuner.
    pub fn with_tuner(max_concurrent: usize, config: TunerConfig) -> Self {
        let pool = TokenPool::new(max_concurrent.max(1));
        let tuner = Tuner::new(Arc::clone(&pool), config);
        Self { pool, tuner: Some(tuner) }
    }

    pub fn pool(&self) -> &Arc<TokenPool> {
        &self.pool
    }

    pub fn tuner(&self) -> Option<&Arc<Tuner>> {
        self.tuner.as_ref()
    }

    /// Digest a file's contents, holding a pool token for the duration.
    pub fn compute(&self, path: &Path) -> io::Result<Digest> {
        let _token = self.pool.acquire();
        match &self.tuner {
            Some(tuner) => digest::hash_file_with_progress(path, |n| tuner.add_bytes(n as u64)),
            None => digest::hash_file(path),
        }
    }

    /// Compute and store the digest for `name` unless a trusted one is
    /// already present (`force` recomputes regardless).
    pub fn refresh(
        &self,
        map: &mut DirectoryMap,
        name: &str,
        force: bool,
    ) -> io::Result<ChecksumOutcome> {
        let record = map
            .get(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no record for {name}")))?;
        if !force && record.digest.is_some() {
            return Ok(ChecksumOutcome::AlreadyValid);
        }
        let computed = self.compute(&map.dir().join(name))?;
        map.set_digest(name, computed);
        Ok(ChecksumOutcome::Computed)
    }

    /// Recompute and compare against the stored digest. A mismatch never
    /// overwrites the stored value; an empty stored digest is filled in.
    pub fn validate(&self, map: &mut DirectoryMap, name: &str) -> io::Result<ChecksumOutcome> {
        let stored = map
            .get(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no record for {name}")))?
            .digest;
        let got = self.compute(&map.dir().join(name))?;
        match stored {
            None => {
                map.set_digest(name, got);
                Ok(ChecksumOutcome::FilledIn)
            }
            Some(expected) if expected == got => Ok(ChecksumOutcome::AlreadyValid),
            Some(expected) => Ok(ChecksumOutcome::Mismatch { expected, got }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChecksumOptions {
    /// Recompute digests even when (size, mtime) are unchanged.
    pub force: bool,
    /// Compare recomputed digests against stored ones instead of trusting
    /// unchanged stats.
    pub validate: bool,
    /// Drop stored digests and volume labels before recomputing.
    pub scrub: bool,
    pub max_concurrent: usize,
    /// Let the adaptive tuner resize the hash pool during the run.
    pub tune: bool,
    pub tuner: TunerConfig,
    pub ignore_patterns: Vec<String>,
    pub cancel: CancelFlag,
}

impl Default for ChecksumOptions {
    fn default() -> Self {
        Self {
            force: false,
            validate: false,
            scrub: false,
            max_concurrent: DEFAULT_HASH_TOKENS,
            tune: false,
            tuner: TunerConfig::default(),
            ignore_patterns: Vec::new(),
            cancel: CancelFlag::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ChecksumReport {
    pub dirs: usize,
    pub files: usize,
    pub hashed: usize,
    pub bytes_hashed: u64,
    /// Files whose stored digest disagreed with recomputation (validate mode).
    pub mismatches: Vec<PathBuf>,
    pub warnings: Vec<WalkWarning>,
    pub cancelled: bool,
}

#[derive(Default)]
struct ScanStats {
    hashed: AtomicUsize,
    bytes: AtomicU64,
    mismatches: Mutex<Vec<PathBuf>>,
}

struct ScanHandler<'a> {
    map: DirectoryMap,
    engine: &'a ChecksumEngine,
    opts: &'a ChecksumOptions,
    stats: &'a ScanStats,
}

impl DirectoryHandler for ScanHandler<'_> {
    fn on_file(&mut self, name: &str, meta: &fs::Metadata) -> Result<(), WalkError> {
        self.map.update_from_stat(name, meta);
        if self.opts.scrub {
            self.map.clear_digest(name);
        }

        let outcome = if self.opts.validate {
            self.engine.validate(&mut self.map, name)
        } else {
            self.engine.refresh(&mut self.map, name, self.opts.force)
        };

        let path = || self.map.dir().join(name);
        match outcome {
            Err(source) => Err(WalkError::Io { path: path(), source }),
            Ok(ChecksumOutcome::AlreadyValid) => {
                if self.opts.validate {
                    self.stats.hashed.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes.fetch_add(meta.len(), Ordering::Relaxed);
                }
                Ok(())
            }
            Ok(ChecksumOutcome::Computed | ChecksumOutcome::FilledIn) => {
                self.stats.hashed.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes.fetch_add(meta.len(), Ordering::Relaxed);
                Ok(())
            }
            Ok(ChecksumOutcome::Mismatch { expected, got }) => {
                let path = path();
                warn!(path = %path.display(), %expected, %got, "checksum mismatch");
                self.stats.hashed.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes.fetch_add(meta.len(), Ordering::Relaxed);
                self.stats.mismatches.lock().unwrap().push(path);
                Ok(())
            }
        }
    }

    fn on_finish(&mut self) -> Result<(), WalkError> {
        self.map.delete_missing();
        self.map.persist()?;
        Ok(())
    }
}

/// Bring the metadata of every directory under `dirs` up to date.
///
/// Safe to invoke repeatedly: files whose (size, mtime) match their record
/// are not re-hashed unless `force` or `validate` is set.
pub fn run_checksums(dirs: &[PathBuf], opts: &ChecksumOptions) -> Result<ChecksumReport, ChecksumError> {
    let engine = if opts.tune {
        ChecksumEngine::with_tuner(opts.max_concurrent, opts.tuner.clone())
    } else {
        ChecksumEngine::new(opts.max_concurrent)
    };
    run_checksums_with(dirs, opts, &engine)
}

/// As [`run_checksums`], against a caller-supplied engine (the backup
/// planner shares one engine across the destination and all sources).
pub fn run_checksums_with(
    dirs: &[PathBuf],
    opts: &ChecksumOptions,
    engine: &ChecksumEngine,
) -> Result<ChecksumReport, ChecksumError> {
    let stats = ScanStats::default();
    let mut report = ChecksumReport::default();

    // With a tuner the walker needs spare threads for the pool to grow into.
    let threads = if engine.tuner().is_some() {
        opts.tuner.max_tokens
    } else {
        opts.max_concurrent
    };

    let tuner_thread = engine.tuner().map(|tuner| {
        let tuner = Arc::clone(tuner);
        let stop = CancelFlag::new();
        let signal = stop.clone();
        (std::thread::spawn(move || tuner.run(&signal)), stop)
    });

    let result: Result<(), ChecksumError> = (|| {
        for dir in dirs {
            if opts.cancel.is_cancelled() {
                break;
            }
            let ignore = IgnoreRules::compile(dir, &opts.ignore_patterns)?;
            let walk_opts = WalkOptions {
                threads,
                ignore,
                cancel: opts.cancel.clone(),
            };
            let sub = walk::walk(dir, &walk_opts, |d: &Path| {
                let (map, warning) = DirectoryMap::load_lenient(d);
                if let Some(w) = warning {
                    warn!(dir = %d.display(), error = %w, "metadata unreadable, rebuilding");
                }
                Ok(ScanHandler { map, engine, opts, stats: &stats })
            })?;
            report.dirs += sub.dirs;
            report.files += sub.files;
            report.warnings.extend(sub.warnings);
        }
        Ok(())
    })();

    if let Some((handle, stop)) = tuner_thread {
        stop.cancel();
        let _ = handle.join();
    }
    result?;

    report.hashed = stats.hashed.into_inner();
    report.bytes_hashed = stats.bytes.into_inner();
    report.mismatches = stats.mismatches.into_inner().unwrap();
    report.cancelled = opts.cancel.is_cancelled();
    info!(
        dirs = report.dirs,
        files = report.files,
        hashed = report.hashed,
        "checksum pass complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    fn run(dirs: &[PathBuf], opts: &ChecksumOptions) -> ChecksumReport {
        run_checksums(dirs, opts).unwrap()
    }

    #[test]
    fn test_clean_scan_records_digests() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("f1.txt"), b"content one").unwrap();
        fs::write(root.path().join("f2.dat"), b"content two different").unwrap();

        let report = run(&[root.path().to_path_buf()], &ChecksumOptions::default());
        assert_eq!(report.files, 2);
        assert_eq!(report.hashed, 2);

        let map = DirectoryMap::load(root.path()).unwrap();
        assert_eq!(map.len(), 2);
        let f1 = map.get("f1.txt").unwrap();
        assert_eq!(f1.size, 11);
        assert_eq!(f1.digest, Some(Digest::of_bytes(b"content one")));
        assert!(f1.volumes.is_empty());
        let f2 = map.get("f2.dat").unwrap();
        assert_eq!(f2.digest, Some(Digest::of_bytes(b"content two different")));
    }

    #[test]
    fn test_second_scan_hashes_nothing() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("f.txt"), b"stable").unwrap();

        run(&[root.path().to_path_buf()], &ChecksumOptions::default());
        let report = run(&[root.path().to_path_buf()], &ChecksumOptions::default());
        assert_eq!(report.hashed, 0);
    }

    #[test]
    fn test_force_rehashes() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("f.txt"), b"stable").unwrap();

        run(&[root.path().to_path_buf()], &ChecksumOptions::default());
        let opts = ChecksumOptions { force: true, ..ChecksumOptions::default() };
        let report = run(&[root.path().to_path_buf()], &opts);
        assert_eq!(report.hashed, 1);
    }

    #[test]
    fn test_changed_file_rehashed() {
        let root = tempdir().unwrap();
        let file = root.path().join("f.txt");
        fs::write(&file, b"before").unwrap();
        run(&[root.path().to_path_buf()], &ChecksumOptions::default());

        fs::write(&file, b"after, and longer").unwrap();
        let report = run(&[root.path().to_path_buf()], &ChecksumOptions::default());
        assert_eq!(report.hashed, 1);

        let map = DirectoryMap::load(root.path()).unwrap();
        assert_eq!(
            map.get("f.txt").unwrap().digest,
            Some(Digest::of_bytes(b"after, and longer"))
        );
    }

    #[test]
    fn test_validate_detects_silent_corruption() {
        let root = tempdir().unwrap();
        let file = root.path().join("f.bin");
        fs::write(&file, b"original").unwrap();
        run(&[root.path().to_path_buf()], &ChecksumOptions::default());

        // Same size, same mtime, different bytes: invisible to a plain scan.
        let mtime = fs::metadata(&file).unwrap().modified().unwrap();
        fs::write(&file, b"0riginal").unwrap();
        File::open(&file).unwrap().set_modified(mtime).unwrap();

        let plain = run(&[root.path().to_path_buf()], &ChecksumOptions::default());
        assert_eq!(plain.hashed, 0);
        assert!(plain.mismatches.is_empty());

        let opts = ChecksumOptions { validate: true, ..ChecksumOptions::default() };
        let report = run(&[root.path().to_path_buf()], &opts);
        assert_eq!(report.mismatches, vec![file]);

        // The stored digest is not overwritten by a failed validation.
        let map = DirectoryMap::load(root.path()).unwrap();
        assert_eq!(map.get("f.bin").unwrap().digest, Some(Digest::of_bytes(b"original")));
    }

    #[test]
    fn test_zero_byte_file_recorded() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("empty"), b"").unwrap();

        run(&[root.path().to_path_buf()], &ChecksumOptions::default());
        let map = DirectoryMap::load(root.path()).unwrap();
        let rec = map.get("empty").unwrap();
        assert_eq!(rec.size, 0);
        assert_eq!(rec.digest, Some(Digest::of_bytes(b"")));
    }

    #[test]
    fn test_vanished_files_pruned() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("stays.txt"), b"s").unwrap();
        fs::write(root.path().join("goes.txt"), b"g").unwrap();
        run(&[root.path().to_path_buf()], &ChecksumOptions::default());

        fs::remove_file(root.path().join("goes.txt")).unwrap();
        run(&[root.path().to_path_buf()], &ChecksumOptions::default());

        let map = DirectoryMap::load(root.path()).unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.get("goes.txt").is_none());
    }

    #[test]
    fn test_scrub_clears_volumes() {
        use crate::volume::VolumeLabel;

        let root = tempdir().unwrap();
        fs::write(root.path().join("f.txt"), b"data").unwrap();
        run(&[root.path().to_path_buf()], &ChecksumOptions::default());

        let mut map = DirectoryMap::load(root.path()).unwrap();
        map.add_volume("f.txt", &VolumeLabel::new("VOL1").unwrap());
        map.persist().unwrap();

        let opts = ChecksumOptions { scrub: true, ..ChecksumOptions::default() };
        let report = run(&[root.path().to_path_buf()], &opts);
        assert_eq!(report.hashed, 1);

        let map = DirectoryMap::load(root.path()).unwrap();
        let rec = map.get("f.txt").unwrap();
        assert!(rec.volumes.is_empty());
        assert_eq!(rec.digest, Some(Digest::of_bytes(b"data")));
    }

    #[test]
    fn test_corrupt_metadata_rebuilt() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("f.txt"), b"data").unwrap();
        fs::write(root.path().join(crate::dirmap::METADATA_FILE), b"<dir><broken").unwrap();

        let report = run(&[root.path().to_path_buf()], &ChecksumOptions::default());
        assert_eq!(report.hashed, 1);
        let map = DirectoryMap::load(root.path()).unwrap();
        assert!(map.get("f.txt").is_some());
    }

    #[test]
    fn test_tuned_engine_counts_bytes() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("f.bin"), vec![7u8; 4096]).unwrap();

        let opts = ChecksumOptions { tune: true, ..ChecksumOptions::default() };
        let engine = ChecksumEngine::with_tuner(opts.max_concurrent, opts.tuner.clone());
        run_checksums_with(&[root.path().to_path_buf()], &opts, &engine).unwrap();

        let tuner = engine.tuner().unwrap();
        tuner.tick(std::time::Duration::from_secs(1));
        let history = tuner.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].bytes_per_sec >= 4096.0);
    }
}
