//! Bounded-concurrency directory traversal.
//!
//! For each directory the walker obtains a fresh [`DirectoryHandler`] from
//! the caller's maker, feeds it every regular file, then lets it finish
//! (typically persisting its map) before fanning out into subdirectories on
//! a bounded thread pool.
//!
//! Failure semantics: a read error on one subtree never aborts its siblings;
//! per-file errors become warnings in the report. Only handler-declared
//! fatal errors (metadata persist failures, in practice) abort the walk.

use crate::config::IgnoreRules;
use crate::dirmap::{MapError, METADATA_FILE};
use crate::pool::CancelFlag;
use crate::volume::VOLUME_FILE;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum WalkError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Map(#[from] MapError),

    #[error("failed to build walker thread pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl WalkError {
    /// Whether this error aborts the whole walk rather than being downgraded
    /// to a warning. Per-file I/O failures are skippable; losing a metadata
    /// file is not.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WalkError::Io { .. })
    }
}

/// A non-fatal problem encountered during a walk.
#[derive(Debug)]
pub struct WalkWarning {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct WalkReport {
    pub dirs: usize,
    pub files: usize,
    pub warnings: Vec<WalkWarning>,
    pub cancelled: bool,
}

pub struct WalkOptions {
    /// Bound on concurrently traversed directories.
    pub threads: usize,
    pub ignore: IgnoreRules,
    pub cancel: CancelFlag,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            threads: 2,
            ignore: IgnoreRules::empty(),
            cancel: CancelFlag::new(),
        }
    }
}

/// Per-directory visitor capability.
pub trait DirectoryHandler: Send {
    /// Called once per regular file, in name order.
    fn on_file(&mut self, name: &str, meta: &fs::Metadata) -> Result<(), WalkError>;

    /// Opt in to visiting dot-files. The metadata and volume-label files are
    /// never visited regardless.
    fn visit_hidden(&self) -> bool {
        false
    }

    /// Called after the last file of the directory, before descending.
    fn on_finish(&mut self) -> Result<(), WalkError>;
}

struct WalkCtx<F> {
    maker: F,
    ignore: IgnoreRules,
    cancel: CancelFlag,
    dirs: AtomicUsize,
    files: AtomicUsize,
    warnings: Mutex<Vec<WalkWarning>>,
    fatal: Mutex<Option<WalkError>>,
}

impl<F> WalkCtx<F> {
    fn report(&self, path: &Path, err: WalkError) {
        if err.is_fatal() {
            let mut fatal = self.fatal.lock().unwrap();
            if fatal.is_none() {
                *fatal = Some(err);
            }
        } else {
            warn!(path = %path.display(), error = %err, "skipping");
            self.warnings.lock().unwrap().push(WalkWarning {
                path: path.to_path_buf(),
                message: err.to_string(),
            });
        }
    }

    fn aborted(&self) -> bool {
        self.fatal.lock().unwrap().is_some()
    }
}

/// Recursively visit every directory under `root`.
pub fn walk<H, F>(root: &Path, opts: &WalkOptions, maker: F) -> Result<WalkReport, WalkError>
where
    H: DirectoryHandler,
    F: Fn(&Path) -> Result<H, WalkError> + Sync,
{
    if !root.is_dir() {
        return Err(WalkError::Io {
            path: root.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotFound, "not a directory"),
        });
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.threads.max(1))
        .build()?;

    let ctx = WalkCtx {
        maker,
        ignore: opts.ignore.clone(),
        cancel: opts.cancel.clone(),
        dirs: AtomicUsize::new(0),
        files: AtomicUsize::new(0),
        warnings: Mutex::new(Vec::new()),
        fatal: Mutex::new(None),
    };

    pool.scope(|scope| visit_dir::<H, F>(root.to_path_buf(), scope, &ctx));

    if let Some(fatal) = ctx.fatal.into_inner().unwrap() {
        return Err(fatal);
    }
    Ok(WalkReport {
        dirs: ctx.dirs.into_inner(),
        files: ctx.files.into_inner(),
        warnings: ctx.warnings.into_inner().unwrap(),
        cancelled: ctx.cancel.is_cancelled(),
    })
}

fn visit_dir<'a, H, F>(dir: PathBuf, scope: &rayon::Scope<'a>, ctx: &'a WalkCtx<F>)
where
    H: DirectoryHandler,
    F: Fn(&Path) -> Result<H, WalkError> + Sync,
{
    if ctx.cancel.is_cancelled() || ctx.aborted() {
        return;
    }
    ctx.dirs.fetch_add(1, Ordering::Relaxed);

    let mut handler = match (ctx.maker)(&dir) {
        Ok(handler) => handler,
        Err(e) => {
            ctx.report(&dir, e);
            return;
        }
    };

    let mut files: Vec<(String, fs::Metadata)> = Vec::new();
    let mut subdirs: Vec<PathBuf> = Vec::new();

    match fs::read_dir(&dir) {
        Ok(entries) => {
            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        ctx.report(&dir, WalkError::Io { path: dir.clone(), source: e });
                        continue;
                    }
                };
                let name = match entry.file_name().into_string() {
                    Ok(name) => name,
                    Err(raw) => {
                        warn!(path = %dir.display(), ?raw, "skipping non-UTF-8 file name");
                        continue;
                    }
                };
                let path = entry.path();
                let file_type = match entry.file_type() {
                    Ok(ft) => ft,
                    Err(e) => {
                        ctx.report(&path, WalkError::Io { path: path.clone(), source: e });
                        continue;
                    }
                };

                if file_type.is_dir() {
                    if name.starts_with('.') || ctx.ignore.is_ignored(&path, true) {
                        continue;
                    }
                    subdirs.push(path);
                } else if file_type.is_file() {
                    if name == METADATA_FILE || name == VOLUME_FILE {
                        continue;
                    }
                    if name.starts_with('.') && !handler.visit_hidden() {
                        continue;
                    }
                    if ctx.ignore.is_ignored(&path, false) {
                        continue;
                    }
                    match entry.metadata() {
                        Ok(meta) => files.push((name, meta)),
                        Err(e) => {
                            ctx.report(&path, WalkError::Io { path: path.clone(), source: e })
                        }
                    }
                }
                // Symlinks and special files are not tracked.
            }
        }
        Err(e) => {
            ctx.report(&dir, WalkError::Io { path: dir.clone(), source: e });
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    subdirs.sort();

    for (name, meta) in &files {
        if ctx.cancel.is_cancelled() || ctx.aborted() {
            break;
        }
        match handler.on_file(name, meta) {
            Ok(()) => {
                ctx.files.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                let path = dir.join(name);
                let fatal = e.is_fatal();
                ctx.report(&path, e);
                if fatal {
                    break;
                }
            }
        }
    }

    if let Err(e) = handler.on_finish() {
        ctx.report(&dir, e);
        return;
    }

    for sub in subdirs {
        if ctx.cancel.is_cancelled() || ctx.aborted() {
            return;
        }
        scope.spawn(move |scope| visit_dir::<H, F>(sub, scope, ctx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirmap::DirectoryMap;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    /// Collects visited (dir, name) pairs.
    struct Collector {
        dir: PathBuf,
        seen: std::sync::Arc<Mutex<BTreeSet<(PathBuf, String)>>>,
        hidden: bool,
    }

    impl DirectoryHandler for Collector {
        fn on_file(&mut self, name: &str, _meta: &fs::Metadata) -> Result<(), WalkError> {
            self.seen.lock().unwrap().insert((self.dir.clone(), name.to_string()));
            Ok(())
        }

        fn visit_hidden(&self) -> bool {
            self.hidden
        }

        fn on_finish(&mut self) -> Result<(), WalkError> {
            Ok(())
        }
    }

    fn collect(root: &Path, hidden: bool) -> (WalkReport, BTreeSet<(PathBuf, String)>) {
        let seen = std::sync::Arc::new(Mutex::new(BTreeSet::new()));
        let report = walk(root, &WalkOptions::default(), |dir: &Path| {
            Ok(Collector { dir: dir.to_path_buf(), seen: seen.clone(), hidden })
        })
        .unwrap();
        let seen = seen.lock().unwrap().clone();
        (report, seen)
    }

    #[test]
    fn test_visits_nested_tree() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("top.txt"), b"t").unwrap();
        fs::create_dir_all(root.path().join("a/b")).unwrap();
        fs::write(root.path().join("a/mid.txt"), b"m").unwrap();
        fs::write(root.path().join("a/b/deep.txt"), b"d").unwrap();

        let (report, seen) = collect(root.path(), false);
        assert_eq!(report.dirs, 3);
        assert_eq!(report.files, 3);
        assert!(seen.contains(&(root.path().join("a/b"), "deep.txt".to_string())));
    }

    #[test]
    fn test_skips_hidden_and_metadata_files() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("normal.txt"), b"n").unwrap();
        fs::write(root.path().join(".hidden"), b"h").unwrap();
        fs::write(root.path().join(METADATA_FILE), b"<dir/>").unwrap();
        fs::write(root.path().join(VOLUME_FILE), b"<volume><label>X</label></volume>").unwrap();

        let (report, seen) = collect(root.path(), false);
        assert_eq!(report.files, 1);
        assert_eq!(seen.len(), 1);

        // Opting in to hidden files still never visits the metadata files.
        let (report, _) = collect(root.path(), true);
        assert_eq!(report.files, 2);
    }

    #[test]
    fn test_skips_hidden_directories() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join(".git")).unwrap();
        fs::write(root.path().join(".git/object"), b"o").unwrap();

        let (report, _) = collect(root.path(), true);
        assert_eq!(report.dirs, 1);
    }

    #[test]
    fn test_ignore_rules_prune_files_and_dirs() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("keep.txt"), b"k").unwrap();
        fs::write(root.path().join("skip.bak"), b"s").unwrap();
        fs::create_dir(root.path().join("cache")).unwrap();
        fs::write(root.path().join("cache/blob"), b"b").unwrap();

        let ignore = IgnoreRules::compile(
            root.path(),
            &["*.bak".to_string(), "cache/".to_string()],
        )
        .unwrap();
        let opts = WalkOptions { ignore, ..WalkOptions::default() };
        let seen = std::sync::Arc::new(Mutex::new(BTreeSet::new()));
        let report = walk(root.path(), &opts, |dir: &Path| {
            Ok(Collector { dir: dir.to_path_buf(), seen: seen.clone(), hidden: false })
        })
        .unwrap();

        assert_eq!(report.dirs, 1);
        assert_eq!(report.files, 1);
    }

    #[test]
    fn test_missing_root_is_error() {
        let root = tempdir().unwrap();
        let gone = root.path().join("nope");
        let result = walk(&gone, &WalkOptions::default(), |dir: &Path| {
            Ok(Collector {
                dir: dir.to_path_buf(),
                seen: Default::default(),
                hidden: false,
            })
        });
        assert!(matches!(result, Err(WalkError::Io { .. })));
    }

    #[test]
    fn test_cancel_stops_descent() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("a/b/c")).unwrap();

        let opts = WalkOptions::default();
        opts.cancel.cancel();
        let report = walk(root.path(), &opts, |dir: &Path| {
            Ok(Collector {
                dir: dir.to_path_buf(),
                seen: Default::default(),
                hidden: false,
            })
        })
        .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.dirs, 0);
    }

    /// Handler that persists a map entry per visited file.
    struct Recorder {
        map: DirectoryMap,
    }

    impl DirectoryHandler for Recorder {
        fn on_file(&mut self, name: &str, meta: &fs::Metadata) -> Result<(), WalkError> {
            self.map.update_from_stat(name, meta);
            Ok(())
        }

        fn on_finish(&mut self) -> Result<(), WalkError> {
            self.map.delete_missing();
            self.map.persist()?;
            Ok(())
        }
    }

    #[test]
    fn test_handler_persists_per_directory() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("f1.txt"), b"one").unwrap();
        fs::create_dir(root.path().join("sub")).unwrap();
        fs::write(root.path().join("sub/f2.txt"), b"two").unwrap();

        walk(root.path(), &WalkOptions::default(), |dir: &Path| {
            let (map, _) = DirectoryMap::load_lenient(dir);
            Ok(Recorder { map })
        })
        .unwrap();

        let top = DirectoryMap::load(root.path()).unwrap();
        assert!(top.get("f1.txt").is_some());
        let sub = DirectoryMap::load(&root.path().join("sub")).unwrap();
        assert!(sub.get("f2.txt").is_some());
    }
}
