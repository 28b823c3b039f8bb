//! Restore planner: bring journal-listed files back from an attached backup
//! volume to their configured destinations.
//!
//! Only files whose recorded label set contains the attached volume's label
//! can be satisfied this run; for everything else the summary reports which
//! volumes are still needed. Per-file failures never abort a restore, and a
//! re-run completes whatever is still missing.

use crate::config::Config;
use crate::copy::copy_file_atomic;
use crate::digest::{self, Digest};
use crate::dirmap::{DirectoryMap, FileRecord};
use crate::journal::{Journal, JournalError};
use crate::pool::CancelFlag;
use crate::volume::{self, VolumeError, VolumeLabel};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Journal(#[from] JournalError),
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub cancel: CancelFlag,
}

#[derive(Debug, Default)]
pub struct RestoreSummary {
    pub restored: usize,
    pub already_correct: usize,
    pub failed: usize,
    /// Aliases the configuration could not resolve to a destination.
    pub skipped_aliases: Vec<String>,
    /// Volume labels that must be attached to complete the restore.
    pub needed: BTreeSet<VolumeLabel>,
    pub cancelled: bool,
}

/// The digest currently at `dir/name`, trusting the map's record when its
/// (size, mtime) still match and hashing otherwise. Returns `None` when the
/// file is absent or unreadable.
fn current_digest(map: &mut DirectoryMap, name: &str) -> Option<Digest> {
    let path = map.dir().join(name);
    let meta = match fs::metadata(&path) {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return None,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot stat");
            return None;
        }
    };
    map.update_from_stat(name, &meta);
    if let Some(existing) = map.get(name).and_then(|r| r.digest) {
        return Some(existing);
    }
    match digest::hash_file(&path) {
        Ok(computed) => {
            map.set_digest(name, computed);
            Some(computed)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot hash");
            None
        }
    }
}

fn entry_subdir(root: &Path, rel: &Path) -> PathBuf {
    if rel == Path::new(".") {
        root.to_path_buf()
    } else {
        root.join(rel)
    }
}

/// Restore from `journal_path`, copying out of the attached volume.
pub fn run_restore(
    journal_path: &Path,
    attached: &Path,
    config: &Config,
    opts: &RestoreOptions,
) -> Result<RestoreSummary, RestoreError> {
    let label = volume::read_label(attached)?;
    let journal = Journal::load(journal_path)?;
    let mut summary = RestoreSummary::default();
    let mut unresolved: BTreeSet<String> = BTreeSet::new();

    'entries: for entry in journal.entries() {
        if opts.cancel.is_cancelled() {
            break;
        }
        let Some(dest_root) = config.resolve_restore(&entry.alias) else {
            if unresolved.insert(entry.alias.clone()) {
                warn!(alias = %entry.alias, "no restore destination configured, skipping");
            }
            continue;
        };
        let dest_dir = entry_subdir(dest_root, &entry.dir);
        let src_dir = entry_subdir(attached, &entry.dir);

        let (mut map, map_warning) = DirectoryMap::load_lenient(&dest_dir);
        if let Some(w) = map_warning {
            warn!(dir = %dest_dir.display(), error = %w, "destination metadata unreadable");
        }

        for file in &entry.files {
            if opts.cancel.is_cancelled() {
                let _ = map.persist();
                break 'entries;
            }
            let Some(wanted) = file.digest else {
                // Journals written before a checksum pass carry no digest;
                // nothing to verify against.
                continue;
            };

            if current_digest(&mut map, &file.name) == Some(wanted) {
                summary.already_correct += 1;
                continue;
            }

            if !file.has_volume(&label) {
                summary.needed.extend(file.volumes.iter().cloned());
                continue;
            }

            let src = src_dir.join(&file.name);
            let dst = dest_dir.join(&file.name);
            match copy_file_atomic(&src, &dst) {
                Ok(copied) if copied.digest == wanted => {
                    let mut record = FileRecord::new(&file.name, copied.size, copied.mtime);
                    record.digest = Some(copied.digest);
                    record.volumes = file.volumes.clone();
                    map.add(record);
                    summary.restored += 1;
                }
                Ok(copied) => {
                    warn!(
                        path = %src.display(),
                        expected = %wanted,
                        got = %copied.digest,
                        "volume copy does not match journal"
                    );
                    // Record what actually landed so a later run sees it.
                    let mut record = FileRecord::new(&file.name, copied.size, copied.mtime);
                    record.digest = Some(copied.digest);
                    map.add(record);
                    summary.failed += 1;
                    summary.needed.extend(
                        file.volumes.iter().filter(|v| **v != label).cloned(),
                    );
                }
                Err(e) => {
                    warn!(path = %src.display(), error = %e, "restore copy failed");
                    summary.failed += 1;
                }
            }
        }

        if let Err(e) = map.persist() {
            warn!(dir = %dest_dir.display(), error = %e, "could not persist metadata");
        }
    }

    summary.skipped_aliases = unresolved.into_iter().collect();
    summary.cancelled = opts.cancel.is_cancelled();
    info!(
        restored = summary.restored,
        already_correct = summary.already_correct,
        failed = summary.failed,
        needed = ?summary.needed,
        "restore complete"
    );
    Ok(summary)
}
