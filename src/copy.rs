//! Atomic copy stage: src -> dst via a temp file, with digest verification
//! and metadata updates on both ends.
//!
//! A partially-written file is never observable under the destination path.
//! On crash the worst leftover is a `*.tmp` next to the destination, which
//! the next copy of that file removes before starting.

use crate::digest::{self, Digest, Hasher};
use crate::dirmap::{mtime_secs, DirectoryMap, FileRecord, MapError};
use crate::volume::VolumeLabel;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

// 256KB: optimal for modern SSD throughput
const COPY_BUFFER_SIZE: usize = 256 * 1024;

const TMP_SUFFIX: &str = ".tmp";

#[derive(Error, Debug)]
pub enum CopyError {
    #[error("no space left on device writing {path}")]
    NoSpace { path: PathBuf },

    #[error("copy verification failed for {path}: expected {expected}, got {got}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: Digest,
        got: Digest,
    },

    #[error("no metadata record for {path}")]
    MissingEntry { path: PathBuf },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Map(#[from] MapError),
}

impl CopyError {
    pub fn is_no_space(&self) -> bool {
        matches!(self, CopyError::NoSpace { .. })
    }

    /// Per-file failures a later run can repair; the planner logs and skips
    /// these instead of aborting.
    pub fn is_skippable(&self) -> bool {
        matches!(self, CopyError::Io { .. })
    }
}

fn classify(path: &Path, source: io::Error) -> CopyError {
    if source.kind() == io::ErrorKind::StorageFull {
        CopyError::NoSpace { path: path.to_path_buf() }
    } else {
        CopyError::Io { path: path.to_path_buf(), source }
    }
}

/// One unit of work for a [`CopyAgent`]: copy `src_dir/name` to
/// `dst_dir/name` and account it under `label`.
#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub src_dir: PathBuf,
    pub dst_dir: PathBuf,
    pub name: String,
    pub label: VolumeLabel,
}

impl CopyRequest {
    pub fn src_path(&self) -> PathBuf {
        self.src_dir.join(&self.name)
    }

    pub fn dst_path(&self) -> PathBuf {
        self.dst_dir.join(&self.name)
    }
}

/// The copy operation the backup planner drives. Tests substitute an
/// in-process double to observe ordering or inject failures.
pub trait CopyAgent: Sync {
    fn copy(&self, req: &CopyRequest) -> Result<(), CopyError>;
}

/// Size, mtime and digest observed on the destination after a copy.
#[derive(Debug, Clone, Copy)]
pub struct CopiedFile {
    pub size: u64,
    pub mtime: i64,
    pub digest: Digest,
}

fn tmp_path(dst: &Path) -> PathBuf {
    let mut os = dst.as_os_str().to_os_string();
    os.push(TMP_SUFFIX);
    PathBuf::from(os)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Copy `src` to `dst` atomically, verifying content on the way.
///
/// The source is hashed while it streams into `dst.tmp`; the temp file is
/// then re-hashed and must agree before it is renamed into place. The
/// source mtime is carried over best-effort.
pub fn copy_file_atomic(src: &Path, dst: &Path) -> Result<CopiedFile, CopyError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| classify(parent, e))?;
    }
    let tmp = tmp_path(dst);
    remove_if_present(&tmp).map_err(|e| classify(&tmp, e))?;

    let result = write_and_verify(src, dst, &tmp);
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_and_verify(src: &Path, dst: &Path, tmp: &Path) -> Result<CopiedFile, CopyError> {
    let src_file = File::open(src).map_err(|e| classify(src, e))?;
    let src_meta = src_file.metadata().map_err(|e| classify(src, e))?;

    let mut reader = BufReader::with_capacity(COPY_BUFFER_SIZE, src_file);
    let out = File::create(tmp).map_err(|e| classify(tmp, e))?;
    let mut writer = BufWriter::with_capacity(COPY_BUFFER_SIZE, out);
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut hasher = Hasher::new();

    loop {
        let bytes_read = reader.read(&mut buffer).map_err(|e| classify(src, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        writer.write_all(&buffer[..bytes_read]).map_err(|e| classify(tmp, e))?;
    }
    writer.flush().map_err(|e| classify(tmp, e))?;
    writer
        .into_inner()
        .map_err(|e| classify(tmp, e.into_error()))?
        .sync_all()
        .map_err(|e| classify(tmp, e))?;

    let src_digest = hasher.finalize();
    let tmp_digest = digest::hash_file(tmp).map_err(|e| classify(tmp, e))?;
    if src_digest != tmp_digest {
        return Err(CopyError::ChecksumMismatch {
            path: dst.to_path_buf(),
            expected: src_digest,
            got: tmp_digest,
        });
    }

    if let Ok(modified) = src_meta.modified() {
        if let Err(e) = File::open(tmp).and_then(|f| f.set_modified(modified)) {
            warn!(path = %tmp.display(), error = %e, "could not carry over mtime");
        }
    }

    // Required on platforms whose rename does not replace.
    remove_if_present(dst).map_err(|e| classify(dst, e))?;
    fs::rename(tmp, dst).map_err(|e| classify(dst, e))?;

    let dst_meta = fs::metadata(dst).map_err(|e| classify(dst, e))?;
    Ok(CopiedFile {
        size: dst_meta.len(),
        mtime: mtime_secs(&dst_meta),
        digest: src_digest,
    })
}

/// Default copy agent: performs the atomic copy, then records the new
/// volume label in the source map and the new file in the destination map.
///
/// Metadata updates for both maps happen under one lock so concurrent
/// copies into the same directory serialize their read-modify-write.
pub struct VolumeCopier {
    meta: Mutex<()>,
}

impl VolumeCopier {
    pub fn new() -> Self {
        Self { meta: Mutex::new(()) }
    }
}

impl Default for VolumeCopier {
    fn default() -> Self {
        Self::new()
    }
}

impl CopyAgent for VolumeCopier {
    fn copy(&self, req: &CopyRequest) -> Result<(), CopyError> {
        let copied = copy_file_atomic(&req.src_path(), &req.dst_path())?;

        let _guard = self.meta.lock().unwrap();
        record_source_label(&req.src_dir, &req.name, &req.label)?;
        record_destination_file(&req.dst_dir, &req.name, &copied)?;
        Ok(())
    }
}

fn record_source_label(dir: &Path, name: &str, label: &VolumeLabel) -> Result<(), CopyError> {
    let mut map = DirectoryMap::load(dir)?;
    if !map.add_volume(name, label) {
        // The record vanished between scan and copy: out-of-band change.
        return Err(CopyError::MissingEntry { path: dir.join(name) });
    }
    map.persist()?;
    Ok(())
}

/// Insert the destination-side record for a freshly copied file.
pub fn record_destination_file(
    dir: &Path,
    name: &str,
    copied: &CopiedFile,
) -> Result<(), CopyError> {
    let (mut map, warning) = DirectoryMap::load_lenient(dir);
    if let Some(w) = warning {
        warn!(dir = %dir.display(), error = %w, "destination metadata unreadable, rebuilding");
    }
    let mut record = FileRecord::new(name, copied.size, copied.mtime);
    record.digest = Some(copied.digest);
    map.add(record);
    map.persist()?;
    Ok(())
}
