//! Per-directory metadata: one `.medorg.xml` per tracked directory.
//!
//! The map holds one record per file (name, size, mtime, digest, volume
//! labels) keyed by file name. Persistence is atomic (temp file + rename);
//! an absent or empty metadata file loads as an empty map, and unknown
//! attributes or elements in the XML are tolerated on read.

use crate::digest::Digest;
use crate::volume::VolumeLabel;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;

/// Fixed name of the per-directory metadata file.
pub const METADATA_FILE: &str = ".medorg.xml";
const METADATA_TMP: &str = ".medorg.xml.tmp";

const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

#[derive(Error, Debug)]
pub enum MapError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed metadata in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: quick_xml::DeError,
    },

    #[error("failed to serialize metadata for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: quick_xml::SeError,
    },
}

/// Metadata for one file within its directory.
///
/// The volume-label set contains only labels for which a byte-identical copy
/// is believed to exist. Whenever (size, mtime) changes on disk, the digest
/// and the label set are cleared together: stale labels must never outlive
/// the content they described.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(rename = "@name")]
    pub name: String,

    #[serde(rename = "@size")]
    pub size: u64,

    /// Last-modified time, integer seconds since the Unix epoch.
    #[serde(rename = "@mtime")]
    pub mtime: i64,

    #[serde(rename = "@chk", default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,

    #[serde(rename = "vol", default, skip_serializing_if = "BTreeSet::is_empty")]
    pub volumes: BTreeSet<VolumeLabel>,
}

impl FileRecord {
    pub fn new(name: impl Into<String>, size: u64, mtime: i64) -> Self {
        Self {
            name: name.into(),
            size,
            mtime,
            digest: None,
            volumes: BTreeSet::new(),
        }
    }

    pub fn matches_stat(&self, size: u64, mtime: i64) -> bool {
        self.size == size && self.mtime == mtime
    }

    pub fn has_volume(&self, label: &VolumeLabel) -> bool {
        self.volumes.contains(label)
    }
}

/// What a [`DirectoryMap::for_each`] visitor wants done with the entry.
pub enum Visit {
    Keep,
    Drop,
    Update(FileRecord),
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename = "dir")]
struct DirDoc {
    #[serde(rename = "file", default)]
    files: Vec<FileRecord>,
}

/// In-memory view of one directory's metadata file.
pub struct DirectoryMap {
    dir: PathBuf,
    files: BTreeMap<String, FileRecord>,
    dirty: bool,
}

impl DirectoryMap {
    /// An empty map bound to `dir`, not yet persisted.
    pub fn empty(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), files: BTreeMap::new(), dirty: false }
    }

    /// Load the map for `dir`. A missing or empty metadata file yields an
    /// empty map; only real I/O failures and malformed XML are errors.
    pub fn load(dir: &Path) -> Result<Self, MapError> {
        let path = dir.join(METADATA_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Self::empty(dir));
            }
            Err(e) => return Err(MapError::Io { path, source: e }),
        };
        if text.trim().is_empty() {
            return Ok(Self::empty(dir));
        }
        let doc: DirDoc =
            quick_xml::de::from_str(&text).map_err(|source| MapError::Parse { path, source })?;
        let mut files = BTreeMap::new();
        for record in doc.files {
            files.insert(record.name.clone(), record);
        }
        Ok(Self { dir: dir.to_path_buf(), files, dirty: false })
    }

    /// Load, degrading a corrupt metadata file to an empty (dirty) map. The
    /// returned error, if any, is a warning for the caller to surface.
    pub fn load_lenient(dir: &Path) -> (Self, Option<MapError>) {
        match Self::load(dir) {
            Ok(map) => (map, None),
            Err(e @ MapError::Parse { .. }) => {
                let mut map = Self::empty(dir);
                map.dirty = true;
                (map, Some(e))
            }
            Err(e) => (Self::empty(dir), Some(e)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the metadata file this map persists to.
    pub fn file_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&FileRecord> {
        self.files.get(name)
    }

    /// Insert or overwrite by name.
    pub fn add(&mut self, record: FileRecord) {
        self.files.insert(record.name.clone(), record);
        self.dirty = true;
    }

    pub fn remove(&mut self, name: &str) -> Option<FileRecord> {
        let removed = self.files.remove(name);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileRecord)> {
        self.files.iter().map(|(name, record)| (name.as_str(), record))
    }

    /// Reconcile one entry with the stat just taken from disk. When (size,
    /// mtime) differ from the stored record, the digest and volume-label set
    /// are cleared; both stay empty until the next checksum pass. Returns
    /// whether anything changed.
    pub fn update_from_stat(&mut self, name: &str, meta: &fs::Metadata) -> bool {
        let size = meta.len();
        let mtime = mtime_secs(meta);
        if let Some(record) = self.files.get_mut(name) {
            if record.matches_stat(size, mtime) {
                return false;
            }
            record.size = size;
            record.mtime = mtime;
            record.digest = None;
            record.volumes.clear();
            self.dirty = true;
            return true;
        }
        self.add(FileRecord::new(name, size, mtime));
        true
    }

    /// Set the digest of an existing entry.
    pub fn set_digest(&mut self, name: &str, digest: Digest) -> bool {
        match self.files.get_mut(name) {
            Some(record) => {
                record.digest = Some(digest);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Drop an entry's digest and volume-label set, forcing the next
    /// checksum pass to start from scratch.
    pub fn clear_digest(&mut self, name: &str) {
        if let Some(record) = self.files.get_mut(name) {
            if record.digest.is_some() || !record.volumes.is_empty() {
                record.digest = None;
                record.volumes.clear();
                self.dirty = true;
            }
        }
    }

    /// Add `label` to an entry's volume set. Returns false if there is no
    /// entry under `name`.
    pub fn add_volume(&mut self, name: &str, label: &VolumeLabel) -> bool {
        match self.files.get_mut(name) {
            Some(record) => {
                if record.volumes.insert(label.clone()) {
                    self.dirty = true;
                }
                true
            }
            None => false,
        }
    }

    pub fn remove_volume(&mut self, name: &str, label: &VolumeLabel) {
        if let Some(record) = self.files.get_mut(name) {
            if record.volumes.remove(label) {
                self.dirty = true;
            }
        }
    }

    /// Remove every entry whose file no longer exists on disk.
    pub fn delete_missing(&mut self) {
        let before = self.files.len();
        let dir = self.dir.clone();
        self.files.retain(|name, _| dir.join(name).is_file());
        if self.files.len() != before {
            self.dirty = true;
        }
    }

    /// Visit every entry; the visitor decides whether it is kept, dropped,
    /// or replaced.
    pub fn for_each<F>(&mut self, mut visitor: F)
    where
        F: FnMut(&str, &FileRecord) -> Visit,
    {
        let names: Vec<String> = self.files.keys().cloned().collect();
        for name in names {
            let record = &self.files[&name];
            match visitor(&name, record) {
                Visit::Keep => {}
                Visit::Drop => {
                    self.files.remove(&name);
                    self.dirty = true;
                }
                Visit::Update(mut updated) => {
                    updated.name = name.clone();
                    self.files.insert(name, updated);
                    self.dirty = true;
                }
            }
        }
    }

    /// Write the metadata file atomically. An empty map removes the file;
    /// a clean map is a no-op.
    pub fn persist(&mut self) -> Result<(), MapError> {
        if !self.dirty {
            return Ok(());
        }
        let path = self.file_path();
        let tmp = self.dir.join(METADATA_TMP);

        if self.files.is_empty() {
            for stale in [&path, &tmp] {
                match fs::remove_file(stale) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(MapError::Io { path: stale.clone(), source: e }),
                }
            }
            self.dirty = false;
            return Ok(());
        }

        let doc = DirDoc { files: self.files.values().cloned().collect() };
        let xml = quick_xml::se::to_string(&doc)
            .map_err(|source| MapError::Serialize { path: path.clone(), source })?;

        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(XML_DECL.as_bytes())?;
            file.write_all(xml.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|source| MapError::Io { path: path.clone(), source })?;
        self.dirty = false;
        Ok(())
    }
}

/// Modification time as integer seconds since the Unix epoch.
pub fn mtime_secs(meta: &fs::Metadata) -> i64 {
    match meta.modified() {
        Ok(t) => match t.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        },
        Err(_) => 0,
    }
}
