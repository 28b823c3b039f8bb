//! Portable journal: every tracked file per alias, with its digest and the
//! volume labels holding a copy. The journal is what a restore works from,
//! so it must survive the trip to another machine as plain XML.

use crate::config::SourceRoot;
use crate::dirmap::{DirectoryMap, FileRecord};
use crate::walk::{self, DirectoryHandler, WalkError, WalkOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("journal entry without an alias")]
    AliasRequired,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed journal: {0}")]
    Parse(#[from] quick_xml::DeError),

    #[error("failed to serialize journal: {0}")]
    Serialize(#[from] quick_xml::SeError),
}

/// All files of one directory under one alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub alias: String,
    /// Directory path relative to the alias root; `.` for the root itself.
    pub dir: PathBuf,
    pub files: Vec<FileRecord>,
}

#[derive(Serialize, Deserialize)]
struct DirElement {
    #[serde(rename = "@path")]
    path: String,

    #[serde(rename = "file", default)]
    files: Vec<FileRecord>,
}

#[derive(Serialize, Deserialize)]
struct SourceElement {
    #[serde(rename = "@alias", default)]
    alias: String,

    #[serde(rename = "directory", default)]
    dirs: Vec<DirElement>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename = "journal")]
struct JournalDoc {
    #[serde(rename = "source", default)]
    sources: Vec<SourceElement>,
}

/// An ordered collection of [`JournalEntry`] values grouped by alias.
///
/// Safe for concurrent `append` from walker threads; writing out serializes.
#[derive(Default)]
pub struct Journal {
    by_alias: Mutex<BTreeMap<String, Vec<JournalEntry>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: JournalEntry) {
        self.by_alias
            .lock()
            .unwrap()
            .entry(entry.alias.clone())
            .or_default()
            .push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.by_alias.lock().unwrap().values().all(|v| v.is_empty())
    }

    pub fn aliases(&self) -> Vec<String> {
        self.by_alias.lock().unwrap().keys().cloned().collect()
    }

    /// All entries, aliases in sorted order, per-alias append order kept.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.by_alias.lock().unwrap().values().flatten().cloned().collect()
    }

    pub fn write_to<W: Write>(&self, mut w: W) -> Result<(), JournalError> {
        let by_alias = self.by_alias.lock().unwrap();
        let doc = JournalDoc {
            sources: by_alias
                .iter()
                .map(|(alias, entries)| SourceElement {
                    alias: alias.clone(),
                    dirs: entries
                        .iter()
                        .map(|entry| DirElement {
                            path: entry.dir.to_string_lossy().into_owned(),
                            files: entry.files.clone(),
                        })
                        .collect(),
                })
                .collect(),
        };
        let xml = quick_xml::se::to_string(&doc)?;
        let io_err = |source| JournalError::Io { path: PathBuf::from("<journal>"), source };
        w.write_all(XML_DECL.as_bytes()).map_err(io_err)?;
        w.write_all(xml.as_bytes()).map_err(io_err)?;
        Ok(())
    }

    /// Streaming parse. Every `source` element must carry a non-empty alias
    /// attribute; unknown attributes and elements are tolerated.
    pub fn read_from<R: Read>(reader: R) -> Result<Self, JournalError> {
        let doc: JournalDoc = quick_xml::de::from_reader(BufReader::new(reader))?;
        let journal = Journal::new();
        for source in doc.sources {
            if source.alias.trim().is_empty() {
                return Err(JournalError::AliasRequired);
            }
            for dir in source.dirs {
                journal.append(JournalEntry {
                    alias: source.alias.clone(),
                    dir: PathBuf::from(dir.path),
                    files: dir.files,
                });
            }
        }
        Ok(journal)
    }

    pub fn save(&self, path: &Path) -> Result<(), JournalError> {
        let file = File::create(path)
            .map_err(|source| JournalError::Io { path: path.to_path_buf(), source })?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer
            .flush()
            .map_err(|source| JournalError::Io { path: path.to_path_buf(), source })
    }

    pub fn load(path: &Path) -> Result<Self, JournalError> {
        let file = File::open(path)
            .map_err(|source| JournalError::Io { path: path.to_path_buf(), source })?;
        Self::read_from(file)
    }

    fn snapshot(&self) -> BTreeMap<String, Vec<JournalEntry>> {
        self.by_alias.lock().unwrap().clone()
    }
}

impl PartialEq for Journal {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").field("by_alias", &self.snapshot()).finish()
    }
}

struct JournalCollector<'a> {
    map: DirectoryMap,
    alias: &'a str,
    rel: PathBuf,
    journal: &'a Journal,
}

impl DirectoryHandler for JournalCollector<'_> {
    fn on_file(&mut self, _name: &str, _meta: &std::fs::Metadata) -> Result<(), WalkError> {
        Ok(())
    }

    fn on_finish(&mut self) -> Result<(), WalkError> {
        if !self.map.is_empty() {
            self.journal.append(JournalEntry {
                alias: self.alias.to_string(),
                dir: self.rel.clone(),
                files: self.map.iter().map(|(_, record)| record.clone()).collect(),
            });
        }
        Ok(())
    }
}

/// Build a journal from the persisted metadata of the given sources.
pub fn collect_journal(
    sources: &[SourceRoot],
    opts: &WalkOptions,
) -> Result<Journal, WalkError> {
    let journal = Journal::new();
    for source in sources {
        let root = source.path.clone();
        walk::walk(&source.path, opts, |dir: &Path| {
            let (map, warning) = DirectoryMap::load_lenient(dir);
            if let Some(w) = warning {
                warn!(dir = %dir.display(), error = %w, "metadata unreadable");
            }
            let rel = match dir.strip_prefix(&root) {
                Ok(rel) if rel.as_os_str().is_empty() => PathBuf::from("."),
                Ok(rel) => rel.to_path_buf(),
                Err(_) => dir.to_path_buf(),
            };
            Ok(JournalCollector {
                map,
                alias: &source.alias,
                rel,
                journal: &journal,
            })
        })?;
    }
    Ok(journal)
}
