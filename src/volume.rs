//! Volume labels: one `.mdbackup.xml` at the root of each backup volume.
//!
//! A label is a short opaque string, globally unique across cooperating
//! volumes. It is written once when the volume is first tagged; recreating
//! it orphans every file record that referred to the old label.

use crate::digest::Digest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Fixed name of the label file at a volume root.
pub const VOLUME_FILE: &str = ".mdbackup.xml";

static LABEL_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("{root} is not a tagged volume (no {VOLUME_FILE})")]
    NotAVolume { root: PathBuf },

    #[error("{root} is already a tagged volume")]
    AlreadyTagged { root: PathBuf },

    #[error("malformed volume file at {root}: {reason}")]
    Malformed { root: PathBuf, reason: String },

    #[error("volume label must not be empty")]
    EmptyLabel,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Opaque identifier for one backup volume.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeLabel(String);

impl VolumeLabel {
    pub fn new(label: impl Into<String>) -> Result<Self, VolumeError> {
        let label = label.into();
        if label.trim().is_empty() {
            return Err(VolumeError::EmptyLabel);
        }
        Ok(Self(label))
    }

    /// Generate a fresh label unique across processes and calls.
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = LABEL_COUNTER.fetch_add(1, Ordering::Relaxed);
        let seed = format!("{}-{}-{}", std::process::id(), nanos, seq);
        let digest = Digest::of_bytes(seed.as_bytes());
        let hex: String = digest.as_bytes()[..6].iter().map(|b| format!("{b:02x}")).collect();
        Self(format!("vol-{hex}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename = "volume")]
struct VolumeDoc {
    label: String,
}

fn label_path(root: &Path) -> PathBuf {
    root.join(VOLUME_FILE)
}

/// Read the label of a tagged volume.
pub fn read_label(root: &Path) -> Result<VolumeLabel, VolumeError> {
    let path = label_path(root);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(VolumeError::NotAVolume { root: root.to_path_buf() })
        }
        Err(e) => return Err(VolumeError::Io { path, source: e }),
    };
    let doc: VolumeDoc = quick_xml::de::from_str(&text).map_err(|e| VolumeError::Malformed {
        root: root.to_path_buf(),
        reason: e.to_string(),
    })?;
    VolumeLabel::new(doc.label).map_err(|_| VolumeError::Malformed {
        root: root.to_path_buf(),
        reason: "empty label".to_string(),
    })
}

fn write_label_file(root: &Path, label: &VolumeLabel, overwrite: bool) -> Result<(), VolumeError> {
    let path = label_path(root);
    let doc = VolumeDoc { label: label.as_str().to_string() };
    let xml = quick_xml::se::to_string(&doc).map_err(|e| VolumeError::Malformed {
        root: root.to_path_buf(),
        reason: e.to_string(),
    })?;

    let io_err = |source| VolumeError::Io { path: path.clone(), source };
    let mut file = if overwrite {
        fs::File::create(&path).map_err(io_err)?
    } else {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(VolumeError::AlreadyTagged { root: root.to_path_buf() })
            }
            Err(e) => return Err(io_err(e)),
        }
    };
    file.write_all(xml.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|source| VolumeError::Io { path: path.clone(), source })
}

/// Tag a volume with `label`. Fails if the volume is already tagged.
pub fn write_label(root: &Path, label: &VolumeLabel) -> Result<(), VolumeError> {
    write_label_file(root, label, false)
}

/// Read the existing label, or tag the volume with a generated one.
pub fn ensure_label(root: &Path) -> Result<VolumeLabel, VolumeError> {
    match read_label(root) {
        Ok(label) => Ok(label),
        Err(VolumeError::NotAVolume { .. }) => {
            let label = VolumeLabel::generate();
            write_label(root, &label)?;
            Ok(label)
        }
        Err(e) => Err(e),
    }
}

/// Replace the volume's label with a fresh one, orphaning all file records
/// that referenced the old label.
pub fn recreate_label(root: &Path) -> Result<VolumeLabel, VolumeError> {
    let label = VolumeLabel::generate();
    write_label_file(root, &label, true)?;
    Ok(label)
}
