//! Multi-volume, content-addressed file backup for local filesystems.
//!
//! Each tracked directory carries a `.medorg.xml` index of its files (size,
//! mtime, MD5 digest, and the labels of every volume holding a copy). On top
//! of that metadata sit a checksum engine with an adaptive concurrency
//! tuner, a priority-scheduling backup planner with an atomic copy stage,
//! and a journal/restore pipeline for bringing files back from any subset of
//! volumes.

pub mod checksum;
pub mod config;
pub mod copy;
pub mod digest;
pub mod dirmap;
pub mod journal;
pub mod planner;
pub mod pool;
pub mod restore;
pub mod tuner;
pub mod volume;
pub mod walk;

pub use checksum::{run_checksums, ChecksumOptions, ChecksumOutcome, ChecksumReport};
pub use config::{AliasSpec, Config, IgnoreRules, SourceRoot};
pub use copy::{CopyAgent, CopyRequest, VolumeCopier};
pub use digest::Digest;
pub use dirmap::{DirectoryMap, FileRecord};
pub use journal::{collect_journal, Journal, JournalEntry};
pub use planner::{run_backup, BackupOptions, BackupSummary};
pub use pool::CancelFlag;
pub use restore::{run_restore, RestoreOptions, RestoreSummary};
pub use volume::VolumeLabel;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
