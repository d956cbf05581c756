use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{BackgroundWorkStatus, BranchId, Revision, UserId, VerifyingKey};

/// Process-wide journal diagnostics, suitable for encoding as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct JournalManagerStatus {
    pub root_dir: PathBuf,
    pub version: u32,
    pub current_uid: Option<UserId>,
    pub current_verifying_key: Option<VerifyingKey>,
    pub enable_auto: bool,
    pub enable_auto_set_by_user: bool,
    pub journal_count: usize,
    pub stored_bytes: u64,
    pub stored_files: u64,
    pub unflushed_bytes: u64,
    pub end_estimate: Option<DateTime<Utc>>,
    pub disk_limiter_status: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct TlfJournalStatus {
    pub dir: PathBuf,
    pub revision_start: Option<Revision>,
    pub revision_end: Option<Revision>,
    pub branch_id: BranchId,
    pub block_op_count: u64,
    pub md_entry_count: u64,
    pub stored_bytes: u64,
    pub stored_files: u64,
    pub unflushed_bytes: u64,
    /// Only filled by the with-paths variant.
    pub unflushed_paths: Vec<String>,
    pub end_estimate: Option<DateTime<Utc>>,
    pub last_flush_error: Option<String>,
    pub enabled: bool,
    pub background_work: BackgroundWorkStatus,
}

/// Byte and file counters of one journal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JournalByteCounts {
    pub stored_bytes: u64,
    pub stored_files: u64,
    pub unflushed_bytes: u64,
}
