// fs_journal buffers block and metadata writes for a folder on local disk and
// replays them to the remote services once connectivity and quota allow.

mod config;
mod delegate;
mod disk_journal;
mod disk_limiter;
mod inspect;
mod journal_manager;
mod layout;
mod services;
mod status;
mod tlf_journal;
mod types;

pub use config::*;
pub use delegate::*;
pub use disk_limiter::LocalDiskLimiter;
pub use inspect::{inspect_journal_root, JournalDirReport, JournalRootReport};
pub use journal_manager::{DirtyOpGuard, JournalCollaborators, JournalManager};
pub use layout::{JournalLayout, JournalManagerConfig, TlfJournalInfo};
pub use services::*;
pub use status::*;
pub use tlf_journal::{JournalDirSummary, TlfJournalOptions};
pub use types::*;

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Raised by a disk limiter when a reservation could not be satisfied in
/// time. `reportable` is decided by the manager's cooldown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLimitTimeout {
    pub timeout: Duration,
    pub requested_bytes: u64,
    pub available_bytes: u64,
    pub reportable: bool,
}

impl fmt::Display for DiskLimitTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "disk limit timeout after {:?}: requested {} bytes, {} available (reportable={})",
            self.timeout, self.requested_bytes, self.available_bytes, self.reportable
        )
    }
}

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("remote error: {0}")]
    RemoteError(String),

    #[error("journal not enabled for {0}")]
    NotEnabled(TlfId),
    #[error("journal for {0} is disabled")]
    Disabled(TlfId),
    #[error("journal for {0} has been shut down")]
    Shutdown(TlfId),
    #[error("dirty writes outstanding: {0}")]
    Dirty(String),
    #[error("metadata conflict: {0}")]
    Conflict(String),

    #[error("over quota: usage {usage} exceeds limit {limit} (throttled={throttled})")]
    OverQuota {
        usage: u64,
        limit: u64,
        throttled: bool,
    },
    #[error("{0}")]
    DiskLimitTimeout(DiskLimitTimeout),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl JournalError {
    /// Failures the background worker retries with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, JournalError::RemoteError(_) | JournalError::IoError(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, JournalError::NotFound(_))
    }
}

pub type JournalResult<T> = std::result::Result<T, JournalError>;

impl From<std::io::Error> for JournalError {
    fn from(err: std::io::Error) -> Self {
        JournalError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for JournalError {
    fn from(err: serde_json::Error) -> Self {
        JournalError::DecodeError(err.to_string())
    }
}

#[cfg(test)]
mod test_util;
