use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::tlf_journal::TlfJournalOptions;
use crate::{JournalError, JournalResult};

pub const DEFAULT_JOURNAL_CONFIG_PATH: &str = "/opt/buckyos/etc/fs_journal.json";
pub const DEFAULT_JOURNAL_ROOT: &str = "/opt/buckyos/var/fs_journal";
pub const DEFAULT_REOPEN_WORKERS: usize = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JournalServiceConfig {
    #[serde(alias = "root_dir", alias = "journal_dir")]
    pub journal_root: PathBuf,
    /// Upper bound on concurrent journal reopens at login.
    #[serde(alias = "workers")]
    pub reopen_workers: usize,
    /// Lazily created journals only flush after `finish_single_op`.
    pub single_op_mode: bool,
    pub quota_error_cooldown_secs: u64,
    pub disk_limit_error_cooldown_secs: u64,
    pub flush_batch_size: usize,
    pub flush_backoff_min_ms: u64,
    pub flush_backoff_max_ms: u64,
    /// 0 means unlimited.
    #[serde(alias = "disk_limit")]
    pub disk_limit_bytes: u64,
    pub disk_limit_timeout_ms: u64,
}

impl Default for JournalServiceConfig {
    fn default() -> Self {
        Self {
            journal_root: PathBuf::from(DEFAULT_JOURNAL_ROOT),
            reopen_workers: DEFAULT_REOPEN_WORKERS,
            single_op_mode: false,
            quota_error_cooldown_secs: 60,
            disk_limit_error_cooldown_secs: 60,
            flush_batch_size: 16,
            flush_backoff_min_ms: 100,
            flush_backoff_max_ms: 30_000,
            disk_limit_bytes: 0,
            disk_limit_timeout_ms: 10_000,
        }
    }
}

impl JournalServiceConfig {
    pub fn with_root(journal_root: impl Into<PathBuf>) -> Self {
        Self {
            journal_root: journal_root.into(),
            ..Default::default()
        }
    }

    pub fn load(path: &Path) -> JournalResult<Self> {
        let config: Self = read_json_config(path)?;
        if config.journal_root.as_os_str().is_empty() {
            return Err(JournalError::InvalidParam(format!(
                "{}: journal_root is empty",
                path.display()
            )));
        }
        Ok(config)
    }

    pub fn quota_error_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.quota_error_cooldown_secs as i64)
    }

    pub fn disk_limit_error_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.disk_limit_error_cooldown_secs as i64)
    }

    pub fn disk_limit_timeout(&self) -> Duration {
        Duration::from_millis(self.disk_limit_timeout_ms)
    }

    pub fn tlf_journal_options(&self) -> TlfJournalOptions {
        TlfJournalOptions {
            flush_batch_size: self.flush_batch_size.max(1),
            backoff_min: Duration::from_millis(self.flush_backoff_min_ms.max(1)),
            backoff_max: Duration::from_millis(
                self.flush_backoff_max_ms.max(self.flush_backoff_min_ms.max(1)),
            ),
        }
    }
}

pub(crate) fn read_json_config<T: DeserializeOwned>(path: &Path) -> JournalResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| JournalError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| JournalError::DecodeError(format!("parse {} failed: {}", path.display(), e)))
}
