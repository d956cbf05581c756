use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::{JournalError, JournalResult, TlfId, UserId, UserOrTeamId, VerifyingKey};

pub const JOURNAL_LAYOUT_VERSION: u32 = 1;
const CONFIG_FILE: &str = "config.json";
const TLF_INFO_FILE: &str = "info.json";

// Key strings start with two fixed bytes, so 36 chars keep 128 random bits.
// 16 chars of the tlf id keep 64 random bits per device.
const SHORT_DEVICE_ID_LEN: usize = 36;
const SHORT_TLF_ID_LEN: usize = 16;

/// Persisted auto-journaling switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalManagerConfig {
    /// True only when the user explicitly turned auto-journaling on.
    pub enable_auto: bool,
    /// The user has explicitly set `enable_auto`, either way.
    pub enable_auto_set_by_user: bool,
}

impl JournalManagerConfig {
    /// Returns (enable_auto, enable_auto_set_by_user). Journaling is on by
    /// default until the user explicitly turns it off.
    pub fn get_enable_auto(&self) -> (bool, bool) {
        if self.enable_auto {
            return (true, true);
        }
        if self.enable_auto_set_by_user {
            return (false, true);
        }
        (true, false)
    }
}

/// Identifies the owner of a per-folder journal directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlfJournalInfo {
    pub uid: UserId,
    pub verifying_key: VerifyingKey,
    pub tlf_id: TlfId,
    pub charged_to: UserOrTeamId,
}

impl TlfJournalInfo {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(TLF_INFO_FILE)
    }

    pub async fn read(dir: &Path) -> JournalResult<Self> {
        read_json_file(&Self::path(dir)).await
    }

    pub async fn write(&self, dir: &Path) -> JournalResult<()> {
        write_json_file_atomic(&Self::path(dir), self).await
    }
}

/// `<dir>/v1/{config.json, <key prefix>-<tlf prefix>/...}`
#[derive(Debug, Clone)]
pub struct JournalLayout {
    dir: PathBuf,
}

impl JournalLayout {
    pub fn new(dir: impl Into<PathBuf>) -> JournalResult<Self> {
        let dir = dir.into();
        if dir.as_os_str().is_empty() {
            return Err(JournalError::InvalidParam(
                "journal root path unexpectedly empty".to_string(),
            ));
        }
        Ok(Self { dir })
    }

    pub fn root_path(&self) -> PathBuf {
        self.dir.join(format!("v{}", JOURNAL_LAYOUT_VERSION))
    }

    pub fn config_path(&self) -> PathBuf {
        self.root_path().join(CONFIG_FILE)
    }

    pub fn tlf_journal_path(&self, key: &VerifyingKey, tlf_id: &TlfId) -> PathBuf {
        let short_device = &key.as_str()[..SHORT_DEVICE_ID_LEN];
        let short_tlf = &tlf_id.as_str()[..SHORT_TLF_ID_LEN];
        self.root_path()
            .join(format!("{}-{}", short_device, short_tlf))
    }

    /// Returns `Ok(None)` if no config has been written yet.
    pub async fn read_config(&self) -> JournalResult<Option<JournalManagerConfig>> {
        match read_json_file(&self.config_path()).await {
            Ok(config) => Ok(Some(config)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn write_config(&self, config: &JournalManagerConfig) -> JournalResult<()> {
        write_json_file_atomic(&self.config_path(), config).await
    }

    /// Entries directly under the versioned root, with their dir flag.
    /// A missing root yields an empty list.
    pub async fn list_entries(&self) -> JournalResult<Vec<(PathBuf, bool)>> {
        let root = self.root_path();
        let mut read_dir = match fs::read_dir(&root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(JournalError::IoError(format!(
                    "read dir {} failed: {}",
                    root.display(),
                    e
                )))
            }
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let is_dir = entry.file_type().await?.is_dir();
            entries.push((entry.path(), is_dir));
        }
        entries.sort();
        Ok(entries)
    }
}

pub(crate) async fn read_json_file<T: DeserializeOwned>(path: &Path) -> JournalResult<T> {
    let content = match fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(JournalError::NotFound(path.display().to_string()))
        }
        Err(e) => {
            return Err(JournalError::IoError(format!(
                "read {} failed: {}",
                path.display(),
                e
            )))
        }
    };
    serde_json::from_slice(&content)
        .map_err(|e| JournalError::DecodeError(format!("parse {} failed: {}", path.display(), e)))
}

/// Writes to a sibling temp file, syncs, then renames over `path`, so a
/// reader never sees a partially written file.
pub(crate) async fn write_json_file_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> JournalResult<()> {
    let data = serde_json::to_vec_pretty(value)?;
    write_file_atomic(path, &data).await
}

pub(crate) async fn write_file_atomic(path: &Path, data: &[u8]) -> JournalResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path).await.map_err(|e| {
        JournalError::IoError(format!("create {} failed: {}", tmp_path.display(), e))
    })?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp_path, path).await.map_err(|e| {
        JournalError::IoError(format!("rename to {} failed: {}", path.display(), e))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TlfType;

    #[test]
    fn test_enable_auto_defaults() {
        let config = JournalManagerConfig::default();
        assert_eq!(config.get_enable_auto(), (true, false));

        let config = JournalManagerConfig {
            enable_auto: false,
            enable_auto_set_by_user: true,
        };
        assert_eq!(config.get_enable_auto(), (false, true));

        let config = JournalManagerConfig {
            enable_auto: true,
            enable_auto_set_by_user: false,
        };
        assert_eq!(config.get_enable_auto(), (true, true));
    }

    #[test]
    fn test_tlf_journal_path_is_deterministic() {
        let layout = JournalLayout::new("/tmp/journal").unwrap();
        let key = VerifyingKey::random();
        let tlf_id = TlfId::random(TlfType::Private);
        let path = layout.tlf_journal_path(&key, &tlf_id);
        assert_eq!(path, layout.tlf_journal_path(&key, &tlf_id));
        assert_eq!(path.parent().unwrap(), layout.root_path());

        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert_eq!(name.len(), 36 + 1 + 16);
        assert!(name.starts_with(&key.as_str()[..36]));
        assert!(name.ends_with(&tlf_id.as_str()[..16]));
    }

    #[tokio::test]
    async fn test_config_read_write() {
        let tmp = tempfile::TempDir::new().expect("create temp dir");
        let layout = JournalLayout::new(tmp.path()).unwrap();
        assert_eq!(layout.read_config().await.unwrap(), None);
        assert!(layout.list_entries().await.unwrap().is_empty());

        let config = JournalManagerConfig {
            enable_auto: false,
            enable_auto_set_by_user: true,
        };
        layout.write_config(&config).await.unwrap();
        assert_eq!(layout.read_config().await.unwrap(), Some(config));

        let entries = layout.list_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].1);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let tmp = tempfile::TempDir::new().expect("create temp dir");
        let missing = tmp.path().join("missing.json");
        let err = read_json_file::<JournalManagerConfig>(&missing)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let garbled = tmp.path().join("garbled.json");
        std::fs::write(&garbled, b"{").unwrap();
        let err = read_json_file::<JournalManagerConfig>(&garbled)
            .await
            .unwrap_err();
        assert!(!err.is_not_found());
        assert!(matches!(err, JournalError::DecodeError(_)));
    }

    #[test]
    fn test_empty_root_rejected() {
        assert!(JournalLayout::new("").is_err());
    }
}
