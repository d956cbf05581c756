use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use crate::layout::{read_json_file, write_json_file_atomic};
use crate::{JournalError, JournalResult};

const ENTRY_EXT: &str = "json";

/// Contiguous run of entries `[earliest, next)`, one JSON file per
/// ordinal. Appends go to the end, removals come off the front.
pub(crate) struct DiskJournal<T> {
    dir: PathBuf,
    earliest: u64,
    next: u64,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned + Send + Sync> DiskJournal<T> {
    pub async fn open(dir: PathBuf) -> JournalResult<Self> {
        fs::create_dir_all(&dir).await.map_err(|e| {
            JournalError::IoError(format!("create journal dir {} failed: {}", dir.display(), e))
        })?;

        let mut ordinals = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(ENTRY_EXT) => {}
                Some("tmp") => {
                    // Interrupted write; the entry was never committed.
                    debug!("removing partial journal entry {}", path.display());
                    let _ = fs::remove_file(&path).await;
                    continue;
                }
                _ => continue,
            }
            let ordinal = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| u64::from_str_radix(s, 16).ok());
            match ordinal {
                Some(ordinal) => ordinals.push(ordinal),
                None => warn!("ignoring unexpected file {} in journal", path.display()),
            }
        }
        ordinals.sort_unstable();

        let (earliest, next) = match (ordinals.first(), ordinals.last()) {
            (Some(first), Some(last)) => (*first, *last + 1),
            _ => (0, 0),
        };
        if (next - earliest) as usize != ordinals.len() {
            return Err(JournalError::DecodeError(format!(
                "journal {} has gaps: {} entries in [{}, {})",
                dir.display(),
                ordinals.len(),
                earliest,
                next
            )));
        }

        Ok(Self {
            dir,
            earliest,
            next,
            _marker: PhantomData,
        })
    }

    fn entry_path(&self, ordinal: u64) -> PathBuf {
        self.dir.join(format!("{:016x}.{}", ordinal, ENTRY_EXT))
    }

    pub fn len(&self) -> u64 {
        self.next - self.earliest
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ordinals(&self) -> std::ops::Range<u64> {
        self.earliest..self.next
    }

    pub async fn append(&mut self, entry: &T) -> JournalResult<u64> {
        let ordinal = self.next;
        write_json_file_atomic(&self.entry_path(ordinal), entry).await?;
        self.next += 1;
        Ok(ordinal)
    }

    pub async fn read(&self, ordinal: u64) -> JournalResult<T> {
        if !self.ordinals().contains(&ordinal) {
            return Err(JournalError::NotFound(format!(
                "journal entry {} not in [{}, {})",
                ordinal, self.earliest, self.next
            )));
        }
        read_json_file(&self.entry_path(ordinal)).await
    }

    /// Overwrites an existing entry in place.
    pub async fn write(&self, ordinal: u64, entry: &T) -> JournalResult<()> {
        if !self.ordinals().contains(&ordinal) {
            return Err(JournalError::NotFound(format!(
                "journal entry {} not in [{}, {})",
                ordinal, self.earliest, self.next
            )));
        }
        write_json_file_atomic(&self.entry_path(ordinal), entry).await
    }

    pub async fn read_earliest(&self) -> JournalResult<Option<(u64, T)>> {
        if self.is_empty() {
            return Ok(None);
        }
        let entry = self.read(self.earliest).await?;
        Ok(Some((self.earliest, entry)))
    }

    pub async fn read_latest(&self) -> JournalResult<Option<(u64, T)>> {
        if self.is_empty() {
            return Ok(None);
        }
        let ordinal = self.next - 1;
        let entry = self.read(ordinal).await?;
        Ok(Some((ordinal, entry)))
    }

    /// Removes the earliest entry, which must be `ordinal`.
    pub async fn remove_earliest(&mut self, ordinal: u64) -> JournalResult<()> {
        if self.is_empty() || ordinal != self.earliest {
            return Err(JournalError::InvalidState(format!(
                "can only remove earliest entry {}, got {}",
                self.earliest, ordinal
            )));
        }
        fs::remove_file(self.entry_path(ordinal)).await?;
        self.earliest += 1;
        if self.is_empty() {
            // Restart numbering so an idle journal does not drift.
            self.earliest = 0;
            self.next = 0;
        }
        Ok(())
    }

    /// Total size of committed entry files.
    pub async fn stored_bytes(&self) -> JournalResult<u64> {
        let mut total = 0u64;
        for ordinal in self.ordinals() {
            total += fs::metadata(self.entry_path(ordinal)).await?.len();
        }
        Ok(total)
    }
}

/// Counts committed entries under `dir` without opening the journal or
/// touching leftovers. A missing directory counts as empty.
pub(crate) async fn count_entries(dir: &Path) -> JournalResult<u64> {
    let mut read_dir = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut count = 0u64;
    while let Some(entry) = read_dir.next_entry().await? {
        if entry.path().extension().and_then(|e| e.to_str()) == Some(ENTRY_EXT) {
            count += 1;
        }
    }
    Ok(count)
}
