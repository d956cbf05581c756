use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::disk_journal::{count_entries, DiskJournal};
use crate::layout::{read_json_file, write_file_atomic, write_json_file_atomic, TlfJournalInfo};
use crate::status::{JournalByteCounts, TlfJournalStatus};
use crate::{
    BackgroundWorkStatus, BlockId, BlockServer, BranchChangeListener, BranchId, Clock,
    DiskLimiter, JournalError, JournalResult, MdFlushListener, MdOps, QuotaInfo, RootMetadata,
    TlfHandle, TlfId, UnflushedPathPopulator, UserId, UserOrTeamId, VerifyingKey,
};

const BLOCK_JOURNAL_DIR: &str = "block_journal";
const MD_JOURNAL_DIR: &str = "md_journal";
const ENTRIES_DIR: &str = "entries";
const BLOCKS_DIR: &str = "blocks";
const BRANCH_FILE: &str = "branch.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlfJournalOptions {
    /// Block operations flushed per step before metadata is considered.
    pub flush_batch_size: usize,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for TlfJournalOptions {
    fn default() -> Self {
        Self {
            flush_batch_size: 16,
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Everything a journal needs from the outside world.
#[derive(Clone)]
pub(crate) struct TlfJournalDeps {
    pub block_server: Arc<dyn BlockServer>,
    pub md_server: Arc<dyn MdOps>,
    pub disk_limiter: Arc<dyn DiskLimiter>,
    pub clock: Arc<dyn Clock>,
    pub on_branch_change: Option<Arc<dyn BranchChangeListener>>,
    pub on_md_flush: Option<Arc<dyn MdFlushListener>>,
    pub options: TlfJournalOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum BlockJournalEntry {
    Put { id: BlockId, size: u64 },
    AddReference { id: BlockId },
    RemoveReferences { ids: Vec<BlockId> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MdJournalEntry {
    /// Absent for revisions written directly to a conflict branch.
    handle: Option<TlfHandle>,
    md: RootMetadata,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct BranchRecord {
    branch_id: BranchId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WorkerState {
    /// Either `Enabled` or `SingleOpEnabled`.
    mode: BackgroundWorkStatus,
    paused: bool,
    single_op_pending: bool,
    shutdown: bool,
}

impl WorkerState {
    fn new(bws: BackgroundWorkStatus) -> Self {
        match bws {
            BackgroundWorkStatus::Paused => Self {
                mode: BackgroundWorkStatus::Enabled,
                paused: true,
                single_op_pending: false,
                shutdown: false,
            },
            mode => Self {
                mode,
                paused: false,
                single_op_pending: false,
                shutdown: false,
            },
        }
    }

    fn should_work(&self) -> bool {
        !self.shutdown
            && !self.paused
            && (self.mode == BackgroundWorkStatus::Enabled || self.single_op_pending)
    }

    fn status(&self) -> BackgroundWorkStatus {
        if self.paused {
            BackgroundWorkStatus::Paused
        } else {
            self.mode
        }
    }
}

enum FlushProgress {
    More,
    Idle,
}

enum FlushWork {
    Blocks(Vec<(u64, BlockJournalEntry)>),
    Md(u64, MdJournalEntry),
}

struct JournalInner {
    blocks: DiskJournal<BlockJournalEntry>,
    mds: DiskJournal<MdJournalEntry>,
    branch_id: BranchId,
    enabled: bool,
    shutdown: bool,
    block_bytes: u64,
    block_files: u64,
    unflushed_bytes: u64,
    quota: Option<QuotaInfo>,
    last_flush_error: Option<String>,
    /// Bytes per second, smoothed.
    flush_rate: Option<f64>,
}

/// Write journal for a single folder. Owns its directory and one
/// background flush task.
pub(crate) struct TlfJournal {
    uid: UserId,
    key: VerifyingKey,
    tlf_id: TlfId,
    charged_to: UserOrTeamId,
    dir: PathBuf,
    deps: TlfJournalDeps,
    inner: tokio::sync::Mutex<JournalInner>,
    // Serializes flush steps between the worker and explicit flushes.
    flush_lock: tokio::sync::Mutex<()>,
    work_available: Notify,
    progress: Notify,
    worker_state: watch::Sender<WorkerState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TlfJournal {
    pub async fn open(
        uid: UserId,
        key: VerifyingKey,
        tlf_id: TlfId,
        charged_to: UserOrTeamId,
        dir: PathBuf,
        deps: TlfJournalDeps,
        bws: BackgroundWorkStatus,
    ) -> JournalResult<Arc<Self>> {
        fs::create_dir_all(&dir).await.map_err(|e| {
            JournalError::IoError(format!("create tlf journal dir {} failed: {}", dir.display(), e))
        })?;

        let info = TlfJournalInfo {
            uid: uid.clone(),
            verifying_key: key.clone(),
            tlf_id: tlf_id.clone(),
            charged_to: charged_to.clone(),
        };
        match TlfJournalInfo::read(&dir).await {
            Ok(existing) => {
                if existing.uid != uid || existing.verifying_key != key || existing.tlf_id != tlf_id
                {
                    return Err(JournalError::InvalidState(format!(
                        "journal dir {} belongs to {} / {} / {}",
                        dir.display(),
                        existing.uid,
                        existing.verifying_key,
                        existing.tlf_id
                    )));
                }
            }
            Err(e) if e.is_not_found() => info.write(&dir).await?,
            Err(e) => return Err(e),
        }

        let blocks: DiskJournal<BlockJournalEntry> =
            DiskJournal::open(dir.join(BLOCK_JOURNAL_DIR).join(ENTRIES_DIR)).await?;
        let mds: DiskJournal<MdJournalEntry> =
            DiskJournal::open(dir.join(MD_JOURNAL_DIR).join(ENTRIES_DIR)).await?;
        let (block_bytes, block_files) =
            scan_block_data(&dir.join(BLOCK_JOURNAL_DIR).join(BLOCKS_DIR)).await?;

        let mut unflushed_bytes = 0u64;
        for ordinal in blocks.ordinals() {
            if let BlockJournalEntry::Put { size, .. } = blocks.read(ordinal).await? {
                unflushed_bytes += size;
            }
        }

        let branch_id = read_branch(&dir).await?;
        if !branch_id.is_null() {
            // A crash during branch conversion may leave some entries behind.
            for ordinal in mds.ordinals() {
                let mut entry = mds.read(ordinal).await?;
                if entry.md.branch_id != branch_id {
                    entry.md.branch_id = branch_id;
                    mds.write(ordinal, &entry).await?;
                }
            }
        }

        deps.disk_limiter.on_stored(&charged_to, unflushed_bytes);

        let (worker_state, state_rx) = watch::channel(WorkerState::new(bws));
        let journal = Arc::new(Self {
            uid,
            key,
            tlf_id,
            charged_to,
            dir,
            deps,
            inner: tokio::sync::Mutex::new(JournalInner {
                blocks,
                mds,
                branch_id,
                enabled: true,
                shutdown: false,
                block_bytes,
                block_files,
                unflushed_bytes,
                quota: None,
                last_flush_error: None,
                flush_rate: None,
            }),
            flush_lock: tokio::sync::Mutex::new(()),
            work_available: Notify::new(),
            progress: Notify::new(),
            worker_state,
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(journal.clone().background_work(state_rx));
        if let Ok(mut worker) = journal.worker.lock() {
            *worker = Some(handle);
        }
        debug!(
            "opened journal for {} at {} ({})",
            journal.tlf_id,
            journal.dir.display(),
            bws
        );
        Ok(journal)
    }

    fn block_data_path(&self, id: &BlockId) -> PathBuf {
        self.dir
            .join(BLOCK_JOURNAL_DIR)
            .join(BLOCKS_DIR)
            .join(format!("{}.data", id))
    }

    fn check_writable(&self, inner: &JournalInner) -> JournalResult<()> {
        if inner.shutdown {
            return Err(JournalError::Shutdown(self.tlf_id.clone()));
        }
        if !inner.enabled {
            return Err(JournalError::Disabled(self.tlf_id.clone()));
        }
        Ok(())
    }

    fn check_open(&self, inner: &JournalInner) -> JournalResult<()> {
        if inner.shutdown {
            return Err(JournalError::Shutdown(self.tlf_id.clone()));
        }
        Ok(())
    }

    // ========== lifecycle ==========

    /// Returns whether the journal was disabled before.
    pub async fn enable(&self) -> JournalResult<bool> {
        let mut inner = self.inner.lock().await;
        self.check_open(&inner)?;
        if inner.enabled {
            return Ok(false);
        }
        inner.enabled = true;
        drop(inner);
        self.work_available.notify_one();
        self.progress.notify_waiters();
        Ok(true)
    }

    /// Stops flushing and rejects new writes. Buffered entries stay on
    /// disk until the journal is enabled again.
    pub async fn disable(&self) -> JournalResult<bool> {
        let mut inner = self.inner.lock().await;
        self.check_open(&inner)?;
        if !inner.enabled {
            return Ok(false);
        }
        inner.enabled = false;
        Ok(true)
    }

    pub fn pause_background_work(&self) {
        self.worker_state.send_if_modified(|state| {
            if state.paused || state.shutdown {
                return false;
            }
            state.paused = true;
            true
        });
    }

    pub fn resume_background_work(&self) {
        self.worker_state.send_if_modified(|state| {
            if !state.paused || state.shutdown {
                return false;
            }
            state.paused = false;
            true
        });
    }

    /// Stops the background worker. Every later call fails with
    /// `JournalError::Shutdown`.
    pub async fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
            // Reopening registers these bytes again.
            self.deps
                .disk_limiter
                .release(&self.charged_to, inner.unflushed_bytes);
        }
        self.worker_state.send_modify(|state| state.shutdown = true);
        self.progress.notify_waiters();

        let handle = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("background worker for {} ended abnormally: {}", self.tlf_id, e);
            }
        }
        debug!("shut down journal for {}", self.tlf_id);
    }

    // ========== writes ==========

    pub async fn put_block_data(&self, id: &BlockId, buf: &[u8]) -> JournalResult<()> {
        {
            let inner = self.inner.lock().await;
            self.check_writable(&inner)?;
        }

        let size = buf.len() as u64;
        self.deps.disk_limiter.reserve(&self.charged_to, size).await?;
        let result = self.append_block_data(id, buf).await;
        match result {
            Ok(true) => {
                self.work_available.notify_one();
                Ok(())
            }
            Ok(false) => {
                self.deps.disk_limiter.release(&self.charged_to, size);
                Ok(())
            }
            Err(e) => {
                self.deps.disk_limiter.release(&self.charged_to, size);
                Err(e)
            }
        }
    }

    /// Returns false if the block was already buffered.
    async fn append_block_data(&self, id: &BlockId, buf: &[u8]) -> JournalResult<bool> {
        let mut inner = self.inner.lock().await;
        self.check_writable(&inner)?;

        let data_path = self.block_data_path(id);
        if fs::try_exists(&data_path).await? {
            return Ok(false);
        }
        write_file_atomic(&data_path, buf).await?;
        let size = buf.len() as u64;
        if let Err(e) = inner
            .blocks
            .append(&BlockJournalEntry::Put {
                id: id.clone(),
                size,
            })
            .await
        {
            let _ = fs::remove_file(&data_path).await;
            return Err(e);
        }
        inner.block_bytes += size;
        inner.block_files += 1;
        inner.unflushed_bytes += size;
        Ok(true)
    }

    pub async fn add_block_reference(&self, id: &BlockId) -> JournalResult<()> {
        self.append_block_entry(BlockJournalEntry::AddReference { id: id.clone() })
            .await
    }

    pub async fn remove_block_references(&self, ids: &[BlockId]) -> JournalResult<()> {
        self.append_block_entry(BlockJournalEntry::RemoveReferences { ids: ids.to_vec() })
            .await
    }

    async fn append_block_entry(&self, entry: BlockJournalEntry) -> JournalResult<()> {
        let mut inner = self.inner.lock().await;
        self.check_writable(&inner)?;
        inner.blocks.append(&entry).await?;
        drop(inner);
        self.work_available.notify_one();
        Ok(())
    }

    /// Queues a metadata revision. It must directly follow the newest
    /// queued revision, and it lands on the journal's current branch.
    pub async fn put_md(&self, handle: &TlfHandle, md: &RootMetadata) -> JournalResult<()> {
        self.append_md(Some(handle.clone()), md, false).await
    }

    /// Queues a revision for the conflict branch the journal is on.
    pub async fn put_unmerged_md(&self, md: &RootMetadata) -> JournalResult<()> {
        self.append_md(None, md, true).await
    }

    async fn append_md(
        &self,
        handle: Option<TlfHandle>,
        md: &RootMetadata,
        unmerged: bool,
    ) -> JournalResult<()> {
        if md.tlf_id != self.tlf_id {
            return Err(JournalError::InvalidParam(format!(
                "metadata for {} put into journal for {}",
                md.tlf_id, self.tlf_id
            )));
        }

        let mut inner = self.inner.lock().await;
        self.check_writable(&inner)?;
        if unmerged && (inner.branch_id.is_null() || inner.branch_id != md.branch_id) {
            return Err(JournalError::InvalidParam(format!(
                "unmerged revision on branch {} but journal for {} is on branch {}",
                md.branch_id, self.tlf_id, inner.branch_id
            )));
        }
        if let Some((_, latest)) = inner.mds.read_latest().await? {
            let expected = latest.md.revision.next();
            if md.revision != expected {
                return Err(JournalError::InvalidParam(format!(
                    "journal for {} expects revision {}, got {}",
                    self.tlf_id, expected, md.revision
                )));
            }
        }

        let mut md = md.clone();
        md.branch_id = inner.branch_id;
        inner.mds.append(&MdJournalEntry { handle, md }).await?;
        drop(inner);
        self.work_available.notify_one();
        Ok(())
    }

    /// Drops the local conflict branch once conflict resolution owns it.
    pub async fn clear_branch(&self, bid: BranchId) -> JournalResult<()> {
        let mut inner = self.inner.lock().await;
        self.check_open(&inner)?;
        if inner.branch_id != bid {
            return Err(JournalError::InvalidParam(format!(
                "journal for {} is on branch {}, not {}",
                self.tlf_id, inner.branch_id, bid
            )));
        }
        if bid.is_null() {
            return Ok(());
        }
        if !inner.mds.is_empty() {
            return Err(JournalError::InvalidState(format!(
                "journal for {} still has {} unflushed revisions on branch {}",
                self.tlf_id,
                inner.mds.len(),
                bid
            )));
        }
        write_branch(&self.dir, BranchId::NULL).await?;
        inner.branch_id = BranchId::NULL;
        drop(inner);

        info!("cleared branch {} for {}", bid, self.tlf_id);
        if let Some(listener) = &self.deps.on_branch_change {
            listener.on_tlf_branch_change(&self.tlf_id, BranchId::NULL);
        }
        self.progress.notify_waiters();
        Ok(())
    }

    // ========== reads ==========

    pub async fn get_block_data(&self, id: &BlockId) -> JournalResult<Option<Vec<u8>>> {
        let inner = self.inner.lock().await;
        self.check_open(&inner)?;
        match fs::read(self.block_data_path(id)).await {
            Ok(buf) => Ok(Some(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn branch_id(&self) -> JournalResult<BranchId> {
        let inner = self.inner.lock().await;
        self.check_open(&inner)?;
        Ok(inner.branch_id)
    }

    /// Newest queued revision, if the journal is on branch `bid`.
    pub async fn md_head(&self, bid: BranchId) -> JournalResult<Option<RootMetadata>> {
        let inner = self.inner.lock().await;
        self.check_open(&inner)?;
        if inner.branch_id != bid {
            return Ok(None);
        }
        Ok(inner.mds.read_latest().await?.map(|(_, entry)| entry.md))
    }

    /// (block entries, metadata entries)
    pub async fn get_journal_entry_counts(&self) -> JournalResult<(u64, u64)> {
        let inner = self.inner.lock().await;
        self.check_open(&inner)?;
        Ok((inner.blocks.len(), inner.mds.len()))
    }

    pub async fn get_byte_counts(&self) -> JournalResult<JournalByteCounts> {
        let inner = self.inner.lock().await;
        self.check_open(&inner)?;
        Ok(JournalByteCounts {
            stored_bytes: inner.block_bytes + inner.mds.stored_bytes().await?,
            stored_files: inner.block_files + inner.mds.len(),
            unflushed_bytes: inner.unflushed_bytes,
        })
    }

    /// (remote usage plus unflushed bytes, limit). The limit is unbounded
    /// until the first successful quota refresh.
    pub async fn quota_usage(&self) -> (u64, u64) {
        let inner = self.inner.lock().await;
        match inner.quota {
            Some(quota) => (
                quota.used_bytes.saturating_add(inner.unflushed_bytes),
                quota.limit_bytes,
            ),
            None => (inner.unflushed_bytes, u64::MAX),
        }
    }

    fn end_estimate(&self, inner: &JournalInner) -> Option<chrono::DateTime<chrono::Utc>> {
        estimate_flush_end(self.deps.clock.now(), inner.unflushed_bytes, inner.flush_rate?)
    }

    pub async fn end_estimate_now(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let inner = self.inner.lock().await;
        self.end_estimate(&inner)
    }

    pub async fn get_journal_status(&self) -> JournalResult<TlfJournalStatus> {
        let inner = self.inner.lock().await;
        self.check_open(&inner)?;
        let revision_start = inner.mds.read_earliest().await?.map(|(_, e)| e.md.revision);
        let revision_end = inner.mds.read_latest().await?.map(|(_, e)| e.md.revision);
        Ok(TlfJournalStatus {
            dir: self.dir.clone(),
            revision_start,
            revision_end,
            branch_id: inner.branch_id,
            block_op_count: inner.blocks.len(),
            md_entry_count: inner.mds.len(),
            stored_bytes: inner.block_bytes + inner.mds.stored_bytes().await?,
            stored_files: inner.block_files + inner.mds.len(),
            unflushed_bytes: inner.unflushed_bytes,
            unflushed_paths: Vec::new(),
            end_estimate: self.end_estimate(&inner),
            last_flush_error: inner.last_flush_error.clone(),
            enabled: inner.enabled,
            background_work: self.worker_state.borrow().status(),
        })
    }

    pub async fn get_journal_status_with_paths(
        &self,
        populator: &dyn UnflushedPathPopulator,
    ) -> JournalResult<TlfJournalStatus> {
        let mut status = self.get_journal_status().await?;
        let mds = {
            let inner = self.inner.lock().await;
            let mut mds = Vec::with_capacity(inner.mds.len() as usize);
            for ordinal in inner.mds.ordinals() {
                mds.push(inner.mds.read(ordinal).await?.md);
            }
            mds
        };
        status.unflushed_paths = populator.populate(&self.tlf_id, &mds).await?;
        Ok(status)
    }

    // ========== flushing ==========

    /// Flushes everything queued from the caller's task, even if
    /// background work is paused. Cancellation is only observed between
    /// entries.
    pub async fn flush(&self, token: &CancellationToken) -> JournalResult<()> {
        loop {
            if token.is_cancelled() {
                return Err(JournalError::Cancelled(format!("flush of {}", self.tlf_id)));
            }
            let flush_guard = tokio::select! {
                guard = self.flush_lock.lock() => guard,
                _ = token.cancelled() => {
                    return Err(JournalError::Cancelled(format!("flush of {}", self.tlf_id)));
                }
            };
            let progress = self.flush_step_locked().await;
            drop(flush_guard);
            match progress {
                Ok(FlushProgress::More) => continue,
                Ok(FlushProgress::Idle) => return Ok(()),
                Err(e) => {
                    self.record_flush_error(Some(e.to_string())).await;
                    return Err(e);
                }
            }
        }
    }

    /// Blocks until every queued entry has been flushed. Cancelling
    /// leaves all entries safely on disk.
    pub async fn wait(&self, token: &CancellationToken) -> JournalResult<()> {
        self.wait_until(token, false).await
    }

    /// Like `wait`, but also waits for any conflict branch created while
    /// flushing to be handed off to conflict resolution.
    pub async fn wait_for_complete_flush(&self, token: &CancellationToken) -> JournalResult<()> {
        self.wait_until(token, true).await
    }

    pub async fn finish_single_op(&self, token: &CancellationToken) -> JournalResult<()> {
        {
            let inner = self.inner.lock().await;
            self.check_open(&inner)?;
        }
        self.worker_state
            .send_modify(|state| state.single_op_pending = true);
        self.wait_for_complete_flush(token).await
    }

    async fn wait_until(&self, token: &CancellationToken, merged: bool) -> JournalResult<()> {
        loop {
            let progressed = self.progress.notified();
            {
                let inner = self.inner.lock().await;
                self.check_open(&inner)?;
                let drained = inner.blocks.is_empty() && inner.mds.is_empty();
                if drained && (!merged || inner.branch_id.is_null()) {
                    return Ok(());
                }
            }
            tokio::select! {
                _ = progressed => {}
                _ = token.cancelled() => {
                    return Err(JournalError::Cancelled(format!("wait on {}", self.tlf_id)));
                }
            }
        }
    }

    async fn flush_step(&self) -> JournalResult<FlushProgress> {
        let _flush_guard = self.flush_lock.lock().await;
        self.flush_step_locked().await
    }

    async fn flush_step_locked(&self) -> JournalResult<FlushProgress> {
        let work = {
            let inner = self.inner.lock().await;
            self.check_open(&inner)?;
            if !inner.enabled {
                return Ok(FlushProgress::Idle);
            }
            if !inner.blocks.is_empty() {
                let mut batch = Vec::new();
                for ordinal in inner
                    .blocks
                    .ordinals()
                    .take(self.deps.options.flush_batch_size)
                {
                    batch.push((ordinal, inner.blocks.read(ordinal).await?));
                }
                FlushWork::Blocks(batch)
            } else if let Some((ordinal, entry)) = inner.mds.read_earliest().await? {
                FlushWork::Md(ordinal, entry)
            } else {
                return Ok(FlushProgress::Idle);
            }
        };

        match work {
            FlushWork::Blocks(batch) => self.flush_blocks(batch).await?,
            FlushWork::Md(ordinal, entry) => self.flush_md(ordinal, entry).await?,
        }
        self.progress.notify_waiters();
        Ok(FlushProgress::More)
    }

    async fn flush_blocks(&self, batch: Vec<(u64, BlockJournalEntry)>) -> JournalResult<()> {
        let started = Instant::now();
        let mut flushed_bytes = 0u64;
        let server = &self.deps.block_server;

        for (ordinal, entry) in batch {
            match &entry {
                BlockJournalEntry::Put { id, .. } => {
                    let buf = fs::read(self.block_data_path(id)).await?;
                    server.put(&self.tlf_id, id, &buf).await?;
                }
                BlockJournalEntry::AddReference { id } => {
                    server.add_block_reference(&self.tlf_id, id).await?;
                }
                BlockJournalEntry::RemoveReferences { ids } => {
                    server.remove_block_references(&self.tlf_id, ids).await?;
                }
            }

            let mut inner = self.inner.lock().await;
            inner.blocks.remove_earliest(ordinal).await?;
            if let BlockJournalEntry::Put { id, size } = &entry {
                if let Err(e) = fs::remove_file(self.block_data_path(id)).await {
                    warn!("remove flushed block {} for {} failed: {}", id, self.tlf_id, e);
                }
                inner.block_bytes = inner.block_bytes.saturating_sub(*size);
                inner.block_files = inner.block_files.saturating_sub(1);
                inner.unflushed_bytes = inner.unflushed_bytes.saturating_sub(*size);
                self.deps.disk_limiter.release(&self.charged_to, *size);
                flushed_bytes += size;
            }
        }

        let quota = match server.get_user_quota_info(&self.charged_to).await {
            Ok(quota) => Some(quota),
            Err(e) => {
                debug!("quota refresh for {} failed: {}", self.charged_to, e);
                None
            }
        };

        let mut inner = self.inner.lock().await;
        if quota.is_some() {
            inner.quota = quota;
        }
        let elapsed = started.elapsed().as_secs_f64();
        if flushed_bytes > 0 && elapsed > 0.0 {
            let rate = flushed_bytes as f64 / elapsed;
            inner.flush_rate = Some(match inner.flush_rate {
                Some(old) => (old + rate) / 2.0,
                None => rate,
            });
        }
        Ok(())
    }

    async fn flush_md(&self, ordinal: u64, entry: MdJournalEntry) -> JournalResult<()> {
        let MdJournalEntry { handle, md } = entry;
        let result = if md.branch_id.is_null() {
            let handle = handle.ok_or_else(|| {
                JournalError::InvalidState(format!(
                    "merged revision {} of {} has no handle",
                    md.revision, self.tlf_id
                ))
            })?;
            self.deps.md_server.put(&handle, &md).await
        } else {
            self.deps.md_server.put_unmerged(&md).await
        };
        match result {
            Ok(()) => {}
            Err(JournalError::Conflict(reason)) if md.branch_id.is_null() => {
                warn!(
                    "conflict flushing revision {} of {}: {}; moving to a local branch",
                    md.revision, self.tlf_id, reason
                );
                return self.convert_to_branch().await;
            }
            Err(e) => return Err(e),
        }

        {
            let mut inner = self.inner.lock().await;
            inner.mds.remove_earliest(ordinal).await?;
        }
        debug!(
            "flushed revision {} of {} (branch {})",
            md.revision, self.tlf_id, md.branch_id
        );
        if let Some(listener) = &self.deps.on_md_flush {
            listener.on_md_flush(&self.tlf_id, md.branch_id, md.revision);
        }
        Ok(())
    }

    /// Moves every queued revision onto a fresh local branch.
    async fn convert_to_branch(&self) -> JournalResult<()> {
        let bid = BranchId::random();
        {
            let mut inner = self.inner.lock().await;
            // Branch record first: reopen repairs half-converted entries.
            write_branch(&self.dir, bid).await?;
            inner.branch_id = bid;
            for ordinal in inner.mds.ordinals() {
                let mut entry = inner.mds.read(ordinal).await?;
                entry.md.branch_id = bid;
                inner.mds.write(ordinal, &entry).await?;
            }
        }
        info!("journal for {} converted to branch {}", self.tlf_id, bid);
        if let Some(listener) = &self.deps.on_branch_change {
            listener.on_tlf_branch_change(&self.tlf_id, bid);
        }
        Ok(())
    }

    async fn record_flush_error(&self, err: Option<String>) {
        let mut inner = self.inner.lock().await;
        inner.last_flush_error = err;
    }

    async fn is_drained(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.blocks.is_empty() && inner.mds.is_empty()
    }

    async fn background_work(self: Arc<Self>, mut state_rx: watch::Receiver<WorkerState>) {
        let options = self.deps.options;
        let mut backoff = options.backoff_min;
        loop {
            let state = *state_rx.borrow_and_update();
            if state.shutdown {
                break;
            }
            if !state.should_work() {
                if state_rx.changed().await.is_err() {
                    break;
                }
                continue;
            }

            match self.flush_step().await {
                Ok(FlushProgress::More) => {
                    backoff = options.backoff_min;
                    self.record_flush_error(None).await;
                }
                Ok(FlushProgress::Idle) => {
                    backoff = options.backoff_min;
                    if state.single_op_pending && self.is_drained().await {
                        self.worker_state
                            .send_modify(|state| state.single_op_pending = false);
                        continue;
                    }
                    tokio::select! {
                        _ = self.work_available.notified() => {}
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(JournalError::Shutdown(_)) => break,
                Err(e) if e.is_transient() => {
                    warn!(
                        "flush of {} failed, retrying in {:?}: {}",
                        self.tlf_id, backoff, e
                    );
                    self.record_flush_error(Some(e.to_string())).await;
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    backoff = (backoff * 2).min(options.backoff_max);
                }
                Err(e) => {
                    error!("flush of {} failed: {}", self.tlf_id, e);
                    self.record_flush_error(Some(e.to_string())).await;
                    tokio::select! {
                        _ = self.work_available.notified() => {}
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!(
            "background work for {} ({} / {}) exiting",
            self.tlf_id, self.uid, self.key
        );
    }
}

async fn scan_block_data(dir: &Path) -> JournalResult<(u64, u64)> {
    let mut read_dir = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => return Err(e.into()),
    };
    let mut bytes = 0u64;
    let mut files = 0u64;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
            let _ = fs::remove_file(&path).await;
            continue;
        }
        bytes += entry.metadata().await?.len();
        files += 1;
    }
    Ok((bytes, files))
}

/// Entry counts and branch of a journal directory, read without opening
/// the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JournalDirSummary {
    pub block_op_count: u64,
    pub md_entry_count: u64,
    pub branch_id: BranchId,
}

pub(crate) async fn summarize_dir(dir: &Path) -> JournalResult<JournalDirSummary> {
    Ok(JournalDirSummary {
        block_op_count: count_entries(&dir.join(BLOCK_JOURNAL_DIR).join(ENTRIES_DIR)).await?,
        md_entry_count: count_entries(&dir.join(MD_JOURNAL_DIR).join(ENTRIES_DIR)).await?,
        branch_id: read_branch(dir).await?,
    })
}

/// `None` when nothing is pending, no rate is known yet, or the estimate
/// falls outside the representable date range.
pub(crate) fn estimate_flush_end(
    now: chrono::DateTime<chrono::Utc>,
    unflushed_bytes: u64,
    bytes_per_sec: f64,
) -> Option<chrono::DateTime<chrono::Utc>> {
    if unflushed_bytes == 0 || bytes_per_sec.is_nan() || bytes_per_sec <= 0.0 {
        return None;
    }
    // Saturates at i64::MAX for tiny rates.
    let millis = (unflushed_bytes as f64 / bytes_per_sec * 1000.0) as i64;
    now.checked_add_signed(chrono::Duration::try_milliseconds(millis)?)
}

async fn read_branch(dir: &Path) -> JournalResult<BranchId> {
    match read_json_file::<BranchRecord>(&dir.join(MD_JOURNAL_DIR).join(BRANCH_FILE)).await {
        Ok(record) => Ok(record.branch_id),
        Err(e) if e.is_not_found() => Ok(BranchId::NULL),
        Err(e) => Err(e),
    }
}

async fn write_branch(dir: &Path, branch_id: BranchId) -> JournalResult<()> {
    write_json_file_atomic(
        &dir.join(MD_JOURNAL_DIR).join(BRANCH_FILE),
        &BranchRecord { branch_id },
    )
    .await
}
