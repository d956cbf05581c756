// In-memory stand-ins for the services a journal manager wraps.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use crate::tlf_journal::TlfJournalDeps;
use crate::{
    BlockCache, BlockCacheLifetime, BlockId, BlockServer, BranchChangeListener, BranchId, Clock,
    DirtyBlockCache, DiskLimiter, FolderInitializer, IdentityResolver, JournalCollaborators, JournalError,
    JournalManager, JournalResult, JournalServiceConfig, LocalDiskLimiter, MdFlushListener, MdOps,
    QuotaInfo, Revision, RootMetadata, TeamId, TlfHandle, TlfId, TlfType,
    UnflushedPathPopulator, UserId, UserOrTeamId, VerifyingKey,
};

static INIT_LOGGER: Once = Once::new();

pub(crate) fn init_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub(crate) type EventLog = Arc<Mutex<Vec<String>>>;

fn record(events: &EventLog, event: String) {
    events.lock().unwrap().push(event);
}

pub(crate) struct MemBlockServer {
    events: EventLog,
    blocks: Mutex<HashMap<BlockId, Vec<u8>>>,
    refs: Mutex<HashMap<BlockId, u32>>,
    quota: Mutex<QuotaInfo>,
    failing_puts: AtomicUsize,
}

impl MemBlockServer {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            blocks: Mutex::new(HashMap::new()),
            refs: Mutex::new(HashMap::new()),
            quota: Mutex::new(QuotaInfo {
                used_bytes: 0,
                limit_bytes: u64::MAX,
            }),
            failing_puts: AtomicUsize::new(0),
        }
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.blocks.lock().unwrap().contains_key(id)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn ref_count(&self, id: &BlockId) -> u32 {
        self.refs.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn set_quota(&self, used_bytes: u64, limit_bytes: u64) {
        *self.quota.lock().unwrap() = QuotaInfo {
            used_bytes,
            limit_bytes,
        };
    }

    /// The next `count` puts fail with a transient error.
    pub fn fail_next_puts(&self, count: usize) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlockServer for MemBlockServer {
    async fn get(&self, _tlf_id: &TlfId, id: &BlockId) -> JournalResult<Vec<u8>> {
        self.blocks
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| JournalError::NotFound(format!("block {}", id)))
    }

    async fn put(&self, _tlf_id: &TlfId, id: &BlockId, buf: &[u8]) -> JournalResult<()> {
        let failing = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(JournalError::RemoteError("injected put failure".to_string()));
        }
        record(&self.events, format!("block_put:{}", id));
        self.blocks.lock().unwrap().insert(id.clone(), buf.to_vec());
        *self.refs.lock().unwrap().entry(id.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn add_block_reference(&self, _tlf_id: &TlfId, id: &BlockId) -> JournalResult<()> {
        record(&self.events, format!("block_add_ref:{}", id));
        let mut refs = self.refs.lock().unwrap();
        match refs.get_mut(id) {
            Some(count) => {
                *count += 1;
                Ok(())
            }
            None => Err(JournalError::NotFound(format!("block {}", id))),
        }
    }

    async fn remove_block_references(
        &self,
        _tlf_id: &TlfId,
        ids: &[BlockId],
    ) -> JournalResult<()> {
        let mut refs = self.refs.lock().unwrap();
        for id in ids {
            record(&self.events, format!("block_remove_ref:{}", id));
            if let Some(count) = refs.get_mut(id) {
                *count = count.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn get_user_quota_info(&self, _charged_to: &UserOrTeamId) -> JournalResult<QuotaInfo> {
        Ok(*self.quota.lock().unwrap())
    }
}

/// Merged history per folder plus unmerged branches. A merged put must
/// follow the head; re-putting the head itself is accepted.
pub(crate) struct MemMdOps {
    events: EventLog,
    merged: Mutex<HashMap<TlfId, Vec<RootMetadata>>>,
    unmerged: Mutex<HashMap<(TlfId, BranchId), Vec<RootMetadata>>>,
    pruned: Mutex<Vec<(TlfId, BranchId)>>,
}

impl MemMdOps {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            merged: Mutex::new(HashMap::new()),
            unmerged: Mutex::new(HashMap::new()),
            pruned: Mutex::new(Vec::new()),
        }
    }

    /// Simulates another device writing `md` to the merged branch.
    pub fn put_from_other_writer(&self, md: RootMetadata) {
        self.merged
            .lock()
            .unwrap()
            .entry(md.tlf_id.clone())
            .or_default()
            .push(md);
    }

    pub fn merged_revisions(&self, tlf_id: &TlfId) -> Vec<Revision> {
        self.merged
            .lock()
            .unwrap()
            .get(tlf_id)
            .map(|mds| mds.iter().map(|md| md.revision).collect())
            .unwrap_or_default()
    }

    pub fn unmerged_revisions(&self, tlf_id: &TlfId, bid: BranchId) -> Vec<Revision> {
        self.unmerged
            .lock()
            .unwrap()
            .get(&(tlf_id.clone(), bid))
            .map(|mds| mds.iter().map(|md| md.revision).collect())
            .unwrap_or_default()
    }

    pub fn pruned(&self) -> Vec<(TlfId, BranchId)> {
        self.pruned.lock().unwrap().clone()
    }
}

#[async_trait]
impl MdOps for MemMdOps {
    async fn get_for_tlf(&self, tlf_id: &TlfId) -> JournalResult<Option<RootMetadata>> {
        Ok(self
            .merged
            .lock()
            .unwrap()
            .get(tlf_id)
            .and_then(|mds| mds.last().cloned()))
    }

    async fn get_unmerged_for_tlf(
        &self,
        tlf_id: &TlfId,
        bid: BranchId,
    ) -> JournalResult<Option<RootMetadata>> {
        Ok(self
            .unmerged
            .lock()
            .unwrap()
            .get(&(tlf_id.clone(), bid))
            .and_then(|mds| mds.last().cloned()))
    }

    async fn put(&self, _handle: &TlfHandle, md: &RootMetadata) -> JournalResult<()> {
        let mut merged = self.merged.lock().unwrap();
        let history = merged.entry(md.tlf_id.clone()).or_default();
        if let Some(head) = history.last() {
            if head == md {
                return Ok(());
            }
            if md.revision != head.revision.next() {
                return Err(JournalError::Conflict(format!(
                    "head of {} is {}, got {}",
                    md.tlf_id, head.revision, md.revision
                )));
            }
        }
        record(&self.events, format!("md_put:{}", md.revision));
        history.push(md.clone());
        Ok(())
    }

    async fn put_unmerged(&self, md: &RootMetadata) -> JournalResult<()> {
        record(&self.events, format!("md_put_unmerged:{}", md.revision));
        self.unmerged
            .lock()
            .unwrap()
            .entry((md.tlf_id.clone(), md.branch_id))
            .or_default()
            .push(md.clone());
        Ok(())
    }

    async fn prune_branch(&self, tlf_id: &TlfId, bid: BranchId) -> JournalResult<()> {
        self.pruned.lock().unwrap().push((tlf_id.clone(), bid));
        self.unmerged.lock().unwrap().remove(&(tlf_id.clone(), bid));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemBlockCache {
    blocks: Mutex<HashMap<BlockId, (Arc<Vec<u8>>, BlockCacheLifetime)>>,
}

impl MemBlockCache {
    pub fn lifetime_of(&self, id: &BlockId) -> Option<BlockCacheLifetime> {
        self.blocks.lock().unwrap().get(id).map(|(_, lifetime)| *lifetime)
    }
}

#[async_trait]
impl BlockCache for MemBlockCache {
    async fn get(&self, id: &BlockId) -> Option<Arc<Vec<u8>>> {
        self.blocks.lock().unwrap().get(id).map(|(block, _)| block.clone())
    }

    async fn put(
        &self,
        _tlf_id: &TlfId,
        id: &BlockId,
        block: Arc<Vec<u8>>,
        lifetime: BlockCacheLifetime,
    ) -> JournalResult<()> {
        self.blocks
            .lock()
            .unwrap()
            .insert(id.clone(), (block, lifetime));
        Ok(())
    }

    async fn delete_permanent(&self, id: &BlockId) -> JournalResult<()> {
        let mut blocks = self.blocks.lock().unwrap();
        if matches!(blocks.get(id), Some((_, BlockCacheLifetime::Permanent))) {
            blocks.remove(id);
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemDirtyBlockCache {
    blocks: Mutex<HashMap<(TlfId, BlockId), Arc<Vec<u8>>>>,
    syncing: Mutex<HashMap<TlfId, u32>>,
}

impl MemDirtyBlockCache {
    pub fn syncing(&self, tlf_id: &TlfId) -> u32 {
        self.syncing.lock().unwrap().get(tlf_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl DirtyBlockCache for MemDirtyBlockCache {
    async fn get(&self, tlf_id: &TlfId, id: &BlockId) -> Option<Arc<Vec<u8>>> {
        self.blocks
            .lock()
            .unwrap()
            .get(&(tlf_id.clone(), id.clone()))
            .cloned()
    }

    async fn put(&self, tlf_id: &TlfId, id: &BlockId, block: Arc<Vec<u8>>) -> JournalResult<()> {
        self.blocks
            .lock()
            .unwrap()
            .insert((tlf_id.clone(), id.clone()), block);
        Ok(())
    }

    async fn delete(&self, tlf_id: &TlfId, id: &BlockId) -> JournalResult<()> {
        self.blocks
            .lock()
            .unwrap()
            .remove(&(tlf_id.clone(), id.clone()));
        Ok(())
    }

    async fn is_dirty(&self, tlf_id: &TlfId, id: &BlockId) -> bool {
        self.blocks
            .lock()
            .unwrap()
            .contains_key(&(tlf_id.clone(), id.clone()))
    }

    async fn is_any_dirty(&self, tlf_id: &TlfId) -> bool {
        self.blocks
            .lock()
            .unwrap()
            .keys()
            .any(|(tlf, _)| tlf == tlf_id)
    }

    async fn sync_started(&self, tlf_id: &TlfId) {
        *self
            .syncing
            .lock()
            .unwrap()
            .entry(tlf_id.clone())
            .or_insert(0) += 1;
    }

    async fn sync_finished(&self, tlf_id: &TlfId) {
        if let Some(count) = self.syncing.lock().unwrap().get_mut(tlf_id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[derive(Default)]
pub(crate) struct StaticIdentityResolver {
    team_writers: Mutex<HashSet<(TeamId, UserId)>>,
    team_roots: Mutex<HashMap<TeamId, TeamId>>,
}

impl StaticIdentityResolver {
    pub fn add_team_writer(&self, team: &TeamId, uid: &UserId) {
        self.team_writers
            .lock()
            .unwrap()
            .insert((team.clone(), uid.clone()));
    }

    pub fn set_team_root(&self, sub_team: &TeamId, root: &TeamId) {
        self.team_roots
            .lock()
            .unwrap()
            .insert(sub_team.clone(), root.clone());
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn is_team_writer(
        &self,
        team: &TeamId,
        uid: &UserId,
        _key: &VerifyingKey,
    ) -> JournalResult<bool> {
        Ok(self
            .team_writers
            .lock()
            .unwrap()
            .contains(&(team.clone(), uid.clone())))
    }

    async fn get_team_root_id(&self, team: &TeamId) -> JournalResult<TeamId> {
        self.team_roots
            .lock()
            .unwrap()
            .get(team)
            .cloned()
            .ok_or_else(|| JournalError::NotFound(format!("root of team {}", team)))
    }
}

pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc::now()),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[derive(Default)]
pub(crate) struct RecordingListener {
    pub branch_changes: Mutex<Vec<(TlfId, BranchId)>>,
    pub md_flushes: Mutex<Vec<(TlfId, BranchId, Revision)>>,
}

impl BranchChangeListener for RecordingListener {
    fn on_tlf_branch_change(&self, tlf_id: &TlfId, bid: BranchId) {
        self.branch_changes
            .lock()
            .unwrap()
            .push((tlf_id.clone(), bid));
    }
}

impl MdFlushListener for RecordingListener {
    fn on_md_flush(&self, tlf_id: &TlfId, bid: BranchId, revision: Revision) {
        self.md_flushes
            .lock()
            .unwrap()
            .push((tlf_id.clone(), bid, revision));
    }
}

#[derive(Default)]
pub(crate) struct RecordingInitializer {
    pub heads: Mutex<Vec<(TlfId, Revision)>>,
}

#[async_trait]
impl FolderInitializer for RecordingInitializer {
    async fn init_folder(&self, tlf_id: &TlfId, head: &RootMetadata) -> JournalResult<()> {
        self.heads
            .lock()
            .unwrap()
            .push((tlf_id.clone(), head.revision));
        Ok(())
    }
}

pub(crate) struct RevisionPathPopulator;

#[async_trait]
impl UnflushedPathPopulator for RevisionPathPopulator {
    async fn populate(&self, tlf_id: &TlfId, mds: &[RootMetadata]) -> JournalResult<Vec<String>> {
        Ok(mds
            .iter()
            .map(|md| format!("/{}/rev{}", tlf_id, md.revision))
            .collect())
    }
}

/// Delegates to a `LocalDiskLimiter`, but stalls the calling thread or
/// panics when a reopened journal accounts for its stored bytes.
pub(crate) struct HookedDiskLimiter {
    pub inner: Arc<LocalDiskLimiter>,
    pub stall_on_stored: Duration,
    pub panic_on_stored_bytes: Option<u64>,
}

#[async_trait]
impl DiskLimiter for HookedDiskLimiter {
    async fn reserve(&self, charged_to: &UserOrTeamId, bytes: u64) -> JournalResult<()> {
        self.inner.reserve(charged_to, bytes).await
    }

    fn on_stored(&self, charged_to: &UserOrTeamId, bytes: u64) {
        if self.panic_on_stored_bytes == Some(bytes) {
            panic!("refusing to account for {} stored bytes", bytes);
        }
        std::thread::sleep(self.stall_on_stored);
        self.inner.on_stored(charged_to, bytes);
    }

    fn release(&self, charged_to: &UserOrTeamId, bytes: u64) {
        self.inner.release(charged_to, bytes);
    }

    fn status(&self, charged_to: Option<&UserOrTeamId>) -> serde_json::Value {
        self.inner.status(charged_to)
    }
}

pub(crate) struct TestEnv {
    pub dir: TempDir,
    pub events: EventLog,
    pub block_server: Arc<MemBlockServer>,
    pub md_ops: Arc<MemMdOps>,
    pub block_cache: Arc<MemBlockCache>,
    pub dirty_cache: Arc<MemDirtyBlockCache>,
    pub resolver: Arc<StaticIdentityResolver>,
    pub clock: Arc<ManualClock>,
    pub limiter: Arc<LocalDiskLimiter>,
    pub listener: Arc<RecordingListener>,
    pub initializer: Arc<RecordingInitializer>,
    pub uid: UserId,
    pub key: VerifyingKey,
}

impl TestEnv {
    pub fn new() -> Self {
        init_logging();
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let config = Self::base_config();
        Self {
            dir: tempfile::tempdir().expect("create temp dir"),
            block_server: Arc::new(MemBlockServer::new(events.clone())),
            md_ops: Arc::new(MemMdOps::new(events.clone())),
            events,
            block_cache: Arc::new(MemBlockCache::default()),
            dirty_cache: Arc::new(MemDirtyBlockCache::default()),
            resolver: Arc::new(StaticIdentityResolver::default()),
            clock: Arc::new(ManualClock::new()),
            limiter: Arc::new(LocalDiskLimiter::from_config(&config)),
            listener: Arc::new(RecordingListener::default()),
            initializer: Arc::new(RecordingInitializer::default()),
            uid: UserId::random(),
            key: VerifyingKey::random(),
        }
    }

    fn base_config() -> JournalServiceConfig {
        JournalServiceConfig {
            flush_backoff_min_ms: 5,
            flush_backoff_max_ms: 50,
            disk_limit_timeout_ms: 50,
            ..Default::default()
        }
    }

    pub fn service_config(&self) -> JournalServiceConfig {
        JournalServiceConfig {
            journal_root: self.dir.path().to_path_buf(),
            ..Self::base_config()
        }
    }

    pub fn collaborators(&self) -> JournalCollaborators {
        JournalCollaborators {
            block_cache: self.block_cache.clone(),
            dirty_block_cache: self.dirty_cache.clone(),
            block_server: self.block_server.clone(),
            md_ops: self.md_ops.clone(),
            identity_resolver: self.resolver.clone(),
            clock: self.clock.clone(),
            disk_limiter: self.limiter.clone(),
            on_branch_change: Some(self.listener.clone()),
            on_md_flush: Some(self.listener.clone()),
            folder_initializer: Some(self.initializer.clone()),
        }
    }

    pub fn manager(&self) -> Arc<JournalManager> {
        self.manager_with(self.service_config())
    }

    pub fn manager_with(&self, config: JournalServiceConfig) -> Arc<JournalManager> {
        JournalManager::new(config, self.collaborators()).expect("create journal manager")
    }

    pub fn manager_with_limiter(&self, limiter: Arc<dyn DiskLimiter>) -> Arc<JournalManager> {
        let collaborators = JournalCollaborators {
            disk_limiter: limiter,
            ..self.collaborators()
        };
        JournalManager::new(self.service_config(), collaborators).expect("create journal manager")
    }

    pub fn journal_deps(&self) -> TlfJournalDeps {
        TlfJournalDeps {
            block_server: self.block_server.clone(),
            md_server: self.md_ops.clone(),
            disk_limiter: self.limiter.clone(),
            clock: self.clock.clone(),
            on_branch_change: Some(self.listener.clone()),
            on_md_flush: Some(self.listener.clone()),
            options: self.service_config().tlf_journal_options(),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// A private folder `uid` can write.
    pub fn private_handle(&self, uid: &UserId) -> TlfHandle {
        TlfHandle {
            name: format!("private/{}", uid),
            tlf_type: TlfType::Private,
            resolved_writers: vec![UserOrTeamId::User(uid.clone())],
            resolved_readers: Vec::new(),
        }
    }

    pub fn make_md(&self, tlf_id: &TlfId, revision: u64) -> RootMetadata {
        RootMetadata {
            tlf_id: tlf_id.clone(),
            revision: Revision(revision),
            branch_id: BranchId::NULL,
            writer: self.uid.clone(),
            writer_key: self.key.clone(),
            data: format!("revision {}", revision).into_bytes(),
        }
    }
}
