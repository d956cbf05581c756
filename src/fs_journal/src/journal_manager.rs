use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::fs;
use tokio::sync::{mpsc, Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::delegate::{JournalBlockCache, JournalBlockServer, JournalDirtyBlockCache, JournalMdOps};
use crate::layout::{JournalLayout, JournalManagerConfig, TlfJournalInfo, JOURNAL_LAYOUT_VERSION};
use crate::status::{JournalManagerStatus, TlfJournalStatus};
use crate::tlf_journal::{TlfJournal, TlfJournalDeps};
use crate::{
    is_writer_from_handle, BackgroundWorkStatus, BlockCache, BlockServer, BranchChangeListener,
    Clock, DirtyBlockCache, DiskLimitTimeout, DiskLimiter, FolderInitializer, IdentityResolver,
    JournalError, JournalResult, JournalServiceConfig, MdFlushListener, MdOps, TlfHandle, TlfId,
    TlfType, UnflushedPathPopulator, UserId, UserOrTeamId, VerifyingKey,
};

/// The services a journal manager sits in front of, plus the hooks it
/// reports to.
#[derive(Clone)]
pub struct JournalCollaborators {
    pub block_cache: Arc<dyn BlockCache>,
    pub dirty_block_cache: Arc<dyn DirtyBlockCache>,
    pub block_server: Arc<dyn BlockServer>,
    pub md_ops: Arc<dyn MdOps>,
    pub identity_resolver: Arc<dyn IdentityResolver>,
    pub clock: Arc<dyn Clock>,
    pub disk_limiter: Arc<dyn DiskLimiter>,
    pub on_branch_change: Option<Arc<dyn BranchChangeListener>>,
    pub on_md_flush: Option<Arc<dyn MdFlushListener>>,
    pub folder_initializer: Option<Arc<dyn FolderInitializer>>,
}

struct ManagerState {
    identity: Option<(UserId, VerifyingKey)>,
    // Set while a bulk reopen for `identity` runs outside the lock.
    reopening: bool,
    config: JournalManagerConfig,
    journals: HashMap<TlfId, Arc<TlfJournal>>,
}

/// Owns every per-folder journal of the process and decides which
/// folders get one.
///
/// Journals stay in the map after `disable` and after `shutdown`; only
/// `shutdown_existing_journals` (logout) clears it.
pub struct JournalManager {
    service_config: JournalServiceConfig,
    layout: JournalLayout,
    collaborators: JournalCollaborators,
    journal_deps: TlfJournalDeps,
    state: RwLock<ManagerState>,
    // Incremented only while holding the state write lock.
    dirty_ops: Mutex<HashMap<TlfId, u32>>,
    dirty_ops_drained: Notify,
    reopen_finished: Notify,
    last_quota_error: Mutex<Option<DateTime<Utc>>>,
    last_disk_limit_error: Mutex<Option<DateTime<Utc>>>,
}

/// Ends a dirty op when dropped.
pub struct DirtyOpGuard {
    manager: Arc<JournalManager>,
    tlf_id: TlfId,
}

impl Drop for DirtyOpGuard {
    fn drop(&mut self) {
        self.manager.dirty_op_end(&self.tlf_id);
    }
}

struct ReopenContext {
    uid: UserId,
    key: VerifyingKey,
    layout: JournalLayout,
    deps: TlfJournalDeps,
    bws: BackgroundWorkStatus,
}

impl ReopenContext {
    async fn reopen(&self, dir: PathBuf, is_dir: bool) -> Option<(TlfId, Arc<TlfJournal>)> {
        if !is_dir {
            debug!("skipping file {}", dir.display());
            return None;
        }
        let info = match TlfJournalInfo::read(&dir).await {
            Ok(info) => info,
            Err(e) => {
                debug!("skipping non-journal dir {}: {}", dir.display(), e);
                return None;
            }
        };
        if info.uid != self.uid {
            debug!("skipping dir {} due to mismatched uid {}", dir.display(), info.uid);
            return None;
        }
        if info.verifying_key != self.key {
            debug!(
                "skipping dir {} due to mismatched key {}",
                dir.display(),
                info.verifying_key
            );
            return None;
        }
        let expected = self.layout.tlf_journal_path(&self.key, &info.tlf_id);
        if dir != expected {
            debug!(
                "skipping misnamed dir {}, expected {}",
                dir.display(),
                expected.display()
            );
            return None;
        }

        let tlf_id = info.tlf_id.clone();
        let journal = match TlfJournal::open(
            self.uid.clone(),
            self.key.clone(),
            info.tlf_id,
            info.charged_to,
            dir.clone(),
            self.deps.clone(),
            self.bws,
        )
        .await
        {
            Ok(journal) => journal,
            Err(e) => {
                warn!("reopen journal for {} failed: {}", tlf_id, e);
                return None;
            }
        };

        match journal.get_journal_entry_counts().await {
            Ok((0, 0)) => {
                debug!("removing empty journal for {}", tlf_id);
                journal.shutdown().await;
                if let Err(e) = fs::remove_dir_all(&dir).await {
                    warn!("remove empty journal dir {} failed: {}", dir.display(), e);
                }
                None
            }
            Ok(_) => Some((tlf_id, journal)),
            Err(e) => {
                warn!("get entry counts of journal for {} failed: {}", tlf_id, e);
                journal.shutdown().await;
                None
            }
        }
    }
}

impl JournalManager {
    pub fn new(
        service_config: JournalServiceConfig,
        collaborators: JournalCollaborators,
    ) -> JournalResult<Arc<Self>> {
        let layout = JournalLayout::new(&service_config.journal_root)?;
        let journal_deps = TlfJournalDeps {
            block_server: collaborators.block_server.clone(),
            md_server: collaborators.md_ops.clone(),
            disk_limiter: collaborators.disk_limiter.clone(),
            clock: collaborators.clock.clone(),
            on_branch_change: collaborators.on_branch_change.clone(),
            on_md_flush: collaborators.on_md_flush.clone(),
            options: service_config.tlf_journal_options(),
        };
        Ok(Arc::new(Self {
            service_config,
            layout,
            collaborators,
            journal_deps,
            state: RwLock::new(ManagerState {
                identity: None,
                reopening: false,
                config: JournalManagerConfig::default(),
                journals: HashMap::new(),
            }),
            dirty_ops: Mutex::new(HashMap::new()),
            dirty_ops_drained: Notify::new(),
            reopen_finished: Notify::new(),
            last_quota_error: Mutex::new(None),
            last_disk_limit_error: Mutex::new(None),
        }))
    }

    pub fn layout(&self) -> &JournalLayout {
        &self.layout
    }

    // ========== identity ==========

    /// Adopts (uid, key) as the current identity and reopens every journal
    /// on disk that belongs to it. Any error leaves the manager with no
    /// identity and no journals.
    ///
    /// The directory scan runs without the state lock, so status calls
    /// proceed meanwhile; journal lookups, enable and disable wait for the
    /// reopened journals to be installed. Must be driven to completion:
    /// dropping the future mid-scan leaves those callers waiting.
    pub async fn enable_existing_journals(
        &self,
        uid: &UserId,
        key: &VerifyingKey,
        bws: BackgroundWorkStatus,
    ) -> JournalResult<()> {
        debug!("enabling existing journals for {} ({})", uid, bws);
        {
            let mut state = self.write_state_when_reopened().await;
            match &state.identity {
                Some((current_uid, current_key)) if current_uid == uid && current_key == key => {
                    return Ok(());
                }
                Some((current_uid, current_key)) => {
                    return Err(JournalError::InvalidState(format!(
                        "trying to switch identity from {} / {} to {} / {}",
                        current_uid, current_key, uid, key
                    )));
                }
                None => {}
            }

            let config = match self.layout.read_config().await? {
                Some(config) => config,
                None => {
                    let config = JournalManagerConfig::default();
                    self.layout.write_config(&config).await?;
                    config
                }
            };
            state.config = config;
            state.identity = Some((uid.clone(), key.clone()));
            state.reopening = true;
        }

        let reopened = self.reopen_existing(uid, key, bws).await;

        let mut state = self.state.write().await;
        state.reopening = false;
        let result = match reopened {
            Ok(journals) => {
                for (tlf_id, journal) in journals {
                    if self.dirty_op_count(&tlf_id) > 0 {
                        warn!("journal for {} reopened with dirty ops outstanding", tlf_id);
                    }
                    state.journals.insert(tlf_id, journal);
                }
                info!(
                    "enabled {} existing journals under {}",
                    state.journals.len(),
                    self.layout.root_path().display()
                );
                Ok(())
            }
            Err(e) => {
                warn!("enabling existing journals failed, reverting: {}", e);
                Self::shutdown_journals_locked(&mut state).await;
                Err(e)
            }
        };
        drop(state);
        self.reopen_finished.notify_waiters();
        result
    }

    async fn reopen_existing(
        &self,
        uid: &UserId,
        key: &VerifyingKey,
        bws: BackgroundWorkStatus,
    ) -> JournalResult<Vec<(TlfId, Arc<TlfJournal>)>> {
        let entries = self.layout.list_entries().await?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let worker_count = self.service_config.reopen_workers.max(1).min(entries.len());
        let (work_tx, work_rx) = mpsc::channel(entries.len());
        for entry in entries.iter().cloned() {
            work_tx
                .send(entry)
                .await
                .map_err(|e| JournalError::Internal(format!("queue reopen work failed: {}", e)))?;
        }
        drop(work_tx);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::channel(entries.len());

        let ctx = Arc::new(ReopenContext {
            uid: uid.clone(),
            key: key.clone(),
            layout: self.layout.clone(),
            deps: self.journal_deps.clone(),
            bws,
        });

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let ctx = ctx.clone();
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let next = work_rx.lock().await.recv().await;
                    let Some((dir, is_dir)) = next else {
                        break;
                    };
                    if let Some(reopened) = ctx.reopen(dir, is_dir).await {
                        if result_tx.send(reopened).await.is_err() {
                            break;
                        }
                    }
                }
            }));
        }
        drop(result_tx);

        let mut join_error = None;
        for worker in workers {
            if let Err(e) = worker.await {
                join_error = Some(JournalError::Internal(format!("reopen worker failed: {}", e)));
            }
        }

        let mut reopened = Vec::new();
        while let Some(result) = result_rx.recv().await {
            reopened.push(result);
        }
        if let Some(e) = join_error {
            for (_, journal) in reopened {
                journal.shutdown().await;
            }
            return Err(e);
        }
        Ok(reopened)
    }

    /// Logout: waits for dirty ops to drain, then shuts down and forgets
    /// every journal along with the identity.
    pub async fn shutdown_existing_journals(&self) {
        let mut state = self.lock_state_when_drained().await;
        debug!("shutting down existing journals");
        Self::shutdown_journals_locked(&mut state).await;
    }

    async fn shutdown_journals_locked(state: &mut ManagerState) {
        for journal in state.journals.values() {
            journal.shutdown().await;
        }
        state.journals.clear();
        state.identity = None;
    }

    /// Stops all background work. Journals stay in the map, so later
    /// access fails with `JournalError::Shutdown` instead of creating a
    /// fresh journal.
    pub async fn shutdown(&self) {
        let state = self.lock_state_when_drained().await;
        info!("shutting down {} journals", state.journals.len());
        for journal in state.journals.values() {
            journal.shutdown().await;
        }
    }

    // ========== enable / disable ==========

    pub async fn enable(
        &self,
        tlf_id: &TlfId,
        handle: Option<&TlfHandle>,
        bws: BackgroundWorkStatus,
    ) -> JournalResult<()> {
        let team_owner = match tlf_id.tlf_type() {
            TlfType::SingleTeam => Some(self.team_charged_to(tlf_id, handle).await?),
            _ => None,
        };

        let mut state = self.write_state_when_reopened().await;
        let charged_to = match (team_owner, &state.identity) {
            (Some(team), _) => team,
            (None, Some((uid, _))) => UserOrTeamId::User(uid.clone()),
            (None, None) => {
                return Err(JournalError::InvalidState(format!(
                    "cannot enable journal for {} without a current identity",
                    tlf_id
                )));
            }
        };
        let journal = self.enable_locked(&state, tlf_id, charged_to, bws).await?;
        state.journals.insert(tlf_id.clone(), journal);
        Ok(())
    }

    async fn team_charged_to(
        &self,
        tlf_id: &TlfId,
        handle: Option<&TlfHandle>,
    ) -> JournalResult<UserOrTeamId> {
        let handle = handle.ok_or_else(|| {
            JournalError::InvalidParam(format!("no handle provided for single-team folder {}", tlf_id))
        })?;
        match handle.first_resolved_writer() {
            Some(UserOrTeamId::Team(team)) if team.is_sub_team() => {
                // Storage is charged to the root team.
                let root = self
                    .collaborators
                    .identity_resolver
                    .get_team_root_id(team)
                    .await?;
                Ok(UserOrTeamId::Team(root))
            }
            Some(UserOrTeamId::Team(team)) => Ok(UserOrTeamId::Team(team.clone())),
            _ => Err(JournalError::InvalidParam(format!(
                "single-team folder {} has no team writer",
                tlf_id
            ))),
        }
    }

    /// Returns an enabled journal without installing it.
    async fn enable_locked(
        &self,
        state: &ManagerState,
        tlf_id: &TlfId,
        charged_to: UserOrTeamId,
        bws: BackgroundWorkStatus,
    ) -> JournalResult<Arc<TlfJournal>> {
        debug!("enabling journal for {} ({})", tlf_id, bws);
        let (uid, key) = state.identity.clone().ok_or_else(|| {
            JournalError::InvalidState(format!(
                "cannot enable journal for {} without a current identity",
                tlf_id
            ))
        })?;

        if let Some(journal) = state.journals.get(tlf_id) {
            journal.enable().await?;
            return Ok(journal.clone());
        }

        self.check_not_dirty(tlf_id).await?;
        let dir = self.layout.tlf_journal_path(&key, tlf_id);
        TlfJournal::open(
            uid,
            key,
            tlf_id.clone(),
            charged_to,
            dir,
            self.journal_deps.clone(),
            bws,
        )
        .await
    }

    /// Returns whether the journal was enabled before. The journal stays
    /// registered either way.
    pub async fn disable(&self, tlf_id: &TlfId) -> JournalResult<bool> {
        debug!("disabling journal for {}", tlf_id);
        let state = self.write_state_when_reopened().await;
        let Some(journal) = state.journals.get(tlf_id).cloned() else {
            debug!("journal doesn't exist for {}", tlf_id);
            return Ok(false);
        };

        self.check_not_dirty(tlf_id).await?;
        let was_enabled = journal.disable().await?;
        if was_enabled {
            debug!("disabled journal for {}", tlf_id);
        }
        Ok(was_enabled)
    }

    async fn check_not_dirty(&self, tlf_id: &TlfId) -> JournalResult<()> {
        if self.dirty_op_count(tlf_id) > 0 {
            return Err(JournalError::Dirty(format!(
                "outstanding dirty ops for {}",
                tlf_id
            )));
        }
        if self.collaborators.dirty_block_cache.is_any_dirty(tlf_id).await {
            return Err(JournalError::Dirty(format!(
                "dirty blocks outstanding for {}",
                tlf_id
            )));
        }
        Ok(())
    }

    pub async fn enable_auto(&self) -> JournalResult<()> {
        let mut state = self.state.write().await;
        if state.config.enable_auto {
            return Ok(());
        }
        let config = JournalManagerConfig {
            enable_auto: true,
            enable_auto_set_by_user: true,
        };
        self.layout.write_config(&config).await?;
        state.config = config;
        info!("auto journaling enabled");
        Ok(())
    }

    pub async fn disable_auto(&self) -> JournalResult<()> {
        let mut state = self.state.write().await;
        let (enabled, _) = state.config.get_enable_auto();
        if !enabled {
            return Ok(());
        }
        let config = JournalManagerConfig {
            enable_auto: false,
            enable_auto_set_by_user: true,
        };
        self.layout.write_config(&config).await?;
        state.config = config;
        info!("auto journaling disabled");
        Ok(())
    }

    // ========== lookup ==========

    /// Finds the folder's journal, creating one when auto journaling is on
    /// and `handle` shows the current identity can write the folder.
    pub(crate) async fn get_tlf_journal(
        &self,
        tlf_id: &TlfId,
        handle: Option<&TlfHandle>,
    ) -> Option<Arc<TlfJournal>> {
        let (uid, key, enable_auto) = {
            let state = self.read_state_when_reopened().await;
            // No journals while logged out.
            let (uid, key) = state.identity.clone()?;
            if let Some(journal) = state.journals.get(tlf_id) {
                return Some(journal.clone());
            }
            (uid, key, state.config.get_enable_auto().0)
        };
        if !enable_auto {
            return None;
        }
        let handle = handle?;

        match is_writer_from_handle(
            handle,
            self.collaborators.identity_resolver.as_ref(),
            &uid,
            &key,
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!("couldn't find writership for {}: {}", tlf_id, e);
                return None;
            }
        }

        let bws = if self.service_config.single_op_mode {
            BackgroundWorkStatus::SingleOpEnabled
        } else {
            BackgroundWorkStatus::Enabled
        };
        debug!("enabling a new journal for {} ({})", tlf_id, bws);
        if let Err(e) = self.enable(tlf_id, Some(handle), bws).await {
            warn!("couldn't enable journal for {}: {}", tlf_id, e);
            return None;
        }

        let state = self.state.read().await;
        state.journals.get(tlf_id).cloned()
    }

    pub async fn has_tlf_journal(&self, tlf_id: &TlfId) -> bool {
        let state = self.state.read().await;
        state.journals.contains_key(tlf_id)
    }

    // ========== per-folder passthroughs ==========

    pub async fn flush(&self, tlf_id: &TlfId, token: &CancellationToken) -> JournalResult<()> {
        match self.get_tlf_journal(tlf_id, None).await {
            Some(journal) => journal.flush(token).await,
            None => {
                debug!("journal not enabled for {}", tlf_id);
                Ok(())
            }
        }
    }

    pub async fn wait(&self, tlf_id: &TlfId, token: &CancellationToken) -> JournalResult<()> {
        match self.get_tlf_journal(tlf_id, None).await {
            Some(journal) => journal.wait(token).await,
            None => {
                debug!("journal not enabled for {}", tlf_id);
                Ok(())
            }
        }
    }

    pub async fn wait_for_complete_flush(
        &self,
        tlf_id: &TlfId,
        token: &CancellationToken,
    ) -> JournalResult<()> {
        match self.get_tlf_journal(tlf_id, None).await {
            Some(journal) => journal.wait_for_complete_flush(token).await,
            None => {
                debug!("journal not enabled for {}", tlf_id);
                Ok(())
            }
        }
    }

    pub async fn finish_single_op(
        &self,
        tlf_id: &TlfId,
        token: &CancellationToken,
    ) -> JournalResult<()> {
        match self.get_tlf_journal(tlf_id, None).await {
            Some(journal) => journal.finish_single_op(token).await,
            None => {
                debug!("journal not enabled for {}", tlf_id);
                Ok(())
            }
        }
    }

    pub async fn pause_background_work(&self, tlf_id: &TlfId) {
        match self.get_tlf_journal(tlf_id, None).await {
            Some(journal) => journal.pause_background_work(),
            None => debug!("could not find journal for {} to pause", tlf_id),
        }
    }

    pub async fn resume_background_work(&self, tlf_id: &TlfId) {
        match self.get_tlf_journal(tlf_id, None).await {
            Some(journal) => journal.resume_background_work(),
            None => debug!("could not find journal for {} to resume", tlf_id),
        }
    }

    // ========== status ==========

    /// Aggregate diagnostics plus the ids of every registered journal.
    pub async fn status(&self) -> (JournalManagerStatus, Vec<TlfId>) {
        let state = self.state.read().await;
        let mut stored_bytes = 0u64;
        let mut stored_files = 0u64;
        let mut unflushed_bytes = 0u64;
        let mut end_estimate: Option<DateTime<Utc>> = None;
        let mut tlf_ids = Vec::with_capacity(state.journals.len());

        for (tlf_id, journal) in state.journals.iter() {
            match journal.get_byte_counts().await {
                Ok(counts) => {
                    stored_bytes += counts.stored_bytes;
                    stored_files += counts.stored_files;
                    unflushed_bytes += counts.unflushed_bytes;
                }
                Err(e) => warn!("couldn't get byte counts for {}: {}", tlf_id, e),
            }
            if let Some(estimate) = journal.end_estimate_now().await {
                end_estimate = Some(end_estimate.map_or(estimate, |e| e.max(estimate)));
            }
            tlf_ids.push(tlf_id.clone());
        }
        tlf_ids.sort();

        let (enable_auto, enable_auto_set_by_user) = state.config.get_enable_auto();
        let owner = state
            .identity
            .as_ref()
            .map(|(uid, _)| UserOrTeamId::User(uid.clone()));
        let status = JournalManagerStatus {
            root_dir: self.layout.root_path(),
            version: JOURNAL_LAYOUT_VERSION,
            current_uid: state.identity.as_ref().map(|(uid, _)| uid.clone()),
            current_verifying_key: state.identity.as_ref().map(|(_, key)| key.clone()),
            enable_auto,
            enable_auto_set_by_user,
            journal_count: tlf_ids.len(),
            stored_bytes,
            stored_files,
            unflushed_bytes,
            end_estimate,
            disk_limiter_status: self.collaborators.disk_limiter.status(owner.as_ref()),
        };
        (status, tlf_ids)
    }

    pub async fn journal_status(&self, tlf_id: &TlfId) -> JournalResult<TlfJournalStatus> {
        let journal = self
            .get_tlf_journal(tlf_id, None)
            .await
            .ok_or_else(|| JournalError::NotEnabled(tlf_id.clone()))?;
        journal.get_journal_status().await
    }

    pub async fn journal_status_with_paths(
        &self,
        tlf_id: &TlfId,
        populator: &dyn UnflushedPathPopulator,
    ) -> JournalResult<TlfJournalStatus> {
        let journal = self
            .get_tlf_journal(tlf_id, None)
            .await
            .ok_or_else(|| JournalError::NotEnabled(tlf_id.clone()))?;
        journal.get_journal_status_with_paths(populator).await
    }

    /// Hands the head of every registered journal to the folder
    /// initializer, concurrently. Await the handle to know when all
    /// folders are done.
    pub async fn init_folders_for_existing_journals(&self) -> JoinHandle<()> {
        let journals: Vec<(TlfId, Arc<TlfJournal>)> = {
            let state = self.read_state_when_reopened().await;
            state
                .journals
                .iter()
                .map(|(tlf_id, journal)| (tlf_id.clone(), journal.clone()))
                .collect()
        };
        let initializer = self.collaborators.folder_initializer.clone();

        tokio::spawn(async move {
            let Some(initializer) = initializer else {
                return;
            };
            let tasks = journals.into_iter().map(|(tlf_id, journal)| {
                let initializer = initializer.clone();
                async move {
                    debug!("initializing folder for non-empty journal {}", tlf_id);
                    let result = async {
                        let bid = journal.branch_id().await?;
                        match journal.md_head(bid).await? {
                            Some(head) => initializer.init_folder(&tlf_id, &head).await,
                            None => Ok(()),
                        }
                    }
                    .await;
                    if let Err(e) = result {
                        warn!("initializing folder for journal {} failed: {}", tlf_id, e);
                    }
                }
            });
            futures::future::join_all(tasks).await;
        })
    }

    // ========== dirty ops ==========

    fn dirty_op_count(&self, tlf_id: &TlfId) -> u32 {
        self.dirty_ops
            .lock()
            .map(|ops| ops.get(tlf_id).copied().unwrap_or(0))
            .unwrap_or_else(|e| e.into_inner().get(tlf_id).copied().unwrap_or(0))
    }

    fn dirty_ops_pending(&self) -> usize {
        self.dirty_ops
            .lock()
            .map(|ops| ops.len())
            .unwrap_or_else(|e| e.into_inner().len())
    }

    /// Marks a write in flight for `tlf_id`; disable and shutdown wait
    /// for it to end.
    pub async fn dirty_op_start(&self, tlf_id: &TlfId) {
        let _state = self.state.write().await;
        let mut ops = self.dirty_ops.lock().unwrap_or_else(|e| e.into_inner());
        *ops.entry(tlf_id.clone()).or_insert(0) += 1;
    }

    /// Panics if no dirty op is outstanding for `tlf_id`.
    pub fn dirty_op_end(&self, tlf_id: &TlfId) {
        let drained = {
            let mut ops = self.dirty_ops.lock().unwrap_or_else(|e| e.into_inner());
            match ops.get_mut(tlf_id) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    if *count == 0 {
                        ops.remove(tlf_id);
                    }
                    Some(ops.is_empty())
                }
                _ => None,
            }
        };
        match drained {
            Some(true) => self.dirty_ops_drained.notify_waiters(),
            Some(false) => {}
            None => panic!("dirty op count underflow for {}", tlf_id),
        }
    }

    pub async fn begin_dirty_op(self: &Arc<Self>, tlf_id: &TlfId) -> DirtyOpGuard {
        self.dirty_op_start(tlf_id).await;
        DirtyOpGuard {
            manager: self.clone(),
            tlf_id: tlf_id.clone(),
        }
    }

    /// Takes the state write lock at a moment when no dirty op is
    /// outstanding and no bulk reopen is in flight. New dirty ops cannot
    /// start while the lock is held.
    async fn lock_state_when_drained(&self) -> RwLockWriteGuard<'_, ManagerState> {
        loop {
            loop {
                let drained = self.dirty_ops_drained.notified();
                let pending = self.dirty_ops_pending();
                if pending == 0 {
                    break;
                }
                debug!("waiting for {} folders with dirty ops", pending);
                drained.await;
            }
            let state = self.write_state_when_reopened().await;
            if self.dirty_ops_pending() == 0 {
                return state;
            }
        }
    }

    async fn write_state_when_reopened(&self) -> RwLockWriteGuard<'_, ManagerState> {
        loop {
            let finished = self.reopen_finished.notified();
            let state = self.state.write().await;
            if !state.reopening {
                return state;
            }
            drop(state);
            debug!("waiting for bulk reopen to finish");
            finished.await;
        }
    }

    async fn read_state_when_reopened(&self) -> RwLockReadGuard<'_, ManagerState> {
        loop {
            let finished = self.reopen_finished.notified();
            let state = self.state.read().await;
            if !state.reopening {
                return state;
            }
            drop(state);
            finished.await;
        }
    }

    // ========== wrappers ==========

    pub fn block_cache(self: &Arc<Self>) -> JournalBlockCache {
        JournalBlockCache::new(self.clone(), self.collaborators.block_cache.clone())
    }

    pub fn dirty_block_cache(
        self: &Arc<Self>,
        journal_cache: Arc<dyn DirtyBlockCache>,
    ) -> JournalDirtyBlockCache {
        JournalDirtyBlockCache::new(
            self.clone(),
            self.collaborators.dirty_block_cache.clone(),
            journal_cache,
        )
    }

    pub fn block_server(self: &Arc<Self>) -> JournalBlockServer {
        JournalBlockServer::new(self.clone(), self.collaborators.block_server.clone())
    }

    pub fn md_ops(self: &Arc<Self>) -> JournalMdOps {
        JournalMdOps::new(self.clone(), self.collaborators.md_ops.clone())
    }

    // ========== error throttles ==========

    /// Over-quota errors are surfaced at most once per cooldown window.
    pub fn maybe_return_over_quota_error(&self, used_bytes: u64, limit_bytes: u64) -> JournalResult<()> {
        if used_bytes <= limit_bytes {
            return Ok(());
        }
        let mut last = self
            .last_quota_error
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let now = self.collaborators.clock.now();
        if let Some(prev) = *last {
            if now - prev < self.service_config.quota_error_cooldown() {
                return Ok(());
            }
        }
        *last = Some(now);
        Err(JournalError::OverQuota {
            usage: used_bytes,
            limit: limit_bytes,
            throttled: false,
        })
    }

    /// Marks the error reportable unless one was reported within the
    /// cooldown window.
    pub fn maybe_make_disk_limit_error_reportable(&self, mut err: DiskLimitTimeout) -> JournalError {
        let mut last = self
            .last_disk_limit_error
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let now = self.collaborators.clock.now();
        let within_cooldown = last
            .map(|prev| now - prev < self.service_config.disk_limit_error_cooldown())
            .unwrap_or(false);
        if !within_cooldown {
            err.reportable = true;
            *last = Some(now);
        }
        JournalError::DiskLimitTimeout(err)
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::time::Duration;

    use super::*;
    use crate::test_util::TestEnv;

    fn poison<T>(lock: &Mutex<T>) {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().unwrap();
            panic!("poisoning lock");
        }));
        assert!(lock.is_poisoned());
    }

    #[tokio::test]
    async fn test_throttles_survive_poisoned_locks() {
        let env = TestEnv::new();
        let manager = env.manager();
        poison(&manager.last_quota_error);
        poison(&manager.last_disk_limit_error);

        assert!(matches!(
            manager.maybe_return_over_quota_error(30, 20),
            Err(JournalError::OverQuota { .. })
        ));
        manager.maybe_return_over_quota_error(30, 20).unwrap();

        let timeout = DiskLimitTimeout {
            timeout: Duration::from_millis(10),
            requested_bytes: 100,
            available_bytes: 5,
            reportable: false,
        };
        let reportable = |err: JournalError| match err {
            JournalError::DiskLimitTimeout(err) => err.reportable,
            other => panic!("unexpected error: {:?}", other),
        };
        assert!(reportable(
            manager.maybe_make_disk_limit_error_reportable(timeout.clone())
        ));
        assert!(!reportable(
            manager.maybe_make_disk_limit_error_reportable(timeout)
        ));
    }
}
