use std::sync::Arc;

use async_trait::async_trait;

use crate::{BlockId, DirtyBlockCache, JournalManager, JournalResult, TlfId};

/// Routes dirty blocks of journaled folders to a separate cache, so a
/// slow remote sync does not hold back writers that only need the
/// journal.
pub struct JournalDirtyBlockCache {
    manager: Arc<JournalManager>,
    sync_cache: Arc<dyn DirtyBlockCache>,
    journal_cache: Arc<dyn DirtyBlockCache>,
}

impl JournalDirtyBlockCache {
    pub fn new(
        manager: Arc<JournalManager>,
        sync_cache: Arc<dyn DirtyBlockCache>,
        journal_cache: Arc<dyn DirtyBlockCache>,
    ) -> Self {
        Self {
            manager,
            sync_cache,
            journal_cache,
        }
    }

    async fn cache_for(&self, tlf_id: &TlfId) -> &Arc<dyn DirtyBlockCache> {
        if self.manager.has_tlf_journal(tlf_id).await {
            &self.journal_cache
        } else {
            &self.sync_cache
        }
    }
}

#[async_trait]
impl DirtyBlockCache for JournalDirtyBlockCache {
    async fn get(&self, tlf_id: &TlfId, id: &BlockId) -> Option<Arc<Vec<u8>>> {
        self.cache_for(tlf_id).await.get(tlf_id, id).await
    }

    async fn put(&self, tlf_id: &TlfId, id: &BlockId, block: Arc<Vec<u8>>) -> JournalResult<()> {
        self.cache_for(tlf_id).await.put(tlf_id, id, block).await
    }

    async fn delete(&self, tlf_id: &TlfId, id: &BlockId) -> JournalResult<()> {
        self.cache_for(tlf_id).await.delete(tlf_id, id).await
    }

    async fn is_dirty(&self, tlf_id: &TlfId, id: &BlockId) -> bool {
        self.cache_for(tlf_id).await.is_dirty(tlf_id, id).await
    }

    async fn is_any_dirty(&self, tlf_id: &TlfId) -> bool {
        self.sync_cache.is_any_dirty(tlf_id).await || self.journal_cache.is_any_dirty(tlf_id).await
    }

    async fn sync_started(&self, tlf_id: &TlfId) {
        self.manager.dirty_op_start(tlf_id).await;
        self.cache_for(tlf_id).await.sync_started(tlf_id).await;
    }

    async fn sync_finished(&self, tlf_id: &TlfId) {
        self.cache_for(tlf_id).await.sync_finished(tlf_id).await;
        self.manager.dirty_op_end(tlf_id);
    }
}
