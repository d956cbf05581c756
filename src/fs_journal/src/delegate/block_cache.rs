use std::sync::Arc;

use async_trait::async_trait;

use crate::{BlockCache, BlockCacheLifetime, BlockId, JournalManager, JournalResult, TlfId};

/// Block cache that keeps journaled blocks only transiently; the journal
/// already holds the durable copy.
pub struct JournalBlockCache {
    manager: Arc<JournalManager>,
    delegate: Arc<dyn BlockCache>,
}

impl JournalBlockCache {
    pub fn new(manager: Arc<JournalManager>, delegate: Arc<dyn BlockCache>) -> Self {
        Self { manager, delegate }
    }
}

#[async_trait]
impl BlockCache for JournalBlockCache {
    async fn get(&self, id: &BlockId) -> Option<Arc<Vec<u8>>> {
        self.delegate.get(id).await
    }

    async fn put(
        &self,
        tlf_id: &TlfId,
        id: &BlockId,
        block: Arc<Vec<u8>>,
        lifetime: BlockCacheLifetime,
    ) -> JournalResult<()> {
        let lifetime = match lifetime {
            BlockCacheLifetime::Permanent if self.manager.has_tlf_journal(tlf_id).await => {
                BlockCacheLifetime::Transient
            }
            lifetime => lifetime,
        };
        self.delegate.put(tlf_id, id, block, lifetime).await
    }

    async fn delete_permanent(&self, id: &BlockId) -> JournalResult<()> {
        self.delegate.delete_permanent(id).await
    }
}
