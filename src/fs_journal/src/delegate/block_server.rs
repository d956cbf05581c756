use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    BlockId, BlockServer, JournalError, JournalManager, JournalResult, QuotaInfo, TlfId,
    UserOrTeamId,
};

/// Block server that writes into the folder's journal when there is one.
/// Over-quota and disk-limit conditions are reported through the
/// manager's cooldowns.
pub struct JournalBlockServer {
    manager: Arc<JournalManager>,
    delegate: Arc<dyn BlockServer>,
}

impl JournalBlockServer {
    pub fn new(manager: Arc<JournalManager>, delegate: Arc<dyn BlockServer>) -> Self {
        Self { manager, delegate }
    }
}

#[async_trait]
impl BlockServer for JournalBlockServer {
    async fn get(&self, tlf_id: &TlfId, id: &BlockId) -> JournalResult<Vec<u8>> {
        if let Some(journal) = self.manager.get_tlf_journal(tlf_id, None).await {
            if let Some(buf) = journal.get_block_data(id).await? {
                return Ok(buf);
            }
        }
        self.delegate.get(tlf_id, id).await
    }

    async fn put(&self, tlf_id: &TlfId, id: &BlockId, buf: &[u8]) -> JournalResult<()> {
        if let Some(journal) = self.manager.get_tlf_journal(tlf_id, None).await {
            match journal.put_block_data(id, buf).await {
                Ok(()) => {
                    let (used, limit) = journal.quota_usage().await;
                    return self.manager.maybe_return_over_quota_error(used, limit);
                }
                Err(JournalError::DiskLimitTimeout(err)) => {
                    return Err(self.manager.maybe_make_disk_limit_error_reportable(err));
                }
                Err(JournalError::Disabled(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.delegate.put(tlf_id, id, buf).await
    }

    async fn add_block_reference(&self, tlf_id: &TlfId, id: &BlockId) -> JournalResult<()> {
        if let Some(journal) = self.manager.get_tlf_journal(tlf_id, None).await {
            match journal.add_block_reference(id).await {
                Ok(()) => return Ok(()),
                Err(JournalError::Disabled(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.delegate.add_block_reference(tlf_id, id).await
    }

    async fn remove_block_references(
        &self,
        tlf_id: &TlfId,
        ids: &[BlockId],
    ) -> JournalResult<()> {
        if let Some(journal) = self.manager.get_tlf_journal(tlf_id, None).await {
            match journal.remove_block_references(ids).await {
                Ok(()) => return Ok(()),
                Err(JournalError::Disabled(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.delegate.remove_block_references(tlf_id, ids).await
    }

    async fn get_user_quota_info(&self, charged_to: &UserOrTeamId) -> JournalResult<QuotaInfo> {
        self.delegate.get_user_quota_info(charged_to).await
    }
}
