use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::{
    BranchId, JournalError, JournalManager, JournalResult, MdOps, RootMetadata, TlfHandle, TlfId,
};

/// Metadata operations that read unflushed heads from the journal and
/// queue puts into it. `put` is what lazily creates a folder's journal.
pub struct JournalMdOps {
    manager: Arc<JournalManager>,
    delegate: Arc<dyn MdOps>,
}

impl JournalMdOps {
    pub fn new(manager: Arc<JournalManager>, delegate: Arc<dyn MdOps>) -> Self {
        Self { manager, delegate }
    }
}

#[async_trait]
impl MdOps for JournalMdOps {
    async fn get_for_tlf(&self, tlf_id: &TlfId) -> JournalResult<Option<RootMetadata>> {
        if let Some(journal) = self.manager.get_tlf_journal(tlf_id, None).await {
            if let Some(head) = journal.md_head(BranchId::NULL).await? {
                return Ok(Some(head));
            }
        }
        self.delegate.get_for_tlf(tlf_id).await
    }

    async fn get_unmerged_for_tlf(
        &self,
        tlf_id: &TlfId,
        bid: BranchId,
    ) -> JournalResult<Option<RootMetadata>> {
        if !bid.is_null() {
            if let Some(journal) = self.manager.get_tlf_journal(tlf_id, None).await {
                if let Some(head) = journal.md_head(bid).await? {
                    return Ok(Some(head));
                }
            }
        }
        self.delegate.get_unmerged_for_tlf(tlf_id, bid).await
    }

    async fn put(&self, handle: &TlfHandle, md: &RootMetadata) -> JournalResult<()> {
        if let Some(journal) = self.manager.get_tlf_journal(&md.tlf_id, Some(handle)).await {
            match journal.put_md(handle, md).await {
                Ok(()) => return Ok(()),
                Err(JournalError::Disabled(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.delegate.put(handle, md).await
    }

    async fn put_unmerged(&self, md: &RootMetadata) -> JournalResult<()> {
        if let Some(journal) = self.manager.get_tlf_journal(&md.tlf_id, None).await {
            match journal.put_unmerged_md(md).await {
                Ok(()) => return Ok(()),
                Err(JournalError::Disabled(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.delegate.put_unmerged(md).await
    }

    async fn prune_branch(&self, tlf_id: &TlfId, bid: BranchId) -> JournalResult<()> {
        if let Some(journal) = self.manager.get_tlf_journal(tlf_id, None).await {
            if journal.branch_id().await? == bid {
                journal.clear_branch(bid).await?;
            } else {
                debug!("journal for {} is not on branch {}", tlf_id, bid);
            }
        }
        self.delegate.prune_branch(tlf_id, bid).await
    }
}
