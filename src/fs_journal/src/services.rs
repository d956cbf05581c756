use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    BlockCacheLifetime, BlockId, BranchId, JournalResult, QuotaInfo, Revision, RootMetadata,
    TeamId, TlfHandle, TlfId, TlfType, UserId, UserOrTeamId, VerifyingKey,
};

/// Remote block storage, or something that looks like it.
#[async_trait]
pub trait BlockServer: Send + Sync {
    /// Returns `JournalError::NotFound` for unknown blocks.
    async fn get(&self, tlf_id: &TlfId, id: &BlockId) -> JournalResult<Vec<u8>>;
    /// Putting a block that already exists with the same content must succeed.
    async fn put(&self, tlf_id: &TlfId, id: &BlockId, buf: &[u8]) -> JournalResult<()>;
    async fn add_block_reference(&self, tlf_id: &TlfId, id: &BlockId) -> JournalResult<()>;
    async fn remove_block_references(&self, tlf_id: &TlfId, ids: &[BlockId])
        -> JournalResult<()>;
    async fn get_user_quota_info(&self, charged_to: &UserOrTeamId) -> JournalResult<QuotaInfo>;
}

/// Metadata operations. `put` returns `JournalError::Conflict` when the
/// merged head is not `md.revision - 1`; re-putting the revision that is
/// already the head with identical content must succeed.
#[async_trait]
pub trait MdOps: Send + Sync {
    async fn get_for_tlf(&self, tlf_id: &TlfId) -> JournalResult<Option<RootMetadata>>;
    async fn get_unmerged_for_tlf(
        &self,
        tlf_id: &TlfId,
        bid: BranchId,
    ) -> JournalResult<Option<RootMetadata>>;
    async fn put(&self, handle: &TlfHandle, md: &RootMetadata) -> JournalResult<()>;
    async fn put_unmerged(&self, md: &RootMetadata) -> JournalResult<()>;
    async fn prune_branch(&self, tlf_id: &TlfId, bid: BranchId) -> JournalResult<()>;
}

#[async_trait]
pub trait BlockCache: Send + Sync {
    async fn get(&self, id: &BlockId) -> Option<Arc<Vec<u8>>>;
    async fn put(
        &self,
        tlf_id: &TlfId,
        id: &BlockId,
        block: Arc<Vec<u8>>,
        lifetime: BlockCacheLifetime,
    ) -> JournalResult<()>;
    async fn delete_permanent(&self, id: &BlockId) -> JournalResult<()>;
}

/// Blocks modified in memory but not yet synced.
#[async_trait]
pub trait DirtyBlockCache: Send + Sync {
    async fn get(&self, tlf_id: &TlfId, id: &BlockId) -> Option<Arc<Vec<u8>>>;
    async fn put(&self, tlf_id: &TlfId, id: &BlockId, block: Arc<Vec<u8>>) -> JournalResult<()>;
    async fn delete(&self, tlf_id: &TlfId, id: &BlockId) -> JournalResult<()>;
    async fn is_dirty(&self, tlf_id: &TlfId, id: &BlockId) -> bool;
    async fn is_any_dirty(&self, tlf_id: &TlfId) -> bool;
    async fn sync_started(&self, tlf_id: &TlfId);
    async fn sync_finished(&self, tlf_id: &TlfId);
}

/// Identity lookups the journal needs but does not own.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn is_team_writer(
        &self,
        team: &TeamId,
        uid: &UserId,
        key: &VerifyingKey,
    ) -> JournalResult<bool>;
    async fn get_team_root_id(&self, team: &TeamId) -> JournalResult<TeamId>;
}

/// Decides whether `uid` may write the folder described by `handle`.
pub async fn is_writer_from_handle(
    handle: &TlfHandle,
    resolver: &dyn IdentityResolver,
    uid: &UserId,
    key: &VerifyingKey,
) -> JournalResult<bool> {
    match handle.tlf_type {
        TlfType::Private | TlfType::Public => Ok(handle
            .resolved_writers
            .iter()
            .any(|w| matches!(w, UserOrTeamId::User(u) if u == uid))),
        TlfType::SingleTeam => match handle.first_resolved_writer() {
            Some(UserOrTeamId::Team(team)) => resolver.is_team_writer(team, uid, key).await,
            _ => Ok(false),
        },
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Local disk-space accounting shared by all journals.
#[async_trait]
pub trait DiskLimiter: Send + Sync {
    /// Waits for room; fails with `JournalError::DiskLimitTimeout`.
    async fn reserve(&self, charged_to: &UserOrTeamId, bytes: u64) -> JournalResult<()>;
    /// Accounts for bytes already on disk (journal reopen), without waiting.
    fn on_stored(&self, charged_to: &UserOrTeamId, bytes: u64);
    fn release(&self, charged_to: &UserOrTeamId, bytes: u64);
    fn status(&self, charged_to: Option<&UserOrTeamId>) -> serde_json::Value;
}

/// Notified when a folder's journal switches branch. Implementations that
/// call back into the journal must do so from another task.
pub trait BranchChangeListener: Send + Sync {
    fn on_tlf_branch_change(&self, tlf_id: &TlfId, bid: BranchId);
}

pub trait MdFlushListener: Send + Sync {
    fn on_md_flush(&self, tlf_id: &TlfId, bid: BranchId, revision: Revision);
}

/// Rebuilds in-memory folder state from a journal head after a restart.
#[async_trait]
pub trait FolderInitializer: Send + Sync {
    async fn init_folder(&self, tlf_id: &TlfId, head: &RootMetadata) -> JournalResult<()>;
}

/// Maps unflushed metadata revisions to human readable paths.
#[async_trait]
pub trait UnflushedPathPopulator: Send + Sync {
    async fn populate(&self, tlf_id: &TlfId, mds: &[RootMetadata]) -> JournalResult<Vec<String>>;
}
