// Journal-aware wrappers around the services the rest of the filesystem
// talks to. Each call looks the folder's journal up through the manager
// and never keeps it between calls.

mod block_cache;
mod block_server;
mod dirty_block_cache;
mod md_ops;

pub use block_cache::JournalBlockCache;
pub use block_server::JournalBlockServer;
pub use dirty_block_cache::JournalDirtyBlockCache;
pub use md_ops::JournalMdOps;
