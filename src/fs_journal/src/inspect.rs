use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;

use crate::layout::{JournalLayout, JournalManagerConfig, TlfJournalInfo, JOURNAL_LAYOUT_VERSION};
use crate::tlf_journal::{summarize_dir, JournalDirSummary};
use crate::JournalResult;

#[derive(Debug, Clone, Serialize)]
pub struct JournalDirReport {
    pub dir: PathBuf,
    pub info: Option<TlfJournalInfo>,
    pub summary: Option<JournalDirSummary>,
    /// Why `info` or `summary` is missing.
    pub error: Option<String>,
}

/// Offline view of a journal root: the persisted config plus every
/// journal directory found under it, whoever it belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct JournalRootReport {
    pub root_dir: PathBuf,
    pub version: u32,
    pub config: Option<JournalManagerConfig>,
    pub journals: Vec<JournalDirReport>,
}

/// Reads a journal root without modifying it. Unreadable directories are
/// reported, not skipped.
pub async fn inspect_journal_root(journal_root: &Path) -> JournalResult<JournalRootReport> {
    let layout = JournalLayout::new(journal_root)?;
    let config = layout.read_config().await?;

    let mut journals = Vec::new();
    for (dir, is_dir) in layout.list_entries().await? {
        if !is_dir {
            continue;
        }
        debug!("inspecting {}", dir.display());
        let info = match TlfJournalInfo::read(&dir).await {
            Ok(info) => info,
            Err(e) => {
                journals.push(JournalDirReport {
                    dir,
                    info: None,
                    summary: None,
                    error: Some(e.to_string()),
                });
                continue;
            }
        };
        let report = match summarize_dir(&dir).await {
            Ok(summary) => JournalDirReport {
                dir,
                info: Some(info),
                summary: Some(summary),
                error: None,
            },
            Err(e) => JournalDirReport {
                dir,
                info: Some(info),
                summary: None,
                error: Some(e.to_string()),
            },
        };
        journals.push(report);
    }

    Ok(JournalRootReport {
        root_dir: layout.root_path(),
        version: JOURNAL_LAYOUT_VERSION,
        config,
        journals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestEnv;
    use crate::{BackgroundWorkStatus, BlockId, BlockServer, BranchId, TlfId, TlfType};

    #[tokio::test]
    async fn test_inspect_reports_every_dir() {
        let env = TestEnv::new();
        let manager = env.manager();
        manager
            .enable_existing_journals(&env.uid, &env.key, BackgroundWorkStatus::Paused)
            .await
            .unwrap();
        let tlf_id = TlfId::random(TlfType::Private);
        manager
            .enable(&tlf_id, None, BackgroundWorkStatus::Paused)
            .await
            .unwrap();
        let server = manager.block_server();
        server.put(&tlf_id, &BlockId::random(), b"one").await.unwrap();
        server.put(&tlf_id, &BlockId::random(), b"two").await.unwrap();
        manager.shutdown().await;

        let layout = JournalLayout::new(env.dir.path()).unwrap();
        std::fs::create_dir_all(layout.root_path().join("garbage")).unwrap();

        let report = inspect_journal_root(env.dir.path()).await.unwrap();
        assert_eq!(report.version, 1);
        assert_eq!(report.config, Some(JournalManagerConfig::default()));
        assert_eq!(report.journals.len(), 2);

        let journal = report
            .journals
            .iter()
            .find(|j| j.dir == layout.tlf_journal_path(&env.key, &tlf_id))
            .expect("journal dir reported");
        assert_eq!(journal.info.as_ref().map(|i| &i.tlf_id), Some(&tlf_id));
        let summary = journal.summary.expect("summary");
        assert_eq!(summary.block_op_count, 2);
        assert_eq!(summary.md_entry_count, 0);
        assert_eq!(summary.branch_id, BranchId::NULL);

        let garbage = report
            .journals
            .iter()
            .find(|j| j.dir.ends_with("garbage"))
            .expect("garbage dir reported");
        assert!(garbage.info.is_none());
        assert!(garbage.error.is_some());
        serde_json::to_string_pretty(&report).unwrap();
    }
}
