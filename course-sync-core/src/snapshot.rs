//! Snapshot fetcher: decides between a full import and an incremental diff.

use tracing::{error, info};

use crate::classify::is_excluded;
use crate::contract::{ChangeAction, ObjectKind, RepositoryEntry, SourceControl};
use crate::error::SyncError;

/// How the entries of a snapshot were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// No checkpoint: every blob at the latest revision, all marked `Add`.
    Full,
    /// Diff between the checkpoint and the latest revision.
    Incremental,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub mode: FetchMode,
    pub latest_revision: String,
    pub entries: Vec<RepositoryEntry>,
}

/// Latest revision id of the source repository.
pub async fn latest_revision(source: &dyn SourceControl) -> Result<String, SyncError> {
    source.latest_revision().await.map_err(|e| {
        error!(error = ?e, "[SYNC][ERROR] Failed to resolve latest revision");
        SyncError::transport("resolve latest revision", e)
    })
}

/// List the entries to reconcile up to `latest`.
///
/// Any collaborator failure fails the whole fetch; a partial listing is never
/// returned.
pub async fn fetch(
    source: &dyn SourceControl,
    checkpoint: Option<&str>,
    latest: &str,
) -> Result<Snapshot, SyncError> {
    let (mode, raw) = match checkpoint {
        None => {
            info!(revision = %latest, "[SYNC] No checkpoint, listing full tree");
            let entries = source.list_full_tree(latest).await.map_err(|e| {
                error!(error = ?e, revision = %latest, "[SYNC][ERROR] Full tree listing failed");
                SyncError::transport(format!("list full tree at {latest}"), e)
            })?;
            let entries = entries
                .into_iter()
                .map(|mut entry| {
                    entry.action = ChangeAction::Add;
                    entry
                })
                .collect::<Vec<_>>();
            (FetchMode::Full, entries)
        }
        Some(from) => {
            info!(from = %from, to = %latest, "[SYNC] Listing diff since checkpoint");
            let entries = source.list_diff(from, latest).await.map_err(|e| {
                error!(error = ?e, from = %from, to = %latest, "[SYNC][ERROR] Diff listing failed");
                SyncError::transport(format!("list diff {from}..{latest}"), e)
            })?;
            (FetchMode::Incremental, entries)
        }
    };

    let total = raw.len();
    let entries: Vec<RepositoryEntry> = raw
        .into_iter()
        .filter(|e| e.object_kind == ObjectKind::Blob && !is_excluded(&e.path))
        .collect();

    info!(
        ?mode,
        listed = total,
        kept = entries.len(),
        "[SYNC] Snapshot fetched"
    );

    Ok(Snapshot {
        mode,
        latest_revision: latest.to_string(),
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MockSourceControl;
    use crate::error::SourceError;

    fn entry(path: &str, kind: ObjectKind, action: ChangeAction) -> RepositoryEntry {
        RepositoryEntry {
            path: path.to_string(),
            object_kind: kind,
            action,
            revision_id: "r1".to_string(),
        }
    }

    #[tokio::test]
    async fn full_fetch_marks_everything_add_and_filters() {
        let mut source = MockSourceControl::new();
        source.expect_list_full_tree().returning(|_| {
            Ok(vec![
                entry("/Modules", ObjectKind::Tree, ChangeAction::Edit),
                entry("/Modules/intro/module.json", ObjectKind::Blob, ChangeAction::Edit),
                entry("/cicd/pipeline.yml", ObjectKind::Blob, ChangeAction::Add),
                entry("/pipelines/cicd/build.yml", ObjectKind::Blob, ChangeAction::Add),
            ])
        });
        source.expect_list_diff().never();

        let snapshot = fetch(&source, None, "r9").await.expect("fetch");
        assert_eq!(snapshot.mode, FetchMode::Full);
        assert_eq!(snapshot.latest_revision, "r9");
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].path, "/Modules/intro/module.json");
        assert_eq!(snapshot.entries[0].action, ChangeAction::Add);
    }

    #[tokio::test]
    async fn incremental_fetch_keeps_reported_actions() {
        let mut source = MockSourceControl::new();
        source
            .expect_list_diff()
            .withf(|from, to| from == "r1" && to == "r2")
            .returning(|_, _| {
                Ok(vec![
                    entry("/Modules/intro/01-welcome.md", ObjectKind::Blob, ChangeAction::Delete),
                    entry("/Modules/intro/02-next.md", ObjectKind::Blob, ChangeAction::Rename),
                ])
            });
        source.expect_list_full_tree().never();

        let snapshot = fetch(&source, Some("r1"), "r2").await.expect("fetch");
        assert_eq!(snapshot.mode, FetchMode::Incremental);
        let actions: Vec<_> = snapshot.entries.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![ChangeAction::Delete, ChangeAction::Rename]);
    }

    #[tokio::test]
    async fn collaborator_failure_is_fatal() {
        let mut source = MockSourceControl::new();
        source
            .expect_list_diff()
            .returning(|_, _| Err(SourceError::Transport("503 Service Unavailable".into())));

        let err = fetch(&source, Some("r1"), "r2").await.unwrap_err();
        assert!(matches!(err, SyncError::Transport { .. }), "got {err:?}");
    }
}
