//! High-level pipeline: reconciles destinations with the source repository.
//!
//! One call to [`synchronise`] is one run:
//!   - reads the checkpoint (last fully applied revision)
//!   - resolves the latest revision and fetches a full tree or a diff
//!   - builds and validates the [`ChangeSet`]; validation failures stop the
//!     run before any destination write
//!   - applies relational rows, then section documents, while attachments are
//!     applied concurrently with both
//!   - advances the checkpoint only when every applier succeeded
//!
//! A failed run leaves the checkpoint untouched, so the next invocation
//! retries the same revision range.
//!
//! Collaborators are borrowed for the duration of the run through
//! [`Collaborators`]; the caller owns and releases them.

use futures::future;
use tracing::{error, info};

use crate::attachments;
use crate::changeset::{self, ChangeSet, ChangeSetSummary};
use crate::checkpoint;
use crate::config::SyncSettings;
use crate::contract::{BlobStore, CheckpointStore, DocumentStore, RelationalStore, SourceControl};
use crate::documents;
use crate::error::SyncError;
use crate::relational;
use crate::snapshot::{self, FetchMode};

/// Explicitly constructed dependencies of one run.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub source: &'a dyn SourceControl,
    pub relational: &'a dyn RelationalStore,
    pub documents: &'a dyn DocumentStore,
    pub blobs: &'a dyn BlobStore,
    pub checkpoints: &'a dyn CheckpointStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Full,
    Incremental,
    /// Latest revision equals the checkpoint; nothing fetched or written.
    UpToDate,
}

impl From<FetchMode> for RunMode {
    fn from(mode: FetchMode) -> Self {
        match mode {
            FetchMode::Full => RunMode::Full,
            FetchMode::Incremental => RunMode::Incremental,
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynchroniseReport {
    pub mode: RunMode,
    pub previous_revision: Option<String>,
    pub revision: String,
    pub applied: ChangeSetSummary,
}

/// Result of a dry run: the validated change set that a run would apply.
#[derive(Debug, Clone)]
pub struct SynchronisePlan {
    pub mode: RunMode,
    pub previous_revision: Option<String>,
    pub change_set: ChangeSet,
}

async fn prepare(
    settings: &SyncSettings,
    deps: Collaborators<'_>,
) -> Result<(Option<String>, String, Option<(RunMode, ChangeSet)>), SyncError> {
    let previous = checkpoint::read(deps.checkpoints).await?;
    let latest = snapshot::latest_revision(deps.source).await?;

    if previous.as_deref() == Some(latest.as_str()) {
        info!(revision = %latest, "[SYNC] Destinations already at latest revision");
        return Ok((previous, latest, None));
    }

    let snap = snapshot::fetch(deps.source, previous.as_deref(), &latest).await?;
    let mode = RunMode::from(snap.mode);
    let change_set = changeset::build(deps.source, &snap, settings.concurrency()).await?;
    Ok((previous, latest, Some((mode, change_set))))
}

/// Fetch and validate without writing anything.
pub async fn plan(
    settings: &SyncSettings,
    deps: Collaborators<'_>,
) -> Result<SynchronisePlan, SyncError> {
    let (previous, latest, prepared) = prepare(settings, deps).await?;
    Ok(match prepared {
        Some((mode, change_set)) => SynchronisePlan {
            mode,
            previous_revision: previous,
            change_set,
        },
        None => SynchronisePlan {
            mode: RunMode::UpToDate,
            previous_revision: previous,
            change_set: ChangeSet {
                revision: latest,
                ..ChangeSet::default()
            },
        },
    })
}

/// Apply a validated change set to all three destinations.
///
/// Relational rows are written before section documents; attachments run
/// alongside both. Both branches run to completion before the first failure
/// is returned, so no write is abandoned mid-request.
pub async fn apply_change_set(
    settings: &SyncSettings,
    deps: Collaborators<'_>,
    change_set: &ChangeSet,
) -> Result<(), SyncError> {
    let relational_then_documents = async {
        relational::apply(deps.relational, &change_set.courses, &change_set.modules).await?;
        documents::apply(
            deps.documents,
            &change_set.sections,
            &change_set.modules,
            settings,
        )
        .await
    };
    let blobs = attachments::apply(
        deps.blobs,
        deps.source,
        &change_set.attachments,
        &change_set.revision,
        settings.concurrency(),
    );

    let (metadata, uploads) = future::join(relational_then_documents, blobs).await;
    metadata?;
    uploads
}

/// Run one synchronisation.
pub async fn synchronise(
    settings: &SyncSettings,
    deps: Collaborators<'_>,
) -> Result<SynchroniseReport, SyncError> {
    info!("[SYNC] Starting synchronisation run");

    let (previous, latest, prepared) = prepare(settings, deps).await?;
    let Some((mode, change_set)) = prepared else {
        return Ok(SynchroniseReport {
            mode: RunMode::UpToDate,
            previous_revision: previous,
            revision: latest,
            applied: ChangeSetSummary::default(),
        });
    };

    if let Err(e) = apply_change_set(settings, deps, &change_set).await {
        error!(error = %e, checkpoint = ?previous, "[SYNC][ERROR] Apply failed, checkpoint not advanced");
        return Err(e);
    }

    checkpoint::commit(deps.checkpoints, previous.as_deref(), &latest).await?;

    let report = SynchroniseReport {
        mode,
        previous_revision: previous,
        revision: latest,
        applied: change_set.summary(),
    };
    info!(?report, "[SYNC] Synchronisation complete");
    Ok(report)
}
