//! Progress tracker over a [`CheckpointStore`].

use tracing::{error, info};

use crate::contract::CheckpointStore;
use crate::error::SyncError;

/// Last revision fully applied to every destination, if any.
pub async fn read(store: &dyn CheckpointStore) -> Result<Option<String>, SyncError> {
    let current = store.read_checkpoint().await.map_err(|e| {
        error!(error = ?e, "[SYNC][ERROR][CHECKPOINT] Read failed");
        SyncError::Checkpoint {
            operation: "read",
            source: e,
        }
    })?;
    info!(checkpoint = ?current, "[SYNC][CHECKPOINT] Read checkpoint");
    Ok(current)
}

/// Replace the stored checkpoint with `revision`.
///
/// Delete-then-write: a crash in between leaves no checkpoint, and the next
/// run falls back to a full import.
pub async fn commit(
    store: &dyn CheckpointStore,
    previous: Option<&str>,
    revision: &str,
) -> Result<(), SyncError> {
    if let Some(previous) = previous {
        store.delete_checkpoint(previous).await.map_err(|e| {
            error!(error = ?e, previous = %previous, "[SYNC][ERROR][CHECKPOINT] Delete failed");
            SyncError::Checkpoint {
                operation: "delete",
                source: e,
            }
        })?;
    }
    store.write_checkpoint(revision).await.map_err(|e| {
        error!(error = ?e, revision = %revision, "[SYNC][ERROR][CHECKPOINT] Write failed");
        SyncError::Checkpoint {
            operation: "write",
            source: e,
        }
    })?;
    info!(revision = %revision, "[SYNC][CHECKPOINT] Checkpoint advanced");
    Ok(())
}
