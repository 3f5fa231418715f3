//! Blob applier: attachment images streamed from the source repository.
//!
//! Deletions all complete before the first upload starts.

use futures::{stream, TryStreamExt};
use tracing::{debug, error, info};

use crate::changeset::AttachmentRecord;
use crate::contract::{BlobStore, SourceControl};
use crate::error::{Destination, SyncError};

pub async fn apply(
    blobs: &dyn BlobStore,
    source: &dyn SourceControl,
    attachments: &[AttachmentRecord],
    revision: &str,
    concurrency: usize,
) -> Result<(), SyncError> {
    let (deletes, uploads): (Vec<&AttachmentRecord>, Vec<&AttachmentRecord>) =
        attachments.iter().partition(|a| a.action.is_delete());

    stream::iter(deletes.iter().copied().map(Ok::<_, SyncError>))
        .try_for_each_concurrent(concurrency.max(1), |attachment| async move {
            let name = attachment.blob_name();
            let existed = blobs.delete_if_exists(name).await.map_err(|e| {
                error!(blob = %name, error = ?e, "[SYNC][ERROR][BLOB] Delete failed");
                SyncError::apply(Destination::Blobs, name, e)
            })?;
            debug!(blob = %name, existed, "[SYNC][BLOB] Deleted attachment");
            Ok(())
        })
        .await?;

    stream::iter(uploads.iter().copied().map(Ok::<_, SyncError>))
        .try_for_each_concurrent(concurrency.max(1), |attachment| async move {
            let name = attachment.blob_name();
            let content = source
                .get_content_stream(&attachment.path, revision)
                .await
                .map_err(|e| {
                    error!(path = %attachment.path, error = ?e, "[SYNC][ERROR][BLOB] Content stream failed");
                    SyncError::transport(format!("stream {}", attachment.path), e)
                })?;
            blobs.upload_stream(name, content).await.map_err(|e| {
                error!(blob = %name, error = ?e, "[SYNC][ERROR][BLOB] Upload failed");
                SyncError::apply(Destination::Blobs, name, e)
            })?;
            debug!(blob = %name, "[SYNC][BLOB] Uploaded attachment");
            Ok(())
        })
        .await?;

    info!(
        deleted = deletes.len(),
        uploaded = uploads.len(),
        "[SYNC][BLOB] Attachments applied"
    );
    Ok(())
}
