//! Azure Blob REST client implementing [`BlobStore`] with a SAS token.
//!
//! Uploads stream the source content into blocks of [`BLOCK_SIZE`] bytes and
//! commit them with a block list. Content that fits in one block is written
//! with a single Put Blob call.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use course_sync_core::contract::{BlobStore, ContentStream};
use course_sync_core::error::StoreError;
use futures::TryStreamExt;
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, error, info};

const STORAGE_VERSION: &str = "2021-08-06";
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

pub struct AzureBlobStorage {
    client: Client,
    endpoint: String,
    container: String,
    sas_token: String,
}

/// Block ids must be valid base64 of equal length; eight decimal digits are.
pub fn block_id(index: usize) -> String {
    format!("{index:08}")
}

pub fn block_list_xml(ids: &[String]) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

pub fn content_type(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else {
        "application/octet-stream"
    }
}

impl AzureBlobStorage {
    pub fn new(endpoint: &str, container: &str, sas_token: String) -> Self {
        info!(endpoint, container, "Initialised blob storage client");
        Self {
            client: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            container: container.to_string(),
            sas_token: sas_token.trim_start_matches('?').to_string(),
        }
    }

    /// Blob URL with the SAS token and any extra query pairs.
    pub fn blob_url(&self, name: &str, extra: &[(&str, &str)]) -> Result<Url, StoreError> {
        let mut url = Url::parse(&format!(
            "https://{}/{}/{}",
            self.endpoint, self.container, name
        ))?;
        url.set_query(Some(&self.sas_token));
        if !extra.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in extra {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn put(
        &self,
        url: Url,
        body: Bytes,
        headers: &[(&str, &str)],
        what: &str,
    ) -> Result<(), StoreError> {
        let mut request = self
            .client
            .put(url)
            .header("x-ms-version", STORAGE_VERSION)
            .body(body);
        for (k, v) in headers {
            request = request.header(*k, *v);
        }
        let resp = request.send().await.map_err(|e| {
            error!(error = ?e, what, "[BLOB][ERROR] Request failed");
            e
        })?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| String::from("<Failed to decode response body>"));
            error!(status = %status, what, "[BLOB][ERROR] Blob storage returned error. Response body: {text}");
            return Err(format!("{what}: {status}").into());
        }
        Ok(())
    }

    async fn put_block(&self, name: &str, id: &str, data: Bytes) -> Result<(), StoreError> {
        let url = self.blob_url(name, &[("comp", "block"), ("blockid", id)])?;
        debug!(blob = name, block = id, size = data.len(), "[BLOB] Put block");
        self.put(url, data, &[], &format!("put block {id} of {name}")).await
    }
}

#[async_trait]
impl BlobStore for AzureBlobStorage {
    async fn upload_stream(&self, name: &str, mut content: ContentStream) -> Result<(), StoreError> {
        let mut buffer = BytesMut::new();
        let mut block_ids = Vec::new();

        while let Some(chunk) = content.try_next().await? {
            buffer.extend_from_slice(&chunk);
            while buffer.len() >= BLOCK_SIZE {
                let block = buffer.split_to(BLOCK_SIZE).freeze();
                let id = block_id(block_ids.len());
                self.put_block(name, &id, block).await?;
                block_ids.push(id);
            }
        }

        if block_ids.is_empty() {
            let url = self.blob_url(name, &[])?;
            let size = buffer.len();
            self.put(
                url,
                buffer.freeze(),
                &[
                    ("x-ms-blob-type", "BlockBlob"),
                    ("Content-Type", content_type(name)),
                ],
                &format!("put blob {name}"),
            )
            .await?;
            info!(blob = name, size, "[BLOB] Uploaded blob");
            return Ok(());
        }

        if !buffer.is_empty() {
            let id = block_id(block_ids.len());
            self.put_block(name, &id, buffer.freeze()).await?;
            block_ids.push(id);
        }

        let url = self.blob_url(name, &[("comp", "blocklist")])?;
        self.put(
            url,
            Bytes::from(block_list_xml(&block_ids)),
            &[("x-ms-blob-content-type", content_type(name))],
            &format!("put block list of {name}"),
        )
        .await?;
        info!(blob = name, blocks = block_ids.len(), "[BLOB] Uploaded blob in blocks");
        Ok(())
    }

    async fn delete_if_exists(&self, name: &str) -> Result<bool, StoreError> {
        let url = self.blob_url(name, &[])?;
        let resp = self
            .client
            .delete(url)
            .header("x-ms-version", STORAGE_VERSION)
            .send()
            .await
            .map_err(|e| {
                error!(error = ?e, blob = name, "[BLOB][ERROR] Delete request failed");
                e
            })?;
        match resp.status() {
            StatusCode::NOT_FOUND => {
                debug!(blob = name, "[BLOB] Blob already absent");
                Ok(false)
            }
            status if status.is_success() => {
                info!(blob = name, "[BLOB] Deleted blob");
                Ok(true)
            }
            status => {
                error!(status = %status, blob = name, "[BLOB][ERROR] Delete returned error");
                Err(format!("delete blob {name}: {status}").into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> AzureBlobStorage {
        AzureBlobStorage::new(
            "contoso.blob.core.windows.net/",
            "attachments",
            "?sv=2021-08-06&sig=abc".to_string(),
        )
    }

    #[test]
    fn blob_url_carries_sas_and_extra_pairs() {
        let url = storage()
            .blob_url("Modules/intro/.attachments/diagram.png", &[("comp", "block"), ("blockid", "00000001")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://contoso.blob.core.windows.net/attachments/Modules/intro/.attachments/diagram.png?sv=2021-08-06&sig=abc&comp=block&blockid=00000001"
        );
    }

    #[test]
    fn blob_url_encodes_spaces_in_names() {
        let url = storage().blob_url("Modules/intro/.attachments/old one.png", &[]).unwrap();
        assert!(url.path().ends_with("old%20one.png"));
    }

    #[test]
    fn block_ids_have_equal_length() {
        assert_eq!(block_id(0), "00000000");
        assert_eq!(block_id(12), "00000012");
        assert_eq!(block_id(0).len(), block_id(9_999_999).len());
    }

    #[test]
    fn block_list_lists_latest_ids_in_order() {
        let xml = block_list_xml(&[block_id(0), block_id(1)]);
        assert!(xml.ends_with(
            "<BlockList><Latest>00000000</Latest><Latest>00000001</Latest></BlockList>"
        ));
    }

    #[test]
    fn content_type_from_extension() {
        assert_eq!(content_type("a/b.PNG"), "image/png");
        assert_eq!(content_type("a/b.jpeg"), "image/jpeg");
        assert_eq!(content_type("a/b.bin"), "application/octet-stream");
    }
}
