//! Azure DevOps Git REST client implementing [`SourceControl`].
//!
//! Authenticates with a personal access token as basic auth (empty user name).
//! The two listing shapes, the recursive items listing and the commit diff,
//! are parsed by hand into [`RepositoryEntry`] values.

use async_trait::async_trait;
use course_sync_core::contract::{
    ChangeAction, ContentStream, ObjectKind, RepositoryEntry, SourceControl,
};
use course_sync_core::error::SourceError;
use futures::TryStreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, error, info};

use crate::load_config::SourceSection;

const API_VERSION: &str = "7.0";
const DIFF_PAGE_SIZE: usize = 1000;

pub struct AzureRepos {
    client: Client,
    repository_url: String,
    branch: String,
    pat: String,
}

impl AzureRepos {
    pub fn new(source: &SourceSection, pat: String) -> Self {
        let repository_url = format!(
            "{}/{}/_apis/git/repositories/{}",
            source.organization_url.trim_end_matches('/'),
            source.project,
            source.repository
        );
        info!(repository_url = %repository_url, branch = %source.branch, "Initialised Azure Repos client");
        Self {
            client: Client::new(),
            repository_url,
            branch: source.branch.clone(),
            pat,
        }
    }

    fn get(&self, resource: &str) -> RequestBuilder {
        self.client
            .get(format!("{}/{}", self.repository_url, resource))
            .basic_auth("", Some(&self.pat))
            .query(&[("api-version", API_VERSION)])
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, SourceError> {
        let resp = request.send().await.map_err(|e| {
            error!(error = ?e, what, "[SOURCE][ERROR] Request failed");
            SourceError::Transport(format!("{what}: {e}"))
        })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| String::from("<Failed to decode response body>"));
        error!(status = %status, what, "[SOURCE][ERROR] Azure Repos returned error. Response body: {body}");
        Err(SourceError::Transport(format!("{what}: {status}")))
    }

    async fn send_json(&self, request: RequestBuilder, what: &str) -> Result<Value, SourceError> {
        let resp = self.send(request, what).await?;
        resp.json::<Value>().await.map_err(|e| {
            error!(error = ?e, what, "[SOURCE][ERROR] Failed to parse response JSON");
            SourceError::Transport(format!("{what}: invalid JSON: {e}"))
        })
    }

    fn content_request(&self, path: &str, revision: &str, previous: bool) -> RequestBuilder {
        let mut request = self.get("items").query(&[
            ("path", path),
            ("versionDescriptor.version", revision),
            ("versionDescriptor.versionType", "commit"),
            ("$format", "octetStream"),
            ("download", "true"),
        ]);
        if previous {
            request = request.query(&[("versionDescriptor.versionOptions", "previousChange")]);
        }
        request
    }

    async fn send_content(
        &self,
        path: &str,
        revision: &str,
        previous: bool,
    ) -> Result<Response, SourceError> {
        let what = format!("content of {path}@{revision}");
        let resp = self
            .content_request(path, revision, previous)
            .send()
            .await
            .map_err(|e| {
                error!(error = ?e, path, revision, "[SOURCE][ERROR] Content request failed");
                SourceError::Transport(format!("{what}: {e}"))
            })?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(path, revision, previous, "[SOURCE] Item not found");
            return Err(SourceError::NotFound {
                path: path.to_string(),
            });
        }
        if !resp.status().is_success() {
            let status = resp.status();
            error!(status = %status, path, revision, "[SOURCE][ERROR] Content request returned error");
            return Err(SourceError::Transport(format!("{what}: {status}")));
        }
        Ok(resp)
    }
}

fn object_kind(item: &Value) -> ObjectKind {
    let is_folder = item.get("isFolder").and_then(Value::as_bool).unwrap_or(false);
    match item.get("gitObjectType").and_then(Value::as_str) {
        Some("tree") => ObjectKind::Tree,
        Some(_) => ObjectKind::Blob,
        None if is_folder => ObjectKind::Tree,
        None => ObjectKind::Blob,
    }
}

fn malformed(what: &str, detail: &str, raw: &Value) -> SourceError {
    error!(what, detail, ?raw, "[SOURCE][ERROR] Malformed listing element");
    SourceError::Transport(format!("{what}: {detail}"))
}

/// One element of the `value` array of a recursive items listing at `revision`.
pub fn parse_tree_item(item: &Value, revision: &str) -> Result<RepositoryEntry, SourceError> {
    let path = item
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("full tree", "item has no path", item))?;
    Ok(RepositoryEntry {
        path: path.to_string(),
        object_kind: object_kind(item),
        action: ChangeAction::Add,
        revision_id: item
            .get("commitId")
            .and_then(Value::as_str)
            .unwrap_or(revision)
            .to_string(),
    })
}

/// One element of the `changes` array of a commit diff.
///
/// A rename is listed once, on the new path. Its old path comes back as a
/// separate removal entry ahead of it.
pub fn parse_diff_change(change: &Value, target: &str) -> Result<Vec<RepositoryEntry>, SourceError> {
    let item = change
        .get("item")
        .ok_or_else(|| malformed("commit diff", "change has no item", change))?;
    let path = item
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("commit diff", "item has no path", change))?;
    let change_type = change
        .get("changeType")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let action = ChangeAction::parse(change_type).ok_or_else(|| {
        malformed(
            "commit diff",
            &format!("unsupported change type '{change_type}' for {path}"),
            change,
        )
    })?;
    let revision_id = item
        .get("commitId")
        .and_then(Value::as_str)
        .unwrap_or(target)
        .to_string();
    let object_kind = object_kind(item);

    let mut entries = Vec::with_capacity(2);
    if action == ChangeAction::Rename {
        let old_path = ["sourceServerItem", "originalPath"]
            .iter()
            .find_map(|key| change.get(*key).and_then(Value::as_str))
            .filter(|old| *old != path);
        if let Some(old_path) = old_path {
            entries.push(RepositoryEntry {
                path: old_path.to_string(),
                object_kind,
                action: ChangeAction::Delete,
                revision_id: revision_id.clone(),
            });
        }
    }
    entries.push(RepositoryEntry {
        path: path.to_string(),
        object_kind,
        action,
        revision_id,
    });
    Ok(entries)
}

fn array<'a>(body: &'a Value, key: &str, what: &str) -> Result<&'a Vec<Value>, SourceError> {
    body.get(key).and_then(Value::as_array).ok_or_else(|| {
        error!(key, what, "[SOURCE][ERROR] Response is missing array");
        SourceError::Transport(format!("{what}: response has no '{key}' array"))
    })
}

#[async_trait]
impl SourceControl for AzureRepos {
    async fn latest_revision(&self) -> Result<String, SourceError> {
        let request = self.get("commits").query(&[
            ("searchCriteria.itemVersion.version", self.branch.as_str()),
            ("searchCriteria.itemVersion.versionType", "branch"),
            ("searchCriteria.$top", "1"),
        ]);
        let body = self.send_json(request, "latest commit").await?;
        let commit = array(&body, "value", "latest commit")?
            .first()
            .and_then(|c| c.get("commitId"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                error!(branch = %self.branch, "[SOURCE][ERROR] Branch has no commits");
                SourceError::Transport(format!("branch {} has no commits", self.branch))
            })?;
        info!(branch = %self.branch, revision = commit, "[SOURCE] Resolved latest revision");
        Ok(commit.to_string())
    }

    async fn list_full_tree(&self, revision: &str) -> Result<Vec<RepositoryEntry>, SourceError> {
        let request = self.get("items").query(&[
            ("scopePath", "/"),
            ("recursionLevel", "Full"),
            ("versionDescriptor.version", revision),
            ("versionDescriptor.versionType", "commit"),
        ]);
        let body = self.send_json(request, "full tree").await?;
        let items = array(&body, "value", "full tree")?;
        let entries = items
            .iter()
            .map(|item| parse_tree_item(item, revision))
            .collect::<Result<Vec<_>, _>>()?;
        info!(revision, entries = entries.len(), "[SOURCE] Listed full tree");
        Ok(entries)
    }

    async fn list_diff(&self, from: &str, to: &str) -> Result<Vec<RepositoryEntry>, SourceError> {
        let mut entries: Vec<RepositoryEntry> = Vec::new();
        // A rename can also be listed as "delete, sourceRename" on its old path.
        let mut seen: HashSet<(String, ChangeAction)> = HashSet::new();
        let mut skip = 0usize;
        loop {
            let top = DIFF_PAGE_SIZE.to_string();
            let skip_text = skip.to_string();
            let request = self.get("diffs/commits").query(&[
                ("baseVersion", from),
                ("baseVersionType", "commit"),
                ("targetVersion", to),
                ("targetVersionType", "commit"),
                ("$top", top.as_str()),
                ("$skip", skip_text.as_str()),
            ]);
            let body = self.send_json(request, "commit diff").await?;
            let changes = array(&body, "changes", "commit diff")?;
            for change in changes {
                for entry in parse_diff_change(change, to)? {
                    if seen.insert((entry.path.clone(), entry.action)) {
                        entries.push(entry);
                    }
                }
            }

            let complete = body
                .get("allChangesIncluded")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            if complete || changes.is_empty() {
                break;
            }
            skip += changes.len();
        }
        info!(from, to, changes = entries.len(), "[SOURCE] Listed diff");
        Ok(entries)
    }

    async fn get_content(
        &self,
        path: &str,
        revision: &str,
        previous: bool,
    ) -> Result<Vec<u8>, SourceError> {
        let resp = self.send_content(path, revision, previous).await?;
        let bytes = resp.bytes().await.map_err(|e| {
            error!(error = ?e, path, "[SOURCE][ERROR] Failed to read content body");
            SourceError::Transport(format!("content of {path}: {e}"))
        })?;
        debug!(path, revision, previous, size = bytes.len(), "[SOURCE] Fetched content");
        Ok(bytes.to_vec())
    }

    async fn get_content_stream(
        &self,
        path: &str,
        revision: &str,
    ) -> Result<ContentStream, SourceError> {
        let resp = self.send_content(path, revision, false).await?;
        let owned_path = path.to_string();
        let stream = resp
            .bytes_stream()
            .map_err(move |e| SourceError::Transport(format!("stream of {owned_path}: {e}")));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tree_item_maps_blob_and_tree() {
        let blob = json!({
            "objectId": "a1",
            "gitObjectType": "blob",
            "commitId": "c9",
            "path": "/Modules/intro/01-welcome.md"
        });
        let entry = parse_tree_item(&blob, "c10").expect("blob");
        assert_eq!(entry.path, "/Modules/intro/01-welcome.md");
        assert_eq!(entry.object_kind, ObjectKind::Blob);
        assert_eq!(entry.action, ChangeAction::Add);
        assert_eq!(entry.revision_id, "c9");

        let tree = json!({ "gitObjectType": "tree", "commitId": "c9", "path": "/Modules", "isFolder": true });
        assert_eq!(parse_tree_item(&tree, "c10").unwrap().object_kind, ObjectKind::Tree);
    }

    #[test]
    fn tree_item_without_commit_uses_listing_revision() {
        let item = json!({ "gitObjectType": "blob", "path": "/Modules/intro/module.json" });
        let entry = parse_tree_item(&item, "c10").expect("item");
        assert_eq!(entry.revision_id, "c10");
    }

    #[test]
    fn tree_item_without_path_fails_listing() {
        let err = parse_tree_item(&json!({ "commitId": "c9" }), "c10").unwrap_err();
        assert!(matches!(err, SourceError::Transport(_)));
    }

    #[test]
    fn diff_change_reads_nested_item_and_change_type() {
        let change = json!({
            "item": {
                "gitObjectType": "blob",
                "path": "/Modules/intro/.attachments/old.png",
                "commitId": "c4"
            },
            "changeType": "delete, sourceRename"
        });
        let entries = parse_diff_change(&change, "c5").expect("change");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, ChangeAction::Delete);
        assert_eq!(entries[0].revision_id, "c4");
        assert_eq!(entries[0].object_kind, ObjectKind::Blob);
    }

    #[test]
    fn diff_change_falls_back_to_target_revision() {
        let change = json!({
            "item": { "path": "/Modules", "isFolder": true },
            "changeType": "edit"
        });
        let entries = parse_diff_change(&change, "c5").expect("change");
        assert_eq!(entries[0].revision_id, "c5");
        assert_eq!(entries[0].object_kind, ObjectKind::Tree);
    }

    #[test]
    fn diff_rename_lists_old_path_as_removal_first() {
        let change = json!({
            "item": {
                "gitObjectType": "blob",
                "path": "/Modules/intro/02-welcome.md",
                "commitId": "c5"
            },
            "changeType": "rename",
            "sourceServerItem": "/Modules/intro/01-welcome.md"
        });
        let entries = parse_diff_change(&change, "c5").expect("change");

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/Modules/intro/01-welcome.md");
        assert_eq!(entries[0].action, ChangeAction::Delete);
        assert_eq!(entries[0].revision_id, "c5");
        assert_eq!(entries[1].path, "/Modules/intro/02-welcome.md");
        assert_eq!(entries[1].action, ChangeAction::Rename);
    }

    #[test]
    fn diff_edit_rename_reads_original_path() {
        let change = json!({
            "item": { "path": "/Modules/intro/.attachments/new.png" },
            "changeType": "edit, rename",
            "originalPath": "/Modules/intro/.attachments/old.png"
        });
        let entries = parse_diff_change(&change, "c5").expect("change");
        assert_eq!(entries[0].path, "/Modules/intro/.attachments/old.png");
        assert_eq!(entries[0].action, ChangeAction::Delete);
        assert_eq!(entries[1].action, ChangeAction::Rename);
    }

    #[test]
    fn diff_undelete_is_an_add() {
        let change = json!({ "item": { "path": "/Modules/intro/01-welcome.md" }, "changeType": "undelete" });
        let entries = parse_diff_change(&change, "c5").expect("change");
        assert_eq!(entries[0].action, ChangeAction::Add);
    }

    #[test]
    fn diff_change_with_unknown_type_fails_listing() {
        let change = json!({ "item": { "path": "/x.md" }, "changeType": "none" });
        let err = parse_diff_change(&change, "c5").unwrap_err();
        assert!(matches!(err, SourceError::Transport(msg) if msg.contains("none")));
    }
}
