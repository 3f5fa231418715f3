//! # contract: collaborator interfaces for the synchronisation engine
//!
//! The engine never talks to a concrete backend. Everything it reads or writes
//! goes through one of the traits below, which are implemented by the CLI
//! crate's real clients, by the in-memory [`crate::fakes`], and by `mockall`
//! mocks in tests.
//!
//! - [`SourceControl`]: revisions, tree and diff listings, file content.
//! - [`RelationalStore`]: course, module and course-module ordering rows.
//! - [`DocumentStore`]: rendered section documents, partitioned by module.
//! - [`BlobStore`]: binary attachments.
//! - [`CheckpointStore`]: the single "last applied revision" value.
//!
//! Destination methods are single-key and idempotent. Update methods report
//! the affected row count so that callers can fall back to an insert.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use mockall::automock;

use crate::error::{SourceError, StoreError};

/// Kind of object a repository listing entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tree,
}

/// Lifecycle action of a repository entry relative to the previous snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Add,
    Edit,
    Delete,
    Rename,
}

impl ChangeAction {
    /// Parse a collaborator change type such as `"edit"` or `"edit, rename"`.
    ///
    /// Tokens are matched exactly. A delete token wins over everything else,
    /// then rename, then add (or undelete), then edit.
    pub fn parse(raw: &str) -> Option<Self> {
        let tokens: Vec<String> = raw
            .split(',')
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        let has = |name: &str| tokens.iter().any(|t| t == name);

        if has("delete") {
            Some(ChangeAction::Delete)
        } else if has("rename") {
            Some(ChangeAction::Rename)
        } else if has("add") || has("undelete") {
            Some(ChangeAction::Add)
        } else if has("edit") {
            Some(ChangeAction::Edit)
        } else {
            None
        }
    }

    pub fn is_delete(self) -> bool {
        matches!(self, ChangeAction::Delete)
    }
}

/// One path in a full tree listing or a diff listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryEntry {
    pub path: String,
    pub object_kind: ObjectKind,
    pub action: ChangeAction,
    /// Revision at which this entry's content was last modified.
    pub revision_id: String,
}

/// Chunked file content, as streamed from the source repository.
pub type ContentStream = Pin<Box<dyn Stream<Item = Result<Bytes, SourceError>> + Send>>;

/// Metadata row of the courses table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseRow {
    pub course_id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub length: String,
}

/// Metadata row of the modules table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRow {
    pub module_id: String,
    pub name: String,
    pub description: String,
    pub version: i64,
}

/// A section as stored in the document store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SectionDocument {
    /// Destination key derived from the section path.
    pub id: String,
    /// Partition key: the owning module id.
    pub module_id: String,
    pub title: String,
    pub body: String,
    pub order_index: u32,
    pub revision_id: String,
}

/// Read access to the version-controlled content repository.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Most recent revision id of the tracked branch.
    async fn latest_revision(&self) -> Result<String, SourceError>;

    /// Recursive listing of every entry at `revision`.
    async fn list_full_tree(&self, revision: &str) -> Result<Vec<RepositoryEntry>, SourceError>;

    /// Entries changed between `from` (exclusive) and `to` (inclusive).
    async fn list_diff(&self, from: &str, to: &str) -> Result<Vec<RepositoryEntry>, SourceError>;

    /// Full content of `path` at `revision`, or as of the change before
    /// `revision` when `previous` is set.
    async fn get_content(
        &self,
        path: &str,
        revision: &str,
        previous: bool,
    ) -> Result<Vec<u8>, SourceError>;

    /// Content of `path` at `revision` as a chunk stream.
    async fn get_content_stream(
        &self,
        path: &str,
        revision: &str,
    ) -> Result<ContentStream, SourceError>;
}

/// Course, module and ordering tables.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn update_course(&self, row: &CourseRow) -> Result<u64, StoreError>;
    async fn insert_course(&self, row: &CourseRow) -> Result<(), StoreError>;
    async fn delete_course(&self, course_id: &str) -> Result<(), StoreError>;

    async fn update_course_module(
        &self,
        course_id: &str,
        module_id: &str,
        order: u32,
    ) -> Result<u64, StoreError>;
    async fn insert_course_module(
        &self,
        course_id: &str,
        module_id: &str,
        order: u32,
    ) -> Result<(), StoreError>;
    /// Remove ordering rows of `course_id` whose module is not in `keep`.
    async fn prune_course_modules(
        &self,
        course_id: &str,
        keep: &[String],
    ) -> Result<(), StoreError>;
    async fn delete_course_modules(&self, course_id: &str) -> Result<(), StoreError>;

    async fn update_module(&self, row: &ModuleRow) -> Result<u64, StoreError>;
    async fn insert_module(&self, row: &ModuleRow) -> Result<(), StoreError>;
    async fn delete_module(&self, module_id: &str) -> Result<(), StoreError>;
    /// Remove every ordering row that references `module_id`.
    async fn delete_module_links(&self, module_id: &str) -> Result<(), StoreError>;
}

/// Partitioned store holding one document per section.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn upsert_document(&self, doc: &SectionDocument) -> Result<(), StoreError>;
    async fn delete_document(&self, id: &str, partition: &str) -> Result<(), StoreError>;
}

/// Attachment container.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `content` under `name`, replacing any existing blob.
    async fn upload_stream(&self, name: &str, content: ContentStream) -> Result<(), StoreError>;

    /// Delete `name`; returns whether it existed.
    async fn delete_if_exists(&self, name: &str) -> Result<bool, StoreError>;
}

/// Durable storage of the last fully applied revision.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn read_checkpoint(&self) -> Result<Option<String>, StoreError>;
    async fn write_checkpoint(&self, revision: &str) -> Result<(), StoreError>;
    async fn delete_checkpoint(&self, revision: &str) -> Result<(), StoreError>;
}
