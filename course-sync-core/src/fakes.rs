//! In-memory fakes for every collaborator trait (testing only)
//!
//! `MemorySource` keeps an ordered list of revisions and derives tree and diff
//! listings from them. The destination fakes keep their state in ordered maps
//! so tests can compare whole destination states, and each can be told to
//! fail on a given key.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, TryStreamExt};

use crate::contract::*;
use crate::error::{SourceError, StoreError};

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FileVersion {
    content: Vec<u8>,
    /// Revision that last modified this file.
    modified_in: String,
}

#[derive(Debug, Clone)]
struct Revision {
    id: String,
    files: BTreeMap<String, FileVersion>,
}

/// Source repository with a linear history.
#[derive(Debug, Default)]
pub struct MemorySource {
    revisions: Mutex<Vec<Revision>>,
    unavailable: Mutex<bool>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record revision `id` on top of the latest one, writing `puts` and
    /// removing `removes`.
    pub fn commit(&self, id: &str, puts: &[(&str, &str)], removes: &[&str]) {
        let mut revisions = self.revisions.lock().unwrap();
        let mut files = revisions
            .last()
            .map(|r| r.files.clone())
            .unwrap_or_default();
        for (path, content) in puts {
            files.insert(
                path.to_string(),
                FileVersion {
                    content: content.as_bytes().to_vec(),
                    modified_in: id.to_string(),
                },
            );
        }
        for path in removes {
            files.remove(*path);
        }
        revisions.push(Revision {
            id: id.to_string(),
            files,
        });
    }

    /// Make every call fail with a transport error.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    fn check_available(&self) -> Result<(), SourceError> {
        if *self.unavailable.lock().unwrap() {
            Err(SourceError::Transport("503 Service Unavailable".into()))
        } else {
            Ok(())
        }
    }

    fn index_of(revisions: &[Revision], id: &str) -> Result<usize, SourceError> {
        revisions
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| SourceError::Transport(format!("unknown revision {id}")))
    }

    fn lookup(&self, path: &str, revision: &str, previous: bool) -> Result<Vec<u8>, SourceError> {
        self.check_available()?;
        let revisions = self.revisions.lock().unwrap();
        let idx = Self::index_of(&revisions, revision)?;
        let candidates = if previous {
            &revisions[..idx]
        } else {
            &revisions[idx..=idx]
        };
        candidates
            .iter()
            .rev()
            .find_map(|r| r.files.get(path))
            .map(|f| f.content.clone())
            .ok_or_else(|| SourceError::NotFound {
                path: path.to_string(),
            })
    }
}

#[async_trait]
impl SourceControl for MemorySource {
    async fn latest_revision(&self) -> Result<String, SourceError> {
        self.check_available()?;
        self.revisions
            .lock()
            .unwrap()
            .last()
            .map(|r| r.id.clone())
            .ok_or_else(|| SourceError::Transport("repository has no revisions".into()))
    }

    async fn list_full_tree(&self, revision: &str) -> Result<Vec<RepositoryEntry>, SourceError> {
        self.check_available()?;
        let revisions = self.revisions.lock().unwrap();
        let rev = &revisions[Self::index_of(&revisions, revision)?];

        let mut folders = BTreeSet::new();
        for path in rev.files.keys() {
            let mut end = path.len();
            while let Some(idx) = path[..end].rfind('/') {
                if idx == 0 {
                    break;
                }
                folders.insert(path[..idx].to_string());
                end = idx;
            }
        }

        let mut entries: Vec<RepositoryEntry> = folders
            .into_iter()
            .map(|path| RepositoryEntry {
                path,
                object_kind: ObjectKind::Tree,
                action: ChangeAction::Add,
                revision_id: rev.id.clone(),
            })
            .collect();
        entries.extend(rev.files.iter().map(|(path, file)| RepositoryEntry {
            path: path.clone(),
            object_kind: ObjectKind::Blob,
            action: ChangeAction::Add,
            revision_id: file.modified_in.clone(),
        }));
        Ok(entries)
    }

    async fn list_diff(&self, from: &str, to: &str) -> Result<Vec<RepositoryEntry>, SourceError> {
        self.check_available()?;
        let revisions = self.revisions.lock().unwrap();
        let old = &revisions[Self::index_of(&revisions, from)?].files;
        let new_rev = &revisions[Self::index_of(&revisions, to)?];

        let mut entries = Vec::new();
        for (path, file) in &new_rev.files {
            let action = match old.get(path) {
                None => ChangeAction::Add,
                Some(prev) if prev.content != file.content => ChangeAction::Edit,
                Some(_) => continue,
            };
            entries.push(RepositoryEntry {
                path: path.clone(),
                object_kind: ObjectKind::Blob,
                action,
                revision_id: file.modified_in.clone(),
            });
        }
        for path in old.keys().filter(|p| !new_rev.files.contains_key(*p)) {
            entries.push(RepositoryEntry {
                path: path.clone(),
                object_kind: ObjectKind::Blob,
                action: ChangeAction::Delete,
                revision_id: new_rev.id.clone(),
            });
        }
        Ok(entries)
    }

    async fn get_content(
        &self,
        path: &str,
        revision: &str,
        previous: bool,
    ) -> Result<Vec<u8>, SourceError> {
        self.lookup(path, revision, previous)
    }

    async fn get_content_stream(
        &self,
        path: &str,
        revision: &str,
    ) -> Result<ContentStream, SourceError> {
        let content = self.lookup(path, revision, false)?;
        let mid = content.len() / 2;
        let chunks = vec![
            Ok(Bytes::copy_from_slice(&content[..mid])),
            Ok(Bytes::copy_from_slice(&content[mid..])),
        ];
        Ok(Box::pin(stream::iter(chunks)))
    }
}

// ---------------------------------------------------------------------------
// Destination fakes
// ---------------------------------------------------------------------------

fn check_key(fail_on: &Mutex<Option<String>>, key: &str) -> Result<(), StoreError> {
    match fail_on.lock().unwrap().as_deref() {
        Some(bad) if bad == key => Err(format!("injected failure for {key}").into()),
        _ => Ok(()),
    }
}

/// Relational tables held in ordered maps.
#[derive(Debug, Default)]
pub struct MemoryRelational {
    courses: Mutex<BTreeMap<String, CourseRow>>,
    modules: Mutex<BTreeMap<String, ModuleRow>>,
    links: Mutex<BTreeMap<(String, String), u32>>,
    fail_on: Mutex<Option<String>>,
    writes: AtomicUsize,
}

impl MemoryRelational {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any write whose course or module id equals `key`.
    pub fn fail_on(&self, key: Option<&str>) {
        *self.fail_on.lock().unwrap() = key.map(str::to_string);
    }

    pub fn courses(&self) -> BTreeMap<String, CourseRow> {
        self.courses.lock().unwrap().clone()
    }

    pub fn modules(&self) -> BTreeMap<String, ModuleRow> {
        self.modules.lock().unwrap().clone()
    }

    pub fn links(&self) -> BTreeMap<(String, String), u32> {
        self.links.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn write(&self, key: &str) -> Result<(), StoreError> {
        check_key(&self.fail_on, key)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl RelationalStore for MemoryRelational {
    async fn update_course(&self, row: &CourseRow) -> Result<u64, StoreError> {
        self.write(&row.course_id)?;
        let mut courses = self.courses.lock().unwrap();
        Ok(match courses.get_mut(&row.course_id) {
            Some(existing) => {
                *existing = row.clone();
                1
            }
            None => 0,
        })
    }

    async fn insert_course(&self, row: &CourseRow) -> Result<(), StoreError> {
        self.write(&row.course_id)?;
        let mut courses = self.courses.lock().unwrap();
        if courses.contains_key(&row.course_id) {
            return Err(format!("duplicate course key {}", row.course_id).into());
        }
        courses.insert(row.course_id.clone(), row.clone());
        Ok(())
    }

    async fn delete_course(&self, course_id: &str) -> Result<(), StoreError> {
        self.write(course_id)?;
        self.courses.lock().unwrap().remove(course_id);
        Ok(())
    }

    async fn update_course_module(
        &self,
        course_id: &str,
        module_id: &str,
        order: u32,
    ) -> Result<u64, StoreError> {
        self.write(course_id)?;
        let mut links = self.links.lock().unwrap();
        Ok(
            match links.get_mut(&(course_id.to_string(), module_id.to_string())) {
                Some(existing) => {
                    *existing = order;
                    1
                }
                None => 0,
            },
        )
    }

    async fn insert_course_module(
        &self,
        course_id: &str,
        module_id: &str,
        order: u32,
    ) -> Result<(), StoreError> {
        self.write(course_id)?;
        let key = (course_id.to_string(), module_id.to_string());
        let mut links = self.links.lock().unwrap();
        if links.contains_key(&key) {
            return Err(format!("duplicate link {course_id}/{module_id}").into());
        }
        links.insert(key, order);
        Ok(())
    }

    async fn prune_course_modules(&self, course_id: &str, keep: &[String]) -> Result<(), StoreError> {
        self.write(course_id)?;
        self.links
            .lock()
            .unwrap()
            .retain(|(course, module), _| course != course_id || keep.contains(module));
        Ok(())
    }

    async fn delete_course_modules(&self, course_id: &str) -> Result<(), StoreError> {
        self.write(course_id)?;
        self.links
            .lock()
            .unwrap()
            .retain(|(course, _), _| course != course_id);
        Ok(())
    }

    async fn update_module(&self, row: &ModuleRow) -> Result<u64, StoreError> {
        self.write(&row.module_id)?;
        let mut modules = self.modules.lock().unwrap();
        Ok(match modules.get_mut(&row.module_id) {
            Some(existing) => {
                *existing = row.clone();
                1
            }
            None => 0,
        })
    }

    async fn insert_module(&self, row: &ModuleRow) -> Result<(), StoreError> {
        self.write(&row.module_id)?;
        let mut modules = self.modules.lock().unwrap();
        if modules.contains_key(&row.module_id) {
            return Err(format!("duplicate module key {}", row.module_id).into());
        }
        modules.insert(row.module_id.clone(), row.clone());
        Ok(())
    }

    async fn delete_module(&self, module_id: &str) -> Result<(), StoreError> {
        self.write(module_id)?;
        self.modules.lock().unwrap().remove(module_id);
        Ok(())
    }

    async fn delete_module_links(&self, module_id: &str) -> Result<(), StoreError> {
        self.write(module_id)?;
        self.links
            .lock()
            .unwrap()
            .retain(|(_, module), _| module != module_id);
        Ok(())
    }
}

/// Documents keyed by `(partition, id)`.
#[derive(Debug, Default)]
pub struct MemoryDocuments {
    docs: Mutex<BTreeMap<(String, String), SectionDocument>>,
    fail_on: Mutex<Option<String>>,
    writes: AtomicUsize,
}

impl MemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any write for document id `key`.
    pub fn fail_on(&self, key: Option<&str>) {
        *self.fail_on.lock().unwrap() = key.map(str::to_string);
    }

    pub fn documents(&self) -> BTreeMap<(String, String), SectionDocument> {
        self.docs.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocuments {
    async fn upsert_document(&self, doc: &SectionDocument) -> Result<(), StoreError> {
        check_key(&self.fail_on, &doc.id)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.docs
            .lock()
            .unwrap()
            .insert((doc.module_id.clone(), doc.id.clone()), doc.clone());
        Ok(())
    }

    async fn delete_document(&self, id: &str, partition: &str) -> Result<(), StoreError> {
        check_key(&self.fail_on, id)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.docs
            .lock()
            .unwrap()
            .remove(&(partition.to_string(), id.to_string()));
        Ok(())
    }
}

/// Blob container keyed by blob name.
#[derive(Debug, Default)]
pub struct MemoryBlobs {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_on: Mutex<Option<String>>,
    writes: AtomicUsize,
}

impl MemoryBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any write for blob `name`.
    pub fn fail_on(&self, name: Option<&str>) {
        *self.fail_on.lock().unwrap() = name.map(str::to_string);
    }

    pub fn blobs(&self) -> BTreeMap<String, Vec<u8>> {
        self.blobs.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobs {
    async fn upload_stream(&self, name: &str, content: ContentStream) -> Result<(), StoreError> {
        check_key(&self.fail_on, name)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let chunks: Vec<Bytes> = content.try_collect().await?;
        let data = chunks.concat();
        self.blobs.lock().unwrap().insert(name.to_string(), data);
        Ok(())
    }

    async fn delete_if_exists(&self, name: &str) -> Result<bool, StoreError> {
        check_key(&self.fail_on, name)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(self.blobs.lock().unwrap().remove(name).is_some())
    }
}

/// Single checkpoint value.
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    value: Mutex<Option<String>>,
    fail_writes: Mutex<bool>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_revision(revision: &str) -> Self {
        Self {
            value: Mutex::new(Some(revision.to_string())),
            fail_writes: Mutex::new(false),
        }
    }

    pub fn current(&self) -> Option<String> {
        self.value.lock().unwrap().clone()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap() = fail;
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoint {
    async fn read_checkpoint(&self) -> Result<Option<String>, StoreError> {
        Ok(self.current())
    }

    async fn write_checkpoint(&self, revision: &str) -> Result<(), StoreError> {
        if *self.fail_writes.lock().unwrap() {
            return Err("checkpoint table unavailable".into());
        }
        *self.value.lock().unwrap() = Some(revision.to_string());
        Ok(())
    }

    async fn delete_checkpoint(&self, revision: &str) -> Result<(), StoreError> {
        let mut value = self.value.lock().unwrap();
        if value.as_deref() == Some(revision) {
            *value = None;
        }
        Ok(())
    }
}
