//! Change set builder.
//!
//! Turns a fetched [`Snapshot`] into a typed, validated [`ChangeSet`]. All
//! content reads happen here, before any destination is touched, and every
//! naming or reference violation of the batch is collected into one
//! [`ValidationReport`]. A change set is only returned when that report is
//! empty.

use std::collections::HashMap;

use futures::{stream, StreamExt, TryStreamExt};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::classify::{classify, ClassifyError, ContentKind};
use crate::contract::{ChangeAction, RepositoryEntry, SourceControl};
use crate::error::{SourceError, SyncError, ValidationReport, Violation};
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseRecord {
    pub course_id: String,
    pub path: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub length: String,
    /// Module ids in display order.
    pub module_refs: Vec<String>,
    pub action: ChangeAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub module_id: String,
    pub path: String,
    pub name: String,
    pub description: String,
    pub version: i64,
    pub action: ChangeAction,
}

impl ModuleRecord {
    /// Folder holding this module's sections and attachments, with trailing slash.
    pub fn folder(&self) -> &str {
        self.path.trim_end_matches("module.json")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionRecord {
    pub section_key: String,
    pub path: String,
    /// Module folder segment of the path.
    pub module_id: String,
    pub order_index: u32,
    /// First line of the content; empty for deletions.
    pub title: String,
    /// Content after the first blank line; empty for deletions.
    pub body: String,
    pub revision_id: String,
    pub action: ChangeAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub path: String,
    pub revision_id: String,
    pub action: ChangeAction,
}

impl AttachmentRecord {
    /// Blob name: the repository path without its leading slash.
    pub fn blob_name(&self) -> &str {
        self.path.trim_start_matches('/')
    }
}

/// Validated unit of work for one run. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub revision: String,
    pub courses: Vec<CourseRecord>,
    pub modules: Vec<ModuleRecord>,
    pub sections: Vec<SectionRecord>,
    pub attachments: Vec<AttachmentRecord>,
}

/// Upsert/delete counts per record kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounts {
    pub upserts: usize,
    pub deletes: usize,
}

impl KindCounts {
    fn tally<'a>(actions: impl Iterator<Item = &'a ChangeAction>) -> Self {
        actions.fold(KindCounts::default(), |mut acc, a| {
            if a.is_delete() {
                acc.deletes += 1;
            } else {
                acc.upserts += 1;
            }
            acc
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSetSummary {
    pub courses: KindCounts,
    pub modules: KindCounts,
    pub sections: KindCounts,
    pub attachments: KindCounts,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.courses.is_empty()
            && self.modules.is_empty()
            && self.sections.is_empty()
            && self.attachments.is_empty()
    }

    pub fn summary(&self) -> ChangeSetSummary {
        ChangeSetSummary {
            courses: KindCounts::tally(self.courses.iter().map(|r| &r.action)),
            modules: KindCounts::tally(self.modules.iter().map(|r| &r.action)),
            sections: KindCounts::tally(self.sections.iter().map(|r| &r.action)),
            attachments: KindCounts::tally(self.attachments.iter().map(|r| &r.action)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CourseDescriptor {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    length: Option<serde_json::Value>,
    #[serde(default)]
    modules: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModuleDescriptor {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    version: i64,
}

fn length_text(value: Option<serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(s)) => s,
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Split markdown into its title line and the body after the first blank line.
pub fn split_section(content: &str) -> (String, String) {
    let normalized = content.replace("\r\n", "\n");
    let title = normalized.lines().next().unwrap_or("").trim().to_string();
    let body = normalized
        .find("\n\n")
        .map(|idx| normalized[idx + 2..].to_string())
        .unwrap_or_default();
    (title, body)
}

struct Partitioned<'a> {
    courses: Vec<(&'a RepositoryEntry, String)>,
    modules: Vec<(&'a RepositoryEntry, String)>,
    sections: Vec<(&'a RepositoryEntry, String, String, u32)>,
    attachments: Vec<&'a RepositoryEntry>,
}

fn partition<'a>(entries: &'a [RepositoryEntry], report: &mut ValidationReport) -> Partitioned<'a> {
    let mut out = Partitioned {
        courses: Vec::new(),
        modules: Vec::new(),
        sections: Vec::new(),
        attachments: Vec::new(),
    };

    for entry in entries {
        match classify(&entry.path) {
            Ok(ContentKind::Course { course_id }) => out.courses.push((entry, course_id)),
            Ok(ContentKind::Module { module_id }) => out.modules.push((entry, module_id)),
            Ok(ContentKind::Section {
                module_id,
                section_key,
                order_index,
            }) => out.sections.push((entry, module_id, section_key, order_index)),
            Ok(ContentKind::Attachment { .. }) => {
                // Deletes are exempt; a path with spaces was never written.
                if entry.action.is_delete() {
                    out.attachments.push(entry);
                } else if entry.path.contains(' ') {
                    report.push(Violation::WhitespaceInAttachment {
                        path: entry.path.clone(),
                    });
                } else {
                    out.attachments.push(entry);
                }
            }
            Ok(ContentKind::Ignored) => {
                debug!(path = %entry.path, "[SYNC][BUILD] Ignoring path");
            }
            // Naming rules bind live entries only. Removing a badly named
            // file is how an operator fixes it.
            Err(e) if entry.action.is_delete() => {
                warn!(path = %entry.path, error = %e, "[SYNC][BUILD] Skipping deletion of unclassifiable path");
            }
            Err(ClassifyError::UnparseableSection(path)) => {
                report.push(Violation::UnparseableSection { path });
            }
            Err(ClassifyError::UnexpectedLayout(path)) => {
                report.push(Violation::UnexpectedLayout { path });
            }
        }
    }
    out
}

async fn read_bytes(
    source: &dyn SourceControl,
    path: &str,
    revision: &str,
    previous: bool,
) -> Result<Vec<u8>, SyncError> {
    source
        .get_content(path, revision, previous)
        .await
        .map_err(|e| {
            error!(error = ?e, path = %path, revision = %revision, previous, "[SYNC][ERROR][BUILD] Content fetch failed");
            SyncError::transport(format!("fetch {path}"), e)
        })
}

/// Revision to read a descriptor from: the latest one for live files, the
/// entry's own revision (as of the change before it) for deletions.
fn read_point<'a>(entry: &'a RepositoryEntry, latest: &'a str) -> (&'a str, bool) {
    if entry.action.is_delete() {
        (&entry.revision_id, true)
    } else {
        (latest, false)
    }
}

fn parse_descriptor<T: for<'de> Deserialize<'de>>(
    entry: &RepositoryEntry,
    bytes: &[u8],
    report: &mut ValidationReport,
) -> Option<T> {
    // Invalid UTF-8 surfaces here as a JSON error naming the path.
    match serde_json::from_slice::<T>(bytes) {
        Ok(parsed) => Some(parsed),
        Err(e) if entry.action.is_delete() => {
            warn!(path = %entry.path, error = %e, "[SYNC][BUILD] Deleted descriptor had invalid JSON, deleting by id only");
            None
        }
        Err(e) => {
            report.push(Violation::MalformedDescriptor {
                path: entry.path.clone(),
                reason: e.to_string(),
            });
            None
        }
    }
}

/// Whether `/Modules/<module_id>/module.json` exists at `revision`.
async fn module_exists(
    source: &dyn SourceControl,
    module_id: &str,
    revision: &str,
) -> Result<bool, SyncError> {
    let path = format!("/Modules/{module_id}/module.json");
    match source.get_content(&path, revision, false).await {
        Ok(_) => Ok(true),
        Err(SourceError::NotFound { .. }) => Ok(false),
        Err(e) => {
            error!(error = ?e, path = %path, "[SYNC][ERROR][BUILD] Module probe failed");
            Err(SyncError::transport(format!("probe {path}"), e))
        }
    }
}

/// Build and validate the change set for `snapshot`.
pub async fn build(
    source: &dyn SourceControl,
    snapshot: &Snapshot,
    concurrency: usize,
) -> Result<ChangeSet, SyncError> {
    let latest = snapshot.latest_revision.as_str();
    let mut report = ValidationReport::default();
    let parts = partition(&snapshot.entries, &mut report);

    info!(
        courses = parts.courses.len(),
        modules = parts.modules.len(),
        sections = parts.sections.len(),
        attachments = parts.attachments.len(),
        "[SYNC][BUILD] Classified snapshot entries"
    );

    let mut probed: HashMap<String, bool> = HashMap::new();
    let mut courses = Vec::with_capacity(parts.courses.len());
    for (entry, course_id) in parts.courses {
        let (revision, previous) = read_point(entry, latest);
        let bytes = read_bytes(source, &entry.path, revision, previous).await?;
        let descriptor = parse_descriptor::<CourseDescriptor>(entry, &bytes, &mut report);

        let Some(descriptor) = descriptor else {
            if entry.action.is_delete() {
                courses.push(CourseRecord {
                    course_id,
                    path: entry.path.clone(),
                    name: String::new(),
                    description: String::new(),
                    category: String::new(),
                    length: String::new(),
                    module_refs: Vec::new(),
                    action: entry.action,
                });
            }
            continue;
        };

        if !entry.action.is_delete() {
            for module_id in &descriptor.modules {
                let exists = match probed.get(module_id) {
                    Some(known) => *known,
                    None => {
                        let found = module_exists(source, module_id, latest).await?;
                        probed.insert(module_id.clone(), found);
                        found
                    }
                };
                if !exists {
                    report.push(Violation::MissingModule {
                        course_id: course_id.clone(),
                        module_id: module_id.clone(),
                    });
                }
            }
        }

        courses.push(CourseRecord {
            course_id,
            path: entry.path.clone(),
            name: descriptor.name,
            description: descriptor.description,
            category: descriptor.category,
            length: length_text(descriptor.length),
            module_refs: descriptor.modules,
            action: entry.action,
        });
    }

    let mut modules = Vec::with_capacity(parts.modules.len());
    for (entry, module_id) in parts.modules {
        let (revision, previous) = read_point(entry, latest);
        let bytes = read_bytes(source, &entry.path, revision, previous).await?;
        match parse_descriptor::<ModuleDescriptor>(entry, &bytes, &mut report) {
            Some(descriptor) => modules.push(ModuleRecord {
                module_id,
                path: entry.path.clone(),
                name: descriptor.name,
                description: descriptor.description,
                version: descriptor.version,
                action: entry.action,
            }),
            None if entry.action.is_delete() => modules.push(ModuleRecord {
                module_id,
                path: entry.path.clone(),
                name: String::new(),
                description: String::new(),
                version: 0,
                action: entry.action,
            }),
            None => {}
        }
    }

    let attachments: Vec<AttachmentRecord> = parts
        .attachments
        .into_iter()
        .map(|entry| AttachmentRecord {
            path: entry.path.clone(),
            revision_id: entry.revision_id.clone(),
            action: entry.action,
        })
        .collect();

    // Naming, whitespace and reference problems are reported together before
    // any section content is downloaded.
    if !report.is_empty() {
        for violation in &report.violations {
            error!(violation = %violation, "[SYNC][ERROR][BUILD] Validation failed");
        }
        return Err(SyncError::Validation(report));
    }

    let fetched: Vec<Result<SectionRecord, Violation>> = stream::iter(parts.sections)
        .map(|(entry, module_id, section_key, order_index)| async move {
            let (title, body) = if entry.action.is_delete() {
                (String::new(), String::new())
            } else {
                let bytes = read_bytes(source, &entry.path, latest, false).await?;
                match String::from_utf8(bytes) {
                    Ok(text) => split_section(&text),
                    Err(_) => {
                        return Ok(Err(Violation::InvalidEncoding {
                            path: entry.path.clone(),
                        }))
                    }
                }
            };
            Ok::<_, SyncError>(Ok(SectionRecord {
                section_key,
                path: entry.path.clone(),
                module_id,
                order_index,
                title,
                body,
                revision_id: entry.revision_id.clone(),
                action: entry.action,
            }))
        })
        .buffered(concurrency.max(1))
        .try_collect()
        .await?;

    let mut sections = Vec::with_capacity(fetched.len());
    for result in fetched {
        match result {
            Ok(section) => sections.push(section),
            Err(violation) => report.push(violation),
        }
    }
    // Encoding problems are only visible once content is downloaded, but are
    // still reported before any destination is written.
    if !report.is_empty() {
        for violation in &report.violations {
            error!(violation = %violation, "[SYNC][ERROR][BUILD] Section content rejected");
        }
        return Err(SyncError::Validation(report));
    }

    let change_set = ChangeSet {
        revision: latest.to_string(),
        courses,
        modules,
        sections,
        attachments,
    };
    info!(summary = ?change_set.summary(), "[SYNC][BUILD] Change set built");
    Ok(change_set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_section_takes_first_line_and_text_after_blank_line() {
        let (title, body) = split_section("# Welcome\r\n\r\nHello there.\n\nSecond paragraph.");
        assert_eq!(title, "# Welcome");
        assert_eq!(body, "Hello there.\n\nSecond paragraph.");
    }

    #[test]
    fn split_section_without_blank_line_has_empty_body() {
        let (title, body) = split_section("Only a title\nand a second line");
        assert_eq!(title, "Only a title");
        assert_eq!(body, "");
    }

    #[test]
    fn summary_counts_deletes_separately() {
        let set = ChangeSet {
            revision: "r".into(),
            attachments: vec![
                AttachmentRecord {
                    path: "/a.png".into(),
                    revision_id: "r".into(),
                    action: ChangeAction::Delete,
                },
                AttachmentRecord {
                    path: "/b.png".into(),
                    revision_id: "r".into(),
                    action: ChangeAction::Rename,
                },
            ],
            ..ChangeSet::default()
        };
        let summary = set.summary();
        assert_eq!(summary.attachments, KindCounts { upserts: 1, deletes: 1 });
        assert_eq!(summary.courses, KindCounts::default());
    }

    #[test]
    fn length_accepts_strings_and_numbers() {
        assert_eq!(length_text(Some(serde_json::json!("2h"))), "2h");
        assert_eq!(length_text(Some(serde_json::json!(90))), "90");
        assert_eq!(length_text(None), "");
    }

    #[test]
    fn module_folder_strips_descriptor_name() {
        let module = ModuleRecord {
            module_id: "intro".into(),
            path: "/Modules/intro/module.json".into(),
            name: "Intro".into(),
            description: String::new(),
            version: 1,
            action: ChangeAction::Add,
        };
        assert_eq!(module.folder(), "/Modules/intro/");
    }
}
