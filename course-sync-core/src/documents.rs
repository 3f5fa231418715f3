//! Document applier: one document per section, partitioned by module id.

use futures::{stream, TryStreamExt};
use tracing::{debug, error, info};

use crate::changeset::{ModuleRecord, SectionRecord};
use crate::classify::module_segment;
use crate::config::SyncSettings;
use crate::contract::{DocumentStore, SectionDocument};
use crate::error::{Destination, SyncError, ValidationReport, Violation};

const MODULES_PREFIX: &str = "/Modules/";
const KEY_DELIMITER: &str = "__";
/// Relative link marker for a module's attachments folder inside section markdown.
pub const ATTACHMENTS_MARKER: &str = "./.attachments/";

/// Document id for a section path.
///
/// `/Modules/intro/01-welcome.md` becomes `intro__01-welcome`. Paths outside
/// `/Modules/` or without the `.md` suffix are rejected instead of truncated.
pub fn document_key(path: &str) -> Result<String, SyncError> {
    let rest = path
        .strip_prefix(MODULES_PREFIX)
        .and_then(|p| p.strip_suffix(".md"))
        .ok_or_else(|| {
            let mut report = ValidationReport::default();
            report.push(Violation::UnparseableSection {
                path: path.to_string(),
            });
            SyncError::Validation(report)
        })?;
    Ok(rest.replace('/', KEY_DELIMITER).replace(' ', "_"))
}

/// Module id owning `section`: the module record of this run whose folder
/// contains the section, else the module segment of the path.
pub fn resolve_module_id(section: &SectionRecord, modules: &[ModuleRecord]) -> String {
    modules
        .iter()
        .find(|m| section.path.starts_with(m.folder()))
        .map(|m| m.module_id.clone())
        .or_else(|| module_segment(&section.path).map(str::to_string))
        .unwrap_or_else(|| section.module_id.clone())
}

/// Rewrite relative attachment links to absolute blob URLs for `module_id`.
pub fn rewrite_attachment_links(body: &str, module_id: &str, settings: &SyncSettings) -> String {
    let absolute = settings.blob_url(&format!("Modules/{module_id}/.attachments/"));
    body.replace(ATTACHMENTS_MARKER, &absolute)
}

/// Upsert or delete the document of every section.
///
/// Items run concurrently up to `settings.max_concurrency`; the first error
/// aborts the step.
pub async fn apply(
    store: &dyn DocumentStore,
    sections: &[SectionRecord],
    modules: &[ModuleRecord],
    settings: &SyncSettings,
) -> Result<(), SyncError> {
    stream::iter(sections.iter().map(Ok::<_, SyncError>))
        .try_for_each_concurrent(settings.concurrency(), |section| async move {
            let id = document_key(&section.path)?;
            let partition = resolve_module_id(section, modules);

            if section.action.is_delete() {
                store.delete_document(&id, &partition).await.map_err(|e| {
                    error!(id = %id, partition = %partition, error = ?e, "[SYNC][ERROR][DOCS] Delete failed");
                    SyncError::apply(Destination::Documents, &id, e)
                })?;
                debug!(id = %id, partition = %partition, "[SYNC][DOCS] Deleted section document");
                return Ok(());
            }

            let doc = SectionDocument {
                id: id.clone(),
                module_id: partition.clone(),
                title: section.title.clone(),
                body: rewrite_attachment_links(&section.body, &partition, settings),
                order_index: section.order_index,
                revision_id: section.revision_id.clone(),
            };
            store.upsert_document(&doc).await.map_err(|e| {
                error!(id = %id, partition = %partition, error = ?e, "[SYNC][ERROR][DOCS] Upsert failed");
                SyncError::apply(Destination::Documents, &id, e)
            })?;
            debug!(id = %id, partition = %partition, "[SYNC][DOCS] Upserted section document");
            Ok(())
        })
        .await?;

    info!(sections = sections.len(), "[SYNC][DOCS] Section documents applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ChangeAction, MockDocumentStore};

    fn section(path: &str, action: ChangeAction, body: &str) -> SectionRecord {
        SectionRecord {
            section_key: "intro-welcome".into(),
            path: path.into(),
            module_id: "intro".into(),
            order_index: 1,
            title: "Welcome".into(),
            body: body.into(),
            revision_id: "r2".into(),
            action,
        }
    }

    fn settings() -> SyncSettings {
        SyncSettings::new("acct.blob.core.windows.net", "attachments")
    }

    #[test]
    fn document_key_flattens_path() {
        assert_eq!(
            document_key("/Modules/intro/01-welcome.md").unwrap(),
            "intro__01-welcome"
        );
        assert_eq!(
            document_key("/Modules/my module/02-next.md").unwrap(),
            "my_module__02-next"
        );
    }

    #[test]
    fn document_key_rejects_unexpected_layout() {
        assert!(matches!(
            document_key("/Courses/intro/01-welcome.md"),
            Err(SyncError::Validation(_))
        ));
        assert!(document_key("/Modules/intro/01-welcome.txt").is_err());
    }

    #[test]
    fn attachment_links_become_absolute_blob_urls() {
        let body = "See ![d](./.attachments/diagram.png) and ![e](./.attachments/e.jpg).";
        assert_eq!(
            rewrite_attachment_links(body, "intro", &settings()),
            "See ![d](https://acct.blob.core.windows.net/attachments/Modules/intro/.attachments/diagram.png) \
             and ![e](https://acct.blob.core.windows.net/attachments/Modules/intro/.attachments/e.jpg)."
        );
    }

    #[test]
    fn module_id_prefers_change_set_record() {
        let module = ModuleRecord {
            module_id: "intro".into(),
            path: "/Modules/intro/module.json".into(),
            name: "Intro".into(),
            description: String::new(),
            version: 1,
            action: ChangeAction::Add,
        };
        let s = section("/Modules/intro/01-welcome.md", ChangeAction::Add, "");
        assert_eq!(resolve_module_id(&s, &[module]), "intro");

        let other = section("/Modules/advanced/01-deep.md", ChangeAction::Add, "");
        assert_eq!(resolve_module_id(&other, &[]), "advanced");
    }

    #[tokio::test]
    async fn upsert_writes_rewritten_document() {
        let mut store = MockDocumentStore::new();
        store
            .expect_upsert_document()
            .withf(|doc| {
                doc.id == "intro__01-welcome"
                    && doc.module_id == "intro"
                    && doc.title == "Welcome"
                    && doc.order_index == 1
                    && doc.revision_id == "r2"
                    && doc.body
                        == "![d](https://acct.blob.core.windows.net/attachments/Modules/intro/.attachments/diagram.png)"
            })
            .times(1)
            .returning(|_| Ok(()));
        store.expect_delete_document().never();

        let sections = [section(
            "/Modules/intro/01-welcome.md",
            ChangeAction::Add,
            "![d](./.attachments/diagram.png)",
        )];
        apply(&store, &sections, &[], &settings()).await.expect("apply");
    }

    #[tokio::test]
    async fn delete_uses_same_key_and_partition() {
        let mut store = MockDocumentStore::new();
        store
            .expect_delete_document()
            .withf(|id, partition| id == "intro__01-welcome" && partition == "intro")
            .times(1)
            .returning(|_, _| Ok(()));
        store.expect_upsert_document().never();

        let sections = [section("/Modules/intro/01-welcome.md", ChangeAction::Delete, "")];
        apply(&store, &sections, &[], &settings()).await.expect("apply");
    }

    #[tokio::test]
    async fn store_error_fails_step() {
        let mut store = MockDocumentStore::new();
        store
            .expect_upsert_document()
            .returning(|_| Err("429 Too Many Requests".into()));

        let sections = [section("/Modules/intro/01-welcome.md", ChangeAction::Edit, "x")];
        let err = apply(&store, &sections, &[], &settings()).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Apply {
                destination: Destination::Documents,
                ..
            }
        ));
    }
}
