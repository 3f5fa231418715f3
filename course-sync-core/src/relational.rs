//! Relational applier: course and module metadata plus course-module ordering.
//!
//! Every write is keyed, so replaying the same records converges on the same
//! rows. Upserts are "update, then insert when nothing was updated".

use tracing::{error, info};

use crate::changeset::{CourseRecord, ModuleRecord};
use crate::contract::{CourseRow, ModuleRow, RelationalStore};
use crate::error::{Destination, StoreError, SyncError};

fn failed(key: &str, e: StoreError) -> SyncError {
    error!(key = %key, error = ?e, "[SYNC][ERROR][SQL] Statement failed");
    SyncError::apply(Destination::Relational, key, e)
}

impl From<&CourseRecord> for CourseRow {
    fn from(record: &CourseRecord) -> Self {
        CourseRow {
            course_id: record.course_id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            category: record.category.clone(),
            length: record.length.clone(),
        }
    }
}

impl From<&ModuleRecord> for ModuleRow {
    fn from(record: &ModuleRecord) -> Self {
        ModuleRow {
            module_id: record.module_id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            version: record.version,
        }
    }
}

async fn upsert_course(store: &dyn RelationalStore, record: &CourseRecord) -> Result<(), SyncError> {
    let key = record.course_id.as_str();
    let row = CourseRow::from(record);
    let updated = store.update_course(&row).await.map_err(|e| failed(key, e))?;
    if updated == 0 {
        store.insert_course(&row).await.map_err(|e| failed(key, e))?;
    }

    for (order, module_id) in record.module_refs.iter().enumerate() {
        let order = order as u32;
        let link_key = format!("{key}/{module_id}");
        let updated = store
            .update_course_module(key, module_id, order)
            .await
            .map_err(|e| failed(&link_key, e))?;
        if updated == 0 {
            store
                .insert_course_module(key, module_id, order)
                .await
                .map_err(|e| failed(&link_key, e))?;
        }
    }
    store
        .prune_course_modules(key, &record.module_refs)
        .await
        .map_err(|e| failed(key, e))?;
    Ok(())
}

async fn upsert_module(store: &dyn RelationalStore, record: &ModuleRecord) -> Result<(), SyncError> {
    let key = record.module_id.as_str();
    let row = ModuleRow::from(record);
    let updated = store.update_module(&row).await.map_err(|e| failed(key, e))?;
    if updated == 0 {
        store.insert_module(&row).await.map_err(|e| failed(key, e))?;
    }
    Ok(())
}

/// Apply course records, then module records, in source order.
///
/// The first failing statement aborts the step.
pub async fn apply(
    store: &dyn RelationalStore,
    courses: &[CourseRecord],
    modules: &[ModuleRecord],
) -> Result<(), SyncError> {
    for record in courses {
        if record.action.is_delete() {
            store
                .delete_course_modules(&record.course_id)
                .await
                .map_err(|e| failed(&record.course_id, e))?;
            store
                .delete_course(&record.course_id)
                .await
                .map_err(|e| failed(&record.course_id, e))?;
            info!(course_id = %record.course_id, "[SYNC][SQL] Deleted course");
        } else {
            upsert_course(store, record).await?;
            info!(
                course_id = %record.course_id,
                modules = record.module_refs.len(),
                action = ?record.action,
                "[SYNC][SQL] Upserted course"
            );
        }
    }

    for record in modules {
        if record.action.is_delete() {
            store
                .delete_module_links(&record.module_id)
                .await
                .map_err(|e| failed(&record.module_id, e))?;
            store
                .delete_module(&record.module_id)
                .await
                .map_err(|e| failed(&record.module_id, e))?;
            info!(module_id = %record.module_id, "[SYNC][SQL] Deleted module");
        } else {
            upsert_module(store, record).await?;
            info!(module_id = %record.module_id, action = ?record.action, "[SYNC][SQL] Upserted module");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ChangeAction, MockRelationalStore};
    use mockall::Sequence;

    fn course(action: ChangeAction, refs: &[&str]) -> CourseRecord {
        CourseRecord {
            course_id: "azure-101".into(),
            path: "/Courses/azure-101/course.json".into(),
            name: "Azure 101".into(),
            description: "Basics".into(),
            category: "cloud".into(),
            length: "2h".into(),
            module_refs: refs.iter().map(|s| s.to_string()).collect(),
            action,
        }
    }

    #[tokio::test]
    async fn course_upsert_inserts_when_update_touches_nothing() {
        let mut store = MockRelationalStore::new();
        store.expect_update_course().times(1).returning(|_| Ok(0));
        store
            .expect_insert_course()
            .withf(|row| row.course_id == "azure-101" && row.name == "Azure 101")
            .times(1)
            .returning(|_| Ok(()));
        // "intro" already linked, "advanced" is new.
        store
            .expect_update_course_module()
            .withf(|c, m, o| c == "azure-101" && m == "intro" && *o == 0)
            .returning(|_, _, _| Ok(1));
        store
            .expect_update_course_module()
            .withf(|c, m, o| c == "azure-101" && m == "advanced" && *o == 1)
            .returning(|_, _, _| Ok(0));
        store
            .expect_insert_course_module()
            .withf(|c, m, o| c == "azure-101" && m == "advanced" && *o == 1)
            .times(1)
            .returning(|_, _, _| Ok(()));
        store
            .expect_prune_course_modules()
            .withf(|course, keep| course == "azure-101" && keep.len() == 2)
            .times(1)
            .returning(|_, _| Ok(()));

        apply(&store, &[course(ChangeAction::Edit, &["intro", "advanced"])], &[])
            .await
            .expect("apply");
    }

    #[tokio::test]
    async fn course_upsert_skips_insert_when_row_exists() {
        let mut store = MockRelationalStore::new();
        store.expect_update_course().returning(|_| Ok(1));
        store.expect_insert_course().never();
        store.expect_prune_course_modules().returning(|_, _| Ok(()));

        apply(&store, &[course(ChangeAction::Add, &[])], &[])
            .await
            .expect("apply");
    }

    #[tokio::test]
    async fn course_delete_removes_links_then_row() {
        let mut store = MockRelationalStore::new();
        let mut seq = Sequence::new();
        store
            .expect_delete_course_modules()
            .withf(|id| id == "azure-101")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        store
            .expect_delete_course()
            .withf(|id| id == "azure-101")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        apply(&store, &[course(ChangeAction::Delete, &["intro"])], &[])
            .await
            .expect("apply");
    }

    #[tokio::test]
    async fn module_delete_removes_referencing_links() {
        let mut store = MockRelationalStore::new();
        store
            .expect_delete_module_links()
            .withf(|id| id == "intro")
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_delete_module()
            .withf(|id| id == "intro")
            .times(1)
            .returning(|_| Ok(()));

        let module = ModuleRecord {
            module_id: "intro".into(),
            path: "/Modules/intro/module.json".into(),
            name: String::new(),
            description: String::new(),
            version: 0,
            action: ChangeAction::Delete,
        };
        apply(&store, &[], &[module]).await.expect("apply");
    }

    #[tokio::test]
    async fn statement_error_aborts_step() {
        let mut store = MockRelationalStore::new();
        store
            .expect_update_course()
            .returning(|_| Err("connection reset".into()));
        store.expect_update_module().never();

        let module = ModuleRecord {
            module_id: "intro".into(),
            path: "/Modules/intro/module.json".into(),
            name: "Intro".into(),
            description: String::new(),
            version: 1,
            action: ChangeAction::Add,
        };
        let err = apply(&store, &[course(ChangeAction::Add, &[])], &[module])
            .await
            .unwrap_err();
        match err {
            SyncError::Apply {
                destination, key, ..
            } => {
                assert_eq!(destination, Destination::Relational);
                assert_eq!(key, "azure-101");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
