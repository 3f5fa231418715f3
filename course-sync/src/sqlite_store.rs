//! SQLite-backed relational, document and checkpoint stores.
//!
//! One database file holds all three. Section documents are stored as JSON
//! keyed by `(partition, id)`; the checkpoint table holds at most one row.

use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use course_sync_core::contract::{
    CheckpointStore, CourseRow, DocumentStore, ModuleRow, RelationalStore, SectionDocument,
};
use course_sync_core::error::StoreError;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and initialise the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        info!(path = %path.display(), "Opened SQLite store");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS courses (
                course_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                category TEXT NOT NULL,
                length TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS modules (
                module_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                version INTEGER NOT NULL
            );

            -- Display order of modules within a course
            CREATE TABLE IF NOT EXISTS course_modules (
                course_id TEXT NOT NULL,
                module_id TEXT NOT NULL,
                order_index INTEGER NOT NULL,
                PRIMARY KEY (course_id, module_id)
            );
            CREATE INDEX IF NOT EXISTS idx_course_modules_module ON course_modules(module_id);

            CREATE TABLE IF NOT EXISTS section_documents (
                partition TEXT NOT NULL,
                id TEXT NOT NULL,
                document TEXT NOT NULL,
                PRIMARY KEY (partition, id)
            );

            CREATE TABLE IF NOT EXISTS sync_checkpoint (
                revision TEXT PRIMARY KEY
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::from("sqlite connection lock poisoned"))
    }

    pub fn course(&self, course_id: &str) -> Result<Option<CourseRow>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT course_id, name, description, category, length FROM courses WHERE course_id = ?1",
                params![course_id],
                |row| {
                    Ok(CourseRow {
                        course_id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        category: row.get(3)?,
                        length: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn module(&self, module_id: &str) -> Result<Option<ModuleRow>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT module_id, name, description, version FROM modules WHERE module_id = ?1",
                params![module_id],
                |row| {
                    Ok(ModuleRow {
                        module_id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        version: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Module ids of `course_id` with their order, sorted by order.
    pub fn course_modules(&self, course_id: &str) -> Result<Vec<(String, u32)>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT module_id, order_index FROM course_modules WHERE course_id = ?1 ORDER BY order_index",
        )?;
        let rows = stmt
            .query_map(params![course_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(String, u32)>, _>>()?;
        Ok(rows)
    }

    pub fn document(&self, partition: &str, id: &str) -> Result<Option<SectionDocument>, StoreError> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT document FROM section_documents WHERE partition = ?1 AND id = ?2",
                params![partition, id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    pub fn document_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM section_documents", [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }
}

#[async_trait]
impl RelationalStore for SqliteStore {
    async fn update_course(&self, row: &CourseRow) -> Result<u64, StoreError> {
        let changed = self.conn()?.execute(
            "UPDATE courses SET name = ?2, description = ?3, category = ?4, length = ?5 WHERE course_id = ?1",
            params![row.course_id, row.name, row.description, row.category, row.length],
        )?;
        Ok(changed as u64)
    }

    async fn insert_course(&self, row: &CourseRow) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO courses (course_id, name, description, category, length) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![row.course_id, row.name, row.description, row.category, row.length],
        )?;
        debug!(course_id = %row.course_id, "Inserted course row");
        Ok(())
    }

    async fn delete_course(&self, course_id: &str) -> Result<(), StoreError> {
        self.conn()?
            .execute("DELETE FROM courses WHERE course_id = ?1", params![course_id])?;
        Ok(())
    }

    async fn update_course_module(
        &self,
        course_id: &str,
        module_id: &str,
        order: u32,
    ) -> Result<u64, StoreError> {
        let changed = self.conn()?.execute(
            "UPDATE course_modules SET order_index = ?3 WHERE course_id = ?1 AND module_id = ?2",
            params![course_id, module_id, order],
        )?;
        Ok(changed as u64)
    }

    async fn insert_course_module(
        &self,
        course_id: &str,
        module_id: &str,
        order: u32,
    ) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO course_modules (course_id, module_id, order_index) VALUES (?1, ?2, ?3)",
            params![course_id, module_id, order],
        )?;
        Ok(())
    }

    async fn prune_course_modules(&self, course_id: &str, keep: &[String]) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let existing = {
            let mut stmt =
                conn.prepare("SELECT module_id FROM course_modules WHERE course_id = ?1")?;
            let ids = stmt
                .query_map(params![course_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        for module_id in existing.iter().filter(|m| !keep.contains(m)) {
            conn.execute(
                "DELETE FROM course_modules WHERE course_id = ?1 AND module_id = ?2",
                params![course_id, module_id],
            )?;
            debug!(course_id, module_id = %module_id, "Pruned stale course module link");
        }
        Ok(())
    }

    async fn delete_course_modules(&self, course_id: &str) -> Result<(), StoreError> {
        self.conn()?.execute(
            "DELETE FROM course_modules WHERE course_id = ?1",
            params![course_id],
        )?;
        Ok(())
    }

    async fn update_module(&self, row: &ModuleRow) -> Result<u64, StoreError> {
        let changed = self.conn()?.execute(
            "UPDATE modules SET name = ?2, description = ?3, version = ?4 WHERE module_id = ?1",
            params![row.module_id, row.name, row.description, row.version],
        )?;
        Ok(changed as u64)
    }

    async fn insert_module(&self, row: &ModuleRow) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO modules (module_id, name, description, version) VALUES (?1, ?2, ?3, ?4)",
            params![row.module_id, row.name, row.description, row.version],
        )?;
        debug!(module_id = %row.module_id, "Inserted module row");
        Ok(())
    }

    async fn delete_module(&self, module_id: &str) -> Result<(), StoreError> {
        self.conn()?
            .execute("DELETE FROM modules WHERE module_id = ?1", params![module_id])?;
        Ok(())
    }

    async fn delete_module_links(&self, module_id: &str) -> Result<(), StoreError> {
        self.conn()?.execute(
            "DELETE FROM course_modules WHERE module_id = ?1",
            params![module_id],
        )?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn upsert_document(&self, doc: &SectionDocument) -> Result<(), StoreError> {
        let json = serde_json::to_string(doc)?;
        self.conn()?.execute(
            "INSERT INTO section_documents (partition, id, document) VALUES (?1, ?2, ?3)
             ON CONFLICT(partition, id) DO UPDATE SET document = excluded.document",
            params![doc.module_id, doc.id, json],
        )?;
        Ok(())
    }

    async fn delete_document(&self, id: &str, partition: &str) -> Result<(), StoreError> {
        self.conn()?.execute(
            "DELETE FROM section_documents WHERE partition = ?1 AND id = ?2",
            params![partition, id],
        )?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn read_checkpoint(&self) -> Result<Option<String>, StoreError> {
        let revision = self
            .conn()?
            .query_row("SELECT revision FROM sync_checkpoint LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(revision)
    }

    async fn write_checkpoint(&self, revision: &str) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO sync_checkpoint (revision) VALUES (?1)",
            params![revision],
        )?;
        Ok(())
    }

    async fn delete_checkpoint(&self, revision: &str) -> Result<(), StoreError> {
        self.conn()?.execute(
            "DELETE FROM sync_checkpoint WHERE revision = ?1",
            params![revision],
        )?;
        Ok(())
    }
}
