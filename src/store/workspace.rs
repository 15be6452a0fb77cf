//! Local sqlite workspace standing in for the school API.

use super::{SchoolStore, StoreError};
use crate::model::{ClassRef, PromotionRuleRecord, PromotionRules, Student, StudentUpdateResult};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};

pub struct WorkspaceStore {
    conn: Arc<Mutex<Connection>>,
}

impl WorkspaceStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub fn load_classes(conn: &Connection) -> rusqlite::Result<Vec<ClassRef>> {
    let mut stmt = conn.prepare("SELECT id, name, form FROM classes ORDER BY name, id")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ClassRef {
                id: row.get(0)?,
                name: row.get(1)?,
                form: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_students(conn: &Connection, class_id: Option<&str>) -> rusqlite::Result<Vec<Student>> {
    let map_row = |row: &rusqlite::Row<'_>| {
        Ok(Student {
            id: row.get(0)?,
            class_id: row.get(1)?,
            student_number: row.get(2)?,
            first_name: row.get(3)?,
            last_name: row.get(4)?,
        })
    };
    let base = "SELECT id, class_id, student_no, first_name, last_name FROM students";
    match class_id {
        Some(cid) => {
            let mut stmt =
                conn.prepare(&format!("{base} WHERE class_id = ? ORDER BY sort_order, id"))?;
            let rows = stmt
                .query_map([cid], map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "{base} ORDER BY class_id IS NULL, class_id, sort_order, id"
            ))?;
            let rows = stmt
                .query_map([], map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        }
    }
}

pub fn load_rules(conn: &Connection) -> rusqlite::Result<PromotionRules> {
    let mut out = PromotionRules::default();

    let mut stmt = conn.prepare("SELECT class_key, next_class FROM promotion_rules")?;
    let named = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    out.named.extend(named);

    let mut stmt = conn.prepare(
        "SELECT from_class_id, to_class_id, is_final_class FROM promotion_links ORDER BY from_class_id",
    )?;
    out.linked = stmt
        .query_map([], |row| {
            Ok(PromotionRuleRecord {
                from_class_id: row.get(0)?,
                to_class_id: row.get(1)?,
                is_final_class: row.get::<_, i64>(2)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(out)
}

#[async_trait]
impl SchoolStore for WorkspaceStore {
    fn kind(&self) -> &'static str {
        "workspace"
    }

    async fn get_classes(&self) -> Result<Vec<ClassRef>, StoreError> {
        Ok(load_classes(&self.lock())?)
    }

    async fn get_students(&self) -> Result<Vec<Student>, StoreError> {
        Ok(load_students(&self.lock(), None)?)
    }

    async fn get_promotion_rules(&self) -> Result<PromotionRules, StoreError> {
        Ok(load_rules(&self.lock())?)
    }

    async fn update_student_class(
        &self,
        student_id: &str,
        class_id: &str,
    ) -> Result<StudentUpdateResult, StoreError> {
        let conn = self.lock();

        let class_exists: Option<i64> = conn
            .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| r.get(0))
            .optional()?;
        if class_exists.is_none() {
            return Err(StoreError::Invalid(format!("class {class_id} does not exist")));
        }

        let changed = conn.execute(
            "UPDATE students SET class_id = ?, updated_at = ? WHERE id = ?",
            (class_id, chrono::Utc::now().to_rfc3339(), student_id),
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("student {student_id}")));
        }

        let row = conn.query_row(
            "SELECT id, class_id, student_no, first_name, last_name FROM students WHERE id = ?",
            [student_id],
            |row| {
                Ok(json!({
                    "id": row.get::<_, String>(0)?,
                    "classId": row.get::<_, Option<String>>(1)?,
                    "studentNumber": row.get::<_, String>(2)?,
                    "firstName": row.get::<_, String>(3)?,
                    "lastName": row.get::<_, String>(4)?,
                }))
            },
        )?;
        Ok(StudentUpdateResult::from_value(row))
    }
}
