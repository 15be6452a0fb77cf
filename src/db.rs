use crate::model::BatchResult;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::Path;

pub const DB_FILE_NAME: &str = "promotion.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;
    // Early workspaces stored only a name per class.
    ensure_classes_form(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT,
            student_no TEXT NOT NULL DEFAULT '',
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS promotion_rules(
            class_key TEXT PRIMARY KEY,
            next_class TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS promotion_links(
            from_class_id TEXT PRIMARY KEY,
            to_class_id TEXT,
            is_final_class INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(from_class_id) REFERENCES classes(id),
            FOREIGN KEY(to_class_id) REFERENCES classes(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS promotion_runs(
            id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            success_count INTEGER NOT NULL,
            fail_count INTEGER NOT NULL,
            cancelled_count INTEGER NOT NULL,
            outcomes_json TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_promotion_runs_started ON promotion_runs(started_at)",
        [],
    )?;

    Ok(conn)
}

fn ensure_classes_form(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "classes", "form")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE classes ADD COLUMN form TEXT NOT NULL DEFAULT ''",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|n| n == column))
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn record_run(conn: &Connection, result: &BatchResult) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO promotion_runs(
            id, started_at, finished_at, success_count, fail_count, cancelled_count, outcomes_json
         ) VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &result.run_id,
            result.started_at.to_rfc3339(),
            result.finished_at.to_rfc3339(),
            result.success_count as i64,
            result.fail_count as i64,
            result.cancelled_count as i64,
            serde_json::to_string(&result.outcomes)?,
        ),
    )?;
    Ok(())
}

pub fn list_runs(conn: &Connection, limit: i64) -> anyhow::Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, started_at, finished_at, success_count, fail_count, cancelled_count, outcomes_json
         FROM promotion_runs
         ORDER BY started_at DESC, id
         LIMIT ?",
    )?;
    let rows = stmt
        .query_map([limit], |row| {
            let outcomes_raw: String = row.get(6)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                outcomes_raw,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (id, started_at, finished_at, success, fail, cancelled, outcomes_raw) in rows {
        // A damaged outcome blob should not hide the run itself.
        let outcomes: serde_json::Value =
            serde_json::from_str(&outcomes_raw).unwrap_or_else(|_| json!([]));
        out.push(json!({
            "runId": id,
            "startedAt": started_at,
            "finishedAt": finished_at,
            "successCount": success,
            "failCount": fail,
            "cancelledCount": cancelled,
            "outcomes": outcomes,
        }));
    }
    Ok(out)
}
