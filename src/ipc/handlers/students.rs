use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::workspace;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.conn() else {
        return ok(&req.id, json!({ "students": [] }));
    };
    let class_id = optional_str(req, "classId");
    match workspace::load_students(&conn, class_id.as_deref()) {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.conn() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(last_name) = optional_str(req, "lastName") else {
        return err(&req.id, "bad_params", "missing lastName", None);
    };
    let Some(first_name) = optional_str(req, "firstName") else {
        return err(&req.id, "bad_params", "missing firstName", None);
    };
    let student_no = optional_str(req, "studentNumber")
        .or_else(|| optional_str(req, "studentNo"))
        .unwrap_or_default();
    // Students may be created without a class; they are simply never promoted.
    let class_id = optional_str(req, "classId");

    if let Some(cid) = class_id.as_deref() {
        let class_exists: Option<i64> = match conn
            .query_row("SELECT 1 FROM classes WHERE id = ?", [cid], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if class_exists.is_none() {
            return err(&req.id, "not_found", "class not found", None);
        }
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_id IS ?",
        [class_id.as_deref()],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, class_id, student_no, first_name, last_name, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            class_id.as_deref(),
            &student_no,
            &first_name,
            &last_name,
            sort_order,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "classId": class_id,
            "studentNumber": student_no,
            "sortOrder": sort_order
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        _ => None,
    }
}
