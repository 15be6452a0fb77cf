use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::COMPLETED_SENTINEL;
use crate::store::workspace;
use rusqlite::OptionalExtension;
use serde_json::json;

fn handle_rules_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.conn() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match workspace::load_rules(&conn) {
        Ok(rules) => ok(
            &req.id,
            json!({ "rules": rules.named, "links": rules.linked }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_rules_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.conn() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    // Keys and successors are stored exactly as typed; matching tolerates the rest.
    let class_key = match req.params.get("classKey").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing classKey", None),
    };
    let next_class = match req.params.get("nextClass").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => return err(&req.id, "bad_params", "missing nextClass", None),
    };

    if let Err(e) = conn.execute(
        "INSERT INTO promotion_rules(class_key, next_class) VALUES(?, ?)
         ON CONFLICT(class_key) DO UPDATE SET next_class = excluded.next_class",
        (&class_key, &next_class),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "promotion_rules" })),
        );
    }
    ok(
        &req.id,
        json!({
            "classKey": class_key,
            "nextClass": next_class,
            "terminal": next_class == COMPLETED_SENTINEL,
        }),
    )
}

fn handle_rules_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.conn() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(class_key) = req.params.get("classKey").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing classKey", None);
    };
    match conn.execute(
        "DELETE FROM promotion_rules WHERE class_key = ?",
        [class_key],
    ) {
        Ok(0) => err(&req.id, "not_found", "rule not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn class_exists(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<bool> {
    let hit: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [id], |r| r.get(0))
        .optional()?;
    Ok(hit.is_some())
}

fn handle_rules_link(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.conn() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(from_class_id) = req.params.get("fromClassId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing fromClassId", None);
    };
    let to_class_id = req
        .params
        .get("toClassId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty());
    let is_final = req
        .params
        .get("isFinalClass")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !is_final && to_class_id.is_none() {
        return err(
            &req.id,
            "bad_params",
            "toClassId is required unless isFinalClass is true",
            None,
        );
    }
    let to_class_id = if is_final { None } else { to_class_id };

    for id in std::iter::once(from_class_id).chain(to_class_id) {
        match class_exists(&conn, id) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    "class not found",
                    Some(json!({ "classId": id })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    if let Err(e) = conn.execute(
        "INSERT INTO promotion_links(from_class_id, to_class_id, is_final_class) VALUES(?, ?, ?)
         ON CONFLICT(from_class_id) DO UPDATE SET
           to_class_id = excluded.to_class_id,
           is_final_class = excluded.is_final_class",
        (from_class_id, to_class_id, i64::from(is_final)),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "promotion_links" })),
        );
    }
    ok(
        &req.id,
        json!({
            "fromClassId": from_class_id,
            "toClassId": to_class_id,
            "isFinalClass": is_final,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "rules.list" => Some(handle_rules_list(state, req)),
        "rules.set" => Some(handle_rules_set(state, req)),
        "rules.delete" => Some(handle_rules_delete(state, req)),
        "rules.link" => Some(handle_rules_link(state, req)),
        _ => None,
    }
}
