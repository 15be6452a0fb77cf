use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::plan::SelectionMode;
use crate::session::{self, SessionError};
use serde_json::{json, Value};
use std::sync::Arc;

fn session_err(req: &Request, e: SessionError) -> Value {
    let details = match &e {
        SessionError::EmptyBatch => Some(json!({
            "message": "No eligible students selected for promotion."
        })),
        _ => None,
    };
    err(&req.id, e.code(), e.to_string(), details)
}

fn required_str<'a>(req: &'a Request, key: &str) -> Result<&'a str, Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

async fn handle_load(state: &mut AppState, req: &Request) -> Value {
    let Some(store) = state.store.clone() else {
        return err(
            &req.id,
            "no_backend",
            "select a workspace or connect a backend first",
            None,
        );
    };
    if let Err(e) = session::load(&state.session, store.as_ref()).await {
        return session_err(req, e);
    }
    ok(&req.id, session::lock(&state.session).plan_json())
}

fn handle_plan(state: &mut AppState, req: &Request) -> Value {
    ok(&req.id, session::lock(&state.session).plan_json())
}

fn handle_mode(state: &mut AppState, req: &Request) -> Value {
    let raw = match required_str(req, "mode") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(mode) = SelectionMode::parse(raw) else {
        return err(
            &req.id,
            "bad_params",
            "mode must be one of: all, individual",
            None,
        );
    };
    let mut s = session::lock(&state.session);
    match s.set_mode(mode) {
        Ok(()) => ok(&req.id, json!({ "mode": s.mode })),
        Err(e) => session_err(req, e),
    }
}

fn handle_toggle(state: &mut AppState, req: &Request) -> Value {
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let mut s = session::lock(&state.session);
    match s.toggle(student_id) {
        Ok(t) => ok(
            &req.id,
            json!({
                "studentId": student_id,
                "eligible": t.eligible,
                "selected": t.selected,
                "selectedCount": s.selected.len(),
            }),
        ),
        Err(e) => session_err(req, e),
    }
}

fn handle_select_class(state: &mut AppState, req: &Request) -> Value {
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let selected = req
        .params
        .get("selected")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let mut s = session::lock(&state.session);
    match s.set_class_selected(class_id, selected) {
        Ok(changed) => ok(
            &req.id,
            json!({ "changed": changed, "selectedCount": s.selected.len() }),
        ),
        Err(e) => session_err(req, e),
    }
}

fn handle_clear_selection(state: &mut AppState, req: &Request) -> Value {
    match session::lock(&state.session).clear_selection() {
        Ok(()) => ok(&req.id, json!({ "selectedCount": 0 })),
        Err(e) => session_err(req, e),
    }
}

fn handle_preview(state: &mut AppState, req: &Request) -> Value {
    let s = session::lock(&state.session);
    match s.commands() {
        Ok(commands) => ok(
            &req.id,
            json!({
                "mode": s.mode,
                "commandCount": commands.len(),
                "commands": commands,
            }),
        ),
        Err(e) => session_err(req, e),
    }
}

fn handle_start(state: &mut AppState, req: &Request) -> Value {
    let Some(store) = state.store.clone() else {
        return err(
            &req.id,
            "no_backend",
            "select a workspace or connect a backend first",
            None,
        );
    };

    let history = state.db.clone();
    let started = session::start(&state.session, store, &state.config, move |result| {
        let Some(db) = history else {
            return;
        };
        let conn = db.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = db::record_run(&conn, result) {
            tracing::warn!(run_id = %result.run_id, error = %e, "could not record promotion run");
        }
    });

    match started {
        Ok(run) => {
            state.tasks.retain(|h| !h.is_finished());
            state.tasks.push(run.handle);
            ok(
                &req.id,
                json!({ "runId": run.run_id, "commandCount": run.command_count }),
            )
        }
        Err(e) => session_err(req, e),
    }
}

fn handle_status(state: &mut AppState, req: &Request) -> Value {
    ok(&req.id, session::lock(&state.session).status_json())
}

fn handle_cancel(state: &mut AppState, req: &Request) -> Value {
    let cancelled = session::lock(&state.session).cancel();
    ok(&req.id, json!({ "cancelled": cancelled }))
}

fn handle_history(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.conn() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let limit = match req.params.get("limit") {
        None | Some(Value::Null) => 20,
        Some(v) => match v.as_i64() {
            Some(n) if (1..=500).contains(&n) => n,
            _ => return err(&req.id, "bad_params", "limit must be in 1..=500", None),
        },
    };
    match db::list_runs(&conn, limit) {
        Ok(runs) => ok(&req.id, json!({ "runs": runs })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub async fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "promotion.load" => handle_load(state, req).await,
        "promotion.plan" => handle_plan(state, req),
        "promotion.mode" => handle_mode(state, req),
        "promotion.toggle" => handle_toggle(state, req),
        "promotion.selectClass" => handle_select_class(state, req),
        "promotion.clearSelection" => handle_clear_selection(state, req),
        "promotion.preview" => handle_preview(state, req),
        "promotion.start" => handle_start(state, req),
        "promotion.status" => handle_status(state, req),
        "promotion.cancel" => handle_cancel(state, req),
        "promotion.history" => handle_history(state, req),
        _ => return None,
    };
    Some(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassRef, PromotionRuleTable, PromotionRules, Student};
    use crate::testing::MockStore;
    use pretty_assertions::assert_eq;

    fn request(method: &str, params: Value) -> Request {
        Request {
            id: "1".into(),
            method: method.into(),
            params,
        }
    }

    fn state_with_mock() -> AppState {
        let rules: PromotionRuleTable = [("Grade 1".to_string(), "Grade 2".to_string())]
            .into_iter()
            .collect();
        let store = MockStore::new(
            vec![
                ClassRef::new("c1", "Grade 1", ""),
                ClassRef::new("c2", "Grade 2", ""),
            ],
            vec![Student {
                id: "s1".into(),
                student_number: "001".into(),
                first_name: "Ann".into(),
                last_name: "Lee".into(),
                class_id: Some("c1".into()),
            }],
            PromotionRules::from_table(rules),
        );
        let mut state = AppState::new();
        state.store = Some(Arc::new(store));
        state
    }

    #[tokio::test]
    async fn load_without_backend_is_rejected() {
        let mut state = AppState::new();
        let resp = try_handle(&mut state, &request("promotion.load", Value::Null))
            .await
            .expect("handled");
        assert_eq!(resp["error"]["code"], "no_backend");
    }

    #[tokio::test]
    async fn preview_before_load_needs_a_plan() {
        let mut state = state_with_mock();
        let resp = try_handle(&mut state, &request("promotion.preview", Value::Null))
            .await
            .expect("handled");
        assert_eq!(resp["error"]["code"], "no_plan");
    }

    #[tokio::test]
    async fn load_then_preview_lists_commands() {
        let mut state = state_with_mock();
        let loaded = try_handle(&mut state, &request("promotion.load", Value::Null))
            .await
            .expect("handled");
        assert_eq!(loaded["ok"], true);
        assert_eq!(loaded["result"]["eligibleStudentCount"], 1);

        let resp = try_handle(&mut state, &request("promotion.preview", Value::Null))
            .await
            .expect("handled");
        assert_eq!(resp["result"]["commandCount"], 1);
        assert_eq!(resp["result"]["commands"][0]["toClassId"], "c2");
    }

    #[tokio::test]
    async fn bad_mode_is_bad_params() {
        let mut state = state_with_mock();
        let resp = try_handle(
            &mut state,
            &request("promotion.mode", json!({ "mode": "some" })),
        )
        .await
        .expect("handled");
        assert_eq!(resp["error"]["code"], "bad_params");
    }

    #[tokio::test]
    async fn unknown_methods_fall_through() {
        let mut state = state_with_mock();
        assert!(try_handle(&mut state, &request("classes.list", Value::Null))
            .await
            .is_none());
    }
}
