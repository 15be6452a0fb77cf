use crate::config::PromotionConfig;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::session;
use serde_json::json;

#[derive(Clone, Copy)]
enum SetupSection {
    Promotion,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "promotion" => Some(Self::Promotion),
            _ => None,
        }
    }
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    // Without a workspace the settings only live for this process.
    let loaded = state.conn().map(|conn| PromotionConfig::load(&conn));
    match loaded {
        Some(Ok(cfg)) => state.config = cfg,
        Some(Err(e)) => return err(&req.id, "db_query_failed", e.to_string(), None),
        None => {}
    }
    ok(
        &req.id,
        json!({
            "promotion": state.config.to_json(),
            "persisted": state.db.is_some(),
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(SetupSection::Promotion) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    // A running batch keeps the settings it started with.
    if session::lock(&state.session).running {
        return err(
            &req.id,
            "promotion_running",
            "settings cannot change while a promotion batch is running",
            None,
        );
    }

    let mut next = state.config.clone();
    if let Err(msg) = next.merge_patch(patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Some(conn) = state.conn() {
        if let Err(e) = next.save(&conn) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    state.config = next;
    ok(&req.id, json!({ "promotion": state.config.to_json() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
