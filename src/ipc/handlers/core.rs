use crate::config::PromotionConfig;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::session::{self, SessionError};
use crate::store::{HttpStore, HttpStoreConfig, WorkspaceStore};
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "backend": state.store.as_ref().map(|s| s.kind()),
        }),
    )
}

/// Switching backends throws away whatever the previous one delivered.
fn reset_session(state: &AppState) -> Result<(), SessionError> {
    session::lock(&state.session).reset()
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    if let Err(e) = session::lock(&state.session).ensure_idle() {
        return err(&req.id, e.code(), e.to_string(), None);
    }

    match db::open_db(&path) {
        Ok(conn) => {
            if let Err(e) = reset_session(state) {
                return err(&req.id, e.code(), e.to_string(), None);
            }
            // Saved settings are best-effort; a broken row must not keep the workspace closed.
            state.config = PromotionConfig::load(&conn).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "could not read promotion settings; using defaults");
                PromotionConfig::default()
            });
            let conn = Arc::new(Mutex::new(conn));
            state.store = Some(Arc::new(WorkspaceStore::new(Arc::clone(&conn))));
            state.db = Some(conn);
            state.workspace = Some(path.clone());
            info!(workspace = %path.display(), "workspace selected");
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn handle_backend_connect(state: &mut AppState, req: &Request) -> serde_json::Value {
    let base_url = match req.params.get("baseUrl").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing baseUrl", None),
    };
    let token = req
        .params
        .get("token")
        .and_then(|v| v.as_str())
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    let timeout_ms = match req.params.get("timeoutMs") {
        None | Some(serde_json::Value::Null) => state.config.request_timeout_ms,
        Some(v) => match v.as_u64() {
            Some(n) if n > 0 => n,
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "timeoutMs must be a positive integer",
                    None,
                )
            }
        },
    };

    let store = match HttpStore::new(HttpStoreConfig {
        base_url,
        token,
        timeout_ms,
    }) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "backend_failed", e.to_string(), None),
    };
    if let Err(e) = reset_session(state) {
        return err(&req.id, e.code(), e.to_string(), None);
    }
    info!(base_url = %store.base_url(), "remote backend connected");
    let url = store.base_url().to_string();
    state.store = Some(Arc::new(store));
    ok(&req.id, json!({ "backend": "http", "baseUrl": url }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "backend.connect" => Some(handle_backend_connect(state, req)),
        _ => None,
    }
}
