use crate::config::EngineConfig;
use crate::db;
use crate::fees;
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::helpers::{db_conn, db_conn_mut};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
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

    match db::open_db(&path) {
        Ok(conn) => {
            let config = match EngineConfig::load(&conn) {
                Ok(c) => c,
                Err(e) => return engine_err(&req.id, e),
            };
            tracing::info!(workspace = %path.display(), "workspace opened");
            state.workspace = Some(path.clone());
            state.config = config;
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "workspacePath": path.to_string_lossy(),
                    "settings": config.to_json(),
                }),
            )
        }
        Err(e) => {
            tracing::warn!(workspace = %path.display(), error = %e, "workspace open failed");
            err(&req.id, "db_open_failed", format!("{e:?}"), None)
        }
    }
}

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(resp) = db_conn(state, req) {
        return resp;
    }
    ok(&req.id, state.config.to_json())
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(resp) = db_conn(state, req) {
        return resp;
    }
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };
    let previous = state.config;
    let mut next = previous;
    if let Err(e) = next.apply_patch(patch) {
        return engine_err(&req.id, e);
    }
    let conn = match db_conn_mut(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(e) = fees::save_config(conn, &previous, &next) {
        return engine_err(&req.id, e);
    }
    state.config = next;
    ok(&req.id, next.to_json())
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req)),
        _ => None,
    }
}
