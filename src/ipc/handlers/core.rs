use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store;
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "loggedIn": state.session.is_some()
        }),
    )
}

/// Open (or create) the workspace database and report whether it still
/// needs its first administrator.
pub fn open_workspace(state: &mut AppState, path: PathBuf) -> anyhow::Result<bool> {
    let conn = db::open_db(&path)?;
    let needs_bootstrap = store::count_users(&conn)? == 0;
    state.session = None;
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    info!(workspace = %path.to_string_lossy(), needs_bootstrap, "workspace opened");
    Ok(needs_bootstrap)
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

    match open_workspace(state, path.clone()) {
        Ok(needs_bootstrap) => ok(
            &req.id,
            json!({
                "workspacePath": path.to_string_lossy(),
                "needsBootstrap": needs_bootstrap
            }),
        ),
        Err(e) => {
            warn!(workspace = %path.to_string_lossy(), error = %e, "workspace open failed");
            err(&req.id, "db_open_failed", format!("{e:?}"), None)
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
