use crate::auth::Session;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store;
use serde_json::json;
use tracing::{info, warn};

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let username = match get_required_str(&req.params, "username") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(password) = req.params.get("password").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing password", None);
    };

    let user = match store::verify_login(conn, &username, password) {
        Ok(Some(u)) => u,
        Ok(None) => {
            warn!(username = %username, "login rejected");
            return err(
                &req.id,
                "unauthenticated",
                "invalid username or password",
                None,
            );
        }
        Err(e) => return HandlerErr::from(e).response(&req.id),
    };

    info!(user_id = %user.id, role = user.role.as_str(), "session started");
    state.session = Some(Session {
        user_id: user.id.clone(),
        username: user.username.clone(),
        role: user.role,
    });
    ok(&req.id, json!({ "user": user }))
}

fn handle_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(s) = state.session.take() {
        info!(user_id = %s.user_id, "session ended");
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_current(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.session.as_ref() else {
        return ok(&req.id, json!({ "user": null }));
    };
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "user": null }));
    };
    match store::get_user(conn, &session.user_id) {
        Ok(user) => ok(&req.id, json!({ "user": user })),
        Err(e) => HandlerErr::from(e).response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "session.login" => Some(handle_login(state, req)),
        "session.logout" => Some(handle_logout(state, req)),
        "session.current" => Some(handle_current(state, req)),
        _ => None,
    }
}
