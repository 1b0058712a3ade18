use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, require_session};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use crate::store;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;

fn handle_notifications_poll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session = match require_session(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let since = match get_optional_str(&req.params, "since") {
        Ok(v) => v.filter(|s| !s.is_empty()),
        Err(e) => return e.response(&req.id),
    };
    // Stored timestamps compare as text, so normalize to the same layout.
    let since = match since.as_deref().map(DateTime::parse_from_rfc3339) {
        None => None,
        Some(Ok(t)) => Some(
            t.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        ),
        Some(Err(_)) => {
            return err(
                &req.id,
                "bad_params",
                "since must be an RFC 3339 timestamp",
                Some(json!({ "since": since })),
            )
        }
    };

    // Read the clock before querying so nothing written in between is skipped
    // by the next poll.
    let server_time = store::now_rfc3339();
    let panel_id = match session.role {
        Role::Admin => None,
        Role::Panel => Some(session.user_id.as_str()),
    };
    match store::poll_events(conn, since.as_deref(), panel_id) {
        Ok(page) => {
            // A cut-short batch resumes from its last event, not from now.
            let next = page
                .resume_after()
                .map(str::to_string)
                .unwrap_or(server_time);
            ok(
                &req.id,
                json!({
                    "events": page.events,
                    "hasMore": page.has_more,
                    "serverTime": next
                }),
            )
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.poll" => Some(handle_notifications_poll(state, req)),
        _ => None,
    }
}
