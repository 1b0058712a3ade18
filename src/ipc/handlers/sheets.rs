use crate::auth::Session;
use crate::calc::{self, round_off, GradingPolicy};
use crate::ipc::error::ok;
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    get_nullable_str, get_optional_i64, get_optional_str, get_required_str, require_admin,
    require_session, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{GradeSheet, GradeSheetStatus, PanelSlot, Role};
use crate::rubric;
use crate::store::{self, NewSheet, ProponentInput, SheetFilter, SheetPatch};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;
use tracing::info;

const MAX_GROUP_NAME_LEN: usize = 200;
const MAX_PROPONENTS: usize = 12;

fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn policy(conn: &Connection) -> Result<GradingPolicy, HandlerErr> {
    setup::grading_policy(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

pub fn decimal_places(conn: &Connection) -> u32 {
    setup::report_settings(conn)
        .map(|r| r.decimal_places)
        .unwrap_or(2)
}

pub fn user_names(conn: &Connection) -> Result<HashMap<String, String>, HandlerErr> {
    Ok(store::list_users(conn)?
        .into_iter()
        .map(|u| (u.id, u.display_name))
        .collect())
}

/// Sheet as sent to clients: the stored document plus derived scores.
pub fn sheet_json(
    sheet: &GradeSheet,
    policy: &GradingPolicy,
    names: &HashMap<String, String>,
    places: u32,
) -> serde_json::Value {
    let rubric = rubric::standard();
    let fin = calc::finalize(rubric, policy, sheet);
    let remark = calc::classify(rubric, policy, sheet);
    let per_student: Vec<serde_json::Value> = fin
        .per_student
        .iter()
        .map(|s| {
            json!({
                "studentId": s.student_id,
                "name": s.name,
                "panel1Total": round_off(s.panel_total(PanelSlot::Panel1), places),
                "panel2Total": round_off(s.panel_total(PanelSlot::Panel2), places),
                "finalScore": round_off(s.final_score, places),
            })
        })
        .collect();
    let name_of = |id: Option<&str>| id.and_then(|i| names.get(i)).cloned();
    json!({
        "sheet": sheet,
        "panel1Name": name_of(sheet.panel1_id.as_deref()),
        "panel2Name": name_of(sheet.panel2_id.as_deref()),
        "students": per_student,
        "groupFinalScore": round_off(fin.group_final_score, places),
        "remark": remark.map(|r| r.as_str()),
        "provisional": sheet.status != GradeSheetStatus::Completed,
    })
}

/// The sheet as `session` may see it. Panel users never see the other
/// evaluator's draft.
pub fn view_for(session: &Session, sheet: &GradeSheet) -> GradeSheet {
    match (session.role, sheet.slot_of(&session.user_id)) {
        (Role::Panel, Some(slot)) => sheet.redacted_for(slot),
        _ => sheet.clone(),
    }
}

/// Panel users may only see sheets they hold a slot on.
pub fn check_can_view(session: &Session, sheet: &GradeSheet) -> Result<(), HandlerErr> {
    if session.role == Role::Admin || sheet.slot_of(&session.user_id).is_some() {
        return Ok(());
    }
    Err(HandlerErr::new("forbidden", "you are not assigned to this group")
        .with_details(json!({ "sheetId": sheet.id })))
}

fn parse_status_filter(params: &serde_json::Value) -> Result<Option<GradeSheetStatus>, HandlerErr> {
    match get_optional_str(params, "status")? {
        Some(s) if !s.is_empty() => GradeSheetStatus::parse(&s)
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", s))),
        _ => Ok(None),
    }
}

fn check_group_name(name: &str) -> Result<(), HandlerErr> {
    if name.len() > MAX_GROUP_NAME_LEN {
        return Err(HandlerErr::bad_params(format!(
            "groupName length must be <= {}",
            MAX_GROUP_NAME_LEN
        )));
    }
    Ok(())
}

fn parse_proponent_names(params: &serde_json::Value) -> Result<Vec<String>, HandlerErr> {
    let Some(arr) = params.get("proponents").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("proponents must be an array"));
    };
    let mut names = Vec::with_capacity(arr.len());
    for v in arr {
        let name = v
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerErr::bad_params("proponent names must be non-empty strings"))?;
        names.push(name.to_string());
    }
    if names.len() > MAX_PROPONENTS {
        return Err(HandlerErr::bad_params(format!(
            "a group may have at most {} proponents",
            MAX_PROPONENTS
        )));
    }
    Ok(names)
}

fn parse_proponent_inputs(v: &serde_json::Value) -> Result<Vec<ProponentInput>, HandlerErr> {
    let Some(arr) = v.as_array() else {
        return Err(HandlerErr::bad_params("proponents must be an array"));
    };
    if arr.len() > MAX_PROPONENTS {
        return Err(HandlerErr::bad_params(format!(
            "a group may have at most {} proponents",
            MAX_PROPONENTS
        )));
    }
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        // Bare strings are new students.
        if let Some(name) = item.as_str() {
            out.push(ProponentInput {
                id: None,
                name: name.trim().to_string(),
            });
            continue;
        }
        let name = item
            .get("name")
            .and_then(|n| n.as_str())
            .map(str::trim)
            .unwrap_or("");
        let id = item
            .get("id")
            .and_then(|n| n.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        out.push(ProponentInput {
            id,
            name: name.to_string(),
        });
    }
    if out.iter().any(|p| p.name.is_empty()) {
        return Err(HandlerErr::bad_params("proponent names must be non-empty"));
    }
    Ok(out)
}

fn sheets_list(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let status = parse_status_filter(params)?;
    let panel_id = match session.role {
        Role::Admin => None,
        Role::Panel => Some(session.user_id.as_str()),
    };
    let sheets = store::list_sheets(conn, SheetFilter { status, panel_id })?;
    let policy = policy(conn)?;
    let places = decimal_places(conn);
    let names = user_names(conn)?;
    let rows: Vec<serde_json::Value> = sheets
        .iter()
        .map(|s| {
            let mut row = sheet_json(&view_for(session, s), &policy, &names, places);
            if let Some(slot) = s.slot_of(&session.user_id) {
                row["mySlot"] = json!(slot.as_str());
            }
            row
        })
        .collect();
    Ok(json!({ "sheets": rows }))
}

fn sheets_get(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let sheet_id = get_required_str(params, "sheetId")?;
    let sheet = store::load_sheet(conn, &sheet_id)?;
    check_can_view(session, &sheet)?;
    let places = decimal_places(conn);
    Ok(sheet_json(&view_for(session, &sheet), &policy(conn)?, &user_names(conn)?, places))
}

fn sheets_create(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let group_name = get_required_str(params, "groupName")?;
    check_group_name(&group_name)?;
    let proponents = parse_proponent_names(params)?;
    let panel1_id = get_optional_str(params, "panel1Id")?.filter(|s| !s.is_empty());
    let panel2_id = get_optional_str(params, "panel2Id")?.filter(|s| !s.is_empty());

    let sheet = store::insert_sheet(
        conn,
        NewSheet {
            group_name,
            proponents,
            panel1_id,
            panel2_id,
        },
        Some(&session.user_id),
    )?;
    Ok(sheet_json(&sheet, &policy(conn)?, &user_names(conn)?, decimal_places(conn)))
}

fn sheets_update(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let sheet_id = get_required_str(params, "sheetId")?;
    let group_name = match get_optional_str(params, "groupName")? {
        Some(n) if n.is_empty() => return Err(HandlerErr::bad_params("groupName must not be empty")),
        Some(n) => {
            check_group_name(&n)?;
            Some(n)
        }
        None => None,
    };
    let proponents = match params.get("proponents") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => Some(parse_proponent_inputs(v)?),
    };
    let patch = SheetPatch {
        group_name,
        proponents,
        panel1_id: get_nullable_str(params, "panel1Id")?,
        panel2_id: get_nullable_str(params, "panel2Id")?,
        expected_version: get_optional_i64(params, "expectedVersion")?,
    };

    let sheet = store::update_sheet(conn, &sheet_id, patch, Some(&session.user_id))?;
    info!(sheet_id = %sheet.id, version = sheet.version, "grade sheet updated");
    Ok(sheet_json(&sheet, &policy(conn)?, &user_names(conn)?, decimal_places(conn)))
}

fn sheets_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let sheet_id = get_required_str(params, "sheetId")?;
    store::delete_sheet(conn, &sheet_id)?;
    Ok(json!({ "ok": true }))
}

fn sheets_reset_panel(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let sheet_id = get_required_str(params, "sheetId")?;
    let slot_raw = get_required_str(params, "slot")?;
    let slot = PanelSlot::parse(&slot_raw)
        .ok_or_else(|| HandlerErr::bad_params("slot must be panel1 or panel2"))?;
    let sheet = store::reset_panel(conn, &sheet_id, slot, Some(&session.user_id))?;
    Ok(sheet_json(&sheet, &policy(conn)?, &user_names(conn)?, decimal_places(conn)))
}

fn handle_sheets_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = db_conn(state).and_then(|conn| {
        let session = require_session(state)?;
        sheets_list(conn, session, &req.params)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_sheets_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = db_conn(state).and_then(|conn| {
        let session = require_session(state)?;
        sheets_get(conn, session, &req.params)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_sheets_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = db_conn(state).and_then(|conn| {
        let session = require_admin(state)?;
        sheets_create(conn, session, &req.params)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_sheets_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = db_conn(state).and_then(|conn| {
        let session = require_admin(state)?;
        sheets_update(conn, session, &req.params)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_sheets_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = db_conn(state).and_then(|conn| {
        require_admin(state)?;
        sheets_delete(conn, &req.params)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_sheets_reset_panel(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = db_conn(state).and_then(|conn| {
        let session = require_admin(state)?;
        sheets_reset_panel(conn, session, &req.params)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sheets.list" => Some(handle_sheets_list(state, req)),
        "sheets.get" => Some(handle_sheets_get(state, req)),
        "sheets.create" => Some(handle_sheets_create(state, req)),
        "sheets.update" => Some(handle_sheets_update(state, req)),
        "sheets.delete" => Some(handle_sheets_delete(state, req)),
        "sheets.resetPanel" => Some(handle_sheets_reset_panel(state, req)),
        _ => None,
    }
}
