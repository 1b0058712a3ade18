use crate::auth::Session;
use crate::calc::{self, round_off, GradingPolicy};
use crate::ipc::error::ok;
use crate::ipc::handlers::setup;
use crate::ipc::handlers::sheets::{decimal_places, sheet_json, user_names};
use crate::ipc::helpers::{get_optional_i64, get_required_str, require_session, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::{GradeSheet, PanelGrades, PanelSlot};
use crate::rubric::{self, Rubric};
use crate::store::{self, StoreError};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::info;

const MAX_COMMENTS_LEN: usize = 4000;

type ScoreMap = BTreeMap<String, f64>;

fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn policy(conn: &Connection) -> Result<GradingPolicy, HandlerErr> {
    setup::grading_policy(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

/// The slot the caller evaluates on this sheet; admins hold none.
fn caller_slot(session: &Session, sheet: &GradeSheet) -> Result<PanelSlot, HandlerErr> {
    sheet.slot_of(&session.user_id).ok_or_else(|| {
        HandlerErr::new("forbidden", "you are not a panel on this group")
            .with_details(json!({ "sheetId": sheet.id }))
    })
}

fn parse_score(v: &Value, key: &str, max: f64) -> Result<f64, HandlerErr> {
    let n = v
        .as_f64()
        .filter(|n| n.is_finite())
        .ok_or_else(|| HandlerErr::bad_params(format!("score {} must be a number", key)))?;
    if !(0.0..=max).contains(&n) {
        return Err(HandlerErr::bad_params(format!(
            "score {} must be in 0..={}",
            key, max
        ))
        .with_details(json!({ "item": key, "value": n, "max": max })));
    }
    Ok(n)
}

fn parse_item_scores(
    v: &Value,
    field: &str,
    lookup: impl Fn(&str) -> Option<f64>,
) -> Result<ScoreMap, HandlerErr> {
    let Some(obj) = v.as_object() else {
        return Err(HandlerErr::bad_params(format!("{} must be an object", field)));
    };
    let mut out = ScoreMap::new();
    for (item_id, raw) in obj {
        // Null clears a single item.
        if raw.is_null() {
            continue;
        }
        let Some(weight) = lookup(item_id) else {
            return Err(HandlerErr::bad_params(format!("unknown rubric item: {}", item_id))
                .with_details(json!({ "field": field, "item": item_id })));
        };
        out.insert(item_id.clone(), parse_score(raw, item_id, weight)?);
    }
    Ok(out)
}

fn parse_title_scores(rubric: &Rubric, v: &Value) -> Result<ScoreMap, HandlerErr> {
    parse_item_scores(v, "titleDefenseScores", |id| {
        rubric.title_item(id).map(|i| i.weight)
    })
}

fn parse_individual_scores(
    rubric: &Rubric,
    v: &Value,
) -> Result<BTreeMap<String, ScoreMap>, HandlerErr> {
    let Some(obj) = v.as_object() else {
        return Err(HandlerErr::bad_params("individualScores must be an object"));
    };
    let mut out = BTreeMap::new();
    for (student_id, scores) in obj {
        let parsed = parse_item_scores(scores, "individualScores", |id| {
            rubric.individual_item(id).map(|i| i.weight)
        })?;
        out.insert(student_id.clone(), parsed);
    }
    Ok(out)
}

fn aggregate_json(rubric: &Rubric, policy: &GradingPolicy, sheet: &GradeSheet, slot: PanelSlot, places: u32) -> Value {
    let agg = calc::aggregate(rubric, policy, sheet.grades(slot), &sheet.proponents);
    let individual: BTreeMap<&String, f64> = agg
        .individual_weighted
        .iter()
        .map(|(k, v)| (k, round_off(*v, places)))
        .collect();
    json!({
        "titleDefenseWeighted": round_off(agg.title_defense_weighted, places),
        "individualWeighted": individual,
    })
}

fn rubric_get(conn: &Connection) -> Result<Value, HandlerErr> {
    Ok(json!({
        "rubric": rubric::standard(),
        "policy": policy(conn)?,
    }))
}

fn grading_view(
    conn: &Connection,
    sheet: &GradeSheet,
    slot: PanelSlot,
) -> Result<Value, HandlerErr> {
    let rubric = rubric::standard();
    let policy = policy(conn)?;
    let places = decimal_places(conn);
    let grades = sheet.grades(slot).cloned().unwrap_or_default();
    Ok(json!({
        "slot": slot.as_str(),
        "version": sheet.version,
        "grades": grades,
        "aggregate": aggregate_json(rubric, &policy, sheet, slot, places),
        "missing": calc::missing_scores(rubric, Some(&grades), &sheet.proponents),
        "detail": sheet_json(&sheet.redacted_for(slot), &policy, &user_names(conn)?, places),
    }))
}

fn grading_open(conn: &Connection, session: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let sheet_id = get_required_str(params, "sheetId")?;
    let sheet = store::load_sheet(conn, &sheet_id)?;
    let slot = caller_slot(session, &sheet)?;
    grading_view(conn, &sheet, slot)
}

struct GradeEdit {
    title_defense_scores: Option<ScoreMap>,
    individual_scores: Option<BTreeMap<String, ScoreMap>>,
    comments: Option<String>,
}

fn parse_grade_edit(rubric: &Rubric, params: &Value) -> Result<GradeEdit, HandlerErr> {
    let title_defense_scores = match params.get("titleDefenseScores") {
        None | Some(Value::Null) => None,
        Some(v) => Some(parse_title_scores(rubric, v)?),
    };
    let individual_scores = match params.get("individualScores") {
        None | Some(Value::Null) => None,
        Some(v) => Some(parse_individual_scores(rubric, v)?),
    };
    let comments = match params.get("comments") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.len() <= MAX_COMMENTS_LEN => Some(s.trim().to_string()),
        Some(Value::String(_)) => {
            return Err(HandlerErr::bad_params(format!(
                "comments length must be <= {}",
                MAX_COMMENTS_LEN
            )))
        }
        Some(_) => return Err(HandlerErr::bad_params("comments must be a string")),
    };
    Ok(GradeEdit {
        title_defense_scores,
        individual_scores,
        comments,
    })
}

fn apply_edit(sheet: &GradeSheet, mut grades: PanelGrades, edit: GradeEdit) -> Result<PanelGrades, StoreError> {
    if let Some(scores) = edit.title_defense_scores {
        grades.title_defense_scores = scores;
    }
    if let Some(by_student) = edit.individual_scores {
        if let Some(unknown) = by_student
            .keys()
            .find(|sid| !sheet.proponents.iter().any(|p| &p.id == *sid))
        {
            return Err(StoreError::Invalid(format!(
                "unknown proponent: {}",
                unknown
            )));
        }
        grades.individual_scores = by_student;
    }
    if let Some(comments) = edit.comments {
        grades.comments = comments;
    }
    grades.submitted = false;
    Ok(grades)
}

fn grading_save(conn: &Connection, session: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let sheet_id = get_required_str(params, "sheetId")?;
    let expected_version = get_optional_i64(params, "expectedVersion")?;
    let edit = parse_grade_edit(rubric::standard(), params)?;

    let current = store::load_sheet(conn, &sheet_id)?;
    let slot = caller_slot(session, &current)?;

    let sheet = store::update_panel_grades(
        conn,
        &sheet_id,
        slot,
        expected_version,
        Some(&session.user_id),
        |fresh, grades| {
            // Reassigned between the two reads.
            if fresh.slot_of(&session.user_id) != Some(slot) {
                return Err(StoreError::SlotLocked(
                    "panel assignment changed; reopen the sheet".to_string(),
                ));
            }
            apply_edit(fresh, grades, edit)
        },
    )?;
    grading_view(conn, &sheet, slot)
}

fn grading_submit(conn: &Connection, session: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let sheet_id = get_required_str(params, "sheetId")?;
    let expected_version = get_optional_i64(params, "expectedVersion")?;

    let current = store::load_sheet(conn, &sheet_id)?;
    let slot = caller_slot(session, &current)?;
    let rubric = rubric::standard();

    let sheet = store::update_panel_grades(
        conn,
        &sheet_id,
        slot,
        expected_version,
        Some(&session.user_id),
        |fresh, mut grades| {
            if fresh.slot_of(&session.user_id) != Some(slot) {
                return Err(StoreError::SlotLocked(
                    "panel assignment changed; reopen the sheet".to_string(),
                ));
            }
            let missing = calc::missing_scores(rubric, Some(&grades), &fresh.proponents);
            if !missing.is_empty() {
                return Err(StoreError::Incomplete(missing));
            }
            grades.submitted = true;
            Ok(grades)
        },
    )?;
    info!(
        sheet_id = %sheet.id,
        slot = slot.as_str(),
        status = sheet.status.as_str(),
        "panel grades submitted"
    );
    grading_view(conn, &sheet, slot)
}

fn handle_rubric_get(state: &mut AppState, req: &Request) -> Value {
    let result = db_conn(state).and_then(|conn| {
        require_session(state)?;
        rubric_get(conn)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_grading_open(state: &mut AppState, req: &Request) -> Value {
    let result = db_conn(state).and_then(|conn| {
        let session = require_session(state)?;
        grading_open(conn, session, &req.params)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_grading_save(state: &mut AppState, req: &Request) -> Value {
    let result = db_conn(state).and_then(|conn| {
        let session = require_session(state)?;
        grading_save(conn, session, &req.params)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_grading_submit(state: &mut AppState, req: &Request) -> Value {
    let result = db_conn(state).and_then(|conn| {
        let session = require_session(state)?;
        grading_submit(conn, session, &req.params)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "rubric.get" => Some(handle_rubric_get(state, req)),
        "grading.open" => Some(handle_grading_open(state, req)),
        "grading.save" => Some(handle_grading_save(state, req)),
        "grading.submit" => Some(handle_grading_submit(state, req)),
        _ => None,
    }
}
