use crate::auth::Session;
use crate::calc::{self, round_off, GradingPolicy};
use crate::ipc::error::ok;
use crate::ipc::handlers::setup::{self, ReportSettings};
use crate::ipc::handlers::sheets::{check_can_view, user_names, view_for};
use crate::ipc::helpers::{
    csv_quote, get_optional_str, get_required_str, require_session, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{GradeSheet, GradeSheetStatus, PanelSlot, Remark, Role};
use crate::rubric::{self, RubricItem};
use crate::store::{self, SheetFilter};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn load_settings(conn: &Connection) -> Result<(GradingPolicy, ReportSettings), HandlerErr> {
    let policy = setup::grading_policy(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let reports = setup::report_settings(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok((policy, reports))
}

fn visible_sheets(
    conn: &Connection,
    session: &Session,
    status: Option<GradeSheetStatus>,
) -> Result<Vec<GradeSheet>, HandlerErr> {
    let panel_id = match session.role {
        Role::Admin => None,
        Role::Panel => Some(session.user_id.as_str()),
    };
    Ok(store::list_sheets(conn, SheetFilter { status, panel_id })?
        .iter()
        .map(|s| view_for(session, s))
        .collect())
}

fn write_output(out_path: &str, contents: &str) -> Result<PathBuf, HandlerErr> {
    let out = PathBuf::from(out_path);
    let io_err = |e: std::io::Error| {
        HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": out_path }))
    };
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(&out, contents).map_err(io_err)?;
    Ok(out)
}

fn dashboard_summary(conn: &Connection, session: &Session) -> Result<Value, HandlerErr> {
    let (policy, settings) = load_settings(conn)?;
    let rubric = rubric::standard();
    let sheets = visible_sheets(conn, session, None)?;

    let mut by_status: HashMap<&'static str, usize> = GradeSheetStatus::ALL
        .iter()
        .map(|s| (s.as_str(), 0usize))
        .collect();
    let mut passed = 0usize;
    let mut failed = 0usize;
    let mut completed_total = 0.0;
    let mut completed_count = 0usize;
    let mut pending = Vec::new();

    for sheet in &sheets {
        *by_status.entry(sheet.status.as_str()).or_insert(0) += 1;
        match calc::classify(rubric, &policy, sheet) {
            Some(Remark::Passed) => passed += 1,
            Some(Remark::Failed) => failed += 1,
            None => {}
        }
        if sheet.status == GradeSheetStatus::Completed {
            completed_total += calc::finalize(rubric, &policy, sheet).group_final_score;
            completed_count += 1;
        }
        if let Some(slot) = sheet.slot_of(&session.user_id) {
            if !sheet.is_submitted(slot) {
                pending.push(json!({
                    "sheetId": sheet.id,
                    "groupName": sheet.group_name,
                    "slot": slot.as_str(),
                    "status": sheet.status,
                }));
            }
        }
    }

    let average = if completed_count > 0 {
        Some(round_off(
            completed_total / completed_count as f64,
            settings.decimal_places,
        ))
    } else {
        None
    };

    Ok(json!({
        "totalGroups": sheets.len(),
        "byStatus": by_status,
        "passed": passed,
        "failed": failed,
        "averageGroupFinal": average,
        "pendingAssignments": pending,
        "passingScore": policy.passing_score,
    }))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MasterlistRow {
    sheet_id: String,
    group_name: String,
    student_id: String,
    student_name: String,
    panel1_total: Option<f64>,
    panel2_total: Option<f64>,
    final_score: Option<f64>,
    group_final_score: Option<f64>,
    status: GradeSheetStatus,
    remark: Option<&'static str>,
    provisional: bool,
}

fn masterlist_rows(
    sheets: &[GradeSheet],
    policy: &GradingPolicy,
    settings: &ReportSettings,
) -> Vec<MasterlistRow> {
    let rubric = rubric::standard();
    let places = settings.decimal_places;
    let mut rows = Vec::new();
    for sheet in sheets {
        let fin = calc::finalize(rubric, policy, sheet);
        let remark = calc::classify(rubric, policy, sheet).map(Remark::as_str);
        let provisional = sheet.status != GradeSheetStatus::Completed;
        let shown = |x: f64| {
            if provisional && !settings.show_provisional {
                None
            } else {
                Some(round_off(x, places))
            }
        };
        for s in &fin.per_student {
            rows.push(MasterlistRow {
                sheet_id: sheet.id.clone(),
                group_name: sheet.group_name.clone(),
                student_id: s.student_id.clone(),
                student_name: s.name.clone(),
                panel1_total: shown(s.panel_total(PanelSlot::Panel1)),
                panel2_total: shown(s.panel_total(PanelSlot::Panel2)),
                final_score: shown(s.final_score),
                group_final_score: shown(fin.group_final_score),
                status: sheet.status,
                remark,
                provisional,
            });
        }
    }
    rows
}

fn parse_status(params: &Value) -> Result<Option<GradeSheetStatus>, HandlerErr> {
    match get_optional_str(params, "status")? {
        Some(s) if !s.is_empty() => GradeSheetStatus::parse(&s)
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", s))),
        _ => Ok(None),
    }
}

fn masterlist_get(conn: &Connection, session: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let status = parse_status(params)?;
    let (policy, settings) = load_settings(conn)?;
    let sheets = visible_sheets(conn, session, status)?;
    let rows = masterlist_rows(&sheets, &policy, &settings);
    Ok(json!({
        "rows": rows,
        "decimalPlaces": settings.decimal_places,
        "institutionName": settings.institution_name,
    }))
}

fn fmt_opt(v: Option<f64>, places: u32) -> String {
    v.map(|x| format!("{:.*}", places as usize, x))
        .unwrap_or_default()
}

fn masterlist_csv(rows: &[MasterlistRow], places: u32) -> String {
    let mut out = String::from(
        "group,student,panel1_total,panel2_total,final_score,group_final_score,status,remark\n",
    );
    for r in rows {
        let cols = [
            csv_quote(&r.group_name),
            csv_quote(&r.student_name),
            fmt_opt(r.panel1_total, places),
            fmt_opt(r.panel2_total, places),
            fmt_opt(r.final_score, places),
            fmt_opt(r.group_final_score, places),
            r.status.as_str().to_string(),
            r.remark.unwrap_or("").to_string(),
        ];
        out.push_str(&cols.join(","));
        out.push('\n');
    }
    out
}

fn masterlist_export_csv(
    conn: &Connection,
    session: &Session,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let out_path = get_required_str(params, "outPath")?;
    let status = parse_status(params)?;
    let (policy, settings) = load_settings(conn)?;
    let sheets = visible_sheets(conn, session, status)?;
    let rows = masterlist_rows(&sheets, &policy, &settings);
    let csv = masterlist_csv(&rows, settings.decimal_places);
    let out = write_output(&out_path, &csv)?;
    info!(path = %out.to_string_lossy(), rows = rows.len(), "masterlist exported");
    Ok(json!({ "ok": true, "path": out_path, "rowCount": rows.len() }))
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '\n' => out.push_str("<br>"),
            _ => out.push(ch),
        }
    }
    out
}

fn score_cell(v: Option<&f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_else(|| "&ndash;".to_string())
}

fn rubric_table(
    html: &mut String,
    title: &str,
    items: &[RubricItem],
    p1: impl Fn(&str) -> Option<f64>,
    p2: impl Fn(&str) -> Option<f64>,
) {
    let _ = write!(
        html,
        "<h3>{}</h3>\n<table>\n<tr><th>Criteria</th><th>Weight</th><th>Panel 1</th><th>Panel 2</th></tr>\n",
        html_escape(title)
    );
    for item in items {
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td class=\"num\">{}</td><td class=\"num\">{}</td><td class=\"num\">{}</td></tr>",
            html_escape(&item.criteria),
            item.weight,
            score_cell(p1(&item.id).as_ref()),
            score_cell(p2(&item.id).as_ref()),
        );
    }
    html.push_str("</table>\n");
}

fn sheet_document(
    sheet: &GradeSheet,
    policy: &GradingPolicy,
    settings: &ReportSettings,
    names: &HashMap<String, String>,
) -> String {
    let rubric = rubric::standard();
    let places = settings.decimal_places as usize;
    let fin = calc::finalize(rubric, policy, sheet);
    let remark = calc::classify(rubric, policy, sheet);
    let panel_name = |slot: PanelSlot| {
        sheet
            .panel_id(slot)
            .and_then(|id| names.get(id))
            .map(|n| html_escape(n))
            .unwrap_or_else(|| "Unassigned".to_string())
    };
    let p1 = sheet.panel1_grades.clone().unwrap_or_default();
    let p2 = sheet.panel2_grades.clone().unwrap_or_default();

    let mut html = String::new();
    html.push_str("<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Grade Sheet</title>\n");
    html.push_str(
        "<style>body{font-family:Calibri,Arial,sans-serif;font-size:11pt}\
         table{border-collapse:collapse;width:100%;margin-bottom:12pt}\
         th,td{border:1px solid #444;padding:3pt 6pt}td.num{text-align:right}</style>\n",
    );
    html.push_str("</head>\n<body>\n");
    if !settings.institution_name.is_empty() {
        let _ = writeln!(html, "<h1>{}</h1>", html_escape(&settings.institution_name));
    }
    let _ = writeln!(html, "<h2>Title Defense Grade Sheet: {}</h2>", html_escape(&sheet.group_name));
    let _ = writeln!(
        html,
        "<p>Panel 1: {}<br>Panel 2: {}<br>Status: {}</p>",
        panel_name(PanelSlot::Panel1),
        panel_name(PanelSlot::Panel2),
        sheet.status.as_str()
    );

    rubric_table(
        &mut html,
        "Title Defense",
        &rubric.title_defense,
        |id| p1.title_defense_scores.get(id).copied(),
        |id| p2.title_defense_scores.get(id).copied(),
    );
    for student in &sheet.proponents {
        let s1 = p1.individual_scores.get(&student.id);
        let s2 = p2.individual_scores.get(&student.id);
        rubric_table(
            &mut html,
            &format!("Individual Performance: {}", student.name),
            &rubric.individual,
            |id| s1.and_then(|m| m.get(id)).copied(),
            |id| s2.and_then(|m| m.get(id)).copied(),
        );
    }

    html.push_str("<h3>Results</h3>\n<table>\n<tr><th>Student</th><th>Panel 1</th><th>Panel 2</th><th>Final</th></tr>\n");
    for s in &fin.per_student {
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td class=\"num\">{:.*}</td><td class=\"num\">{:.*}</td><td class=\"num\">{:.*}</td></tr>",
            html_escape(&s.name),
            places,
            s.panel_total(PanelSlot::Panel1),
            places,
            s.panel_total(PanelSlot::Panel2),
            places,
            s.final_score,
        );
    }
    html.push_str("</table>\n");
    let _ = writeln!(
        html,
        "<p><b>Group final score:</b> {:.*}<br><b>Remark:</b> {}</p>",
        places,
        fin.group_final_score,
        remark.map(Remark::as_str).unwrap_or("Pending")
    );
    for (label, grades) in [("Panel 1", &p1), ("Panel 2", &p2)] {
        if !grades.comments.is_empty() {
            let _ = writeln!(
                html,
                "<p><b>{} comments:</b><br>{}</p>",
                label,
                html_escape(&grades.comments)
            );
        }
    }
    html.push_str("</body>\n</html>\n");
    html
}

fn reports_export_sheet_doc(
    conn: &Connection,
    session: &Session,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let sheet_id = get_required_str(params, "sheetId")?;
    let out_path = get_required_str(params, "outPath")?;
    let sheet = store::load_sheet(conn, &sheet_id)?;
    check_can_view(session, &sheet)?;
    let (policy, settings) = load_settings(conn)?;
    let doc = sheet_document(&view_for(session, &sheet), &policy, &settings, &user_names(conn)?);
    let out = write_output(&out_path, &doc)?;
    info!(sheet_id = %sheet.id, path = %out.to_string_lossy(), "grade sheet document exported");
    Ok(json!({
        "ok": true,
        "path": out_path,
        "fileName": Path::new(&out_path).file_name().map(|n| n.to_string_lossy().to_string()),
    }))
}

fn handle_dashboard_summary(state: &mut AppState, req: &Request) -> Value {
    let result = db_conn(state).and_then(|conn| {
        let session = require_session(state)?;
        dashboard_summary(conn, session)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_masterlist_get(state: &mut AppState, req: &Request) -> Value {
    let result = db_conn(state).and_then(|conn| {
        let session = require_session(state)?;
        masterlist_get(conn, session, &req.params)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_masterlist_export_csv(state: &mut AppState, req: &Request) -> Value {
    let result = db_conn(state).and_then(|conn| {
        let session = require_session(state)?;
        masterlist_export_csv(conn, session, &req.params)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_reports_export_sheet_doc(state: &mut AppState, req: &Request) -> Value {
    let result = db_conn(state).and_then(|conn| {
        let session = require_session(state)?;
        reports_export_sheet_doc(conn, session, &req.params)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "dashboard.summary" => Some(handle_dashboard_summary(state, req)),
        "masterlist.get" => Some(handle_masterlist_get(state, req)),
        "masterlist.exportCsv" => Some(handle_masterlist_export_csv(state, req)),
        "reports.exportSheetDoc" => Some(handle_reports_export_sheet_doc(state, req)),
        _ => None,
    }
}
