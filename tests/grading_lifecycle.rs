mod test_support;

use serde_json::json;
use test_support::{
    bootstrap_admin, create_panel, error_code, f64_at, login, request_err, request_ok,
    scores_at, spawn_sidecar, str_at, temp_dir,
};

fn stored_status(workspace: &std::path::Path, sheet_id: &str) -> (String, i64) {
    let conn = rusqlite::Connection::open(workspace.join("gradesheet.sqlite3")).expect("open db");
    conn.query_row(
        "SELECT status, version FROM grade_sheets WHERE id = ?",
        [sheet_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .expect("sheet row")
}

#[test]
fn two_panels_grade_submit_and_complete() {
    let workspace = temp_dir("gradesheet-grading-lifecycle");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let p1 = create_panel(&mut stdin, &mut reader, "ana", "Ana Reyes");
    let p2 = create_panel(&mut stdin, &mut reader, "ben", "Ben Cruz");
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "sheets.create",
        json!({
            "groupName": "Group Atlas",
            "proponents": ["Lia Santos", "Mo Tan"],
            "panel1Id": p1,
            "panel2Id": p2
        }),
    );
    let sheet_id = str_at(&created, "/sheet/id").to_string();
    assert_eq!(str_at(&created, "/sheet/status"), "NOT_STARTED");
    let students: Vec<String> = created["sheet"]["proponents"]
        .as_array()
        .expect("proponents")
        .iter()
        .map(|p| p["id"].as_str().expect("student id").to_string())
        .collect();
    assert_eq!(students.len(), 2);

    // Admin holds no slot.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "grading.open",
        json!({ "sheetId": sheet_id }),
    );
    assert_eq!(error_code(&e), "forbidden");

    let rubric = request_ok(&mut stdin, &mut reader, "3", "rubric.get", json!({}))["rubric"].clone();
    let (full_title, full_indiv) = scores_at(&rubric, 1.0, &students);
    let (half_title, half_indiv) = scores_at(&rubric, 0.5, &students);

    // Panel 1: comments only moves the sheet to IN_PROGRESS.
    login(&mut stdin, &mut reader, "ana");
    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grading.open",
        json!({ "sheetId": sheet_id }),
    );
    assert_eq!(str_at(&opened, "/slot"), "panel1");
    assert_eq!(opened["grades"]["submitted"], false);
    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grading.save",
        json!({ "sheetId": sheet_id, "comments": "ok" }),
    );
    assert_eq!(str_at(&saved, "/detail/sheet/status"), "IN_PROGRESS");
    assert_eq!(stored_status(&workspace, &sheet_id).0, "IN_PROGRESS");

    // Submitting before every score is filled is refused with the gaps listed.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "grading.submit",
        json!({ "sheetId": sheet_id }),
    );
    assert_eq!(error_code(&e), "incomplete_grades");
    let missing = e["details"]["missing"].as_array().expect("missing list");
    assert_eq!(missing.len(), 6 + 4 * 2);

    // Out-of-range score is rejected.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "grading.save",
        json!({ "sheetId": sheet_id, "titleDefenseScores": { "td_scope": 11 } }),
    );
    assert_eq!(error_code(&e), "bad_params");

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grading.save",
        json!({
            "sheetId": sheet_id,
            "titleDefenseScores": full_title,
            "individualScores": full_indiv
        }),
    );
    assert_eq!(f64_at(&saved, "/aggregate/titleDefenseWeighted"), 70.0);
    assert_eq!(
        f64_at(&saved, &format!("/aggregate/individualWeighted/{}", students[0])),
        30.0
    );
    assert_eq!(saved["grades"]["comments"], "ok");

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grading.submit",
        json!({ "sheetId": sheet_id }),
    );
    assert_eq!(str_at(&submitted, "/detail/sheet/status"), "PANEL_1_SUBMITTED");
    assert!(submitted["detail"]["remark"].is_null());
    assert_eq!(submitted["detail"]["provisional"], true);

    let e = request_err(
        &mut stdin,
        &mut reader,
        "10",
        "grading.save",
        json!({ "sheetId": sheet_id, "comments": "late edit" }),
    );
    assert_eq!(error_code(&e), "already_submitted");

    // Panel 2 grades half marks; final is (100 + 50) / 2.
    login(&mut stdin, &mut reader, "ben");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grading.save",
        json!({
            "sheetId": sheet_id,
            "titleDefenseScores": half_title,
            "individualScores": half_indiv
        }),
    );
    let done = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "grading.submit",
        json!({ "sheetId": sheet_id }),
    );
    assert_eq!(str_at(&done, "/detail/sheet/status"), "COMPLETED");
    assert_eq!(f64_at(&done, "/detail/groupFinalScore"), 75.0);
    assert_eq!(str_at(&done, "/detail/remark"), "Passed");
    assert_eq!(done["detail"]["provisional"], false);

    let (status, version) = stored_status(&workspace, &sheet_id);
    assert_eq!(status, "COMPLETED");
    assert!(version > 1);

    // Panel 1's submitted slot survived panel 2's writes.
    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "sheets.get",
        json!({ "sheetId": sheet_id }),
    );
    assert_eq!(detail["sheet"]["panel1Grades"]["submitted"], true);
    assert_eq!(detail["sheet"]["panel1Grades"]["comments"], "ok");
    assert_eq!(f64_at(&detail, "/students/0/panel1Total"), 100.0);
    assert_eq!(f64_at(&detail, "/students/0/panel2Total"), 50.0);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn reset_reverts_status_and_allows_regrading() {
    let workspace = temp_dir("gradesheet-grading-reset");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let p1 = create_panel(&mut stdin, &mut reader, "ana", "Ana Reyes");
    let p2 = create_panel(&mut stdin, &mut reader, "ben", "Ben Cruz");
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "sheets.create",
        json!({ "groupName": "Solo", "proponents": ["Noor"], "panel1Id": p1, "panel2Id": p2 }),
    );
    let sheet_id = str_at(&created, "/sheet/id").to_string();
    let student = str_at(&created, "/sheet/proponents/0/id").to_string();
    let rubric = request_ok(&mut stdin, &mut reader, "2", "rubric.get", json!({}))["rubric"].clone();
    let (title, indiv) = scores_at(&rubric, 1.0, &[student]);

    login(&mut stdin, &mut reader, "ben");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grading.save",
        json!({ "sheetId": sheet_id, "titleDefenseScores": title, "individualScores": indiv }),
    );
    let sub = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grading.submit",
        json!({ "sheetId": sheet_id }),
    );
    assert_eq!(str_at(&sub, "/detail/sheet/status"), "PANEL_2_SUBMITTED");

    // Only admins reset.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "sheets.resetPanel",
        json!({ "sheetId": sheet_id, "slot": "panel2" }),
    );
    assert_eq!(error_code(&e), "forbidden");

    login(&mut stdin, &mut reader, "admin");
    let reset = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "sheets.resetPanel",
        json!({ "sheetId": sheet_id, "slot": "panel2" }),
    );
    assert_eq!(str_at(&reset, "/sheet/status"), "NOT_STARTED");
    assert!(reset["sheet"]["panel2Grades"].is_null());

    login(&mut stdin, &mut reader, "ben");
    let reopened = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grading.open",
        json!({ "sheetId": sheet_id }),
    );
    assert_eq!(reopened["grades"]["submitted"], false);
    assert_eq!(
        reopened["grades"]["titleDefenseScores"]
            .as_object()
            .map(|m| m.len()),
        Some(0)
    );

    drop(stdin);
    let _ = child.wait();
}
