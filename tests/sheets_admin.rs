mod test_support;

use serde_json::json;
use test_support::{
    bootstrap_admin, create_panel, error_code, login, request_err, request_ok, scores_at,
    spawn_sidecar, str_at, temp_dir,
};

#[test]
fn create_validates_panels_and_lists_by_status() {
    let workspace = temp_dir("gradesheet-sheets-create");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let ana = create_panel(&mut stdin, &mut reader, "ana", "Ana Reyes");
    let ben = create_panel(&mut stdin, &mut reader, "ben", "Ben Cruz");

    let e = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "sheets.create",
        json!({ "groupName": "Twice", "proponents": ["Ria"], "panel1Id": ana, "panel2Id": ana }),
    );
    assert_eq!(error_code(&e), "panel_conflict");

    let e = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "sheets.create",
        json!({ "groupName": "Ghost", "proponents": ["Ria"], "panel1Id": "no-such-user" }),
    );
    assert_eq!(error_code(&e), "not_found");

    let e = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "sheets.create",
        json!({ "groupName": "  ", "proponents": ["Ria"] }),
    );
    assert_eq!(error_code(&e), "bad_params");

    let made = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "sheets.create",
        json!({ "groupName": "Alpha", "proponents": ["Ria", "Sol"], "panel1Id": ana, "panel2Id": ben }),
    );
    assert_eq!(str_at(&made, "/panel1Name"), "Ana Reyes");
    assert_eq!(str_at(&made, "/panel2Name"), "Ben Cruz");
    assert_eq!(made["sheet"]["version"], 1);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "sheets.create",
        json!({ "groupName": "Beta", "proponents": ["Tia"], "panel2Id": ben }),
    );

    let all = request_ok(&mut stdin, &mut reader, "6", "sheets.list", json!({}));
    assert_eq!(all["sheets"].as_array().map(|a| a.len()), Some(2));
    let not_started = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "sheets.list",
        json!({ "status": "NOT_STARTED" }),
    );
    assert_eq!(not_started["sheets"].as_array().map(|a| a.len()), Some(2));
    let completed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "sheets.list",
        json!({ "status": "COMPLETED" }),
    );
    assert_eq!(completed["sheets"].as_array().map(|a| a.len()), Some(0));
    let e = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "sheets.list",
        json!({ "status": "ARCHIVED" }),
    );
    assert_eq!(error_code(&e), "bad_params");

    // Panel users see only their own groups, tagged with their slot.
    login(&mut stdin, &mut reader, "ana");
    let mine = request_ok(&mut stdin, &mut reader, "10", "sheets.list", json!({}));
    let rows = mine["sheets"].as_array().expect("sheets");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["mySlot"], "panel1");
    assert_eq!(rows[0]["sheet"]["groupName"], "Alpha");

    let e = request_err(
        &mut stdin,
        &mut reader,
        "11",
        "sheets.create",
        json!({ "groupName": "Mine", "proponents": [] }),
    );
    assert_eq!(error_code(&e), "forbidden");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn proponent_edits_keep_ids_and_prune_removed_scores() {
    let workspace = temp_dir("gradesheet-sheets-proponents");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let ana = create_panel(&mut stdin, &mut reader, "ana", "Ana Reyes");
    let made = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "sheets.create",
        json!({ "groupName": "Gamma", "proponents": ["Ria", "Sol"], "panel1Id": ana }),
    );
    let sheet_id = str_at(&made, "/sheet/id").to_string();
    let ria = str_at(&made, "/sheet/proponents/0/id").to_string();
    let sol = str_at(&made, "/sheet/proponents/1/id").to_string();
    let rubric = request_ok(&mut stdin, &mut reader, "2", "rubric.get", json!({}))["rubric"].clone();
    let (_, indiv) = scores_at(&rubric, 0.5, &[ria.clone(), sol.clone()]);

    login(&mut stdin, &mut reader, "ana");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grading.save",
        json!({ "sheetId": sheet_id, "individualScores": indiv }),
    );

    login(&mut stdin, &mut reader, "admin");
    let current = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "sheets.get",
        json!({ "sheetId": sheet_id }),
    );
    let version = current["sheet"]["version"].as_i64().expect("version");

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "sheets.update",
        json!({
            "sheetId": sheet_id,
            "groupName": "Gamma Team",
            "proponents": [{ "id": ria, "name": "Ria Santos" }, "Uma"],
            "expectedVersion": version
        }),
    );
    assert_eq!(str_at(&updated, "/sheet/groupName"), "Gamma Team");
    let props = updated["sheet"]["proponents"].as_array().expect("proponents");
    assert_eq!(props.len(), 2);
    assert_eq!(props[0]["id"], ria.as_str());
    assert_eq!(props[0]["name"], "Ria Santos");
    assert_ne!(props[1]["id"], sol.as_str());

    let kept = &updated["sheet"]["panel1Grades"]["individualScores"];
    assert!(kept.get(&ria).is_some());
    assert!(kept.get(&sol).is_none());

    // Stale version.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "sheets.update",
        json!({ "sheetId": sheet_id, "groupName": "Late", "expectedVersion": version }),
    );
    assert_eq!(error_code(&e), "version_conflict");

    let e = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "sheets.update",
        json!({ "sheetId": sheet_id, "proponents": [{ "id": "stranger", "name": "X" }] }),
    );
    assert_eq!(error_code(&e), "bad_params");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn reassignment_respects_submitted_slots_and_delete_removes_everything() {
    let workspace = temp_dir("gradesheet-sheets-reassign");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    bootstrap_admin(&mut stdin, &mut reader, &workspace);
    let ana = create_panel(&mut stdin, &mut reader, "ana", "Ana Reyes");
    let ben = create_panel(&mut stdin, &mut reader, "ben", "Ben Cruz");
    let cy = create_panel(&mut stdin, &mut reader, "cy", "Cy Lim");
    let made = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "sheets.create",
        json!({ "groupName": "Delta", "proponents": ["Ria"], "panel1Id": ana, "panel2Id": ben }),
    );
    let sheet_id = str_at(&made, "/sheet/id").to_string();
    let ria = str_at(&made, "/sheet/proponents/0/id").to_string();
    let rubric = request_ok(&mut stdin, &mut reader, "2", "rubric.get", json!({}))["rubric"].clone();
    let (title, indiv) = scores_at(&rubric, 1.0, &[ria]);

    login(&mut stdin, &mut reader, "ana");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grading.save",
        json!({ "sheetId": sheet_id, "titleDefenseScores": title, "individualScores": indiv }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grading.submit",
        json!({ "sheetId": sheet_id }),
    );
    login(&mut stdin, &mut reader, "ben");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grading.save",
        json!({ "sheetId": sheet_id, "comments": "draft" }),
    );

    login(&mut stdin, &mut reader, "admin");
    let e = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "sheets.update",
        json!({ "sheetId": sheet_id, "panel1Id": cy }),
    );
    assert_eq!(error_code(&e), "slot_locked");

    // An unsubmitted slot moves to the new panel with empty grades.
    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "sheets.update",
        json!({ "sheetId": sheet_id, "panel2Id": cy }),
    );
    assert_eq!(str_at(&moved, "/sheet/panel2Id"), cy);
    assert!(moved["sheet"]["panel2Grades"].is_null());
    assert_eq!(str_at(&moved, "/sheet/status"), "PANEL_1_SUBMITTED");
    assert_eq!(moved["sheet"]["panel1Grades"]["submitted"], true);

    login(&mut stdin, &mut reader, "ben");
    let e = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "grading.open",
        json!({ "sheetId": sheet_id }),
    );
    assert_eq!(error_code(&e), "forbidden");

    login(&mut stdin, &mut reader, "admin");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "sheets.delete",
        json!({ "sheetId": sheet_id }),
    );
    let e = request_err(
        &mut stdin,
        &mut reader,
        "10",
        "sheets.get",
        json!({ "sheetId": sheet_id }),
    );
    assert_eq!(error_code(&e), "not_found");

    let conn = rusqlite::Connection::open(workspace.join("gradesheet.sqlite3")).expect("open db");
    let leftovers: i64 = conn
        .query_row(
            "SELECT (SELECT COUNT(*) FROM proponents WHERE sheet_id = ?1)
                  + (SELECT COUNT(*) FROM events WHERE sheet_id = ?1)",
            [&sheet_id],
            |r| r.get(0),
        )
        .expect("count");
    assert_eq!(leftovers, 0);

    // Freed panels may now be deleted.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "users.delete",
        json!({ "userId": ana }),
    );

    drop(stdin);
    let _ = child.wait();
}
