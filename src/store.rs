use crate::auth;
use crate::calc::derive_status;
use crate::model::{GradeSheet, GradeSheetStatus, PanelGrades, PanelSlot, Role, Student, User};
use chrono::{SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Invalid(String),
    #[error("panel 1 and panel 2 must be different evaluators")]
    PanelConflict,
    #[error("{0} grades are already submitted")]
    AlreadySubmitted(PanelSlot),
    #[error("{0}")]
    SlotLocked(String),
    #[error("{} score(s) still missing", .0.len())]
    Incomplete(Vec<String>),
    #[error("grade sheet changed since it was read (current version {current})")]
    VersionConflict { current: i64 },
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::Invalid(_) => "bad_params",
            StoreError::PanelConflict => "panel_conflict",
            StoreError::AlreadySubmitted(_) => "already_submitted",
            StoreError::SlotLocked(_) => "slot_locked",
            StoreError::Incomplete(_) => "incomplete_grades",
            StoreError::VersionConflict { .. } => "version_conflict",
            StoreError::Sqlite(_) | StoreError::Json(_) => "db_query_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            StoreError::VersionConflict { current } => Some(json!({ "currentVersion": current })),
            StoreError::AlreadySubmitted(slot) => Some(json!({ "slot": slot.as_str() })),
            StoreError::Incomplete(missing) => Some(json!({ "missing": missing })),
            _ => None,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Writes take the database write lock up front so a second process waits
/// out the busy timeout instead of failing mid read-modify-write.
fn write_tx(conn: &Connection) -> StoreResult<Transaction<'_>> {
    Ok(Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?)
}

// ---------------------------------------------------------------------------
// users

const USER_COLUMNS: &str = "id, username, display_name, role, active, created_at, updated_at";

fn read_user(r: &Row<'_>) -> rusqlite::Result<User> {
    let role: String = r.get(3)?;
    Ok(User {
        id: r.get(0)?,
        username: r.get(1)?,
        display_name: r.get(2)?,
        role: Role::parse(&role).unwrap_or(Role::Panel),
        active: r.get::<_, i64>(4)? != 0,
        created_at: r.get(5)?,
        updated_at: r.get(6)?,
    })
}

pub fn list_users(conn: &Connection) -> StoreResult<Vec<User>> {
    let sql = format!("SELECT {} FROM users ORDER BY username", USER_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let users = stmt
        .query_map([], read_user)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

pub fn get_user(conn: &Connection, user_id: &str) -> StoreResult<User> {
    let sql = format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS);
    conn.query_row(&sql, [user_id], read_user)
        .optional()?
        .ok_or(StoreError::NotFound("user"))
}

pub fn count_users(conn: &Connection) -> StoreResult<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?)
}

pub fn username_exists(conn: &Connection, username: &str) -> StoreResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE username = ? COLLATE NOCASE",
            [username],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn insert_user(
    conn: &Connection,
    username: &str,
    display_name: &str,
    role: Role,
    password: &str,
) -> StoreResult<User> {
    if username_exists(conn, username)? {
        return Err(StoreError::Invalid(format!(
            "username already exists: {}",
            username
        )));
    }
    let id = Uuid::new_v4().to_string();
    let salt = auth::new_salt();
    let hash = auth::hash_password(&salt, password);
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO users(id, username, display_name, role, password_hash, password_salt, active, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?, ?)",
        params![id, username, display_name, role.as_str(), hash, salt, now, now],
    )?;
    info!(user_id = %id, username, role = role.as_str(), "user created");
    get_user(conn, &id)
}

#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub display_name: Option<String>,
    pub role: Option<Role>,
    pub password: Option<String>,
    pub active: Option<bool>,
}

fn assignment_count(conn: &Connection, user_id: &str) -> StoreResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM grade_sheets WHERE panel1_id = ?1 OR panel2_id = ?1",
        [user_id],
        |r| r.get(0),
    )?)
}

pub fn update_user(conn: &Connection, user_id: &str, patch: UserPatch) -> StoreResult<User> {
    let current = get_user(conn, user_id)?;
    if let Some(role) = patch.role {
        if role != current.role
            && current.role == Role::Panel
            && assignment_count(conn, user_id)? > 0
        {
            return Err(StoreError::SlotLocked(
                "user is assigned to a grade sheet as a panel".to_string(),
            ));
        }
    }

    let tx = write_tx(conn)?;
    let now = now_rfc3339();
    if let Some(name) = patch.display_name.as_deref() {
        tx.execute(
            "UPDATE users SET display_name = ?, updated_at = ? WHERE id = ?",
            (name, &now, user_id),
        )?;
    }
    if let Some(role) = patch.role {
        tx.execute(
            "UPDATE users SET role = ?, updated_at = ? WHERE id = ?",
            (role.as_str(), &now, user_id),
        )?;
    }
    if let Some(active) = patch.active {
        tx.execute(
            "UPDATE users SET active = ?, updated_at = ? WHERE id = ?",
            (active as i64, &now, user_id),
        )?;
    }
    if let Some(password) = patch.password.as_deref() {
        let salt = auth::new_salt();
        let hash = auth::hash_password(&salt, password);
        tx.execute(
            "UPDATE users SET password_hash = ?, password_salt = ?, updated_at = ? WHERE id = ?",
            (hash, salt, &now, user_id),
        )?;
    }
    tx.commit()?;
    get_user(conn, user_id)
}

pub fn delete_user(conn: &Connection, user_id: &str) -> StoreResult<()> {
    get_user(conn, user_id)?;
    if assignment_count(conn, user_id)? > 0 {
        return Err(StoreError::SlotLocked(
            "user is assigned to a grade sheet; reassign the panel first".to_string(),
        ));
    }
    conn.execute("DELETE FROM users WHERE id = ?", [user_id])?;
    info!(user_id, "user deleted");
    Ok(())
}

/// Returns the active user matching the credentials, if any.
pub fn verify_login(conn: &Connection, username: &str, password: &str) -> StoreResult<Option<User>> {
    let row: Option<(String, String, String, i64)> = conn
        .query_row(
            "SELECT id, password_hash, password_salt, active FROM users WHERE username = ? COLLATE NOCASE",
            [username],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((id, hash, salt, active)) = row else {
        return Ok(None);
    };
    if active == 0 || !auth::verify_password(&salt, password, &hash) {
        return Ok(None);
    }
    Ok(Some(get_user(conn, &id)?))
}

// ---------------------------------------------------------------------------
// grade sheets

const SHEET_COLUMNS: &str = "id, group_name, panel1_id, panel2_id, panel1_grades, panel2_grades, status, version, created_at, updated_at";

struct SheetRow {
    id: String,
    group_name: String,
    panel1_id: Option<String>,
    panel2_id: Option<String>,
    panel1_grades: Option<String>,
    panel2_grades: Option<String>,
    status: String,
    version: i64,
    created_at: String,
    updated_at: String,
}

fn read_sheet_row(r: &Row<'_>) -> rusqlite::Result<SheetRow> {
    Ok(SheetRow {
        id: r.get(0)?,
        group_name: r.get(1)?,
        panel1_id: r.get(2)?,
        panel2_id: r.get(3)?,
        panel1_grades: r.get(4)?,
        panel2_grades: r.get(5)?,
        status: r.get(6)?,
        version: r.get(7)?,
        created_at: r.get(8)?,
        updated_at: r.get(9)?,
    })
}

fn parse_grades(raw: Option<String>) -> StoreResult<Option<PanelGrades>> {
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

fn encode_grades(grades: Option<&PanelGrades>) -> StoreResult<Option<String>> {
    match grades {
        Some(g) => Ok(Some(serde_json::to_string(g)?)),
        None => Ok(None),
    }
}

impl SheetRow {
    fn into_sheet(self, proponents: Vec<Student>) -> StoreResult<GradeSheet> {
        let panel1_grades = parse_grades(self.panel1_grades)?;
        let panel2_grades = parse_grades(self.panel2_grades)?;
        let status = GradeSheetStatus::parse(&self.status)
            .unwrap_or_else(|| derive_status(panel1_grades.as_ref(), panel2_grades.as_ref()));
        Ok(GradeSheet {
            id: self.id,
            group_name: self.group_name,
            proponents,
            panel1_id: self.panel1_id,
            panel2_id: self.panel2_id,
            panel1_grades,
            panel2_grades,
            status,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn load_proponents(conn: &Connection, sheet_id: &str) -> StoreResult<Vec<Student>> {
    let mut stmt =
        conn.prepare("SELECT id, name FROM proponents WHERE sheet_id = ? ORDER BY sort_order")?;
    let students = stmt
        .query_map([sheet_id], |r| {
            Ok(Student {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(students)
}

pub fn load_sheet(conn: &Connection, sheet_id: &str) -> StoreResult<GradeSheet> {
    let sql = format!("SELECT {} FROM grade_sheets WHERE id = ?", SHEET_COLUMNS);
    let row = conn
        .query_row(&sql, [sheet_id], read_sheet_row)
        .optional()?
        .ok_or(StoreError::NotFound("grade sheet"))?;
    let proponents = load_proponents(conn, sheet_id)?;
    row.into_sheet(proponents)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SheetFilter<'a> {
    pub status: Option<GradeSheetStatus>,
    pub panel_id: Option<&'a str>,
}

pub fn list_sheets(conn: &Connection, filter: SheetFilter<'_>) -> StoreResult<Vec<GradeSheet>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(status) = filter.status {
        clauses.push("status = ?");
        binds.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(panel_id) = filter.panel_id {
        clauses.push("(panel1_id = ? OR panel2_id = ?)");
        binds.push(Value::Text(panel_id.to_string()));
        binds.push(Value::Text(panel_id.to_string()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT {} FROM grade_sheets {} ORDER BY group_name COLLATE NOCASE, created_at",
        SHEET_COLUMNS, where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), read_sheet_row)?
        .collect::<Result<Vec<_>, _>>()?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let mut by_sheet: HashMap<String, Vec<Student>> = HashMap::new();
    let mut prop_stmt =
        conn.prepare("SELECT sheet_id, id, name FROM proponents ORDER BY sheet_id, sort_order")?;
    let props = prop_stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            Student {
                id: r.get(1)?,
                name: r.get(2)?,
            },
        ))
    })?;
    for p in props {
        let (sheet_id, student) = p?;
        by_sheet.entry(sheet_id).or_default().push(student);
    }

    rows.into_iter()
        .map(|row| {
            let proponents = by_sheet.remove(&row.id).unwrap_or_default();
            row.into_sheet(proponents)
        })
        .collect()
}

fn check_panel_pair(panel1_id: Option<&str>, panel2_id: Option<&str>) -> StoreResult<()> {
    if panel1_id.is_some() && panel1_id == panel2_id {
        return Err(StoreError::PanelConflict);
    }
    Ok(())
}

/// The user must exist and be an active panel evaluator to take a slot.
fn check_assignable_panel(conn: &Connection, user_id: &str) -> StoreResult<()> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT role, active FROM users WHERE id = ?",
            [user_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((role, active)) = row else {
        return Err(StoreError::NotFound("panel user"));
    };
    if Role::parse(&role) != Some(Role::Panel) || active == 0 {
        return Err(StoreError::Invalid(format!(
            "user {} is not an active panel evaluator",
            user_id
        )));
    }
    Ok(())
}

fn write_proponents(conn: &Connection, sheet_id: &str, proponents: &[Student]) -> StoreResult<()> {
    conn.execute("DELETE FROM proponents WHERE sheet_id = ?", [sheet_id])?;
    let mut stmt = conn
        .prepare("INSERT INTO proponents(id, sheet_id, name, sort_order) VALUES(?, ?, ?, ?)")?;
    for (i, s) in proponents.iter().enumerate() {
        stmt.execute((&s.id, sheet_id, &s.name, i as i64))?;
    }
    Ok(())
}

/// Whole-document replacement guarded by the version read earlier in the
/// same transaction. Status is always re-derived here from the merged grades.
fn write_sheet(conn: &Connection, sheet: &mut GradeSheet, read_version: i64) -> StoreResult<()> {
    sheet.status = derive_status(sheet.panel1_grades.as_ref(), sheet.panel2_grades.as_ref());
    let now = now_rfc3339();
    let p1 = encode_grades(sheet.panel1_grades.as_ref())?;
    let p2 = encode_grades(sheet.panel2_grades.as_ref())?;
    let changed = conn.execute(
        "UPDATE grade_sheets
         SET group_name = ?, panel1_id = ?, panel2_id = ?, panel1_grades = ?, panel2_grades = ?,
             status = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND version = ?",
        params![
            sheet.group_name,
            sheet.panel1_id,
            sheet.panel2_id,
            p1,
            p2,
            sheet.status.as_str(),
            now,
            sheet.id,
            read_version
        ],
    )?;
    if changed == 0 {
        let current: Option<i64> = conn
            .query_row(
                "SELECT version FROM grade_sheets WHERE id = ?",
                [&sheet.id],
                |r| r.get(0),
            )
            .optional()?;
        return Err(match current {
            Some(current) => StoreError::VersionConflict { current },
            None => StoreError::NotFound("grade sheet"),
        });
    }
    sheet.version = read_version + 1;
    sheet.updated_at = now;
    debug!(
        sheet_id = %sheet.id,
        version = sheet.version,
        status = sheet.status.as_str(),
        "grade sheet written"
    );
    Ok(())
}

fn check_version(sheet: &GradeSheet, expected: Option<i64>) -> StoreResult<()> {
    match expected {
        Some(v) if v != sheet.version => Err(StoreError::VersionConflict {
            current: sheet.version,
        }),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewSheet {
    pub group_name: String,
    pub proponents: Vec<String>,
    pub panel1_id: Option<String>,
    pub panel2_id: Option<String>,
}

pub fn insert_sheet(conn: &Connection, new: NewSheet, actor_id: Option<&str>) -> StoreResult<GradeSheet> {
    check_panel_pair(new.panel1_id.as_deref(), new.panel2_id.as_deref())?;
    for id in [&new.panel1_id, &new.panel2_id].into_iter().flatten() {
        check_assignable_panel(conn, id)?;
    }

    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    let students: Vec<Student> = new
        .proponents
        .iter()
        .map(|name| Student {
            id: Uuid::new_v4().to_string(),
            name: name.clone(),
        })
        .collect();

    let tx = write_tx(conn)?;
    tx.execute(
        "INSERT INTO grade_sheets(id, group_name, panel1_id, panel2_id, panel1_grades, panel2_grades, status, version, created_at, updated_at)
         VALUES(?, ?, ?, ?, NULL, NULL, ?, 1, ?, ?)",
        params![
            id,
            new.group_name,
            new.panel1_id,
            new.panel2_id,
            derive_status(None, None).as_str(),
            now,
            now
        ],
    )?;
    write_proponents(&tx, &id, &students)?;
    append_event(&tx, &id, "sheet_created", None, actor_id)?;
    tx.commit()?;

    info!(sheet_id = %id, group = %new.group_name, proponents = students.len(), "grade sheet created");
    load_sheet(conn, &id)
}

#[derive(Debug, Clone)]
pub struct ProponentInput {
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct SheetPatch {
    pub group_name: Option<String>,
    pub proponents: Option<Vec<ProponentInput>>,
    /// Outer `None` leaves the slot alone; `Some(None)` unassigns it.
    pub panel1_id: Option<Option<String>>,
    pub panel2_id: Option<Option<String>>,
    pub expected_version: Option<i64>,
}

fn prune_individual_scores(grades: &mut Option<PanelGrades>, keep: &HashSet<String>) {
    if let Some(g) = grades.as_mut() {
        g.individual_scores.retain(|sid, _| keep.contains(sid));
    }
}

pub fn update_sheet(
    conn: &Connection,
    sheet_id: &str,
    patch: SheetPatch,
    actor_id: Option<&str>,
) -> StoreResult<GradeSheet> {
    let tx = write_tx(conn)?;
    let mut sheet = load_sheet(&tx, sheet_id)?;
    check_version(&sheet, patch.expected_version)?;
    let read_version = sheet.version;

    if let Some(name) = patch.group_name {
        sheet.group_name = name;
    }

    let mut proponents_changed = false;
    if let Some(inputs) = patch.proponents {
        let existing: HashSet<String> = sheet.proponents.iter().map(|s| s.id.clone()).collect();
        let mut next: Vec<Student> = Vec::with_capacity(inputs.len());
        let mut seen: HashSet<String> = HashSet::new();
        for input in inputs {
            let id = match input.id {
                Some(id) if existing.contains(&id) => id,
                Some(id) => {
                    return Err(StoreError::Invalid(format!(
                        "proponent {} does not belong to this group",
                        id
                    )))
                }
                None => Uuid::new_v4().to_string(),
            };
            if !seen.insert(id.clone()) {
                return Err(StoreError::Invalid(format!("duplicate proponent {}", id)));
            }
            next.push(Student {
                id,
                name: input.name,
            });
        }

        let membership_changed = seen != existing;
        if membership_changed
            && (sheet.is_submitted(PanelSlot::Panel1) || sheet.is_submitted(PanelSlot::Panel2))
        {
            return Err(StoreError::SlotLocked(
                "proponents cannot be added or removed after a panel has submitted".to_string(),
            ));
        }
        prune_individual_scores(&mut sheet.panel1_grades, &seen);
        prune_individual_scores(&mut sheet.panel2_grades, &seen);
        sheet.proponents = next;
        proponents_changed = true;
    }

    let mut assigned: Vec<(PanelSlot, String)> = Vec::new();
    for (slot, requested) in [
        (PanelSlot::Panel1, patch.panel1_id),
        (PanelSlot::Panel2, patch.panel2_id),
    ] {
        let Some(requested) = requested else {
            continue;
        };
        if requested.as_deref() == sheet.panel_id(slot) {
            continue;
        }
        if sheet.is_submitted(slot) {
            return Err(StoreError::SlotLocked(format!(
                "{} grades are submitted; reset the panel before reassigning",
                slot
            )));
        }
        *sheet.grades_mut(slot) = None;
        if let Some(user_id) = requested.as_ref() {
            assigned.push((slot, user_id.clone()));
        }
        match slot {
            PanelSlot::Panel1 => sheet.panel1_id = requested,
            PanelSlot::Panel2 => sheet.panel2_id = requested,
        }
    }
    check_panel_pair(sheet.panel1_id.as_deref(), sheet.panel2_id.as_deref())?;
    // Slots left alone keep their evaluator even if that account was deactivated.
    for (_, user_id) in &assigned {
        check_assignable_panel(&tx, user_id)?;
    }

    write_sheet(&tx, &mut sheet, read_version)?;
    if proponents_changed {
        write_proponents(&tx, &sheet.id, &sheet.proponents)?;
    }
    for (slot, _) in &assigned {
        append_event(&tx, &sheet.id, "panel_assigned", Some(*slot), actor_id)?;
    }
    tx.commit()?;
    Ok(sheet)
}

pub fn delete_sheet(conn: &Connection, sheet_id: &str) -> StoreResult<()> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM grade_sheets WHERE id = ?", [sheet_id], |r| {
            r.get(0)
        })
        .optional()?;
    if exists.is_none() {
        return Err(StoreError::NotFound("grade sheet"));
    }

    // Explicit dependency order; no ON DELETE CASCADE.
    let tx = write_tx(conn)?;
    tx.execute("DELETE FROM events WHERE sheet_id = ?", [sheet_id])?;
    tx.execute("DELETE FROM proponents WHERE sheet_id = ?", [sheet_id])?;
    tx.execute("DELETE FROM grade_sheets WHERE id = ?", [sheet_id])?;
    tx.commit()?;
    info!(sheet_id, "grade sheet deleted");
    Ok(())
}

/// Read-modify-write of one panel slot. `f` receives the freshly read sheet
/// and that slot's current grades (or an empty template) and returns the
/// replacement. The other slot is never touched.
pub fn update_panel_grades<F>(
    conn: &Connection,
    sheet_id: &str,
    slot: PanelSlot,
    expected_version: Option<i64>,
    actor_id: Option<&str>,
    f: F,
) -> StoreResult<GradeSheet>
where
    F: FnOnce(&GradeSheet, PanelGrades) -> StoreResult<PanelGrades>,
{
    let tx = write_tx(conn)?;
    let mut sheet = load_sheet(&tx, sheet_id)?;
    check_version(&sheet, expected_version)?;
    if sheet.is_submitted(slot) {
        return Err(StoreError::AlreadySubmitted(slot));
    }
    let read_version = sheet.version;
    let before = sheet.status;

    let current = sheet.grades(slot).cloned().unwrap_or_default();
    let next = f(&sheet, current)?;
    let submitting = next.submitted;
    *sheet.grades_mut(slot) = Some(next);
    write_sheet(&tx, &mut sheet, read_version)?;

    if submitting {
        append_event(&tx, &sheet.id, "panel_submitted", Some(slot), actor_id)?;
        if sheet.status == GradeSheetStatus::Completed && before != GradeSheetStatus::Completed {
            append_event(&tx, &sheet.id, "completed", None, actor_id)?;
        }
    }
    tx.commit()?;
    Ok(sheet)
}

/// Clear one panel slot, including submitted grades.
pub fn reset_panel(
    conn: &Connection,
    sheet_id: &str,
    slot: PanelSlot,
    actor_id: Option<&str>,
) -> StoreResult<GradeSheet> {
    let tx = write_tx(conn)?;
    let mut sheet = load_sheet(&tx, sheet_id)?;
    let read_version = sheet.version;
    *sheet.grades_mut(slot) = None;
    write_sheet(&tx, &mut sheet, read_version)?;
    append_event(&tx, &sheet.id, "panel_reset", Some(slot), actor_id)?;
    tx.commit()?;
    info!(sheet_id, slot = slot.as_str(), status = sheet.status.as_str(), "panel grades reset");
    Ok(sheet)
}

// ---------------------------------------------------------------------------
// events

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetEvent {
    pub id: String,
    pub sheet_id: String,
    pub group_name: String,
    pub kind: String,
    pub panel_slot: Option<String>,
    pub actor_id: Option<String>,
    pub created_at: String,
}

const EVENT_POLL_LIMIT: i64 = 200;

fn append_event(
    conn: &Connection,
    sheet_id: &str,
    kind: &str,
    slot: Option<PanelSlot>,
    actor_id: Option<&str>,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO events(id, sheet_id, kind, panel_slot, actor_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        params![
            Uuid::new_v4().to_string(),
            sheet_id,
            kind,
            slot.map(|s| s.as_str()),
            actor_id,
            now_rfc3339()
        ],
    )?;
    Ok(())
}

/// One batch of events plus whether more are waiting past it.
#[derive(Debug, Clone)]
pub struct EventPage {
    pub events: Vec<SheetEvent>,
    pub has_more: bool,
}

impl EventPage {
    /// Cursor for the next poll when the batch was cut short.
    pub fn resume_after(&self) -> Option<&str> {
        if self.has_more {
            self.events.last().map(|e| e.created_at.as_str())
        } else {
            None
        }
    }
}

/// Events newer than `since`, oldest first. With `panel_id`, only sheets
/// that user evaluates, excluding the user's own actions.
pub fn poll_events(
    conn: &Connection,
    since: Option<&str>,
    panel_id: Option<&str>,
) -> StoreResult<EventPage> {
    poll_events_limited(conn, since, panel_id, EVENT_POLL_LIMIT)
}

fn poll_events_limited(
    conn: &Connection,
    since: Option<&str>,
    panel_id: Option<&str>,
    limit: i64,
) -> StoreResult<EventPage> {
    let mut stmt = conn.prepare(
        "SELECT e.id, e.sheet_id, s.group_name, e.kind, e.panel_slot, e.actor_id, e.created_at
         FROM events e
         JOIN grade_sheets s ON s.id = e.sheet_id
         WHERE (?1 IS NULL OR e.created_at > ?1)
           AND (?2 IS NULL OR s.panel1_id = ?2 OR s.panel2_id = ?2)
           AND (?2 IS NULL OR e.actor_id IS NULL OR e.actor_id <> ?2)
         ORDER BY e.created_at, e.rowid
         LIMIT ?3",
    )?;
    let mut events = stmt
        .query_map(params![since, panel_id, limit + 1], |r| {
            Ok(SheetEvent {
                id: r.get(0)?,
                sheet_id: r.get(1)?,
                group_name: r.get(2)?,
                kind: r.get(3)?,
                panel_slot: r.get(4)?,
                actor_id: r.get(5)?,
                created_at: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let has_more = events.len() as i64 > limit;
    if has_more {
        // The cursor compares strictly, so a batch must not end partway
        // through a run of equal timestamps.
        let first_left_out = events[limit as usize].created_at.clone();
        events.truncate(limit as usize);
        let keep = events
            .iter()
            .rposition(|e| e.created_at != first_left_out)
            .map(|i| i + 1)
            .unwrap_or(events.len());
        events.truncate(keep);
        debug!(returned = events.len(), "event poll truncated");
    }
    Ok(EventPage { events, has_more })
}
