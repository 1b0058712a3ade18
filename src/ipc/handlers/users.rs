use crate::auth::Session;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_optional_bool, get_optional_str, get_required_str, parse_csv_record, require_admin,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use crate::store::{self, UserPatch};
use rusqlite::Connection;
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

const MIN_PASSWORD_LEN: usize = 4;
const MAX_USERNAME_LEN: usize = 64;
const MAX_DISPLAY_NAME_LEN: usize = 120;

fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn parse_role(raw: &str) -> Result<Role, HandlerErr> {
    Role::parse(raw).ok_or_else(|| HandlerErr::bad_params("role must be one of: admin, panel"))
}

fn check_username(username: &str) -> Result<(), HandlerErr> {
    if username.len() > MAX_USERNAME_LEN {
        return Err(HandlerErr::bad_params(format!(
            "username length must be <= {}",
            MAX_USERNAME_LEN
        )));
    }
    if username.chars().any(|c| c.is_whitespace() || c == ',') {
        return Err(HandlerErr::bad_params(
            "username must not contain spaces or commas",
        ));
    }
    Ok(())
}

fn check_display_name(name: &str) -> Result<(), HandlerErr> {
    if name.is_empty() || name.len() > MAX_DISPLAY_NAME_LEN {
        return Err(HandlerErr::bad_params(format!(
            "displayName must be 1..={} characters",
            MAX_DISPLAY_NAME_LEN
        )));
    }
    Ok(())
}

fn check_password(pw: &str) -> Result<(), HandlerErr> {
    if pw.chars().count() < MIN_PASSWORD_LEN {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn users_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let users = store::list_users(conn)?;
    Ok(json!({ "users": users }))
}

fn users_create(
    conn: &Connection,
    session: Option<&Session>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let bootstrap = store::count_users(conn)? == 0;
    if !bootstrap {
        match session {
            None => return Err(HandlerErr::new("unauthenticated", "log in first")),
            Some(s) if !s.is_admin() => {
                return Err(HandlerErr::new("forbidden", "administrator role required"))
            }
            Some(_) => {}
        }
    }

    let username = get_required_str(params, "username")?;
    check_username(&username)?;
    let display_name = get_optional_str(params, "displayName")?.unwrap_or_else(|| username.clone());
    check_display_name(&display_name)?;
    let role = parse_role(&get_required_str(params, "role")?)?;
    if bootstrap && role != Role::Admin {
        return Err(HandlerErr::bad_params(
            "the first account in a workspace must be an admin",
        ));
    }
    let Some(password) = params.get("password").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing password"));
    };
    check_password(password)?;

    let user = store::insert_user(conn, &username, &display_name, role, password)?;
    Ok(json!({ "user": user, "bootstrap": bootstrap }))
}

fn users_update(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let display_name = get_optional_str(params, "displayName")?;
    if let Some(n) = display_name.as_deref() {
        check_display_name(n)?;
    }
    let role = match get_optional_str(params, "role")? {
        Some(r) => Some(parse_role(&r)?),
        None => None,
    };
    let password = match params.get("password").and_then(|v| v.as_str()) {
        Some(pw) => {
            check_password(pw)?;
            Some(pw.to_string())
        }
        None => None,
    };
    let active = get_optional_bool(params, "active")?;

    if user_id == session.user_id
        && (active == Some(false) || role.is_some_and(|r| r != Role::Admin))
    {
        return Err(HandlerErr::bad_params(
            "you cannot deactivate or demote your own account",
        ));
    }

    let user = store::update_user(
        conn,
        &user_id,
        UserPatch {
            display_name,
            role,
            password,
            active,
        },
    )?;
    Ok(json!({ "user": user }))
}

fn users_delete(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    if user_id == session.user_id {
        return Err(HandlerErr::bad_params("you cannot delete your own account"));
    }
    store::delete_user(conn, &user_id)?;
    Ok(json!({ "ok": true }))
}

#[derive(Debug, Clone, PartialEq)]
struct CsvUserRow {
    line_no: usize,
    username: String,
    display_name: String,
    role: String,
    password: String,
}

/// Split an import file into candidate rows plus per-line warnings. The
/// header row is required so column order mistakes fail loudly.
fn parse_user_rows(text: &str) -> Result<(Vec<CsvUserRow>, Vec<serde_json::Value>), HandlerErr> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty());
    let Some((_, header)) = lines.next() else {
        return Err(HandlerErr::bad_params("csv file is empty"));
    };
    let header: Vec<String> = parse_csv_record(header.trim_start_matches('\u{feff}'))
        .into_iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();
    let expected = ["username", "display_name", "role", "password"];
    if header.len() < expected.len() || header[..expected.len()] != expected {
        return Err(HandlerErr::bad_params(
            "csv header must be: username,display_name,role,password",
        )
        .with_details(json!({ "header": header })));
    }

    let mut rows = Vec::new();
    let mut warnings = Vec::new();
    for (idx, line) in lines {
        let line_no = idx + 1;
        let cols = parse_csv_record(line);
        if cols.len() < expected.len() {
            warnings.push(json!({
                "line": line_no,
                "code": "short_row",
                "message": "expected 4 columns"
            }));
            continue;
        }
        rows.push(CsvUserRow {
            line_no,
            username: cols[0].trim().to_string(),
            display_name: cols[1].trim().to_string(),
            role: cols[2].trim().to_string(),
            password: cols[3].to_string(),
        });
    }
    Ok((rows, warnings))
}

fn users_import_csv(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let path = PathBuf::from(get_required_str(params, "path")?);
    let text = std::fs::read_to_string(&path).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string())
            .with_details(json!({ "path": path.to_string_lossy() }))
    })?;
    let (rows, mut warnings) = parse_user_rows(&text)?;

    let mut created = 0usize;
    let mut skipped = warnings.len();
    for row in rows {
        let checked = check_username(&row.username)
            .and_then(|_| check_display_name(&row.display_name))
            .and_then(|_| check_password(&row.password))
            .and_then(|_| parse_role(&row.role));
        let role = match checked {
            Ok(r) if !row.username.is_empty() => r,
            Ok(_) => {
                skipped += 1;
                warnings.push(json!({ "line": row.line_no, "code": "bad_row", "message": "missing username" }));
                continue;
            }
            Err(e) => {
                skipped += 1;
                warnings.push(json!({ "line": row.line_no, "code": "bad_row", "message": e.message }));
                continue;
            }
        };
        if store::username_exists(conn, &row.username)? {
            skipped += 1;
            warnings.push(json!({
                "line": row.line_no,
                "code": "duplicate_username",
                "message": format!("username already exists: {}", row.username)
            }));
            continue;
        }
        store::insert_user(conn, &row.username, &row.display_name, role, &row.password)?;
        created += 1;
    }

    info!(path = %path.to_string_lossy(), created, skipped, "users imported");
    Ok(json!({
        "created": created,
        "skipped": skipped,
        "warnings": warnings
    }))
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = db_conn(state).and_then(|conn| {
        require_admin(state)?;
        users_list(conn)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = db_conn(state)
        .and_then(|conn| users_create(conn, state.session.as_ref(), &req.params));
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = db_conn(state).and_then(|conn| {
        let session = require_admin(state)?;
        users_update(conn, session, &req.params)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = db_conn(state).and_then(|conn| {
        let session = require_admin(state)?;
        users_delete(conn, session, &req.params)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_users_import_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = db_conn(state).and_then(|conn| {
        require_admin(state)?;
        users_import_csv(conn, &req.params)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(handle_users_list(state, req)),
        "users.create" => Some(handle_users_create(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        "users.delete" => Some(handle_users_delete(state, req)),
        "users.importCsv" => Some(handle_users_import_csv(state, req)),
        _ => None,
    }
}
