use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "gradesheet.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // Two evaluators may hold the same workspace open; wait for the writer
    // instead of failing immediately.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            role TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            password_salt TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_sheets(
            id TEXT PRIMARY KEY,
            group_name TEXT NOT NULL,
            panel1_id TEXT,
            panel2_id TEXT,
            panel1_grades TEXT,
            panel2_grades TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(panel1_id) REFERENCES users(id),
            FOREIGN KEY(panel2_id) REFERENCES users(id)
        )",
        [],
    )?;
    ensure_grade_sheets_version(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_sheets_panel1 ON grade_sheets(panel1_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_sheets_panel2 ON grade_sheets(panel2_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS proponents(
            id TEXT PRIMARY KEY,
            sheet_id TEXT NOT NULL,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(sheet_id) REFERENCES grade_sheets(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_proponents_sheet_sort ON proponents(sheet_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events(
            id TEXT PRIMARY KEY,
            sheet_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            panel_slot TEXT,
            actor_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(sheet_id) REFERENCES grade_sheets(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_grade_sheets_version(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grade_sheets", "version")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE grade_sheets ADD COLUMN version INTEGER NOT NULL DEFAULT 1",
        [],
    )?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn open_adds_version_column_to_older_workspaces() {
        let ws = temp_dir("gradesheet-db-migrate");
        {
            let conn = Connection::open(ws.join(DB_FILE_NAME)).expect("open raw");
            conn.execute(
                "CREATE TABLE grade_sheets(
                    id TEXT PRIMARY KEY,
                    group_name TEXT NOT NULL,
                    panel1_id TEXT,
                    panel2_id TEXT,
                    panel1_grades TEXT,
                    panel2_grades TEXT,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                [],
            )
            .expect("old schema");
            conn.execute(
                "INSERT INTO grade_sheets(id, group_name, status, created_at, updated_at)
                 VALUES('g1','Old','NOT_STARTED','t','t')",
                [],
            )
            .expect("old row");
        }

        let conn = open_db(&ws).expect("open_db");
        assert!(table_has_column(&conn, "grade_sheets", "version").expect("pragma"));
        let v: i64 = conn
            .query_row("SELECT version FROM grade_sheets WHERE id = 'g1'", [], |r| {
                r.get(0)
            })
            .expect("version");
        assert_eq!(v, 1);
    }

    #[test]
    fn settings_roundtrip_overwrites() {
        let ws = temp_dir("gradesheet-db-settings");
        let conn = open_db(&ws).expect("open_db");
        assert!(settings_get_json(&conn, "setup.grading").expect("get").is_none());
        settings_set_json(&conn, "setup.grading", &serde_json::json!({ "passingScore": 75 }))
            .expect("set");
        settings_set_json(&conn, "setup.grading", &serde_json::json!({ "passingScore": 60 }))
            .expect("set again");
        let v = settings_get_json(&conn, "setup.grading")
            .expect("get")
            .expect("present");
        assert_eq!(v["passingScore"], 60);
    }
}
