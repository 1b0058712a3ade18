use crate::calc::{
    GradingPolicy, DEFAULT_INDIVIDUAL_SHARE, DEFAULT_PASSING_SCORE, DEFAULT_TITLE_DEFENSE_SHARE,
};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{require_admin, require_session};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};
use tracing::info;

#[derive(Clone, Copy)]
enum SetupSection {
    Grading,
    Reports,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "reports" => Some(Self::Reports),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::Reports => "setup.reports",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Grading => json!({
            "titleDefenseShare": DEFAULT_TITLE_DEFENSE_SHARE as i64,
            "individualShare": DEFAULT_INDIVIDUAL_SHARE as i64,
            "passingScore": DEFAULT_PASSING_SCORE as i64
        }),
        SetupSection::Reports => json!({
            "decimalPlaces": 2,
            "institutionName": "",
            "showProvisional": true
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Grading => match k.as_str() {
                "titleDefenseShare" | "individualShare" | "passingScore" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 100)?));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SetupSection::Reports => match k.as_str() {
                "decimalPlaces" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 4)?));
                }
                "institutionName" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "showProvisional" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown reports field: {}", k)),
            },
        }
    }
    if let SetupSection::Grading = section {
        let title = obj.get("titleDefenseShare").and_then(Value::as_i64).unwrap_or(0);
        let indiv = obj.get("individualShare").and_then(Value::as_i64).unwrap_or(0);
        if title + indiv != 100 {
            return Err(format!(
                "titleDefenseShare + individualShare must equal 100 (got {})",
                title + indiv
            ));
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values fall back to defaults.
            let mut candidate = current.clone();
            if merge_section_patch(section, &mut candidate, saved_obj).is_ok() {
                current = candidate;
            }
        }
    }
    Ok(current)
}

/// Weighting and cutoff currently in force for the workspace.
pub fn grading_policy(conn: &rusqlite::Connection) -> anyhow::Result<GradingPolicy> {
    let v = load_section(conn, SetupSection::Grading)?;
    let num = |key: &str, default: f64| v.get(key).and_then(Value::as_f64).unwrap_or(default);
    Ok(GradingPolicy {
        title_defense_share: num("titleDefenseShare", DEFAULT_TITLE_DEFENSE_SHARE),
        individual_share: num("individualShare", DEFAULT_INDIVIDUAL_SHARE),
        passing_score: num("passingScore", DEFAULT_PASSING_SCORE),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportSettings {
    pub decimal_places: u32,
    pub institution_name: String,
    pub show_provisional: bool,
}

pub fn report_settings(conn: &rusqlite::Connection) -> anyhow::Result<ReportSettings> {
    let v = load_section(conn, SetupSection::Reports)?;
    Ok(ReportSettings {
        decimal_places: v
            .get("decimalPlaces")
            .and_then(Value::as_u64)
            .map(|n| n.min(4) as u32)
            .unwrap_or(2),
        institution_name: v
            .get("institutionName")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        show_provisional: v
            .get("showProvisional")
            .and_then(Value::as_bool)
            .unwrap_or(true),
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(e) = require_session(state) {
        return e.response(&req.id);
    }
    let grading = match load_section(conn, SetupSection::Grading) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let reports = match load_section(conn, SetupSection::Reports) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "grading": grading,
            "reports": reports
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(e) = require_admin(state) {
        return e.response(&req.id);
    }
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    info!(section = section.key(), "settings updated");
    ok(&req.id, json!({ "ok": true, "section": section_raw, "values": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn open_temp(prefix: &str) -> rusqlite::Connection {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        db::open_db(&p).expect("open db")
    }

    fn patch(v: Value) -> Map<String, Value> {
        v.as_object().cloned().expect("object patch")
    }

    #[test]
    fn grading_shares_must_sum_to_one_hundred() {
        let mut cur = default_section(SetupSection::Grading);
        let res = merge_section_patch(
            SetupSection::Grading,
            &mut cur,
            &patch(json!({ "titleDefenseShare": 60 })),
        );
        assert!(res.is_err());

        let mut cur = default_section(SetupSection::Grading);
        merge_section_patch(
            SetupSection::Grading,
            &mut cur,
            &patch(json!({ "titleDefenseShare": 60, "individualShare": 40, "passingScore": 75 })),
        )
        .expect("valid patch");
        assert_eq!(cur["passingScore"], 75);
    }

    #[test]
    fn unknown_and_out_of_range_fields_are_rejected() {
        let mut cur = default_section(SetupSection::Reports);
        assert!(merge_section_patch(
            SetupSection::Reports,
            &mut cur,
            &patch(json!({ "decimalPlaces": 9 }))
        )
        .is_err());
        assert!(merge_section_patch(
            SetupSection::Reports,
            &mut cur,
            &patch(json!({ "colour": "red" }))
        )
        .is_err());
    }

    #[test]
    fn policy_defaults_then_stored_values() {
        let conn = open_temp("gradesheet-setup-policy");
        assert_eq!(grading_policy(&conn).expect("policy"), GradingPolicy::default());

        db::settings_set_json(
            &conn,
            "setup.grading",
            &json!({ "titleDefenseShare": 50, "individualShare": 50, "passingScore": 65 }),
        )
        .expect("store");
        let p = grading_policy(&conn).expect("policy");
        assert_eq!(p.title_defense_share, 50.0);
        assert_eq!(p.individual_share, 50.0);
        assert_eq!(p.passing_score, 65.0);
    }

    #[test]
    fn corrupt_stored_section_falls_back_to_defaults() {
        let conn = open_temp("gradesheet-setup-corrupt");
        db::settings_set_json(&conn, "setup.grading", &json!({ "titleDefenseShare": 90 }))
            .expect("store");
        assert_eq!(grading_policy(&conn).expect("policy"), GradingPolicy::default());

        let r = report_settings(&conn).expect("reports");
        assert_eq!(r.decimal_places, 2);
        assert!(r.show_provisional);
    }
}
