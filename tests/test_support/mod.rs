#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
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

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradesheetd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradesheetd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(Value::Null)
}

/// Sends a request expected to fail and returns its error object.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or(Value::Null)
}

pub fn error_code(error: &Value) -> &str {
    error.get("code").and_then(|v| v.as_str()).unwrap_or("")
}

pub fn str_at<'a>(v: &'a Value, pointer: &str) -> &'a str {
    v.pointer(pointer)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing string at {} in {}", pointer, v))
}

pub fn f64_at(v: &Value, pointer: &str) -> f64 {
    v.pointer(pointer)
        .and_then(|x| x.as_f64())
        .unwrap_or_else(|| panic!("missing number at {} in {}", pointer, v))
}

pub fn login(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, username: &str) {
    let _ = request_ok(stdin, reader, "login", "session.login", json!({
        "username": username,
        "password": "secret",
    }));
}

/// Opens `workspace`, creates the first admin (`admin` / `secret`) and logs in.
pub fn bootstrap_admin(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(stdin, reader, "boot", "users.create", json!({
        "username": "admin",
        "displayName": "Registrar",
        "role": "admin",
        "password": "secret",
    }));
    login(stdin, reader, "admin");
}

/// Creates a panel user with password `secret` and returns its id.
pub fn create_panel(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    username: &str,
    display_name: &str,
) -> String {
    let res = request_ok(stdin, reader, "mk-panel", "users.create", json!({
        "username": username,
        "displayName": display_name,
        "role": "panel",
        "password": "secret",
    }));
    str_at(&res, "/user/id").to_string()
}

/// Score maps with every rubric item set to `fraction` of its weight.
pub fn scores_at(rubric: &Value, fraction: f64, student_ids: &[String]) -> (Value, Value) {
    let mut title = serde_json::Map::new();
    for item in rubric["titleDefense"].as_array().expect("titleDefense") {
        let w = item["weight"].as_f64().expect("weight");
        title.insert(item["id"].as_str().expect("id").to_string(), json!(w * fraction));
    }
    let mut indiv = serde_json::Map::new();
    for sid in student_ids {
        let mut per = serde_json::Map::new();
        for item in rubric["individual"].as_array().expect("individual") {
            let w = item["weight"].as_f64().expect("weight");
            per.insert(item["id"].as_str().expect("id").to_string(), json!(w * fraction));
        }
        indiv.insert(sid.clone(), Value::Object(per));
    }
    (Value::Object(title), Value::Object(indiv))
}
