#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ADMIN_USER: &str = "registrar";
pub const PASSWORD: &str = "secret123";

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
    let exe = env!("CARGO_BIN_EXE_registrard");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn registrard");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn send(stdin: &mut ChildStdin, id: &str, method: &str, params: serde_json::Value) {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
}

pub fn read_response(reader: &mut BufReader<ChildStdout>, id: &str) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", id);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    send(stdin, id, method, params);
    read_response(reader, id)
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Sends a request that must fail and returns its error code.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

pub fn str_at(v: &serde_json::Value, path: &[&str]) -> String {
    let mut cur = v;
    for key in path {
        cur = cur.get(*key).unwrap_or_else(|| panic!("missing {} in {}", key, v));
    }
    cur.as_str()
        .unwrap_or_else(|| panic!("{:?} is not a string in {}", path, v))
        .to_string()
}

pub fn select_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
}

pub fn login(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    username: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        &format!("login-{}", username),
        "auth.login",
        json!({ "username": username, "password": PASSWORD }),
    )
}

/// Creates the first administrator in an empty workspace and signs in as them.
pub fn bootstrap_admin(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let created = request_ok(
        stdin,
        reader,
        "bootstrap",
        "users.create",
        json!({
            "username": ADMIN_USER,
            "password": PASSWORD,
            "name": "Registrar Office",
            "role": { "kind": "admin", "adminNo": "ADM-001" }
        }),
    );
    let _ = login(stdin, reader, ADMIN_USER);
    str_at(&created, &["identity", "id"])
}

pub fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    username: &str,
    student_no: &str,
    fee_balance: i64,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("student-{}", username),
        "users.create",
        json!({
            "username": username,
            "password": PASSWORD,
            "name": format!("Student {}", username),
            "contact": { "email": format!("{}@uni.test", username) },
            "role": {
                "kind": "student",
                "studentNo": student_no,
                "program": "BSc Computer Science",
                "yearOfStudy": 1,
                "semester": 1,
                "feeBalance": fee_balance
            }
        }),
    );
    str_at(&created, &["identity", "id"])
}

pub fn create_lecturer(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    username: &str,
    lecturer_no: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("lecturer-{}", username),
        "users.create",
        json!({
            "username": username,
            "password": PASSWORD,
            "name": format!("Dr {}", username),
            "role": { "kind": "lecturer", "lecturerNo": lecturer_no, "department": "Computing" }
        }),
    );
    str_at(&created, &["identity", "id"])
}

pub fn create_course(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    code: &str,
    max_capacity: i64,
    lecturer_id: Option<&str>,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("course-{}", code),
        "courses.create",
        json!({
            "code": code,
            "name": format!("{} lectures", code),
            "credits": 4,
            "department": "Computing",
            "yearLevel": 1,
            "semester": 1,
            "maxCapacity": max_capacity,
            "lecturerId": lecturer_id
        }),
    );
    str_at(&created, &["course", "id"])
}
