use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const DB_FILE_NAME: &str = "registrar.sqlite3";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;
/// Stored in `PRAGMA user_version`; bump when the table layout changes.
pub const SCHEMA_VERSION: i64 = 1;

/// Tables holding registrar records, in dependency order.
pub const RECORD_TABLES: [&str; 9] = [
    "users",
    "students",
    "lecturers",
    "admins",
    "courses",
    "course_registrations",
    "grades",
    "payments",
    "activity_log",
];

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    configure(&conn, busy_timeout_from_env())?;
    create_schema(&conn)?;
    Ok(conn)
}

/// Store used by unit tests; same schema, no file.
#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    Ok(conn)
}

fn busy_timeout_from_env() -> Duration {
    let ms = std::env::var("REGISTRARD_BUSY_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_BUSY_TIMEOUT_MS);
    Duration::from_millis(ms)
}

fn configure(conn: &Connection, busy_timeout: Duration) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // Several sidecars may share one workspace; writers queue on the lock instead of failing.
    conn.busy_timeout(busy_timeout)?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
    Ok(())
}

fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            password_salt TEXT NOT NULL,
            full_name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            role TEXT NOT NULL CHECK(role IN ('STUDENT', 'LECTURER', 'ADMIN')),
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            user_id TEXT PRIMARY KEY,
            student_no TEXT NOT NULL UNIQUE,
            program TEXT NOT NULL,
            year_of_study INTEGER NOT NULL,
            semester INTEGER NOT NULL,
            fee_balance INTEGER NOT NULL DEFAULT 0,
            gpa REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS lecturers(
            user_id TEXT PRIMARY KEY,
            lecturer_no TEXT NOT NULL UNIQUE,
            department TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS admins(
            user_id TEXT PRIMARY KEY,
            admin_no TEXT NOT NULL UNIQUE,
            access_level TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            credits INTEGER NOT NULL,
            department TEXT NOT NULL,
            year_level INTEGER NOT NULL,
            semester INTEGER NOT NULL,
            max_capacity INTEGER NOT NULL CHECK(max_capacity >= 0),
            active INTEGER NOT NULL DEFAULT 1,
            lecturer_id TEXT,
            FOREIGN KEY(lecturer_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_level_semester ON courses(year_level, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_registrations(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            semester INTEGER NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('REGISTERED', 'DROPPED', 'COMPLETED')),
            registered_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES users(id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    // At most one live registration per (student, course, term); dropped rows are kept.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_registrations_live
         ON course_registrations(student_id, course_id, academic_year, semester)
         WHERE status = 'REGISTERED'",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_course_term
         ON course_registrations(course_id, academic_year, semester, status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_student
         ON course_registrations(student_id, academic_year, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            registration_id TEXT NOT NULL UNIQUE,
            coursework_marks REAL NOT NULL CHECK(coursework_marks >= 0 AND coursework_marks <= 40),
            exam_marks REAL NOT NULL CHECK(exam_marks >= 0 AND exam_marks <= 60),
            total_marks REAL NOT NULL,
            letter_grade TEXT NOT NULL,
            grade_points REAL NOT NULL,
            remarks TEXT,
            graded_by TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(registration_id) REFERENCES course_registrations(id),
            FOREIGN KEY(graded_by) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            amount INTEGER NOT NULL CHECK(amount > 0),
            payment_date TEXT NOT NULL,
            method TEXT NOT NULL,
            reference_number TEXT NOT NULL UNIQUE,
            purpose TEXT,
            academic_year TEXT NOT NULL,
            semester INTEGER NOT NULL,
            processed_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES users(id),
            FOREIGN KEY(processed_by) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_student ON payments(student_id, payment_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS activity_log(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT,
            action TEXT NOT NULL,
            details TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS workspace_settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

pub fn schema_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("PRAGMA user_version", [], |r| r.get(0))
}

/// Row count per record table.
pub fn record_counts(conn: &Connection) -> rusqlite::Result<BTreeMap<String, i64>> {
    let mut out = BTreeMap::new();
    for table in RECORD_TABLES {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?;
        out.insert(table.to_string(), n);
    }
    Ok(out)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM workspace_settings WHERE key = ?",
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
        "INSERT INTO workspace_settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// True when the error is a UNIQUE / partial-unique index violation.
pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
