use rusqlite::Connection;
use serde::Serialize;

use crate::db;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: i64,
    pub user_id: Option<String>,
    pub action: String,
    pub details: String,
    pub created_at: String,
}

/// Best-effort audit write. Failures are logged and swallowed so they never
/// abort the operation that triggered them.
pub fn log_action(conn: &Connection, user_id: Option<&str>, action: &str, details: &str) {
    let res = conn.execute(
        "INSERT INTO activity_log(user_id, action, details, created_at) VALUES(?, ?, ?, ?)",
        (user_id, action, details, db::now_rfc3339()),
    );
    if let Err(e) = res {
        tracing::warn!(action, error = %e, "activity log write failed");
    }
}

pub fn recent(conn: &Connection, limit: i64) -> rusqlite::Result<Vec<ActivityEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, action, details, created_at
         FROM activity_log
         ORDER BY id DESC
         LIMIT ?",
    )?;
    let rows = stmt
        .query_map([limit.max(0)], |row| {
            Ok(ActivityEntry {
                id: row.get(0)?,
                user_id: row.get(1)?,
                action: row.get(2)?,
                details: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
