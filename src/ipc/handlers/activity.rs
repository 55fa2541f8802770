use crate::activity;
use crate::ipc::error::db_err;
use crate::ipc::helpers::{opt_i64_param, require_admin, require_db, respond, to_json, HandlerResult};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

fn handle_recent(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    require_admin(state, req)?;
    let conn = require_db(state, req)?;
    let limit = opt_i64_param(req, "limit")?
        .unwrap_or(DEFAULT_LIMIT)
        .clamp(1, MAX_LIMIT);
    let rows = activity::recent(conn, limit).map_err(|e| db_err(&req.id, e))?;
    Ok(json!({ "entries": to_json(req, &rows)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "activity.recent" => Some(respond(req, handle_recent(state, req))),
        _ => None,
    }
}
