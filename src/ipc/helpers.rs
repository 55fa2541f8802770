use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::Value;

use crate::auth::AuthError;
use crate::domain::{Identity, Term};
use crate::ipc::error::{db_err, domain_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::session::Ctx;
use crate::settings;

/// Handler bodies return the error response itself on the `Err` side.
pub type HandlerResult<T> = Result<T, Value>;

pub fn respond(req: &Request, res: HandlerResult<Value>) -> Value {
    match res {
        Ok(v) => ok(&req.id, v),
        Err(e) => e,
    }
}

pub fn require_db<'a>(state: &'a AppState, req: &Request) -> HandlerResult<&'a Connection> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn require_session<'a>(state: &'a AppState, req: &Request) -> HandlerResult<&'a Identity> {
    state
        .session
        .as_ref()
        .ok_or_else(|| domain_err(&req.id, &AuthError::NotAuthenticated))
}

pub fn require_admin<'a>(state: &'a AppState, req: &Request) -> HandlerResult<&'a Identity> {
    let who = require_session(state, req)?;
    if !who.is_admin() {
        return Err(forbidden(req, "administrators only"));
    }
    Ok(who)
}

pub fn forbidden(req: &Request, why: &'static str) -> Value {
    tracing::info!(method = %req.method, why, "request denied");
    domain_err(&req.id, &AuthError::Forbidden(why))
}

/// Store handle plus the signed-in identity, if any.
pub fn ctx<'a>(state: &'a AppState, req: &Request) -> HandlerResult<Ctx<'a>> {
    Ok(Ctx::new(require_db(state, req)?, state.session.as_ref()))
}

pub fn str_param(req: &Request, key: &str) -> HandlerResult<String> {
    match req.params.get(key).and_then(|v| v.as_str()).map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        Some(_) => Err(bad_params(req, format!("{} must not be empty", key))),
        None => Err(bad_params(req, format!("missing {}", key))),
    }
}

pub fn opt_str_param(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn i64_param(req: &Request, key: &str) -> HandlerResult<i64> {
    opt_i64_param(req, key)?.ok_or_else(|| bad_params(req, format!("missing {}", key)))
}

pub fn opt_i64_param(req: &Request, key: &str) -> HandlerResult<Option<i64>> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| bad_params(req, format!("{} must be a whole number", key))),
    }
}

pub fn f64_param(req: &Request, key: &str) -> HandlerResult<f64> {
    req.params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| bad_params(req, format!("missing or non-numeric {}", key)))
}

pub fn bool_param(req: &Request, key: &str) -> HandlerResult<bool> {
    req.params
        .get(key)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| bad_params(req, format!("missing {}", key)))
}

pub fn date_param(req: &Request, key: &str) -> HandlerResult<Option<NaiveDate>> {
    match opt_str_param(req, key) {
        None => Ok(None),
        Some(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| bad_params(req, format!("{} must be YYYY-MM-DD", key))),
    }
}

/// `academicYear` / `semester` from params, falling back to the workspace defaults.
pub fn term_param(conn: &Connection, req: &Request) -> HandlerResult<Term> {
    let defaults = settings::enrollment(conn)
        .map_err(|e| db_err(&req.id, e))?
        .default_term();
    let academic_year = opt_str_param(req, "academicYear").unwrap_or(defaults.academic_year);
    let semester = opt_i64_param(req, "semester")?.unwrap_or(defaults.semester);
    if !(1..=3).contains(&semester) {
        return Err(bad_params(req, "semester must be 1, 2 or 3"));
    }
    Ok(Term::new(academic_year, semester))
}

/// Like `term_param`, but `None` when the caller named no term at all.
pub fn opt_term_param(conn: &Connection, req: &Request) -> HandlerResult<Option<Term>> {
    if req.params.get("academicYear").map_or(true, Value::is_null)
        && req.params.get("semester").map_or(true, Value::is_null)
    {
        return Ok(None);
    }
    term_param(conn, req).map(Some)
}

pub fn bad_params(req: &Request, message: impl Into<String>) -> Value {
    err(
        &req.id,
        "bad_params",
        message,
        Some(serde_json::json!({ "kind": "validation" })),
    )
}

pub fn to_json<T: serde::Serialize>(req: &Request, v: &T) -> HandlerResult<Value> {
    serde_json::to_value(v).map_err(|e| err(&req.id, "encode_failed", e.to_string(), None))
}
