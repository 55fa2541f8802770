use crate::auth::{self, AuthError, NewRole, NewUser};
use crate::domain::Role;
use crate::ipc::error::{db_err, domain_err, err};
use crate::ipc::helpers::{
    bad_params, bool_param, ctx, forbidden, require_admin, require_db, require_session, respond,
    str_param, to_json, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{can_view_student, Ctx};
use crate::settings;
use serde_json::{json, Value};

fn handle_login(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let conn = require_db(state, req)?;
    let username = str_param(req, "username")?;
    let Some(password) = req.params.get("password").and_then(|v| v.as_str()) else {
        return Err(bad_params(req, "missing password"));
    };
    let identity = auth::login(conn, &username, password).map_err(|e| domain_err(&req.id, &e))?;
    let out = to_json(req, &identity)?;
    state.session = Some(identity);
    Ok(json!({ "identity": out }))
}

fn handle_logout(state: &mut AppState, _req: &Request) -> HandlerResult<Value> {
    if let (Some(conn), Some(who)) = (state.db.as_ref(), state.session.as_ref()) {
        Ctx::new(conn, Some(who)).log("LOGOUT", "session closed");
    }
    state.session = None;
    Ok(json!({ "ok": true }))
}

/// Re-reads the signed-in identity so balances and GPA are current.
fn handle_whoami(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let user_id = require_session(state, req)?.id.clone();
    let conn = require_db(state, req)?;
    let fresh = auth::get_identity(conn, &user_id).map_err(|e| db_err(&req.id, e))?;
    let Some(identity) = fresh else {
        state.session = None;
        return Err(domain_err(&req.id, &AuthError::NotAuthenticated));
    };
    let out = to_json(req, &identity)?;
    state.session = Some(identity);
    Ok(json!({ "identity": out }))
}

fn handle_change_password(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let who = require_session(state, req)?;
    let ctx = ctx(state, req)?;
    let (Some(current), Some(new_password)) = (
        req.params.get("currentPassword").and_then(|v| v.as_str()),
        req.params.get("newPassword").and_then(|v| v.as_str()),
    ) else {
        return Err(bad_params(req, "missing currentPassword or newPassword"));
    };
    let min_len = settings::security(ctx.conn)
        .map_err(|e| db_err(&req.id, e))?
        .min_password_length;
    auth::change_password(ctx, &who.id, current, new_password, min_len)
        .map_err(|e| domain_err(&req.id, &e))?;
    Ok(json!({ "ok": true }))
}

fn handle_users_create(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let conn = require_db(state, req)?;
    let new: NewUser = serde_json::from_value(req.params.clone())
        .map_err(|e| bad_params(req, format!("invalid user: {}", e)))?;

    let existing = auth::user_count(conn).map_err(|e| db_err(&req.id, e))?;
    if existing == 0 {
        // An empty workspace can only be bootstrapped with an administrator.
        if !matches!(new.role, NewRole::Admin { .. }) {
            return Err(forbidden(req, "the first account must be an administrator"));
        }
    } else {
        let who = require_session(state, req)?;
        if !who.is_admin() {
            return Err(forbidden(req, "administrators only"));
        }
    }

    let min_len = settings::security(conn)
        .map_err(|e| db_err(&req.id, e))?
        .min_password_length;
    let identity = auth::create_user(ctx(state, req)?, &new, min_len)
        .map_err(|e| domain_err(&req.id, &e))?;
    Ok(json!({ "identity": to_json(req, &identity)? }))
}

fn handle_users_get(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let who = require_session(state, req)?;
    let conn = require_db(state, req)?;
    let user_id = str_param(req, "userId")?;
    let target = auth::get_identity(conn, &user_id)
        .map_err(|e| db_err(&req.id, e))?
        .ok_or_else(|| err(&req.id, "not_found", "user not found", None))?;

    let allowed = match &target.role {
        Role::Student(_) => can_view_student(who, &target.id),
        Role::Lecturer(_) | Role::Admin(_) => who.is_admin() || who.id == target.id,
    };
    if !allowed {
        return Err(forbidden(req, "cannot view this user"));
    }
    Ok(json!({ "identity": to_json(req, &target)? }))
}

fn handle_users_set_active(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    require_admin(state, req)?;
    let user_id = str_param(req, "userId")?;
    let active = bool_param(req, "active")?;
    let identity = auth::set_user_active(ctx(state, req)?, &user_id, active)
        .map_err(|e| domain_err(&req.id, &e))?;
    Ok(json!({ "identity": to_json(req, &identity)?, "active": active }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.login" => Some(respond(req, handle_login(state, req))),
        "auth.logout" => Some(respond(req, handle_logout(state, req))),
        "auth.whoami" => Some(respond(req, handle_whoami(state, req))),
        "auth.changePassword" => Some(respond(req, handle_change_password(state, req))),
        "users.create" => Some(respond(req, handle_users_create(state, req))),
        "users.get" => Some(respond(req, handle_users_get(state, req))),
        "users.setActive" => Some(respond(req, handle_users_set_active(state, req))),
        _ => None,
    }
}
