use crate::courses::{self, CourseFilter, CourseInput};
use crate::ipc::error::{db_err, domain_err, err};
use crate::ipc::helpers::{
    bad_params, bool_param, ctx, opt_i64_param, require_admin, require_db, require_session,
    respond, str_param, to_json, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

fn course_input(req: &Request) -> HandlerResult<CourseInput> {
    serde_json::from_value(req.params.clone())
        .map_err(|e| bad_params(req, format!("invalid course: {}", e)))
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    require_admin(state, req)?;
    let input = course_input(req)?;
    let course = courses::create_course(ctx(state, req)?, &input)
        .map_err(|e| domain_err(&req.id, &e))?;
    Ok(json!({ "course": to_json(req, &course)? }))
}

fn handle_courses_update(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    require_admin(state, req)?;
    let course_id = str_param(req, "courseId")?;
    let input = course_input(req)?;
    let course = courses::update_course(ctx(state, req)?, &course_id, &input)
        .map_err(|e| domain_err(&req.id, &e))?;
    Ok(json!({ "course": to_json(req, &course)? }))
}

fn handle_courses_set_active(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    require_admin(state, req)?;
    let course_id = str_param(req, "courseId")?;
    let active = bool_param(req, "active")?;
    courses::set_course_active(ctx(state, req)?, &course_id, active)
        .map_err(|e| domain_err(&req.id, &e))?;
    Ok(json!({ "courseId": course_id, "active": active }))
}

fn handle_courses_get(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    require_session(state, req)?;
    let conn = require_db(state, req)?;
    let course_id = str_param(req, "courseId")?;
    let course = courses::get_course(conn, &course_id)
        .map_err(|e| db_err(&req.id, e))?
        .ok_or_else(|| err(&req.id, "course_not_found", "course not found", None))?;
    Ok(json!({ "course": to_json(req, &course)? }))
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    require_session(state, req)?;
    let conn = require_db(state, req)?;
    let filter = CourseFilter {
        year_level: opt_i64_param(req, "yearLevel")?,
        semester: opt_i64_param(req, "semester")?,
        active_only: req
            .params
            .get("activeOnly")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    };
    let rows = courses::list_courses(conn, &filter).map_err(|e| db_err(&req.id, e))?;
    Ok(json!({ "courses": to_json(req, &rows)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.create" => Some(respond(req, handle_courses_create(state, req))),
        "courses.update" => Some(respond(req, handle_courses_update(state, req))),
        "courses.setActive" => Some(respond(req, handle_courses_set_active(state, req))),
        "courses.get" => Some(respond(req, handle_courses_get(state, req))),
        "courses.list" => Some(respond(req, handle_courses_list(state, req))),
        _ => None,
    }
}
