use crate::domain::{Identity, Role};
use crate::enrollment;
use crate::ipc::error::{db_err, domain_err};
use crate::ipc::helpers::{
    bad_params, ctx, forbidden, i64_param, opt_str_param, opt_term_param, require_admin,
    require_db, require_session, respond, str_param, term_param, to_json, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{can_act_for_student, can_view_student};
use serde_json::{json, Value};

/// `studentId` param, or the caller's own id when a student omits it.
fn student_id_param(req: &Request, who: &Identity) -> HandlerResult<String> {
    match (opt_str_param(req, "studentId"), &who.role) {
        (Some(id), _) => Ok(id),
        (None, Role::Student(_)) => Ok(who.id.clone()),
        (None, _) => Err(bad_params(req, "missing studentId")),
    }
}

fn handle_register(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let who = require_session(state, req)?;
    let student_id = student_id_param(req, who)?;
    if !can_act_for_student(who, &student_id) {
        return Err(forbidden(req, "cannot register on behalf of this student"));
    }
    let course_id = str_param(req, "courseId")?;
    let ctx = ctx(state, req)?;
    let term = term_param(ctx.conn, req)?;

    let registration_id = enrollment::register(ctx, &student_id, &course_id, &term)
        .map_err(|e| domain_err(&req.id, &e))?;
    Ok(json!({
        "registrationId": registration_id,
        "studentId": student_id,
        "courseId": course_id,
        "academicYear": term.academic_year,
        "semester": term.semester
    }))
}

fn handle_drop(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let who = require_session(state, req)?;
    let student_id = student_id_param(req, who)?;
    if !can_act_for_student(who, &student_id) {
        return Err(forbidden(req, "cannot drop on behalf of this student"));
    }
    let registration_id = str_param(req, "registrationId")?;
    enrollment::drop(ctx(state, req)?, &registration_id, &student_id)
        .map_err(|e| domain_err(&req.id, &e))?;
    Ok(json!({ "registrationId": registration_id, "status": "DROPPED" }))
}

fn handle_available(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    require_session(state, req)?;
    let conn = require_db(state, req)?;
    let year_level = i64_param(req, "yearLevel")?;
    let term = term_param(conn, req)?;
    let rows = enrollment::available_courses(conn, year_level, term.semester, &term)
        .map_err(|e| db_err(&req.id, e))?;
    Ok(json!({ "courses": to_json(req, &rows)? }))
}

fn handle_student_registrations(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let who = require_session(state, req)?;
    let conn = require_db(state, req)?;
    let student_id = student_id_param(req, who)?;
    if !can_view_student(who, &student_id) {
        return Err(forbidden(req, "cannot view this student's registrations"));
    }
    let term = opt_term_param(conn, req)?;
    let rows = enrollment::student_registrations(conn, &student_id, term.as_ref())
        .map_err(|e| db_err(&req.id, e))?;
    Ok(json!({ "registrations": to_json(req, &rows)? }))
}

fn handle_course_enrollments(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let who = require_session(state, req)?;
    if matches!(who.role, Role::Student(_)) {
        return Err(forbidden(req, "staff only"));
    }
    let conn = require_db(state, req)?;
    let course_id = str_param(req, "courseId")?;
    let term = term_param(conn, req)?;
    let rows = enrollment::course_enrollments(conn, &course_id, &term)
        .map_err(|e| db_err(&req.id, e))?;
    Ok(json!({ "students": to_json(req, &rows)?, "count": rows.len() }))
}

fn handle_complete_term(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    require_admin(state, req)?;
    let course_id = str_param(req, "courseId")?;
    let ctx = ctx(state, req)?;
    let term = term_param(ctx.conn, req)?;
    let completed = enrollment::complete_term(ctx, &course_id, &term)
        .map_err(|e| domain_err(&req.id, &e))?;
    Ok(json!({ "completed": completed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollment.register" => Some(respond(req, handle_register(state, req))),
        "enrollment.drop" => Some(respond(req, handle_drop(state, req))),
        "enrollment.available" => Some(respond(req, handle_available(state, req))),
        "enrollment.studentRegistrations" => {
            Some(respond(req, handle_student_registrations(state, req)))
        }
        "enrollment.courseEnrollments" => Some(respond(req, handle_course_enrollments(state, req))),
        "enrollment.completeTerm" => Some(respond(req, handle_complete_term(state, req))),
        _ => None,
    }
}
