use crate::courses;
use crate::domain::Role;
use crate::enrollment;
use crate::grading;
use crate::ipc::error::{db_err, domain_err};
use crate::ipc::helpers::{
    bad_params, ctx, f64_param, forbidden, opt_str_param, require_db, require_session, respond,
    str_param, term_param, to_json, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{can_grade, can_view_student};
use serde_json::{json, Value};

fn handle_upload(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let who = require_session(state, req)?;
    let ctx = ctx(state, req)?;
    let registration_id = str_param(req, "registrationId")?;
    let coursework = f64_param(req, "courseworkMarks")?;
    let exam = f64_param(req, "examMarks")?;
    let remarks = opt_str_param(req, "remarks");

    // Unknown registrations fall through so the grading engine reports them.
    let registration =
        enrollment::get_registration(ctx.conn, &registration_id).map_err(|e| db_err(&req.id, e))?;
    let lecturer = match &registration {
        Some(r) => courses::get_course(ctx.conn, &r.course_id)
            .map_err(|e| db_err(&req.id, e))?
            .and_then(|c| c.lecturer_id),
        None => None,
    };
    if !can_grade(who, lecturer.as_deref()) {
        return Err(forbidden(req, "only the course lecturer or an administrator may grade"));
    }

    let grade = grading::upload_grade(
        ctx,
        &registration_id,
        coursework,
        exam,
        &who.id,
        remarks.as_deref(),
    )
    .map_err(|e| domain_err(&req.id, &e))?;
    Ok(json!({ "grade": to_json(req, &grade)? }))
}

fn viewed_student(req: &Request, state: &AppState) -> HandlerResult<String> {
    let who = require_session(state, req)?;
    let student_id = match (opt_str_param(req, "studentId"), &who.role) {
        (Some(id), _) => id,
        (None, Role::Student(_)) => who.id.clone(),
        (None, _) => return Err(bad_params(req, "missing studentId")),
    };
    if !can_view_student(who, &student_id) {
        return Err(forbidden(req, "cannot view this student's grades"));
    }
    Ok(student_id)
}

fn handle_for_student(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let student_id = viewed_student(req, state)?;
    let conn = require_db(state, req)?;
    let rows = grading::grades_for_student(conn, &student_id).map_err(|e| db_err(&req.id, e))?;
    Ok(json!({ "grades": to_json(req, &rows)? }))
}

fn handle_transcript(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let student_id = viewed_student(req, state)?;
    let conn = require_db(state, req)?;
    let t = grading::transcript(conn, &student_id).map_err(|e| db_err(&req.id, e))?;
    to_json(req, &t)
}

fn handle_for_course(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let who = require_session(state, req)?;
    if matches!(who.role, Role::Student(_)) {
        return Err(forbidden(req, "staff only"));
    }
    let conn = require_db(state, req)?;
    let course_id = str_param(req, "courseId")?;
    let term = term_param(conn, req)?;
    let rows =
        grading::grades_for_course(conn, &course_id, &term).map_err(|e| db_err(&req.id, e))?;
    Ok(json!({ "rows": to_json(req, &rows)? }))
}

fn handle_standing(_state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let gpa = f64_param(req, "gpa")?;
    if !gpa.is_finite() || gpa < 0.0 {
        return Err(bad_params(req, "gpa must be a non-negative number"));
    }
    Ok(json!({ "gpa": gpa, "standing": grading::standing_for_gpa(gpa) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.upload" => Some(respond(req, handle_upload(state, req))),
        "grades.forStudent" => Some(respond(req, handle_for_student(state, req))),
        "grades.forCourse" => Some(respond(req, handle_for_course(state, req))),
        "grades.transcript" => Some(respond(req, handle_transcript(state, req))),
        "grades.standing" => Some(respond(req, handle_standing(state, req))),
        _ => None,
    }
}
