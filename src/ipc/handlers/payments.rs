use crate::domain::{Identity, Role};
use crate::ipc::error::{db_err, domain_err};
use crate::ipc::helpers::{
    bad_params, ctx, date_param, forbidden, opt_str_param, require_admin, require_db,
    require_session, respond, str_param, term_param, to_json, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::payments::{self, NewPayment, PaymentError, PaymentFilter};
use crate::settings;
use serde_json::{json, Value};

/// Payments are visible to administrators and to the paying student.
fn can_see_payments(who: &Identity, student_id: &str) -> bool {
    match &who.role {
        Role::Admin(_) => true,
        Role::Student(_) => who.id == student_id,
        Role::Lecturer(_) => false,
    }
}

fn amount_param(req: &Request) -> HandlerResult<i64> {
    match req.params.get("amount") {
        None | Some(Value::Null) => Err(bad_params(req, "missing amount")),
        Some(v) => match v.as_i64() {
            Some(n) => Ok(n),
            // Fractions and non-numbers are not valid amounts in minor units.
            None => Err(domain_err(&req.id, &PaymentError::InvalidAmount)),
        },
    }
}

fn handle_record(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let who = require_admin(state, req)?;
    let ctx = ctx(state, req)?;
    let student_id = str_param(req, "studentId")?;
    let amount = amount_param(req)?;
    let term = term_param(ctx.conn, req)?;
    let setup = settings::payments(ctx.conn).map_err(|e| db_err(&req.id, e))?;

    let reference_number = match opt_str_param(req, "referenceNumber") {
        Some(r) => r,
        None => payments::next_free_reference(ctx.conn, &setup.reference_prefix, chrono::Local::now())
            .map_err(|e| db_err(&req.id, e))?,
    };
    let date = date_param(req, "date")?.unwrap_or_else(|| chrono::Local::now().date_naive());

    let new = NewPayment {
        student_id: student_id.clone(),
        amount,
        date,
        method: opt_str_param(req, "method").unwrap_or(setup.default_method),
        reference_number: reference_number.clone(),
        purpose: opt_str_param(req, "purpose"),
        term,
        processed_by: who.id.clone(),
    };
    let payment_id = payments::record_payment(ctx, &new).map_err(|e| domain_err(&req.id, &e))?;
    let balance = payments::balance(ctx.conn, &student_id).map_err(|e| domain_err(&req.id, &e))?;
    Ok(json!({
        "paymentId": payment_id,
        "referenceNumber": reference_number,
        "feeBalance": balance.fee_balance
    }))
}

fn handle_generate_reference(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    require_admin(state, req)?;
    let conn = require_db(state, req)?;
    let setup = settings::payments(conn).map_err(|e| db_err(&req.id, e))?;
    let candidate = payments::generate_reference_number(&setup.reference_prefix, chrono::Local::now());
    let in_use = payments::reference_exists(conn, &candidate).map_err(|e| db_err(&req.id, e))?;
    Ok(json!({ "referenceNumber": candidate, "inUse": in_use }))
}

fn handle_history(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let who = require_session(state, req)?;
    let conn = require_db(state, req)?;
    let student_id = match (&who.role, opt_str_param(req, "studentId")) {
        (Role::Student(_), _) => Some(who.id.clone()),
        (_, id) => id,
    };
    match &student_id {
        Some(id) if !can_see_payments(who, id) => {
            return Err(forbidden(req, "cannot view these payments"))
        }
        None if !who.is_admin() => return Err(forbidden(req, "administrators only")),
        _ => {}
    }
    let filter = PaymentFilter {
        student_id,
        from: date_param(req, "from")?,
        to: date_param(req, "to")?,
    };
    let rows = payments::payment_history(conn, &filter).map_err(|e| db_err(&req.id, e))?;
    Ok(json!({ "payments": to_json(req, &rows)? }))
}

fn handle_get_by_reference(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let who = require_session(state, req)?;
    let conn = require_db(state, req)?;
    let reference = str_param(req, "referenceNumber")?;
    let payment =
        payments::get_payment_by_reference(conn, &reference).map_err(|e| db_err(&req.id, e))?;
    match &payment {
        Some(p) if !can_see_payments(who, &p.student_id) => {
            Err(forbidden(req, "cannot view this payment"))
        }
        _ => Ok(json!({ "payment": to_json(req, &payment)? })),
    }
}

fn handle_total_paid(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let who = require_session(state, req)?;
    let conn = require_db(state, req)?;
    let student_id = opt_str_param(req, "studentId").unwrap_or_else(|| who.id.clone());
    if !can_see_payments(who, &student_id) {
        return Err(forbidden(req, "cannot view these payments"));
    }
    let total = payments::total_paid(conn, &student_id).map_err(|e| db_err(&req.id, e))?;
    Ok(json!({ "studentId": student_id, "totalPaid": total }))
}

fn handle_balance(state: &mut AppState, req: &Request) -> HandlerResult<Value> {
    let who = require_session(state, req)?;
    let conn = require_db(state, req)?;
    let student_id = opt_str_param(req, "studentId").unwrap_or_else(|| who.id.clone());
    if !can_see_payments(who, &student_id) {
        return Err(forbidden(req, "cannot view this balance"));
    }
    let balance = payments::balance(conn, &student_id).map_err(|e| domain_err(&req.id, &e))?;
    to_json(req, &balance)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "payments.record" => Some(respond(req, handle_record(state, req))),
        "payments.generateReference" => Some(respond(req, handle_generate_reference(state, req))),
        "payments.history" => Some(respond(req, handle_history(state, req))),
        "payments.getByReference" => Some(respond(req, handle_get_by_reference(state, req))),
        "payments.totalPaid" => Some(respond(req, handle_total_paid(state, req))),
        "payments.balance" => Some(respond(req, handle_balance(state, req))),
        _ => None,
    }
}
