use chrono::{DateTime, NaiveDate, TimeZone};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use uuid::Uuid;

use crate::db;
use crate::domain::{Payment, PaymentId, Term};
use crate::error::{DomainError, ErrorKind};
use crate::session::Ctx;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("amount must be greater than zero")]
    InvalidAmount,
    #[error("reference number must not be empty")]
    InvalidReference,
    #[error("student not found")]
    StudentNotFound,
    #[error("reference number already used: {0}")]
    DuplicateReference(String),
    #[error("payment could not be stored: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl DomainError for PaymentError {
    fn kind(&self) -> ErrorKind {
        match self {
            PaymentError::InvalidAmount | PaymentError::InvalidReference => ErrorKind::Validation,
            PaymentError::StudentNotFound => ErrorKind::NotFound,
            PaymentError::DuplicateReference(_) => ErrorKind::StateConflict,
            PaymentError::Persistence(_) => ErrorKind::Persistence,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            PaymentError::InvalidAmount => "invalid_amount",
            PaymentError::InvalidReference => "bad_params",
            PaymentError::StudentNotFound => "student_not_found",
            PaymentError::DuplicateReference(_) => "duplicate_reference",
            PaymentError::Persistence(_) => "persistence_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub student_id: String,
    pub amount: i64,
    pub date: NaiveDate,
    pub method: String,
    pub reference_number: String,
    pub purpose: Option<String>,
    pub term: Term,
    pub processed_by: String,
}

#[derive(Debug, Clone, Default)]
pub struct PaymentFilter {
    pub student_id: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub student_id: String,
    pub fee_balance: i64,
    pub total_paid: i64,
}

/// Stores a payment and decrements the student's fee balance.
///
/// Both writes happen in one `BEGIN IMMEDIATE` transaction: either the
/// payment row and the lower balance are both committed, or neither is.
/// The UNIQUE index on `reference_number` catches a reference claimed by
/// another process between our check and our insert.
pub fn record_payment(ctx: Ctx<'_>, payment: &NewPayment) -> Result<PaymentId, PaymentError> {
    if payment.amount <= 0 {
        return Err(PaymentError::InvalidAmount);
    }
    let reference = payment.reference_number.trim();
    if reference.is_empty() {
        return Err(PaymentError::InvalidReference);
    }

    let tx = Transaction::new_unchecked(ctx.conn, TransactionBehavior::Immediate)?;

    let current: Option<i64> = tx
        .query_row(
            "SELECT fee_balance FROM students WHERE user_id = ?",
            [&payment.student_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(current) = current else {
        return Err(PaymentError::StudentNotFound);
    };
    // SQLite would silently widen an overflowing INTEGER to REAL.
    let Some(new_balance) = current.checked_sub(payment.amount) else {
        return Err(PaymentError::InvalidAmount);
    };
    // The running total must stay summable too, or `balance` stops working.
    if total_paid(&tx, &payment.student_id)?
        .checked_add(payment.amount)
        .is_none()
    {
        return Err(PaymentError::InvalidAmount);
    }
    if reference_exists(&tx, reference)? {
        return Err(PaymentError::DuplicateReference(reference.to_string()));
    }

    let payment_id = Uuid::new_v4().to_string();
    let inserted = tx.execute(
        "INSERT INTO payments(id, student_id, amount, payment_date, method, reference_number,
                              purpose, academic_year, semester, processed_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &payment_id,
            &payment.student_id,
            payment.amount,
            payment.date.format("%Y-%m-%d").to_string(),
            payment.method.trim(),
            reference,
            payment.purpose.as_deref(),
            &payment.term.academic_year,
            payment.term.semester,
            &payment.processed_by,
            db::now_rfc3339(),
        ),
    );
    match inserted {
        Ok(_) => {}
        Err(e) if db::is_unique_violation(&e) => {
            return Err(PaymentError::DuplicateReference(reference.to_string()))
        }
        Err(e) => return Err(fail_and_rollback(tx, e)),
    }

    let updated = tx.execute(
        "UPDATE students SET fee_balance = ? WHERE user_id = ?",
        (new_balance, &payment.student_id),
    );
    match updated {
        Ok(1) => {}
        Ok(n) => {
            return Err(fail_and_rollback(
                tx,
                rusqlite::Error::StatementChangedRows(n),
            ))
        }
        Err(e) => return Err(fail_and_rollback(tx, e)),
    }
    tx.commit()?;

    tracing::info!(
        payment_id = %payment_id,
        student_id = %payment.student_id,
        amount = payment.amount,
        reference,
        "payment recorded"
    );
    ctx.log(
        "PAYMENT_RECORD",
        &format!(
            "student={} amount={} reference={}",
            payment.student_id, payment.amount, reference
        ),
    );
    Ok(payment_id)
}

fn fail_and_rollback(tx: Transaction<'_>, cause: rusqlite::Error) -> PaymentError {
    if let Err(e) = tx.rollback() {
        tracing::warn!(error = %e, "payment rollback failed");
    }
    tracing::warn!(error = %cause, "payment write failed; rolled back");
    PaymentError::Persistence(cause)
}

pub fn reference_exists(conn: &Connection, reference: &str) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM payments WHERE reference_number = ?",
            [reference],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Time-derived reference candidate such as `PAY-20260301142530-9F3A`.
/// Nothing is reserved: the caller must still check it is unused.
pub fn generate_reference_number<Tz>(prefix: &str, now: DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let suffix = Uuid::new_v4().simple().to_string()[..4].to_ascii_uppercase();
    format!("{}-{}-{}", prefix, now.format("%Y%m%d%H%M%S"), suffix)
}

/// Keeps generating until an unused reference turns up.
pub fn next_free_reference<Tz>(
    conn: &Connection,
    prefix: &str,
    now: DateTime<Tz>,
) -> rusqlite::Result<String>
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    loop {
        let candidate = generate_reference_number(prefix, now.clone());
        if !reference_exists(conn, &candidate)? {
            return Ok(candidate);
        }
    }
}

const PAYMENT_COLUMNS: &str = "id, student_id, amount, payment_date, method, reference_number, purpose, academic_year, semester, processed_by";

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        id: row.get(0)?,
        student_id: row.get(1)?,
        amount: row.get(2)?,
        date: row.get(3)?,
        method: row.get(4)?,
        reference_number: row.get(5)?,
        purpose: row.get(6)?,
        academic_year: row.get(7)?,
        semester: row.get(8)?,
        processed_by: row.get(9)?,
    })
}

pub fn get_payment_by_reference(
    conn: &Connection,
    reference: &str,
) -> rusqlite::Result<Option<Payment>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM payments WHERE reference_number = ?",
            PAYMENT_COLUMNS
        ),
        [reference.trim()],
        payment_from_row,
    )
    .optional()
}

pub fn total_paid(conn: &Connection, student_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM payments WHERE student_id = ?",
        [student_id],
        |r| r.get(0),
    )
}

pub fn balance(conn: &Connection, student_id: &str) -> Result<Balance, PaymentError> {
    let fee_balance: i64 = conn
        .query_row(
            "SELECT fee_balance FROM students WHERE user_id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or(PaymentError::StudentNotFound)?;
    Ok(Balance {
        student_id: student_id.to_string(),
        fee_balance,
        total_paid: total_paid(conn, student_id)?,
    })
}

pub fn payment_history(conn: &Connection, filter: &PaymentFilter) -> rusqlite::Result<Vec<Payment>> {
    let from = filter.from.map(|d| d.format("%Y-%m-%d").to_string());
    let to = filter.to.map(|d| d.format("%Y-%m-%d").to_string());
    let mut stmt = conn.prepare(&format!(
        "SELECT {}
         FROM payments
         WHERE (?1 IS NULL OR student_id = ?1)
           AND (?2 IS NULL OR payment_date >= ?2)
           AND (?3 IS NULL OR payment_date <= ?3)
         ORDER BY payment_date, created_at",
        PAYMENT_COLUMNS
    ))?;
    let rows = stmt
        .query_map((filter.student_id.as_deref(), from, to), payment_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::{seed_user, student_role};
    use crate::auth::NewRole;
    use chrono::Utc;

    fn new_payment(student_id: &str, admin_id: &str, amount: i64, reference: &str) -> NewPayment {
        NewPayment {
            student_id: student_id.to_string(),
            amount,
            date: NaiveDate::from_ymd_opt(2026, 2, 1).expect("date"),
            method: "BANK".to_string(),
            reference_number: reference.to_string(),
            purpose: Some("Tuition".to_string()),
            term: Term::new("2025/2026", 2),
            processed_by: admin_id.to_string(),
        }
    }

    fn fixture(conn: &Connection) -> (String, String) {
        let admin = seed_user(
            conn,
            "bursar",
            NewRole::Admin {
                admin_no: "A1".into(),
                access_level: "FULL".into(),
            },
        );
        let student = seed_user(conn, "payer", student_role("S1", 200_000));
        (student.id, admin.id)
    }

    #[test]
    fn payment_decrements_balance_and_rejects_reused_reference() {
        let conn = db::open_in_memory().expect("open");
        let ctx = Ctx::new(&conn, None);
        let (student, admin) = fixture(&conn);

        record_payment(ctx, &new_payment(&student, &admin, 50_000, "R1")).expect("record");
        let b = balance(&conn, &student).expect("balance");
        assert_eq!(b.fee_balance, 150_000);
        assert_eq!(b.total_paid, 50_000);
        let p = get_payment_by_reference(&conn, "R1").expect("get").expect("stored");
        assert_eq!(p.amount, 50_000);

        let e = record_payment(ctx, &new_payment(&student, &admin, 10_000, "R1"))
            .expect_err("duplicate");
        assert!(matches!(e, PaymentError::DuplicateReference(_)));
        assert_eq!(balance(&conn, &student).expect("balance").fee_balance, 150_000);
    }

    #[test]
    fn non_positive_amount_is_rejected() {
        let conn = db::open_in_memory().expect("open");
        let ctx = Ctx::new(&conn, None);
        let (student, admin) = fixture(&conn);
        for amount in [0, -5] {
            let e = record_payment(ctx, &new_payment(&student, &admin, amount, "R9"))
                .expect_err("amount");
            assert_eq!(e.kind(), ErrorKind::Validation);
        }
        assert_eq!(total_paid(&conn, &student).expect("total"), 0);
    }

    #[test]
    fn balance_overflow_is_rejected_without_touching_the_ledger() {
        let conn = db::open_in_memory().expect("open");
        let ctx = Ctx::new(&conn, None);
        let (student, admin) = fixture(&conn);
        conn.execute(
            "UPDATE students SET fee_balance = ? WHERE user_id = ?",
            (i64::MIN + 5, &student),
        )
        .expect("seed balance");

        let e = record_payment(ctx, &new_payment(&student, &admin, 10, "OV1"))
            .expect_err("overflow");
        assert!(matches!(e, PaymentError::InvalidAmount));
        assert!(get_payment_by_reference(&conn, "OV1").expect("get").is_none());

        let b = balance(&conn, &student).expect("balance stays an integer");
        assert_eq!(b.fee_balance, i64::MIN + 5);
        assert_eq!(b.total_paid, 0);
    }

    #[test]
    fn max_amount_payment_keeps_integer_balance() {
        let conn = db::open_in_memory().expect("open");
        let ctx = Ctx::new(&conn, None);
        let (student, admin) = fixture(&conn);
        conn.execute("UPDATE students SET fee_balance = 0 WHERE user_id = ?", [&student])
            .expect("zero balance");

        record_payment(ctx, &new_payment(&student, &admin, i64::MAX, "BIG1")).expect("big");
        let e = record_payment(ctx, &new_payment(&student, &admin, 10, "BIG2"))
            .expect_err("would overflow");
        assert!(matches!(e, PaymentError::InvalidAmount));

        assert_eq!(balance(&conn, &student).expect("balance").fee_balance, -i64::MAX);
        assert_eq!(total_paid(&conn, &student).expect("total"), i64::MAX);
        let who = crate::auth::get_identity(&conn, &student)
            .expect("identity readable")
            .expect("exists");
        assert_eq!(who.id, student);
    }

    #[test]
    fn running_total_overflow_is_rejected() {
        let conn = db::open_in_memory().expect("open");
        let ctx = Ctx::new(&conn, None);
        let (student, admin) = fixture(&conn);
        conn.execute(
            "UPDATE students SET fee_balance = ? WHERE user_id = ?",
            (i64::MAX, &student),
        )
        .expect("seed balance");

        record_payment(ctx, &new_payment(&student, &admin, i64::MAX, "T1")).expect("first");
        let e = record_payment(ctx, &new_payment(&student, &admin, 1, "T2"))
            .expect_err("total would overflow");
        assert!(matches!(e, PaymentError::InvalidAmount));
        let b = balance(&conn, &student).expect("balance");
        assert_eq!((b.fee_balance, b.total_paid), (0, i64::MAX));
    }

    #[test]
    fn failed_balance_write_rolls_back_payment_row() {
        let conn = db::open_in_memory().expect("open");
        let ctx = Ctx::new(&conn, None);
        let (student, admin) = fixture(&conn);
        conn.execute_batch(
            "CREATE TRIGGER block_balance BEFORE UPDATE OF fee_balance ON students
             BEGIN SELECT RAISE(ABORT, 'balance locked'); END;",
        )
        .expect("trigger");

        let e = record_payment(ctx, &new_payment(&student, &admin, 1_000, "R2"))
            .expect_err("blocked");
        assert_eq!(e.kind(), ErrorKind::Persistence);
        assert!(get_payment_by_reference(&conn, "R2").expect("get").is_none());
        assert_eq!(balance(&conn, &student).expect("balance").fee_balance, 200_000);
    }

    #[test]
    fn history_filters_by_student_and_date() {
        let conn = db::open_in_memory().expect("open");
        let ctx = Ctx::new(&conn, None);
        let (student, admin) = fixture(&conn);
        let mut early = new_payment(&student, &admin, 100, "H1");
        early.date = NaiveDate::from_ymd_opt(2026, 1, 5).expect("date");
        let mut late = new_payment(&student, &admin, 200, "H2");
        late.date = NaiveDate::from_ymd_opt(2026, 3, 5).expect("date");
        record_payment(ctx, &early).expect("early");
        record_payment(ctx, &late).expect("late");

        let all = payment_history(&conn, &PaymentFilter::default()).expect("all");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].reference_number, "H1");

        let from_feb = payment_history(
            &conn,
            &PaymentFilter {
                student_id: Some(student.clone()),
                from: NaiveDate::from_ymd_opt(2026, 2, 1),
                to: None,
            },
        )
        .expect("filtered");
        assert_eq!(from_feb.len(), 1);
        assert_eq!(from_feb[0].reference_number, "H2");

        let other = payment_history(
            &conn,
            &PaymentFilter {
                student_id: Some("someone-else".into()),
                ..Default::default()
            },
        )
        .expect("other");
        assert!(other.is_empty());
    }

    #[test]
    fn generated_reference_is_time_derived() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 14, 25, 30).single().expect("time");
        let r = generate_reference_number("PAY", now);
        assert!(r.starts_with("PAY-20260301142530-"), "{}", r);
        assert_eq!(r.len(), "PAY-20260301142530-".len() + 4);

        let conn = db::open_in_memory().expect("open");
        let free = next_free_reference(&conn, "PAY", now).expect("free");
        assert!(!reference_exists(&conn, &free).expect("exists"));
    }
}
