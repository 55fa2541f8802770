use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use uuid::Uuid;

use crate::courses::{self, course_from_row, COURSE_COLUMNS};
use crate::db;
use crate::domain::{Course, Registration, RegistrationId, RegistrationStatus, Term};
use crate::error::{DomainError, ErrorKind};
use crate::session::Ctx;

#[derive(Debug, thiserror::Error)]
pub enum EnrollError {
    #[error("course not found")]
    CourseNotFound,
    #[error("course is not open for registration")]
    CourseInactive,
    #[error("student not found")]
    StudentNotFound,
    #[error("student account is inactive")]
    StudentInactive,
    #[error("already registered for this course in {0}")]
    DuplicateRegistration(Term),
    #[error("course is full ({capacity} places)")]
    CourseFull { capacity: i64 },
    #[error("store error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl DomainError for EnrollError {
    fn kind(&self) -> ErrorKind {
        match self {
            EnrollError::CourseNotFound | EnrollError::StudentNotFound => ErrorKind::NotFound,
            EnrollError::CourseInactive
            | EnrollError::StudentInactive
            | EnrollError::DuplicateRegistration(_)
            | EnrollError::CourseFull { .. } => ErrorKind::StateConflict,
            EnrollError::Persistence(_) => ErrorKind::Persistence,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            EnrollError::CourseNotFound => "course_not_found",
            EnrollError::CourseInactive => "course_inactive",
            EnrollError::StudentNotFound => "student_not_found",
            EnrollError::StudentInactive => "student_inactive",
            EnrollError::DuplicateRegistration(_) => "duplicate_registration",
            EnrollError::CourseFull { .. } => "course_full",
            EnrollError::Persistence(_) => "persistence_error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DropError {
    #[error("registration does not exist, belongs to another student, or is not active")]
    InvalidRegistration,
    #[error("store error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl DomainError for DropError {
    fn kind(&self) -> ErrorKind {
        match self {
            DropError::InvalidRegistration => ErrorKind::StateConflict,
            DropError::Persistence(_) => ErrorKind::Persistence,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            DropError::InvalidRegistration => "invalid_registration",
            DropError::Persistence(_) => "persistence_error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableCourse {
    #[serde(flatten)]
    pub course: Course,
    pub enrolled: i64,
    pub seats_left: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrolledStudent {
    pub registration_id: RegistrationId,
    pub student_id: String,
    pub student_no: String,
    pub name: String,
    pub program: String,
    pub status: RegistrationStatus,
}

fn registered_count(conn: &Connection, course_id: &str, term: &Term) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM course_registrations
         WHERE course_id = ? AND academic_year = ? AND semester = ? AND status = 'REGISTERED'",
        (course_id, &term.academic_year, term.semester),
        |r| r.get(0),
    )
}

/// Registers a student for a course in a term.
///
/// The course check, duplicate check, capacity count and insert all run in
/// one `BEGIN IMMEDIATE` transaction. That takes the database write lock up
/// front, so two sidecars sharing the workspace cannot both pass the
/// capacity check before either inserts. The partial unique index on live
/// registrations backs up the duplicate check.
pub fn register(
    ctx: Ctx<'_>,
    student_id: &str,
    course_id: &str,
    term: &Term,
) -> Result<RegistrationId, EnrollError> {
    let tx = Transaction::new_unchecked(ctx.conn, TransactionBehavior::Immediate)?;

    let course = courses::get_course(&tx, course_id)?.ok_or(EnrollError::CourseNotFound)?;
    if !course.active {
        return Err(EnrollError::CourseInactive);
    }

    let status: Option<String> = tx
        .query_row(
            "SELECT status FROM students WHERE user_id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()?;
    match status.as_deref() {
        None => return Err(EnrollError::StudentNotFound),
        Some("ACTIVE") => {}
        Some(_) => return Err(EnrollError::StudentInactive),
    }

    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM course_registrations
             WHERE student_id = ? AND course_id = ? AND academic_year = ? AND semester = ?
               AND status = 'REGISTERED'",
            (student_id, course_id, &term.academic_year, term.semester),
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(EnrollError::DuplicateRegistration(term.clone()));
    }

    let enrolled = registered_count(&tx, course_id, term)?;
    if enrolled >= course.max_capacity {
        return Err(EnrollError::CourseFull {
            capacity: course.max_capacity,
        });
    }

    let registration_id = Uuid::new_v4().to_string();
    let res = tx.execute(
        "INSERT INTO course_registrations(id, student_id, course_id, academic_year, semester, status, registered_at)
         VALUES(?, ?, ?, ?, ?, 'REGISTERED', ?)",
        (
            &registration_id,
            student_id,
            course_id,
            &term.academic_year,
            term.semester,
            db::now_rfc3339(),
        ),
    );
    match res {
        Ok(_) => {}
        Err(e) if db::is_unique_violation(&e) => {
            return Err(EnrollError::DuplicateRegistration(term.clone()))
        }
        Err(e) => return Err(e.into()),
    }
    tx.commit()?;

    tracing::info!(
        registration_id = %registration_id,
        student_id,
        course = %course.code,
        term = %term,
        "course registration created"
    );
    ctx.log(
        "COURSE_REGISTER",
        &format!(
            "student={} course={} term={}",
            student_id, course.code, term
        ),
    );
    Ok(registration_id)
}

/// Marks a live registration DROPPED. Dropped rows are kept and cannot be
/// revived through this path.
pub fn drop(ctx: Ctx<'_>, registration_id: &str, student_id: &str) -> Result<(), DropError> {
    // The status guard makes a concurrent double-drop change at most one row.
    let changed = ctx.conn.execute(
        "UPDATE course_registrations
         SET status = 'DROPPED', updated_at = ?
         WHERE id = ? AND student_id = ? AND status = 'REGISTERED'",
        (db::now_rfc3339(), registration_id, student_id),
    )?;
    if changed == 0 {
        return Err(DropError::InvalidRegistration);
    }

    tracing::info!(registration_id, student_id, "course registration dropped");
    ctx.log(
        "COURSE_DROP",
        &format!("registration={} student={}", registration_id, student_id),
    );
    Ok(())
}

/// Closes a course's term: every live registration becomes COMPLETED.
/// Returns how many rows moved.
pub fn complete_term(ctx: Ctx<'_>, course_id: &str, term: &Term) -> Result<usize, EnrollError> {
    if courses::get_course(ctx.conn, course_id)?.is_none() {
        return Err(EnrollError::CourseNotFound);
    }
    let changed = ctx.conn.execute(
        "UPDATE course_registrations
         SET status = 'COMPLETED', updated_at = ?
         WHERE course_id = ? AND academic_year = ? AND semester = ? AND status = 'REGISTERED'",
        (db::now_rfc3339(), course_id, &term.academic_year, term.semester),
    )?;
    tracing::info!(course_id, term = %term, completed = changed, "term closed");
    ctx.log(
        "TERM_COMPLETE",
        &format!("course={} term={} rows={}", course_id, term, changed),
    );
    Ok(changed)
}

pub fn available_courses(
    conn: &Connection,
    year_level: i64,
    semester: i64,
    term: &Term,
) -> rusqlite::Result<Vec<AvailableCourse>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {},
           (SELECT COUNT(*) FROM course_registrations r
            WHERE r.course_id = c.id AND r.academic_year = ? AND r.semester = ?
              AND r.status = 'REGISTERED') AS enrolled
         FROM courses c
         WHERE c.active = 1 AND c.year_level = ? AND c.semester = ?
         ORDER BY c.code",
        COURSE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(
            (&term.academic_year, term.semester, year_level, semester),
            |row| {
                let course = course_from_row(row)?;
                let enrolled: i64 = row.get(10)?;
                let seats_left = (course.max_capacity - enrolled).max(0);
                Ok(AvailableCourse {
                    course,
                    enrolled,
                    seats_left,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn registration_from_row(row: &Row<'_>) -> rusqlite::Result<Registration> {
    let status: String = row.get(7)?;
    Ok(Registration {
        id: row.get(0)?,
        student_id: row.get(1)?,
        course_id: row.get(2)?,
        course_code: row.get(3)?,
        course_name: row.get(4)?,
        academic_year: row.get(5)?,
        semester: row.get(6)?,
        status: RegistrationStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                rusqlite::types::Type::Text,
                format!("unknown registration status: {}", status).into(),
            )
        })?,
        registered_at: row.get(8)?,
    })
}

pub fn get_registration(
    conn: &Connection,
    registration_id: &str,
) -> rusqlite::Result<Option<Registration>> {
    conn.query_row(
        "SELECT r.id, r.student_id, r.course_id, c.code, c.name, r.academic_year, r.semester,
                r.status, r.registered_at
         FROM course_registrations r
         JOIN courses c ON c.id = r.course_id
         WHERE r.id = ?",
        [registration_id],
        registration_from_row,
    )
    .optional()
}

/// A student's registrations; all terms when `term` is `None`.
pub fn student_registrations(
    conn: &Connection,
    student_id: &str,
    term: Option<&Term>,
) -> rusqlite::Result<Vec<Registration>> {
    let mut stmt = conn.prepare(
        "SELECT r.id, r.student_id, r.course_id, c.code, c.name, r.academic_year, r.semester,
                r.status, r.registered_at
         FROM course_registrations r
         JOIN courses c ON c.id = r.course_id
         WHERE r.student_id = ?1
           AND (?2 IS NULL OR r.academic_year = ?2)
           AND (?3 IS NULL OR r.semester = ?3)
         ORDER BY r.academic_year, r.semester, c.code, r.registered_at",
    )?;
    let rows = stmt
        .query_map(
            (
                student_id,
                term.map(|t| t.academic_year.as_str()),
                term.map(|t| t.semester),
            ),
            registration_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Students currently REGISTERED on a course for a term.
pub fn course_enrollments(
    conn: &Connection,
    course_id: &str,
    term: &Term,
) -> rusqlite::Result<Vec<EnrolledStudent>> {
    let mut stmt = conn.prepare(
        "SELECT r.id, r.student_id, s.student_no, u.full_name, s.program, r.status
         FROM course_registrations r
         JOIN students s ON s.user_id = r.student_id
         JOIN users u ON u.id = r.student_id
         WHERE r.course_id = ? AND r.academic_year = ? AND r.semester = ?
           AND r.status = 'REGISTERED'
         ORDER BY s.student_no",
    )?;
    let rows = stmt
        .query_map((course_id, &term.academic_year, term.semester), |row| {
            Ok(EnrolledStudent {
                registration_id: row.get(0)?,
                student_id: row.get(1)?,
                student_no: row.get(2)?,
                name: row.get(3)?,
                program: row.get(4)?,
                status: RegistrationStatus::Registered,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::tests::{seed_user, student_role};
    use crate::courses::tests::course_input;
    use crate::courses::create_course;

    fn term() -> Term {
        Term::new("2025/2026", 1)
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let conn = db::open_in_memory().expect("open");
        let ctx = Ctx::new(&conn, None);
        let course = create_course(ctx, &course_input("CS101", 2)).expect("course");
        let students: Vec<_> = (0..3)
            .map(|i| seed_user(&conn, &format!("s{}", i), student_role(&format!("S{}", i), 0)))
            .collect();

        let results: Vec<_> = students
            .iter()
            .map(|s| register(ctx, &s.id, &course.id, &term()))
            .collect();
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(
            results[2],
            Err(EnrollError::CourseFull { capacity: 2 })
        ));
        assert_eq!(registered_count(&conn, &course.id, &term()).expect("count"), 2);
    }

    #[test]
    fn duplicate_registration_leaves_one_live_row() {
        let conn = db::open_in_memory().expect("open");
        let ctx = Ctx::new(&conn, None);
        let course = create_course(ctx, &course_input("CS102", 10)).expect("course");
        let s = seed_user(&conn, "dup", student_role("S10", 0));

        register(ctx, &s.id, &course.id, &term()).expect("first");
        let e = register(ctx, &s.id, &course.id, &term()).expect_err("second");
        assert_eq!(e.code(), "duplicate_registration");
        assert_eq!(registered_count(&conn, &course.id, &term()).expect("count"), 1);

        // A different term is a different tuple.
        register(ctx, &s.id, &course.id, &Term::new("2025/2026", 2)).expect("other term");
    }

    #[test]
    fn missing_or_inactive_course_is_rejected() {
        let conn = db::open_in_memory().expect("open");
        let ctx = Ctx::new(&conn, None);
        let s = seed_user(&conn, "x", student_role("S20", 0));
        let e = register(ctx, &s.id, "nope", &term()).expect_err("missing");
        assert!(matches!(e, EnrollError::CourseNotFound));

        let course = create_course(ctx, &course_input("CS103", 10)).expect("course");
        courses::set_course_active(ctx, &course.id, false).expect("deactivate");
        let e = register(ctx, &s.id, &course.id, &term()).expect_err("inactive");
        assert!(matches!(e, EnrollError::CourseInactive));
    }

    #[test]
    fn deactivated_student_cannot_register() {
        let conn = db::open_in_memory().expect("open");
        let ctx = Ctx::new(&conn, None);
        let s = seed_user(&conn, "y", student_role("S21", 0));
        let course = create_course(ctx, &course_input("CS105", 10)).expect("course");
        crate::auth::set_user_active(ctx, &s.id, false).expect("deactivate");

        let e = register(ctx, &s.id, &course.id, &term()).expect_err("inactive student");
        assert!(matches!(e, EnrollError::StudentInactive));
        assert_eq!(registered_count(&conn, &course.id, &term()).expect("count"), 0);
    }

    #[test]
    fn drop_is_terminal_and_owner_checked() {
        let conn = db::open_in_memory().expect("open");
        let ctx = Ctx::new(&conn, None);
        let course = create_course(ctx, &course_input("CS104", 1)).expect("course");
        let a = seed_user(&conn, "a", student_role("S30", 0));
        let b = seed_user(&conn, "b", student_role("S31", 0));
        let reg = register(ctx, &a.id, &course.id, &term()).expect("register");

        let e = drop(ctx, &reg, &b.id).expect_err("not owner");
        assert!(matches!(e, DropError::InvalidRegistration));

        drop(ctx, &reg, &a.id).expect("drop");
        let e = drop(ctx, &reg, &a.id).expect_err("already dropped");
        assert!(matches!(e, DropError::InvalidRegistration));
        let r = get_registration(&conn, &reg).expect("get").expect("row kept");
        assert_eq!(r.status, RegistrationStatus::Dropped);

        // The freed seat can be taken, and the dropped student may register again.
        register(ctx, &b.id, &course.id, &term()).expect("seat freed");
        drop(ctx, &student_registrations(&conn, &b.id, None).expect("list")[0].id, &b.id)
            .expect("drop b");
        register(ctx, &a.id, &course.id, &term()).expect("re-register");
    }

    #[test]
    fn projections_reflect_current_rows() {
        let conn = db::open_in_memory().expect("open");
        let ctx = Ctx::new(&conn, None);
        let course = create_course(ctx, &course_input("CS105", 3)).expect("course");
        let s = seed_user(&conn, "p", student_role("S40", 0));
        register(ctx, &s.id, &course.id, &term()).expect("register");

        let avail = available_courses(&conn, 1, 1, &term()).expect("available");
        assert_eq!(avail.len(), 1);
        assert_eq!(avail[0].enrolled, 1);
        assert_eq!(avail[0].seats_left, 2);

        let mine = student_registrations(&conn, &s.id, Some(&term())).expect("mine");
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].course_code, "CS105");

        let roster = course_enrollments(&conn, &course.id, &term()).expect("roster");
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].student_no, "S40");

        assert_eq!(complete_term(ctx, &course.id, &term()).expect("complete"), 1);
        assert!(course_enrollments(&conn, &course.id, &term())
            .expect("roster")
            .is_empty());
    }
}
