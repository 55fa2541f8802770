use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use uuid::Uuid;

use crate::db;
use crate::domain::{Grade, RegistrationStatus, Term};
use crate::enrollment;
use crate::error::{DomainError, ErrorKind};
use crate::session::Ctx;

pub const MAX_COURSEWORK: f64 = 40.0;
pub const MAX_EXAM: f64 = 60.0;

#[derive(Debug, thiserror::Error)]
pub enum GradeError {
    #[error("marks out of range: coursework must be 0..=40 and exam 0..=60")]
    OutOfRangeMarks,
    #[error("registration not found")]
    RegistrationNotFound,
    #[error("registration was dropped")]
    RegistrationDropped,
    #[error("store error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl DomainError for GradeError {
    fn kind(&self) -> ErrorKind {
        match self {
            GradeError::OutOfRangeMarks => ErrorKind::Validation,
            GradeError::RegistrationNotFound => ErrorKind::NotFound,
            GradeError::RegistrationDropped => ErrorKind::StateConflict,
            GradeError::Persistence(_) => ErrorKind::Persistence,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            GradeError::OutOfRangeMarks => "out_of_range_marks",
            GradeError::RegistrationNotFound => "registration_not_found",
            GradeError::RegistrationDropped => "registration_dropped",
            GradeError::Persistence(_) => "persistence_error",
        }
    }
}

/// Letter grade and grade points for a total mark out of 100.
pub fn grade_for_total(total: f64) -> (&'static str, f64) {
    if total >= 90.0 {
        ("A", 5.0)
    } else if total >= 80.0 {
        ("B", 4.0)
    } else if total >= 70.0 {
        ("C", 3.0)
    } else if total >= 60.0 {
        ("D", 2.0)
    } else if total >= 50.0 {
        ("E", 1.0)
    } else {
        ("F", 0.0)
    }
}

/// Degree standing for a GPA on the 5-point scale.
pub fn standing_for_gpa(gpa: f64) -> &'static str {
    if gpa >= 4.5 {
        "First Class"
    } else if gpa >= 3.6 {
        "Second Upper"
    } else if gpa >= 3.0 {
        "Second Lower"
    } else if gpa >= 2.5 {
        "Pass"
    } else {
        "Retake"
    }
}

fn marks_in_range(coursework: f64, exam: f64) -> bool {
    coursework.is_finite()
        && exam.is_finite()
        && (0.0..=MAX_COURSEWORK).contains(&coursework)
        && (0.0..=MAX_EXAM).contains(&exam)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

const GRADE_COLUMNS: &str = "g.id, g.registration_id, g.coursework_marks, g.exam_marks, g.total_marks, g.letter_grade, g.grade_points, g.remarks, g.graded_by";

fn grade_from_row(row: &Row<'_>) -> rusqlite::Result<Grade> {
    Ok(Grade {
        id: row.get(0)?,
        registration_id: row.get(1)?,
        coursework_marks: row.get(2)?,
        exam_marks: row.get(3)?,
        total_marks: row.get(4)?,
        letter_grade: row.get(5)?,
        grade_points: row.get(6)?,
        remarks: row.get(7)?,
        graded_by: row.get(8)?,
    })
}

/// Records marks for a registration. Resubmitting for the same registration
/// overwrites the earlier grade, so identical uploads converge to one row.
pub fn upload_grade(
    ctx: Ctx<'_>,
    registration_id: &str,
    coursework: f64,
    exam: f64,
    grader_id: &str,
    remarks: Option<&str>,
) -> Result<Grade, GradeError> {
    if !marks_in_range(coursework, exam) {
        return Err(GradeError::OutOfRangeMarks);
    }
    let total = coursework + exam;
    let (letter, points) = grade_for_total(total);
    let remarks = remarks.map(str::trim).filter(|s| !s.is_empty());

    // Status is read under the write lock so a concurrent drop cannot slip in
    // between the check and the upsert.
    let tx = Transaction::new_unchecked(ctx.conn, TransactionBehavior::Immediate)?;
    let registration = enrollment::get_registration(&tx, registration_id)?
        .ok_or(GradeError::RegistrationNotFound)?;
    if registration.status == RegistrationStatus::Dropped {
        return Err(GradeError::RegistrationDropped);
    }
    tx.execute(
        "INSERT INTO grades(id, registration_id, coursework_marks, exam_marks, total_marks,
                            letter_grade, grade_points, remarks, graded_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(registration_id) DO UPDATE SET
           coursework_marks = excluded.coursework_marks,
           exam_marks = excluded.exam_marks,
           total_marks = excluded.total_marks,
           letter_grade = excluded.letter_grade,
           grade_points = excluded.grade_points,
           remarks = excluded.remarks,
           graded_by = excluded.graded_by,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            registration_id,
            coursework,
            exam,
            total,
            letter,
            points,
            remarks,
            grader_id,
            db::now_rfc3339(),
        ),
    )?;
    let gpa = compute_gpa(&tx, &registration.student_id)?;
    tx.execute(
        "UPDATE students SET gpa = ? WHERE user_id = ?",
        (gpa, &registration.student_id),
    )?;
    tx.commit()?;

    tracing::info!(
        registration_id,
        total,
        letter,
        student_gpa = gpa,
        "grade uploaded"
    );
    ctx.log(
        "GRADE_UPLOAD",
        &format!(
            "registration={} total={} letter={}",
            registration_id, total, letter
        ),
    );

    get_grade(ctx.conn, registration_id)?.ok_or(GradeError::RegistrationNotFound)
}

pub fn get_grade(conn: &Connection, registration_id: &str) -> rusqlite::Result<Option<Grade>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM grades g WHERE g.registration_id = ?",
            GRADE_COLUMNS
        ),
        [registration_id],
        grade_from_row,
    )
    .optional()
}

/// Credit-weighted mean grade points over graded, non-dropped registrations.
pub fn compute_gpa(conn: &Connection, student_id: &str) -> rusqlite::Result<f64> {
    let (weighted, credits): (f64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(g.grade_points * c.credits), 0), COALESCE(SUM(c.credits), 0)
         FROM grades g
         JOIN course_registrations r ON r.id = g.registration_id
         JOIN courses c ON c.id = r.course_id
         WHERE r.student_id = ? AND r.status != 'DROPPED'",
        [student_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    if credits == 0 {
        return Ok(0.0);
    }
    Ok(round2(weighted / credits as f64))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeLine {
    pub course_code: String,
    pub course_name: String,
    pub credits: i64,
    pub academic_year: String,
    pub semester: i64,
    #[serde(flatten)]
    pub grade: Grade,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub student_id: String,
    pub lines: Vec<GradeLine>,
    pub gpa: f64,
    pub standing: &'static str,
}

pub fn grades_for_student(conn: &Connection, student_id: &str) -> rusqlite::Result<Vec<GradeLine>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {}, c.code, c.name, c.credits, r.academic_year, r.semester
         FROM grades g
         JOIN course_registrations r ON r.id = g.registration_id
         JOIN courses c ON c.id = r.course_id
         WHERE r.student_id = ? AND r.status != 'DROPPED'
         ORDER BY r.academic_year, r.semester, c.code",
        GRADE_COLUMNS
    ))?;
    let rows = stmt
        .query_map([student_id], |row| {
            Ok(GradeLine {
                grade: grade_from_row(row)?,
                course_code: row.get(9)?,
                course_name: row.get(10)?,
                credits: row.get(11)?,
                academic_year: row.get(12)?,
                semester: row.get(13)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseGradeRow {
    pub student_id: String,
    pub student_no: String,
    pub name: String,
    pub registration_id: String,
    pub grade: Option<Grade>,
}

/// Every non-dropped registration on a course for a term, graded or not.
pub fn grades_for_course(
    conn: &Connection,
    course_id: &str,
    term: &Term,
) -> rusqlite::Result<Vec<CourseGradeRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {}, r.id, r.student_id, s.student_no, u.full_name
         FROM course_registrations r
         JOIN students s ON s.user_id = r.student_id
         JOIN users u ON u.id = r.student_id
         LEFT JOIN grades g ON g.registration_id = r.id
         WHERE r.course_id = ? AND r.academic_year = ? AND r.semester = ?
           AND r.status != 'DROPPED'
         ORDER BY s.student_no",
        GRADE_COLUMNS
    ))?;
    let rows = stmt
        .query_map((course_id, &term.academic_year, term.semester), |row| {
            let graded: Option<String> = row.get(0)?;
            Ok(CourseGradeRow {
                registration_id: row.get(9)?,
                student_id: row.get(10)?,
                student_no: row.get(11)?,
                name: row.get(12)?,
                grade: match graded {
                    Some(_) => Some(grade_from_row(row)?),
                    None => None,
                },
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn transcript(conn: &Connection, student_id: &str) -> rusqlite::Result<Transcript> {
    let lines = grades_for_student(conn, student_id)?;
    let gpa = compute_gpa(conn, student_id)?;
    Ok(Transcript {
        student_id: student_id.to_string(),
        lines,
        gpa,
        standing: standing_for_gpa(gpa),
    })
}
