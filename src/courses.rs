use rusqlite::{Connection, OptionalExtension, Row};
use serde::Deserialize;
use uuid::Uuid;

use crate::db;
use crate::domain::Course;
use crate::error::{DomainError, ErrorKind};
use crate::session::Ctx;

#[derive(Debug, thiserror::Error)]
pub enum CourseError {
    #[error("{0}")]
    InvalidCourse(String),
    #[error("course code already exists: {0}")]
    DuplicateCode(String),
    #[error("course not found")]
    NotFound,
    #[error("store error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl DomainError for CourseError {
    fn kind(&self) -> ErrorKind {
        match self {
            CourseError::InvalidCourse(_) => ErrorKind::Validation,
            CourseError::DuplicateCode(_) => ErrorKind::StateConflict,
            CourseError::NotFound => ErrorKind::NotFound,
            CourseError::Persistence(_) => ErrorKind::Persistence,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            CourseError::InvalidCourse(_) => "bad_params",
            CourseError::DuplicateCode(_) => "duplicate_course_code",
            CourseError::NotFound => "course_not_found",
            CourseError::Persistence(_) => "persistence_error",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseInput {
    pub code: String,
    pub name: String,
    pub credits: i64,
    pub department: String,
    pub year_level: i64,
    pub semester: i64,
    pub max_capacity: i64,
    #[serde(default)]
    pub lecturer_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CourseFilter {
    pub year_level: Option<i64>,
    pub semester: Option<i64>,
    pub active_only: bool,
}

pub(crate) const COURSE_COLUMNS: &str =
    "c.id, c.code, c.name, c.credits, c.department, c.year_level, c.semester, c.max_capacity, c.active, c.lecturer_id";

pub(crate) fn course_from_row(row: &Row<'_>) -> rusqlite::Result<Course> {
    Ok(Course {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        credits: row.get(3)?,
        department: row.get(4)?,
        year_level: row.get(5)?,
        semester: row.get(6)?,
        max_capacity: row.get(7)?,
        active: row.get::<_, i64>(8)? != 0,
        lecturer_id: row.get(9)?,
    })
}

fn validate(input: &CourseInput) -> Result<(), CourseError> {
    if input.code.trim().is_empty() {
        return Err(CourseError::InvalidCourse("code must not be empty".into()));
    }
    if input.name.trim().is_empty() {
        return Err(CourseError::InvalidCourse("name must not be empty".into()));
    }
    if input.credits <= 0 {
        return Err(CourseError::InvalidCourse("credits must be positive".into()));
    }
    if input.year_level < 1 {
        return Err(CourseError::InvalidCourse("yearLevel must be >= 1".into()));
    }
    if !(1..=3).contains(&input.semester) {
        return Err(CourseError::InvalidCourse("semester must be 1, 2 or 3".into()));
    }
    if input.max_capacity < 0 {
        return Err(CourseError::InvalidCourse("maxCapacity must be >= 0".into()));
    }
    Ok(())
}

fn ensure_lecturer(conn: &Connection, lecturer_id: Option<&str>) -> Result<(), CourseError> {
    let Some(id) = lecturer_id else {
        return Ok(());
    };
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM lecturers WHERE user_id = ?", [id], |r| {
            r.get(0)
        })
        .optional()?;
    if found.is_none() {
        return Err(CourseError::InvalidCourse(format!("unknown lecturer: {}", id)));
    }
    Ok(())
}

pub fn create_course(ctx: Ctx<'_>, input: &CourseInput) -> Result<Course, CourseError> {
    validate(input)?;
    ensure_lecturer(ctx.conn, input.lecturer_id.as_deref())?;

    let course_id = Uuid::new_v4().to_string();
    let res = ctx.conn.execute(
        "INSERT INTO courses(id, code, name, credits, department, year_level, semester, max_capacity, active, lecturer_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &course_id,
            input.code.trim(),
            input.name.trim(),
            input.credits,
            input.department.trim(),
            input.year_level,
            input.semester,
            input.max_capacity,
            input.lecturer_id.as_deref(),
        ),
    );
    match res {
        Ok(_) => {}
        Err(e) if db::is_unique_violation(&e) => {
            return Err(CourseError::DuplicateCode(input.code.trim().to_string()))
        }
        Err(e) => return Err(e.into()),
    }

    tracing::info!(course_id = %course_id, code = input.code.trim(), "course created");
    ctx.log("COURSE_CREATE", &format!("code={}", input.code.trim()));
    get_course(ctx.conn, &course_id)?.ok_or(CourseError::NotFound)
}

pub fn update_course(
    ctx: Ctx<'_>,
    course_id: &str,
    input: &CourseInput,
) -> Result<Course, CourseError> {
    validate(input)?;
    ensure_lecturer(ctx.conn, input.lecturer_id.as_deref())?;

    let res = ctx.conn.execute(
        "UPDATE courses
         SET code = ?, name = ?, credits = ?, department = ?, year_level = ?, semester = ?,
             max_capacity = ?, lecturer_id = ?
         WHERE id = ?",
        (
            input.code.trim(),
            input.name.trim(),
            input.credits,
            input.department.trim(),
            input.year_level,
            input.semester,
            input.max_capacity,
            input.lecturer_id.as_deref(),
            course_id,
        ),
    );
    let changed = match res {
        Ok(n) => n,
        Err(e) if db::is_unique_violation(&e) => {
            return Err(CourseError::DuplicateCode(input.code.trim().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    if changed == 0 {
        return Err(CourseError::NotFound);
    }

    ctx.log("COURSE_UPDATE", &format!("course={}", course_id));
    get_course(ctx.conn, course_id)?.ok_or(CourseError::NotFound)
}

pub fn set_course_active(ctx: Ctx<'_>, course_id: &str, active: bool) -> Result<(), CourseError> {
    let changed = ctx.conn.execute(
        "UPDATE courses SET active = ? WHERE id = ?",
        (active as i64, course_id),
    )?;
    if changed == 0 {
        return Err(CourseError::NotFound);
    }
    ctx.log(
        "COURSE_SET_ACTIVE",
        &format!("course={} active={}", course_id, active),
    );
    Ok(())
}

pub fn get_course(conn: &Connection, course_id: &str) -> rusqlite::Result<Option<Course>> {
    conn.query_row(
        &format!("SELECT {} FROM courses c WHERE c.id = ?", COURSE_COLUMNS),
        [course_id],
        course_from_row,
    )
    .optional()
}

pub fn list_courses(conn: &Connection, filter: &CourseFilter) -> rusqlite::Result<Vec<Course>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {}
         FROM courses c
         WHERE (?1 IS NULL OR c.year_level = ?1)
           AND (?2 IS NULL OR c.semester = ?2)
           AND (?3 = 0 OR c.active = 1)
         ORDER BY c.code",
        COURSE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(
            (filter.year_level, filter.semester, filter.active_only as i64),
            course_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
