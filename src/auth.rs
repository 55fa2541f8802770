use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db;
use crate::domain::{
    AdminProfile, Contact, Identity, LecturerProfile, Role, StudentProfile,
};
use crate::error::{DomainError, ErrorKind};
use crate::session::Ctx;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("sign in first")]
    NotAuthenticated,
    #[error("not permitted: {0}")]
    Forbidden(&'static str),
    #[error("store error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl DomainError for AuthError {
    fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Persistence(_) => ErrorKind::Persistence,
            _ => ErrorKind::Authentication,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::NotAuthenticated => "not_authenticated",
            AuthError::Forbidden(_) => "forbidden",
            AuthError::Persistence(_) => "persistence_error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("password must be at least {min} characters")]
    WeakPassword { min: usize },
    #[error("username already taken: {0}")]
    DuplicateUsername(String),
    #[error("role number already in use: {0}")]
    DuplicateRoleNumber(String),
    #[error("user not found")]
    NotFound,
    #[error("current password is incorrect")]
    WrongPassword,
    #[error("store error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl DomainError for UserError {
    fn kind(&self) -> ErrorKind {
        match self {
            UserError::InvalidInput(_) | UserError::WeakPassword { .. } => ErrorKind::Validation,
            UserError::DuplicateUsername(_) | UserError::DuplicateRoleNumber(_) => {
                ErrorKind::StateConflict
            }
            UserError::NotFound => ErrorKind::NotFound,
            UserError::WrongPassword => ErrorKind::Authentication,
            UserError::Persistence(_) => ErrorKind::Persistence,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            UserError::InvalidInput(_) => "bad_params",
            UserError::WeakPassword { .. } => "weak_password",
            UserError::DuplicateUsername(_) => "duplicate_username",
            UserError::DuplicateRoleNumber(_) => "duplicate_role_number",
            UserError::NotFound => "not_found",
            UserError::WrongPassword => "invalid_credentials",
            UserError::Persistence(_) => "persistence_error",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NewRole {
    Student {
        student_no: String,
        program: String,
        year_of_study: i64,
        semester: i64,
        #[serde(default)]
        fee_balance: i64,
    },
    Lecturer {
        lecturer_no: String,
        department: String,
    },
    Admin {
        admin_no: String,
        #[serde(default = "default_access_level")]
        access_level: String,
    },
}

fn default_access_level() -> String {
    "FULL".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub name: String,
    #[serde(default)]
    pub contact: Contact,
    pub role: NewRole,
}

pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn user_count(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
}

pub fn create_user(
    ctx: Ctx<'_>,
    new: &NewUser,
    min_password_length: usize,
) -> Result<Identity, UserError> {
    let username = new.username.trim();
    let name = new.name.trim();
    if username.is_empty() {
        return Err(UserError::InvalidInput("username must not be empty".into()));
    }
    if name.is_empty() {
        return Err(UserError::InvalidInput("name must not be empty".into()));
    }
    if new.password.chars().count() < min_password_length {
        return Err(UserError::WeakPassword {
            min: min_password_length,
        });
    }
    let role_no = match &new.role {
        NewRole::Student {
            student_no,
            year_of_study,
            semester,
            fee_balance,
            ..
        } => {
            if *year_of_study < 1 || !(1..=3).contains(semester) {
                return Err(UserError::InvalidInput(
                    "yearOfStudy must be >= 1 and semester in 1..=3".into(),
                ));
            }
            if *fee_balance < 0 {
                return Err(UserError::InvalidInput("feeBalance must not be negative".into()));
            }
            student_no
        }
        NewRole::Lecturer { lecturer_no, .. } => lecturer_no,
        NewRole::Admin { admin_no, .. } => admin_no,
    };
    if role_no.trim().is_empty() {
        return Err(UserError::InvalidInput("role number must not be empty".into()));
    }

    let conn = ctx.conn;
    let taken: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE username = ?", [username], |r| {
            r.get(0)
        })
        .optional()?;
    if taken.is_some() {
        return Err(UserError::DuplicateUsername(username.to_string()));
    }

    let user_id = Uuid::new_v4().to_string();
    let salt = Uuid::new_v4().simple().to_string();
    let hash = hash_password(&new.password, &salt);
    let role_tag = match &new.role {
        NewRole::Student { .. } => "STUDENT",
        NewRole::Lecturer { .. } => "LECTURER",
        NewRole::Admin { .. } => "ADMIN",
    };

    let tx = conn.unchecked_transaction()?;
    let inserted = tx.execute(
        "INSERT INTO users(id, username, password_hash, password_salt, full_name, email, phone, role, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &user_id,
            username,
            &hash,
            &salt,
            name,
            new.contact.email.as_deref(),
            new.contact.phone.as_deref(),
            role_tag,
            db::now_rfc3339(),
        ),
    );
    if let Err(e) = inserted {
        let _ = tx.rollback();
        if db::is_unique_violation(&e) {
            return Err(UserError::DuplicateUsername(username.to_string()));
        }
        return Err(e.into());
    }

    let role_row = match &new.role {
        NewRole::Student {
            student_no,
            program,
            year_of_study,
            semester,
            fee_balance,
        } => tx.execute(
            "INSERT INTO students(user_id, student_no, program, year_of_study, semester, fee_balance, gpa, status)
             VALUES(?, ?, ?, ?, ?, ?, 0, 'ACTIVE')",
            (
                &user_id,
                student_no.trim(),
                program.trim(),
                year_of_study,
                semester,
                fee_balance,
            ),
        ),
        NewRole::Lecturer {
            lecturer_no,
            department,
        } => tx.execute(
            "INSERT INTO lecturers(user_id, lecturer_no, department, status) VALUES(?, ?, ?, 'ACTIVE')",
            (&user_id, lecturer_no.trim(), department.trim()),
        ),
        NewRole::Admin {
            admin_no,
            access_level,
        } => tx.execute(
            "INSERT INTO admins(user_id, admin_no, access_level) VALUES(?, ?, ?)",
            (&user_id, admin_no.trim(), access_level.trim()),
        ),
    };
    if let Err(e) = role_row {
        let _ = tx.rollback();
        if db::is_unique_violation(&e) {
            return Err(UserError::DuplicateRoleNumber(role_no.trim().to_string()));
        }
        return Err(e.into());
    }
    tx.commit()?;

    tracing::info!(user_id = %user_id, role = role_tag, "user created");
    ctx.log(
        "USER_CREATE",
        &format!("username={} role={}", username, role_tag),
    );

    get_identity(conn, &user_id)?.ok_or(UserError::NotFound)
}

/// Resolves credentials to a role-tagged identity. The error never says
/// which of username or password was wrong.
pub fn login(conn: &Connection, username: &str, password: &str) -> Result<Identity, AuthError> {
    let row: Option<(String, String, String, bool)> = conn
        .query_row(
            "SELECT id, password_hash, password_salt, active FROM users WHERE username = ?",
            [username.trim()],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get::<_, i64>(3)? != 0)),
        )
        .optional()?;

    let matched = match &row {
        Some((_, hash, salt, active)) => *active && hash_password(password, salt) == *hash,
        None => false,
    };
    let Some((user_id, ..)) = row.filter(|_| matched) else {
        tracing::info!("login rejected");
        crate::activity::log_action(
            conn,
            None,
            "LOGIN_FAILED",
            &format!("username={}", username.trim()),
        );
        return Err(AuthError::InvalidCredentials);
    };

    let identity = get_identity(conn, &user_id)?.ok_or(AuthError::InvalidCredentials)?;
    tracing::info!(user_id = %identity.id, role = identity.role.tag(), "login accepted");
    crate::activity::log_action(conn, Some(&identity.id), "LOGIN", "login succeeded");
    Ok(identity)
}

pub fn change_password(
    ctx: Ctx<'_>,
    user_id: &str,
    current: &str,
    new_password: &str,
    min_password_length: usize,
) -> Result<(), UserError> {
    let row: Option<(String, String)> = ctx
        .conn
        .query_row(
            "SELECT password_hash, password_salt FROM users WHERE id = ?",
            [user_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((hash, salt)) = row else {
        return Err(UserError::NotFound);
    };
    if hash_password(current, &salt) != hash {
        return Err(UserError::WrongPassword);
    }
    if new_password.chars().count() < min_password_length {
        return Err(UserError::WeakPassword {
            min: min_password_length,
        });
    }
    let new_salt = Uuid::new_v4().simple().to_string();
    ctx.conn.execute(
        "UPDATE users SET password_hash = ?, password_salt = ? WHERE id = ?",
        (hash_password(new_password, &new_salt), &new_salt, user_id),
    )?;
    ctx.log("PASSWORD_CHANGE", &format!("user={}", user_id));
    Ok(())
}

/// Enables or disables an account. A disabled account cannot sign in, and
/// the student or lecturer profile status follows the flag.
pub fn set_user_active(ctx: Ctx<'_>, user_id: &str, active: bool) -> Result<Identity, UserError> {
    if !active && ctx.actor_id() == Some(user_id) {
        return Err(UserError::InvalidInput(
            "cannot deactivate your own account".into(),
        ));
    }
    let status = if active { "ACTIVE" } else { "INACTIVE" };

    let tx = ctx.conn.unchecked_transaction()?;
    let changed = tx.execute(
        "UPDATE users SET active = ? WHERE id = ?",
        (active as i64, user_id),
    )?;
    if changed == 0 {
        return Err(UserError::NotFound);
    }
    tx.execute(
        "UPDATE students SET status = ? WHERE user_id = ?",
        (status, user_id),
    )?;
    tx.execute(
        "UPDATE lecturers SET status = ? WHERE user_id = ?",
        (status, user_id),
    )?;
    tx.commit()?;

    tracing::info!(user_id, active, "account status changed");
    ctx.log(
        "USER_SET_ACTIVE",
        &format!("user={} active={}", user_id, active),
    );
    get_identity(ctx.conn, user_id)?.ok_or(UserError::NotFound)
}

pub fn get_identity(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<Identity>> {
    let base: Option<(String, String, Option<String>, Option<String>, String)> = conn
        .query_row(
            "SELECT username, full_name, email, phone, role FROM users WHERE id = ?",
            [user_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?;
    let Some((username, name, email, phone, role_tag)) = base else {
        return Ok(None);
    };

    let role = match role_tag.as_str() {
        "STUDENT" => conn
            .query_row(
                "SELECT student_no, program, year_of_study, semester, fee_balance, gpa, status
                 FROM students WHERE user_id = ?",
                [user_id],
                |r| {
                    Ok(Role::Student(StudentProfile {
                        student_no: r.get(0)?,
                        program: r.get(1)?,
                        year_of_study: r.get(2)?,
                        semester: r.get(3)?,
                        fee_balance: r.get(4)?,
                        gpa: r.get(5)?,
                        status: r.get(6)?,
                    }))
                },
            )
            .optional()?,
        "LECTURER" => conn
            .query_row(
                "SELECT lecturer_no, department, status FROM lecturers WHERE user_id = ?",
                [user_id],
                |r| {
                    Ok(Role::Lecturer(LecturerProfile {
                        lecturer_no: r.get(0)?,
                        department: r.get(1)?,
                        status: r.get(2)?,
                    }))
                },
            )
            .optional()?,
        "ADMIN" => conn
            .query_row(
                "SELECT admin_no, access_level FROM admins WHERE user_id = ?",
                [user_id],
                |r| {
                    Ok(Role::Admin(AdminProfile {
                        admin_no: r.get(0)?,
                        access_level: r.get(1)?,
                    }))
                },
            )
            .optional()?,
        _ => None,
    };
    // A user row without its role row is not a usable identity.
    let Some(role) = role else {
        return Ok(None);
    };

    Ok(Some(Identity {
        id: user_id.to_string(),
        username,
        name,
        contact: Contact { email, phone },
        role,
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn seed_user(conn: &Connection, username: &str, role: NewRole) -> Identity {
        let new = NewUser {
            username: username.to_string(),
            password: "secret123".to_string(),
            name: format!("{} name", username),
            contact: Contact::default(),
            role,
        };
        create_user(Ctx::new(conn, None), &new, 6).expect("create user")
    }

    pub(crate) fn student_role(no: &str, fee_balance: i64) -> NewRole {
        NewRole::Student {
            student_no: no.to_string(),
            program: "BSc CS".to_string(),
            year_of_study: 1,
            semester: 1,
            fee_balance,
        }
    }

    #[test]
    fn hash_depends_on_salt() {
        assert_eq!(hash_password("pw", "a"), hash_password("pw", "a"));
        assert_ne!(hash_password("pw", "a"), hash_password("pw", "b"));
        assert_eq!(hash_password("pw", "a").len(), 64);
    }

    #[test]
    fn login_returns_role_tagged_identity() {
        let conn = db::open_in_memory().expect("open");
        let created = seed_user(&conn, "alice", student_role("S001", 1000));
        let who = login(&conn, "alice", "secret123").expect("login");
        assert_eq!(who.id, created.id);
        match who.role {
            Role::Student(p) => {
                assert_eq!(p.student_no, "S001");
                assert_eq!(p.fee_balance, 1000);
            }
            other => panic!("unexpected role {:?}", other),
        }
    }

    #[test]
    fn login_failure_does_not_reveal_which_part_was_wrong() {
        let conn = db::open_in_memory().expect("open");
        seed_user(
            &conn,
            "bob",
            NewRole::Lecturer {
                lecturer_no: "L1".into(),
                department: "CS".into(),
            },
        );
        let wrong_pw = login(&conn, "bob", "nope").expect_err("wrong password");
        let no_user = login(&conn, "nobody", "secret123").expect_err("unknown user");
        assert_eq!(wrong_pw.code(), "invalid_credentials");
        assert_eq!(wrong_pw.to_string(), no_user.to_string());
        let failed: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM activity_log WHERE action = 'LOGIN_FAILED'",
                [],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(failed, 2);
    }

    #[test]
    fn duplicate_username_and_weak_password_are_rejected() {
        let conn = db::open_in_memory().expect("open");
        seed_user(&conn, "carol", student_role("S002", 0));
        let dup = NewUser {
            username: "carol".into(),
            password: "secret123".into(),
            name: "Carol Two".into(),
            contact: Contact::default(),
            role: student_role("S003", 0),
        };
        let e = create_user(Ctx::new(&conn, None), &dup, 6).expect_err("dup");
        assert!(matches!(e, UserError::DuplicateUsername(_)));

        let weak = NewUser {
            username: "dave".into(),
            password: "abc".into(),
            ..dup
        };
        let e = create_user(Ctx::new(&conn, None), &weak, 6).expect_err("weak");
        assert!(matches!(e, UserError::WeakPassword { min: 6 }));
        assert_eq!(user_count(&conn).expect("count"), 1);
    }

    #[test]
    fn deactivated_account_cannot_sign_in_until_reactivated() {
        let conn = db::open_in_memory().expect("open");
        let admin = seed_user(
            &conn,
            "root",
            NewRole::Admin {
                admin_no: "A9".into(),
                access_level: "FULL".into(),
            },
        );
        let u = seed_user(&conn, "frank", student_role("S005", 0));
        let ctx = Ctx::new(&conn, Some(&admin));

        let off = set_user_active(ctx, &u.id, false).expect("deactivate");
        match off.role {
            Role::Student(p) => assert_eq!(p.status, "INACTIVE"),
            other => panic!("unexpected role {:?}", other),
        }
        let denied = login(&conn, "frank", "secret123").expect_err("inactive");
        let unknown = login(&conn, "nobody", "secret123").expect_err("unknown");
        assert!(matches!(denied, AuthError::InvalidCredentials));
        assert_eq!(denied.to_string(), unknown.to_string());

        set_user_active(ctx, &u.id, true).expect("reactivate");
        login(&conn, "frank", "secret123").expect("login again");
    }

    #[test]
    fn set_active_rejects_self_and_unknown_users() {
        let conn = db::open_in_memory().expect("open");
        let admin = seed_user(
            &conn,
            "root",
            NewRole::Admin {
                admin_no: "A9".into(),
                access_level: "FULL".into(),
            },
        );
        let ctx = Ctx::new(&conn, Some(&admin));
        let e = set_user_active(ctx, &admin.id, false).expect_err("self");
        assert!(matches!(e, UserError::InvalidInput(_)));
        let e = set_user_active(ctx, "ghost", false).expect_err("unknown");
        assert!(matches!(e, UserError::NotFound));
        login(&conn, "root", "secret123").expect("still active");
    }

    #[test]
    fn change_password_requires_current_password() {
        let conn = db::open_in_memory().expect("open");
        let u = seed_user(&conn, "erin", student_role("S004", 0));
        let ctx = Ctx::new(&conn, None);
        let e = change_password(ctx, &u.id, "wrong", "newsecret", 6).expect_err("wrong");
        assert!(matches!(e, UserError::WrongPassword));
        change_password(ctx, &u.id, "secret123", "newsecret", 6).expect("change");
        assert!(login(&conn, "erin", "secret123").is_err());
        login(&conn, "erin", "newsecret").expect("login with new password");
    }
}
