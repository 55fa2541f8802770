use rusqlite::Connection;

use crate::activity;
use crate::domain::{Identity, Role};

/// Per-command context: the store handle plus whoever is acting.
/// Passed explicitly into every service call; there is no global session.
#[derive(Clone, Copy)]
pub struct Ctx<'a> {
    pub conn: &'a Connection,
    pub actor: Option<&'a Identity>,
}

impl<'a> Ctx<'a> {
    pub fn new(conn: &'a Connection, actor: Option<&'a Identity>) -> Self {
        Self { conn, actor }
    }

    pub fn actor_id(&self) -> Option<&'a str> {
        self.actor.map(|a| a.id.as_str())
    }

    pub fn log(&self, action: &str, details: &str) {
        activity::log_action(self.conn, self.actor_id(), action, details);
    }
}

/// What a signed-in identity may do, decided purely by its role variant.
pub fn can_act_for_student(actor: &Identity, student_id: &str) -> bool {
    match &actor.role {
        Role::Admin(_) => true,
        Role::Student(_) => actor.id == student_id,
        Role::Lecturer(_) => false,
    }
}

pub fn can_view_student(actor: &Identity, student_id: &str) -> bool {
    match &actor.role {
        Role::Admin(_) | Role::Lecturer(_) => true,
        Role::Student(_) => actor.id == student_id,
    }
}

pub fn can_grade(actor: &Identity, course_lecturer: Option<&str>) -> bool {
    match &actor.role {
        Role::Admin(_) => true,
        Role::Lecturer(_) => course_lecturer.map_or(true, |l| l == actor.id),
        Role::Student(_) => false,
    }
}
