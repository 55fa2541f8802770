use serde::{Deserialize, Serialize};

pub type UserId = String;
pub type CourseId = String;
pub type RegistrationId = String;
pub type PaymentId = String;

/// An (academicYear, semester) pair scoping registrations, grades and payments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Term {
    pub academic_year: String,
    pub semester: i64,
}

impl Term {
    pub fn new(academic_year: impl Into<String>, semester: i64) -> Self {
        Self {
            academic_year: academic_year.into(),
            semester,
        }
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} sem {}", self.academic_year, self.semester)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentProfile {
    pub student_no: String,
    pub program: String,
    pub year_of_study: i64,
    pub semester: i64,
    pub fee_balance: i64,
    pub gpa: f64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LecturerProfile {
    pub lecturer_no: String,
    pub department: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminProfile {
    pub admin_no: String,
    pub access_level: String,
}

/// Role payload; every identity carries exactly one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Role {
    Student(StudentProfile),
    Lecturer(LecturerProfile),
    Admin(AdminProfile),
}

impl Role {
    pub fn tag(&self) -> &'static str {
        match self {
            Role::Student(_) => "STUDENT",
            Role::Lecturer(_) => "LECTURER",
            Role::Admin(_) => "ADMIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: UserId,
    pub username: String,
    pub name: String,
    pub contact: Contact,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: CourseId,
    pub code: String,
    pub name: String,
    pub credits: i64,
    pub department: String,
    pub year_level: i64,
    pub semester: i64,
    pub max_capacity: i64,
    pub active: bool,
    pub lecturer_id: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    Registered,
    Dropped,
    Completed,
}

impl RegistrationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RegistrationStatus::Registered => "REGISTERED",
            RegistrationStatus::Dropped => "DROPPED",
            RegistrationStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REGISTERED" => Some(Self::Registered),
            "DROPPED" => Some(Self::Dropped),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub id: RegistrationId,
    pub student_id: UserId,
    pub course_id: CourseId,
    pub course_code: String,
    pub course_name: String,
    pub academic_year: String,
    pub semester: i64,
    pub status: RegistrationStatus,
    pub registered_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grade {
    pub id: String,
    pub registration_id: RegistrationId,
    pub coursework_marks: f64,
    pub exam_marks: f64,
    pub total_marks: f64,
    pub letter_grade: String,
    pub grade_points: f64,
    pub remarks: Option<String>,
    pub graded_by: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: PaymentId,
    pub student_id: UserId,
    pub amount: i64,
    pub date: String,
    pub method: String,
    pub reference_number: String,
    pub purpose: Option<String>,
    pub academic_year: String,
    pub semester: i64,
    pub processed_by: UserId,
}
