use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db;
use crate::domain::Term;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupSection {
    Enrollment,
    Payments,
    Security,
}

impl SetupSection {
    pub const ALL: [SetupSection; 3] = [
        SetupSection::Enrollment,
        SetupSection::Payments,
        SetupSection::Security,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enrollment" => Some(Self::Enrollment),
            "payments" => Some(Self::Payments),
            "security" => Some(Self::Security),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Enrollment => "enrollment",
            Self::Payments => "payments",
            Self::Security => "security",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Enrollment => "setup.enrollment",
            Self::Payments => "setup.payments",
            Self::Security => "setup.security",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct EnrollmentSetup {
    pub default_academic_year: String,
    pub default_semester: i64,
}

impl Default for EnrollmentSetup {
    fn default() -> Self {
        Self {
            default_academic_year: "2025/2026".to_string(),
            default_semester: 1,
        }
    }
}

impl EnrollmentSetup {
    pub fn default_term(&self) -> Term {
        Term::new(self.default_academic_year.clone(), self.default_semester)
    }

    fn validate(&self) -> Result<(), String> {
        if self.default_academic_year.trim().is_empty() {
            return Err("defaultAcademicYear must not be empty".into());
        }
        if !(1..=3).contains(&self.default_semester) {
            return Err("defaultSemester must be 1, 2 or 3".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct PaymentsSetup {
    pub reference_prefix: String,
    pub default_method: String,
}

impl Default for PaymentsSetup {
    fn default() -> Self {
        Self {
            reference_prefix: "PAY".to_string(),
            default_method: "CASH".to_string(),
        }
    }
}

impl PaymentsSetup {
    fn validate(&self) -> Result<(), String> {
        let p = self.reference_prefix.trim();
        if p.is_empty() || p.len() > 12 || !p.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err("referencePrefix must be 1-12 ASCII letters or digits".into());
        }
        if self.default_method.trim().is_empty() {
            return Err("defaultMethod must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct SecuritySetup {
    pub min_password_length: usize,
}

impl Default for SecuritySetup {
    fn default() -> Self {
        Self {
            min_password_length: 6,
        }
    }
}

impl SecuritySetup {
    fn validate(&self) -> Result<(), String> {
        if self.min_password_length < 4 {
            return Err("minPasswordLength must be at least 4".into());
        }
        Ok(())
    }
}

fn load<T: DeserializeOwned + Default>(conn: &Connection, section: SetupSection) -> anyhow::Result<T> {
    match db::settings_get_json(conn, section.key())? {
        // Malformed historical values fall back to defaults rather than block the workspace.
        Some(saved) => Ok(serde_json::from_value(saved).unwrap_or_default()),
        None => Ok(T::default()),
    }
}

pub fn enrollment(conn: &Connection) -> anyhow::Result<EnrollmentSetup> {
    load(conn, SetupSection::Enrollment)
}

pub fn payments(conn: &Connection) -> anyhow::Result<PaymentsSetup> {
    load(conn, SetupSection::Payments)
}

pub fn security(conn: &Connection) -> anyhow::Result<SecuritySetup> {
    load(conn, SetupSection::Security)
}

pub fn section_json(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    Ok(match section {
        SetupSection::Enrollment => serde_json::to_value(enrollment(conn)?)?,
        SetupSection::Payments => serde_json::to_value(payments(conn)?)?,
        SetupSection::Security => serde_json::to_value(security(conn)?)?,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

fn merge_and_check<T>(current: T, patch: &Map<String, Value>) -> Result<T, SetupError>
where
    T: Serialize + DeserializeOwned,
{
    let mut merged = serde_json::to_value(current).map_err(|e| SetupError::Store(e.into()))?;
    if let Some(obj) = merged.as_object_mut() {
        for (k, v) in patch {
            obj.insert(k.clone(), v.clone());
        }
    }
    serde_json::from_value(merged).map_err(|e| SetupError::Invalid(e.to_string()))
}

/// Applies a partial update to one section and persists the merged result.
pub fn update_section(
    conn: &Connection,
    section: SetupSection,
    patch: &Map<String, Value>,
) -> Result<Value, SetupError> {
    let merged = match section {
        SetupSection::Enrollment => {
            let next: EnrollmentSetup = merge_and_check(enrollment(conn)?, patch)?;
            next.validate().map_err(SetupError::Invalid)?;
            serde_json::to_value(next).map_err(|e| SetupError::Store(e.into()))?
        }
        SetupSection::Payments => {
            let next: PaymentsSetup = merge_and_check(payments(conn)?, patch)?;
            next.validate().map_err(SetupError::Invalid)?;
            serde_json::to_value(next).map_err(|e| SetupError::Store(e.into()))?
        }
        SetupSection::Security => {
            let next: SecuritySetup = merge_and_check(security(conn)?, patch)?;
            next.validate().map_err(SetupError::Invalid)?;
            serde_json::to_value(next).map_err(|e| SetupError::Store(e.into()))?
        }
    };
    db::settings_set_json(conn, section.key(), &merged)?;
    tracing::info!(section = section.name(), "workspace settings updated");
    Ok(merged)
}
