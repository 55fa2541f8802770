/// Failure classes every domain error falls into. None of them is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; reported inline.
    Validation,
    /// The input was fine but the records disagree (duplicate, full, dropped).
    StateConflict,
    /// Store unreachable or a write failed.
    Persistence,
    /// Bad credentials or missing permission.
    Authentication,
    NotFound,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::StateConflict => "state_conflict",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Authentication => "authentication",
            ErrorKind::NotFound => "not_found",
        }
    }
}

/// Implemented by each service error so the IPC layer can render it uniformly.
pub trait DomainError: std::error::Error {
    fn kind(&self) -> ErrorKind;

    /// Stable wire code, e.g. `course_full`.
    fn code(&self) -> &'static str;
}
