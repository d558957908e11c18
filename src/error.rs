use crate::incident::IncidentStatus;

/// Failures surfaced by the incident service.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IncidentError {
    #[error("Incident {0} does not exist")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Transition {from} -> {to} is not allowed")]
    InvalidTransition {
        from: IncidentStatus,
        to: IncidentStatus,
    },
    #[error("Incident {0} is closed and must be reopened first")]
    IncidentClosed(String),
    #[error("Incident {0} has no active assignment")]
    NoActiveAssignment(String),
    #[error("Incident {id} kept changing underneath us, gave up after {attempts} attempts")]
    ConflictRetryable { id: String, attempts: u32 },
    #[error("Repository unavailable: {0}")]
    RepositoryUnavailable(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable, machine readable error codes. These strings are part of the
/// external contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    InvalidTransition,
    IncidentClosed,
    NoActiveAssignment,
    ConflictRetryable,
    RepositoryUnavailable,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::IncidentClosed => "incident_closed",
            ErrorKind::NoActiveAssignment => "no_active_assignment",
            ErrorKind::ConflictRetryable => "conflict_retryable",
            ErrorKind::RepositoryUnavailable => "repository_unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl IncidentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IncidentError::NotFound(_) => ErrorKind::NotFound,
            IncidentError::InvalidInput(_) => ErrorKind::InvalidInput,
            IncidentError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            IncidentError::IncidentClosed(_) => ErrorKind::IncidentClosed,
            IncidentError::NoActiveAssignment(_) => ErrorKind::NoActiveAssignment,
            IncidentError::ConflictRetryable { .. } => ErrorKind::ConflictRetryable,
            IncidentError::RepositoryUnavailable(_) => ErrorKind::RepositoryUnavailable,
            IncidentError::Cancelled => ErrorKind::Cancelled,
            IncidentError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Deterministic failures that a retry cannot fix.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidInput
                | ErrorKind::InvalidTransition
                | ErrorKind::IncidentClosed
                | ErrorKind::NoActiveAssignment
        )
    }
}

/// Failures reported by a repository implementation.
#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    #[error("Version conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Stored record could not be decoded: {0}")]
    Corrupt(String),
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<RepositoryError> for IncidentError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Conflict { id, .. } => {
                IncidentError::ConflictRetryable { id, attempts: 1 }
            }
            RepositoryError::Unavailable(reason) | RepositoryError::Corrupt(reason) => {
                IncidentError::RepositoryUnavailable(reason)
            }
            RepositoryError::Cancelled => IncidentError::Cancelled,
        }
    }
}

impl From<sled::Error> for RepositoryError {
    fn from(value: sled::Error) -> Self {
        RepositoryError::Unavailable(value.to_string())
    }
}

impl From<minicbor::decode::Error> for RepositoryError {
    fn from(value: minicbor::decode::Error) -> Self {
        RepositoryError::Corrupt(value.to_string())
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for RepositoryError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        RepositoryError::Corrupt(value.to_string())
    }
}
