use ulid::Ulid;

use crate::model::Ms;

/// Caller-facing category of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authorization,
    NotFound,
    Conflict,
    Internal,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authorization => "authorization",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    InvalidWindow { index: usize, start: Ms, end: Ms },
    /// Two windows in the same submitted batch overlap each other.
    OverlappingBatch { first: usize, second: usize },
    InvalidField { field: &'static str, reason: String },
    NotEligible(Ulid),
    LimitExceeded(&'static str),
    Forbidden,
    NotFound(Ulid),
    Overlap(Ulid),
    AlreadyExists(Ulid),
    AlreadyBooked(Ulid),
    AlreadyScheduled(Ulid),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidWindow { .. }
            | EngineError::OverlappingBatch { .. }
            | EngineError::InvalidField { .. }
            | EngineError::NotEligible(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::Forbidden => ErrorKind::Authorization,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Overlap(_)
            | EngineError::AlreadyExists(_)
            | EngineError::AlreadyBooked(_)
            | EngineError::AlreadyScheduled(_) => ErrorKind::Conflict,
            EngineError::WalError(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidWindow { index, start, end } => {
                write!(f, "window {index}: start {start} must be before end {end}")
            }
            EngineError::OverlappingBatch { first, second } => {
                write!(f, "windows {first} and {second} in the batch overlap")
            }
            EngineError::InvalidField { field, reason } => write!(f, "{field}: {reason}"),
            EngineError::NotEligible(id) => {
                write!(f, "professional {id} is not eligible to take attendances")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Forbidden => write!(f, "not permitted"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Overlap(id) => write!(f, "overlaps existing availability: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::AlreadyBooked(id) => write!(f, "availability already booked: {id}"),
            EngineError::AlreadyScheduled(id) => write!(f, "attendance already scheduled: {id}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
