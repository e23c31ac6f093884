//! Error taxonomy for the abstraction layer.
//!
//! Every public operation returns [`DalError`]. Errors are grouped into
//! [`ErrorClass`]es so callers can decide whether to retry, fail fast or page
//! an operator without matching on every variant.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::schema::FieldType;

pub type Result<T, E = DalError> = std::result::Result<T, E>;

/// Coarse classification of a [`DalError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient backend or pool condition; retry with backoff.
    Transient,
    /// Misuse of the API (bad types, unknown fields). Never retried.
    Programmer,
    /// Bad configuration (unknown backend, unsupported construct).
    Configuration,
    /// Requires operator intervention.
    Fatal,
    /// Concurrent transactions collided; retry the whole transaction.
    Conflict,
    /// Statement rejected by the backend for another reason.
    Backend,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "Transient Error"),
            ErrorClass::Programmer => write!(f, "Programmer Error"),
            ErrorClass::Configuration => write!(f, "Configuration Error"),
            ErrorClass::Fatal => write!(f, "Fatal Error"),
            ErrorClass::Conflict => write!(f, "Conflict"),
            ErrorClass::Backend => write!(f, "Backend Error"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DalError {
    #[error("connection error on {backend}: {message}")]
    Connection {
        backend: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("connection pool exhausted after waiting {waited:?} (max size {max_size})")]
    PoolExhausted { waited: Duration, max_size: usize },

    #[error("type mismatch on {context}: expected {expected}, found {found}")]
    TypeMismatch {
        context: String,
        expected: String,
        found: String,
    },

    #[error("ambiguous reference to {reference}: {reason}")]
    AmbiguousReference { reference: String, reason: String },

    #[error("unknown table {table}")]
    UnknownTable { table: String },

    #[error("unknown field {table}.{field}")]
    UnknownField { table: String, field: String },

    #[error("cannot parse {raw} from column {column} as {target}: {reason}")]
    Parse {
        column: String,
        raw: String,
        target: FieldType,
        reason: String,
    },

    #[error("value {value} out of range for {context} ({target}): {reason}")]
    OutOfRange {
        context: String,
        value: String,
        target: FieldType,
        reason: String,
    },

    #[error("validation failed for {table}.{field}: {message}")]
    Validation {
        table: String,
        field: String,
        message: String,
    },

    #[error("{construct} is not supported by {backend}")]
    UnsupportedConstruct { backend: String, construct: String },

    #[error("unsupported backend {scheme}: {reason}")]
    UnsupportedBackend { scheme: String, reason: String },

    #[error("invalid connection uri: {0}")]
    InvalidUri(String),

    #[error("invalid schema for {table}: {reason}")]
    InvalidSchema { table: String, reason: String },

    #[error("migration of {table} failed{}: {message}", partial_note(.partial))]
    MigrationFailed {
        table: String,
        message: String,
        partial: bool,
    },

    #[error("transaction conflict on {backend}: {message}")]
    TransactionConflict { backend: String, message: String },

    #[error("statement failed on {backend}{}: {message}", sqlstate_note(.code))]
    Statement {
        backend: String,
        code: Option<String>,
        message: String,
    },

    #[error("operation cancelled during {during}")]
    Cancelled { during: &'static str },

    #[error("deadline exceeded during {during}")]
    DeadlineExceeded { during: &'static str },

    #[error("instance {0} is closed")]
    Closed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn partial_note(partial: &bool) -> &'static str {
    if *partial {
        " (partially applied, manual intervention required)"
    } else {
        ""
    }
}

fn sqlstate_note(code: &Option<String>) -> String {
    code.as_ref()
        .map(|c| format!(" (SQLSTATE {c})"))
        .unwrap_or_default()
}

impl DalError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DalError::Connection { .. }
            | DalError::PoolExhausted { .. }
            | DalError::Cancelled { .. }
            | DalError::DeadlineExceeded { .. } => ErrorClass::Transient,
            DalError::TypeMismatch { .. }
            | DalError::AmbiguousReference { .. }
            | DalError::UnknownTable { .. }
            | DalError::UnknownField { .. }
            | DalError::Parse { .. }
            | DalError::OutOfRange { .. }
            | DalError::Validation { .. }
            | DalError::InvalidSchema { .. }
            | DalError::Closed(_) => ErrorClass::Programmer,
            DalError::UnsupportedConstruct { .. }
            | DalError::UnsupportedBackend { .. }
            | DalError::InvalidUri(_)
            | DalError::Config(_) => ErrorClass::Configuration,
            DalError::MigrationFailed { .. } | DalError::Io(_) => ErrorClass::Fatal,
            DalError::TransactionConflict { .. } => ErrorClass::Conflict,
            DalError::Statement { .. } => ErrorClass::Backend,
        }
    }

    /// Whether the caller may retry the failed operation (after backoff).
    ///
    /// Conflicts are retryable only by re-running the whole transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::Conflict
        )
    }

    pub(crate) fn unsupported(backend: impl fmt::Display, construct: impl Into<String>) -> Self {
        DalError::UnsupportedConstruct {
            backend: backend.to_string(),
            construct: construct.into(),
        }
    }

    pub(crate) fn mismatch(
        context: impl Into<String>,
        expected: impl fmt::Display,
        found: impl fmt::Display,
    ) -> Self {
        DalError::TypeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}
