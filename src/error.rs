use std::fmt;

use anyhow::anyhow;

use crate::models::HierarchyViolation;

pub type Result<T> = std::result::Result<T, LibError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Database,
    /// Transient lock or serialization conflict reported by the store.
    Conflict,
    InvalidInput,
    NotFound,
    Timeout,
    Unauthorized,
    Violation,
    Unknown,
}

#[derive(Debug)]
pub struct LibError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub public: &'static str,
    pub violation: Option<HierarchyViolation>,
    pub source: anyhow::Error,
}

impl LibError {
    pub fn database(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Database,
            code: "database_error",
            public,
            violation: None,
            source,
        }
    }

    pub fn conflict(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            code: "transaction_conflict",
            public,
            violation: None,
            source,
        }
    }

    pub fn invalid(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: "invalid_input",
            public,
            violation: None,
            source,
        }
    }

    pub fn unauthorized(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Unauthorized,
            code: "unauthorized",
            public,
            violation: None,
            source,
        }
    }

    pub fn not_found(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "not_found",
            public,
            violation: None,
            source,
        }
    }

    pub fn timeout(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            code: "timeout",
            public,
            violation: None,
            source,
        }
    }

    pub fn violation(violation: HierarchyViolation) -> Self {
        let source = anyhow!("hierarchy invariant violated: {:?}", violation);
        Self {
            kind: ErrorKind::Violation,
            code: violation.error_code(),
            public: violation.public_message(),
            violation: Some(violation),
            source,
        }
    }

    pub fn unknown(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            code: "unknown_error",
            public,
            violation: None,
            source,
        }
    }

    pub fn message(public: &'static str) -> Self {
        Self::unknown(public, anyhow!(public))
    }

    /// Only store-level conflicts are retried; taxonomy errors go straight to the caller.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Conflict
    }

    pub fn violation_kind(&self) -> Option<&HierarchyViolation> {
        self.violation.as_ref()
    }
}

impl fmt::Display for LibError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.public, self.code, self.source)
    }
}

impl std::error::Error for LibError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for LibError {
    fn from(value: sqlx::Error) -> Self {
        Self::database("Database request failed", anyhow!(value))
    }
}
