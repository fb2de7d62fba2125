//! The error taxonomy shared by every component (see spec §7).
//!
//! Leaf components return a [`TygerError`] carrying one of the [`ErrorKind`]
//! variants; middle layers wrap with [`anyhow::Context`]-style messages via
//! [`TygerError::context`]; the HTTP edge maps a kind directly onto a status
//! code and an `{error:{code,message}}` body.

use std::fmt;

/// Error kind, not a type hierarchy — every component agrees on this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller contract violation. Maps to HTTP 400, code `InvalidInput`.
    Invalid,
    /// Maps to HTTP 404.
    NotFound,
    /// Duplicate codespec-by-name-different-body, or similar. Maps to HTTP 409.
    Conflict,
    /// `ifMatchETag` mismatch on a conditional write. Maps to HTTP 412.
    PreconditionFailed,
    /// Maps to HTTP 401.
    Unauthorized,
    /// Maps to HTTP 403.
    Forbidden,
    /// Network/store hiccup; retried at the nearest boundary, surfaces only
    /// if retries are exhausted. Maps to HTTP 503.
    Transient,
    /// Cooperative cancellation. Never logged as an error.
    Cancelled,
    /// Invariant violation severe enough to crash the process after logging.
    Fatal,
}

impl ErrorKind {
    /// The stable wire code used in `{error:{code,message}}` bodies.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Invalid => "InvalidInput",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::PreconditionFailed => "PreconditionFailed",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::Transient => "Transient",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Fatal => "Fatal",
        }
    }

    /// The HTTP status code this kind maps to at the API edge.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Invalid => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::PreconditionFailed => 412,
            ErrorKind::Transient => 503,
            ErrorKind::Cancelled => 499,
            ErrorKind::Fatal => 500,
        }
    }
}

/// A kind-tagged error, propagated between components.
#[derive(Debug)]
pub struct TygerError {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl TygerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreconditionFailed, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Attach additional context, preserving the original kind.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self {
            kind: self.kind,
            message: format!("{}: {}", context.into(), self.message),
            source: self.source,
        }
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for TygerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for TygerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as _)
    }
}

pub type Result<T> = std::result::Result<T, TygerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(ErrorKind::Invalid.http_status(), 400);
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::Conflict.http_status(), 409);
        assert_eq!(ErrorKind::PreconditionFailed.http_status(), 412);
    }

    #[test]
    fn context_preserves_kind() {
        let err = TygerError::not_found("run 7").context("GetRun");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.message(), "GetRun: run 7");
    }

    #[test]
    fn display_includes_code() {
        let err = TygerError::invalid("bad buffer name");
        assert_eq!(err.to_string(), "InvalidInput: bad buffer name");
    }
}
