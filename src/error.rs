//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the fabric returns [`Error`], which carries an
//! [`ErrorKind`] the Router can map to a stable wire error code (see
//! [`ErrorKind::wire_code`]) without re-deriving the mapping at each call site.

use thiserror::Error;

/// Propagation-relevant error taxonomy (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed frame or payload. Never retried.
    Validation,
    /// No channel row, or missing/expired claims.
    Unauthorized,
    /// No handler registered for the action.
    InvalidAction,
    /// Target channel absent in the Delivery Manager.
    NotFound,
    /// Transport reported the channel permanently gone.
    Stale,
    /// Network/5xx/timeout/429; retried per policy.
    Transient,
    /// Rejected by the per-channel circuit breaker.
    CircuitOpen,
    /// Programmer error or store failure.
    Internal,
}

impl ErrorKind {
    /// The stable wire error code for this kind (spec §6).
    pub fn wire_code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::InvalidAction => "INVALID_ACTION",
            ErrorKind::NotFound => "NOT_FOUND",
            // Stale is never surfaced to a client frame directly, but callers
            // that must render one treat it as a gone/not-found condition.
            ErrorKind::Stale => "NOT_FOUND",
            ErrorKind::Transient => "TIMEOUT",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// Whether an Async Processor should retry a handler failure of this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::CircuitOpen)
    }
}

/// The crate's error type. Wraps an [`ErrorKind`] plus an optional message and source.
#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn invalid_action(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidAction, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn stale(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Stale, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// The stable wire error code for this error (delegates to [`ErrorKind::wire_code`]).
    pub fn code(&self) -> &'static str {
        self.kind.wire_code()
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::with_source(ErrorKind::Validation, "malformed JSON payload", value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
