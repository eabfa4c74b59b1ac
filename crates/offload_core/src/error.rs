use std::num::NonZeroI32;

use thiserror::Error;

use crate::kind::OperationKind;
use crate::session::SessionId;

/// Status code reported to the engine when an offloaded operation succeeds.
pub const STATUS_SUCCESS: i32 = 0;

pub const STATUS_INVALID_SESSION: i32 = -401;
pub const STATUS_NOT_REGISTERED: i32 = -402;
pub const STATUS_SETUP_FAILURE: i32 = -403;
pub const STATUS_OPERATION_FAILURE: i32 = -404;
pub const STATUS_BUFFER_TOO_SMALL: i32 = -405;
pub const STATUS_CONTEXT_MISMATCH: i32 = -406;
pub const STATUS_CONTEXT_IN_USE: i32 = -407;
pub const STATUS_CONFIG: i32 = -408;
pub const STATUS_IO: i32 = -409;
pub const STATUS_KEY_DERIVATION: i32 = -410;

/// Failure reported by a handler from inside the callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackError {
    /// Cipher or key configuration failed. The handler must leave its context
    /// uninitialised so the next call retries setup.
    #[error("Setup failed: {0}")]
    Setup(String),

    /// The operation itself failed for this input (bad padding, tag mismatch,
    /// malformed key material).
    #[error("Operation failed: {0}")]
    Operation(String),

    /// Output capacity is insufficient. Nothing was written.
    #[error("Output buffer too small: need {needed} bytes")]
    BufferTooSmall { needed: usize },

    /// Application-defined status, surfaced to the engine unchanged.
    #[error("Handler status {0}")]
    Status(NonZeroI32),
}

#[derive(Debug, Error)]
pub enum OffloadError {
    #[error("Invalid session: {0}")]
    InvalidSession(SessionId),

    #[error("No handler registered for {0}")]
    NotRegistered(OperationKind),

    #[error("{kind} setup failed: {reason}")]
    SetupFailure { kind: OperationKind, reason: String },

    #[error("{kind} failed: {reason}")]
    OperationFailure { kind: OperationKind, reason: String },

    #[error("{kind} output buffer too small: need {needed} bytes, have {capacity}")]
    BufferTooSmall {
        kind: OperationKind,
        needed: usize,
        capacity: usize,
    },

    #[error("{kind} handler returned status {code}")]
    HandlerStatus { kind: OperationKind, code: NonZeroI32 },

    #[error("Context attached for {kind} is `{attached}`, handler expects `{expected}`")]
    ContextMismatch {
        kind: OperationKind,
        attached: &'static str,
        expected: &'static str,
    },

    #[error("Context for {kind} is already attached to session {holder}")]
    ContextInUse {
        kind: OperationKind,
        holder: SessionId,
    },

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OffloadError {
    /// Map a handler failure to the engine-facing error for `kind`.
    /// `capacity` is the output capacity the engine offered.
    pub(crate) fn from_callback(kind: OperationKind, capacity: usize, err: CallbackError) -> Self {
        match err {
            CallbackError::Setup(reason) => Self::SetupFailure { kind, reason },
            CallbackError::Operation(reason) => Self::OperationFailure { kind, reason },
            CallbackError::BufferTooSmall { needed } => Self::BufferTooSmall {
                kind,
                needed,
                capacity,
            },
            CallbackError::Status(code) => Self::HandlerStatus { kind, code },
        }
    }

    /// Non-zero status code for the engine. Handler-defined codes pass
    /// through verbatim.
    pub fn status_code(&self) -> i32 {
        match self {
            Self::InvalidSession(_) => STATUS_INVALID_SESSION,
            Self::NotRegistered(_) => STATUS_NOT_REGISTERED,
            Self::SetupFailure { .. } => STATUS_SETUP_FAILURE,
            Self::OperationFailure { .. } => STATUS_OPERATION_FAILURE,
            Self::BufferTooSmall { .. } => STATUS_BUFFER_TOO_SMALL,
            Self::HandlerStatus { code, .. } => code.get(),
            Self::ContextMismatch { .. } => STATUS_CONTEXT_MISMATCH,
            Self::ContextInUse { .. } => STATUS_CONTEXT_IN_USE,
            Self::KeyDerivation(_) => STATUS_KEY_DERIVATION,
            Self::Config(_) => STATUS_CONFIG,
            Self::Io(_) => STATUS_IO,
        }
    }

    /// True when the same call may succeed if repeated (setup is retried on
    /// the next invocation). The core itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SetupFailure { .. })
    }
}

/// Static description of a status code.
pub fn describe_status(code: i32) -> &'static str {
    match code {
        STATUS_SUCCESS => "success",
        STATUS_INVALID_SESSION => "unknown or torn-down session",
        STATUS_NOT_REGISTERED => "no handler registered for operation kind",
        STATUS_SETUP_FAILURE => "cipher or key setup failed; retry is possible",
        STATUS_OPERATION_FAILURE => "cryptographic operation rejected its input",
        STATUS_BUFFER_TOO_SMALL => "output buffer too small",
        STATUS_CONTEXT_MISMATCH => "attached context has the wrong type for the handler",
        STATUS_CONTEXT_IN_USE => "context is attached to another session",
        STATUS_CONFIG => "configuration could not be parsed",
        STATUS_IO => "configuration could not be read",
        STATUS_KEY_DERIVATION => "traffic key derivation failed",
        _ => "application-defined handler status",
    }
}
