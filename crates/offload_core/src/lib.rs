//! offload_core: crypto operation offload for a TLS engine
//!
//! An application registers a handler per [`OperationKind`] on a session and
//! optionally attaches an opaque context; the engine then routes the matching
//! RSA or record-protection step through that handler instead of its own
//! implementation.
//!
//! # Module layout
//! - `kind`       operation kinds
//! - `callbacks`  handler traits, one per kind, and the [`Handler`] value
//! - `registry`   per-session kind to handler map
//! - `context`    typed, session-exclusive callback contexts
//! - `session`    session state: keys, sequence numbers, registry, contexts
//! - `invoke`     the invocation points the engine calls
//! - `table`      id-addressed session table
//! - `keys`       bulk ciphers and TLS 1.3 traffic key derivation
//! - `handlers`   software reference handlers (feature gated)
//! - `logging`    application logging callback as a tracing layer
//! - `config`     JSON configuration
//! - `error`      error types and status codes

pub mod callbacks;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
mod invoke;
pub mod keys;
pub mod kind;
pub mod logging;
pub mod registry;
pub mod session;
pub mod table;

use serde::Serialize;

pub use callbacks::{
    Handler, RecordDecryptCallback, RecordEncryptCallback, RsaEncryptCallback, RsaSignCallback,
    RsaVerifyCallback,
};
pub use config::{FallbackPolicy, OffloadConfig};
pub use context::{CallbackContext, ErasedContext};
pub use error::{describe_status, CallbackError, OffloadError, STATUS_SUCCESS};
pub use keys::{BulkCipher, ContentType, TrafficKeys};
pub use kind::OperationKind;
pub use session::{Session, SessionId, SessionView};
pub use table::SessionTable;

/// Which reference handler families this build carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub pk_callbacks: bool,
    pub atomic_user: bool,
}

pub fn capabilities() -> Capabilities {
    Capabilities {
        pk_callbacks: cfg!(feature = "pk-callbacks"),
        atomic_user: cfg!(feature = "atomic-user"),
    }
}
