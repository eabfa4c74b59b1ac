//! Operation kinds the engine can hand off to an application handler.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A fixed category of cryptographic operation. Each kind has exactly one
/// callback signature (see [`crate::callbacks`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// RSA public-key encryption during the handshake (premaster secret).
    RsaPublicEncrypt,
    /// RSA signature over handshake data with a key the application holds.
    RsaSign,
    /// RSA signature verification against a peer public key.
    RsaVerify,
    /// Single-call encrypt-and-authenticate of one outgoing record.
    AtomicRecordEncrypt,
    /// Single-call decrypt-and-verify of one incoming record.
    AtomicRecordDecrypt,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        Self::RsaPublicEncrypt,
        Self::RsaSign,
        Self::RsaVerify,
        Self::AtomicRecordEncrypt,
        Self::AtomicRecordDecrypt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RsaPublicEncrypt => "rsa_public_encrypt",
            Self::RsaSign => "rsa_sign",
            Self::RsaVerify => "rsa_verify",
            Self::AtomicRecordEncrypt => "atomic_record_encrypt",
            Self::AtomicRecordDecrypt => "atomic_record_decrypt",
        }
    }

    /// Record-layer kinds cannot run without a context carrying cipher state.
    pub fn requires_context(self) -> bool {
        matches!(self, Self::AtomicRecordEncrypt | Self::AtomicRecordDecrypt)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
