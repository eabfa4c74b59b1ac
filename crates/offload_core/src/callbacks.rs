//! Handler signatures, one trait per [`OperationKind`].
//!
//! Every trait names the concrete context type it expects. The session
//! stores handlers and contexts type-erased; the adapters here are the only
//! place a context is downcast, and a mismatch fails the call before the
//! handler runs.
//!
//! Buffer rules shared by all producing kinds: inputs are borrowed for the
//! call only; `out.len()` is the capacity the engine offers; the handler
//! returns the exact number of bytes it wrote, or an error with nothing
//! reported.

use std::fmt;
use std::sync::Arc;

use crate::context::ErasedContext;
use crate::error::{CallbackError, OffloadError};
use crate::keys::ContentType;
use crate::kind::OperationKind;
use crate::session::SessionView;

/// RSA public-key encryption of handshake material (e.g. the premaster
/// secret) under the peer key given as DER.
pub trait RsaEncryptCallback: Send + Sync + 'static {
    type Context: Send + 'static;

    fn rsa_encrypt(
        &self,
        session: &SessionView<'_>,
        ctx: Option<&mut Self::Context>,
        plaintext: &[u8],
        key_der: &[u8],
        out: &mut [u8],
    ) -> Result<usize, CallbackError>;
}

/// RSA signature over `message`. `key_der` is the public half of the key
/// the engine expects to sign with; the private half is the handler's
/// business.
pub trait RsaSignCallback: Send + Sync + 'static {
    type Context: Send + 'static;

    fn rsa_sign(
        &self,
        session: &SessionView<'_>,
        ctx: Option<&mut Self::Context>,
        message: &[u8],
        key_der: &[u8],
        out: &mut [u8],
    ) -> Result<usize, CallbackError>;
}

/// RSA signature verification. A signature that does not verify is
/// [`CallbackError::Operation`].
pub trait RsaVerifyCallback: Send + Sync + 'static {
    type Context: Send + 'static;

    fn rsa_verify(
        &self,
        session: &SessionView<'_>,
        ctx: Option<&mut Self::Context>,
        message: &[u8],
        signature: &[u8],
        key_der: &[u8],
    ) -> Result<(), CallbackError>;
}

/// Single-call protection of one outgoing record. The context is mandatory.
pub trait RecordEncryptCallback: Send + Sync + 'static {
    type Context: Send + 'static;

    fn encrypt_record(
        &self,
        session: &SessionView<'_>,
        ctx: &mut Self::Context,
        content_type: ContentType,
        plaintext: &[u8],
        out: &mut [u8],
    ) -> Result<usize, CallbackError>;
}

/// Single-call decrypt-and-verify of one incoming record. The context is
/// mandatory.
pub trait RecordDecryptCallback: Send + Sync + 'static {
    type Context: Send + 'static;

    fn decrypt_record(
        &self,
        session: &SessionView<'_>,
        ctx: &mut Self::Context,
        content_type: ContentType,
        ciphertext: &[u8],
        out: &mut [u8],
    ) -> Result<usize, CallbackError>;
}

// ── Type-erased adapters ─────────────────────────────────────────────────────

pub(crate) trait DynRsaEncrypt: Send + Sync {
    fn invoke(
        &self,
        session: &SessionView<'_>,
        ctx: Option<&ErasedContext>,
        plaintext: &[u8],
        key_der: &[u8],
        out: &mut [u8],
    ) -> Result<usize, OffloadError>;
}

impl<H: RsaEncryptCallback> DynRsaEncrypt for H {
    fn invoke(
        &self,
        session: &SessionView<'_>,
        ctx: Option<&ErasedContext>,
        plaintext: &[u8],
        key_der: &[u8],
        out: &mut [u8],
    ) -> Result<usize, OffloadError> {
        let kind = OperationKind::RsaPublicEncrypt;
        let capacity = out.len();
        let result = match ctx {
            Some(ctx) => ctx.with::<H::Context, _>(kind, |c| {
                self.rsa_encrypt(session, Some(c), plaintext, key_der, out)
            })?,
            None => self.rsa_encrypt(session, None, plaintext, key_der, out),
        };
        checked_len(kind, capacity, result)
    }
}

pub(crate) trait DynRsaSign: Send + Sync {
    fn invoke(
        &self,
        session: &SessionView<'_>,
        ctx: Option<&ErasedContext>,
        message: &[u8],
        key_der: &[u8],
        out: &mut [u8],
    ) -> Result<usize, OffloadError>;
}

impl<H: RsaSignCallback> DynRsaSign for H {
    fn invoke(
        &self,
        session: &SessionView<'_>,
        ctx: Option<&ErasedContext>,
        message: &[u8],
        key_der: &[u8],
        out: &mut [u8],
    ) -> Result<usize, OffloadError> {
        let kind = OperationKind::RsaSign;
        let capacity = out.len();
        let result = match ctx {
            Some(ctx) => ctx.with::<H::Context, _>(kind, |c| {
                self.rsa_sign(session, Some(c), message, key_der, out)
            })?,
            None => self.rsa_sign(session, None, message, key_der, out),
        };
        checked_len(kind, capacity, result)
    }
}

pub(crate) trait DynRsaVerify: Send + Sync {
    fn invoke(
        &self,
        session: &SessionView<'_>,
        ctx: Option<&ErasedContext>,
        message: &[u8],
        signature: &[u8],
        key_der: &[u8],
    ) -> Result<(), OffloadError>;
}

impl<H: RsaVerifyCallback> DynRsaVerify for H {
    fn invoke(
        &self,
        session: &SessionView<'_>,
        ctx: Option<&ErasedContext>,
        message: &[u8],
        signature: &[u8],
        key_der: &[u8],
    ) -> Result<(), OffloadError> {
        let kind = OperationKind::RsaVerify;
        let result = match ctx {
            Some(ctx) => ctx.with::<H::Context, _>(kind, |c| {
                self.rsa_verify(session, Some(c), message, signature, key_der)
            })?,
            None => self.rsa_verify(session, None, message, signature, key_der),
        };
        result.map_err(|e| OffloadError::from_callback(kind, 0, e))
    }
}

pub(crate) trait DynRecordEncrypt: Send + Sync {
    fn invoke(
        &self,
        session: &SessionView<'_>,
        ctx: Option<&ErasedContext>,
        content_type: ContentType,
        plaintext: &[u8],
        out: &mut [u8],
    ) -> Result<usize, OffloadError>;
}

impl<H: RecordEncryptCallback> DynRecordEncrypt for H {
    fn invoke(
        &self,
        session: &SessionView<'_>,
        ctx: Option<&ErasedContext>,
        content_type: ContentType,
        plaintext: &[u8],
        out: &mut [u8],
    ) -> Result<usize, OffloadError> {
        let kind = OperationKind::AtomicRecordEncrypt;
        let capacity = out.len();
        let ctx = ctx.ok_or_else(|| missing_context(kind))?;
        let result = ctx.with::<H::Context, _>(kind, |c| {
            self.encrypt_record(session, c, content_type, plaintext, out)
        })?;
        checked_len(kind, capacity, result)
    }
}

pub(crate) trait DynRecordDecrypt: Send + Sync {
    fn invoke(
        &self,
        session: &SessionView<'_>,
        ctx: Option<&ErasedContext>,
        content_type: ContentType,
        ciphertext: &[u8],
        out: &mut [u8],
    ) -> Result<usize, OffloadError>;
}

impl<H: RecordDecryptCallback> DynRecordDecrypt for H {
    fn invoke(
        &self,
        session: &SessionView<'_>,
        ctx: Option<&ErasedContext>,
        content_type: ContentType,
        ciphertext: &[u8],
        out: &mut [u8],
    ) -> Result<usize, OffloadError> {
        let kind = OperationKind::AtomicRecordDecrypt;
        let capacity = out.len();
        let ctx = ctx.ok_or_else(|| missing_context(kind))?;
        let result = ctx.with::<H::Context, _>(kind, |c| {
            self.decrypt_record(session, c, content_type, ciphertext, out)
        })?;
        checked_len(kind, capacity, result)
    }
}

fn missing_context(kind: OperationKind) -> OffloadError {
    OffloadError::SetupFailure {
        kind,
        reason: "no callback context attached".into(),
    }
}

/// A handler can never have written past `out`, so a larger reported length
/// is a lie about the output and is treated as an overflow.
fn checked_len(
    kind: OperationKind,
    capacity: usize,
    result: Result<usize, CallbackError>,
) -> Result<usize, OffloadError> {
    match result {
        Ok(written) if written > capacity => Err(OffloadError::BufferTooSmall {
            kind,
            needed: written,
            capacity,
        }),
        Ok(written) => Ok(written),
        Err(e) => Err(OffloadError::from_callback(kind, capacity, e)),
    }
}

// ── Handler value ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub(crate) enum HandlerInner {
    RsaPublicEncrypt(Arc<dyn DynRsaEncrypt>),
    RsaSign(Arc<dyn DynRsaSign>),
    RsaVerify(Arc<dyn DynRsaVerify>),
    AtomicRecordEncrypt(Arc<dyn DynRecordEncrypt>),
    AtomicRecordDecrypt(Arc<dyn DynRecordDecrypt>),
}

/// A registered handler. The kind is fixed by the constructor, so a handler
/// can only ever be bound to the slot whose signature it implements.
#[derive(Clone)]
pub struct Handler {
    pub(crate) inner: HandlerInner,
}

impl Handler {
    pub fn rsa_public_encrypt<H: RsaEncryptCallback>(handler: H) -> Self {
        Self {
            inner: HandlerInner::RsaPublicEncrypt(Arc::new(handler)),
        }
    }

    pub fn rsa_sign<H: RsaSignCallback>(handler: H) -> Self {
        Self {
            inner: HandlerInner::RsaSign(Arc::new(handler)),
        }
    }

    pub fn rsa_verify<H: RsaVerifyCallback>(handler: H) -> Self {
        Self {
            inner: HandlerInner::RsaVerify(Arc::new(handler)),
        }
    }

    pub fn atomic_record_encrypt<H: RecordEncryptCallback>(handler: H) -> Self {
        Self {
            inner: HandlerInner::AtomicRecordEncrypt(Arc::new(handler)),
        }
    }

    pub fn atomic_record_decrypt<H: RecordDecryptCallback>(handler: H) -> Self {
        Self {
            inner: HandlerInner::AtomicRecordDecrypt(Arc::new(handler)),
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self.inner {
            HandlerInner::RsaPublicEncrypt(_) => OperationKind::RsaPublicEncrypt,
            HandlerInner::RsaSign(_) => OperationKind::RsaSign,
            HandlerInner::RsaVerify(_) => OperationKind::RsaVerify,
            HandlerInner::AtomicRecordEncrypt(_) => OperationKind::AtomicRecordEncrypt,
            HandlerInner::AtomicRecordDecrypt(_) => OperationKind::AtomicRecordDecrypt,
        }
    }

    /// True when both values refer to the same registered instance.
    pub fn same_as(&self, other: &Handler) -> bool {
        use HandlerInner::*;
        match (&self.inner, &other.inner) {
            (RsaPublicEncrypt(a), RsaPublicEncrypt(b)) => Arc::ptr_eq(a, b),
            (RsaSign(a), RsaSign(b)) => Arc::ptr_eq(a, b),
            (RsaVerify(a), RsaVerify(b)) => Arc::ptr_eq(a, b),
            (AtomicRecordEncrypt(a), AtomicRecordEncrypt(b)) => Arc::ptr_eq(a, b),
            (AtomicRecordDecrypt(a), AtomicRecordDecrypt(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.kind()).finish()
    }
}
