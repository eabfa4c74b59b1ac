//! Software atomic record handlers.
//!
//! Record layout is `ciphertext || tag` with the per-record nonce derived
//! from the session IV and the direction's sequence number, and the 5-byte
//! record header as additional data. The AEAD instance is built lazily from
//! the session's traffic keys on the first call and cached in the attached
//! [`RecordCipherContext`].

use std::fmt;

use aes_gcm::aead::{self, Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use tracing::debug;
use zeroize::Zeroizing;

use crate::callbacks::{RecordDecryptCallback, RecordEncryptCallback};
use crate::error::CallbackError;
use crate::keys::{
    record_aad, BulkCipher, ContentType, TrafficKeys, IV_LEN, MAX_CIPHERTEXT_LEN, TAG_LEN,
};
use crate::session::SessionView;

enum RecordAead {
    Aes128Gcm(Box<Aes128Gcm>),
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

impl RecordAead {
    fn setup(keys: &TrafficKeys) -> Result<Self, CallbackError> {
        let key = keys.key();
        let bad_key = || CallbackError::Setup(format!("bad key length {}", key.len()));
        match (keys.cipher(), key.len()) {
            (BulkCipher::AesGcm, 16) => Ok(Self::Aes128Gcm(Box::new(
                Aes128Gcm::new_from_slice(key).map_err(|_| bad_key())?,
            ))),
            (BulkCipher::AesGcm, 32) => Ok(Self::Aes256Gcm(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(|_| bad_key())?,
            ))),
            (BulkCipher::ChaCha, 32) => Ok(Self::ChaCha20Poly1305(Box::new(
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| bad_key())?,
            ))),
            (BulkCipher::AesGcm | BulkCipher::ChaCha, n) => Err(CallbackError::Setup(format!(
                "{:?} cannot be keyed with {n} bytes",
                keys.cipher()
            ))),
            (other, _) => Err(CallbackError::Setup(format!(
                "unsupported bulk cipher {other:?}"
            ))),
        }
    }

    fn seal(&self, nonce: &[u8; IV_LEN], payload: Payload<'_, '_>) -> Result<Vec<u8>, aead::Error> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            Self::Aes128Gcm(c) => c.encrypt(nonce, payload),
            Self::Aes256Gcm(c) => c.encrypt(nonce, payload),
            Self::ChaCha20Poly1305(c) => c.encrypt(nonce, payload),
        }
    }

    fn open(&self, nonce: &[u8; IV_LEN], payload: Payload<'_, '_>) -> Result<Vec<u8>, aead::Error> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            Self::Aes128Gcm(c) => c.decrypt(nonce, payload),
            Self::Aes256Gcm(c) => c.decrypt(nonce, payload),
            Self::ChaCha20Poly1305(c) => c.decrypt(nonce, payload),
        }
    }
}

struct InitializedCipher {
    aead: RecordAead,
    cipher: BulkCipher,
    key: Zeroizing<Vec<u8>>,
    iv: Zeroizing<[u8; IV_LEN]>,
}

impl InitializedCipher {
    /// Same cipher, key and IV. Any difference means the keys were replaced.
    fn matches(&self, keys: &TrafficKeys) -> bool {
        self.cipher == keys.cipher()
            && self.key.as_slice() == keys.key()
            && *self.iv == *keys.iv()
    }
}

/// Per-session state for [`SoftwareRecordCipher`]. Attach the same context
/// for both record kinds; each direction keeps its own cipher.
#[derive(Default)]
pub struct RecordCipherContext {
    read: Option<InitializedCipher>,
    write: Option<InitializedCipher>,
    setup_attempts: u32,
    records: u64,
}

impl RecordCipherContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a cipher is configured for at least one direction. A
    /// context attached for a single record kind only ever fills that one.
    pub fn is_initialized(&self) -> bool {
        self.read.is_some() || self.write.is_some()
    }

    pub fn is_read_initialized(&self) -> bool {
        self.read.is_some()
    }

    pub fn is_write_initialized(&self) -> bool {
        self.write.is_some()
    }

    /// Number of times cipher setup has been attempted, successful or not.
    pub fn setup_attempts(&self) -> u32 {
        self.setup_attempts
    }

    /// Records successfully processed in either direction.
    pub fn records(&self) -> u64 {
        self.records
    }

    fn cipher_for<'a>(
        slot: &'a mut Option<InitializedCipher>,
        attempts: &mut u32,
        keys: Option<&TrafficKeys>,
    ) -> Result<&'a RecordAead, CallbackError> {
        let keys = keys.ok_or_else(|| CallbackError::Setup("no traffic keys installed".into()))?;
        // A rekey builds the new cipher before dropping the old one, so a
        // failed rebuild never leaves an initialised context empty.
        if !slot.as_ref().is_some_and(|c| c.matches(keys)) {
            *attempts += 1;
            let fresh = InitializedCipher {
                aead: RecordAead::setup(keys)?,
                cipher: keys.cipher(),
                key: Zeroizing::new(keys.key().to_vec()),
                iv: Zeroizing::new(*keys.iv()),
            };
            if slot.is_some() {
                debug!(cipher = ?keys.cipher(), "traffic keys changed, record cipher rebuilt");
            }
            *slot = Some(fresh);
        }
        slot.as_ref()
            .map(|c| &c.aead)
            .ok_or_else(|| CallbackError::Setup("record cipher unavailable".into()))
    }
}

impl fmt::Debug for RecordCipherContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordCipherContext")
            .field("read", &self.read.as_ref().map(|c| c.cipher))
            .field("write", &self.write.as_ref().map(|c| c.cipher))
            .field("setup_attempts", &self.setup_attempts)
            .field("records", &self.records)
            .finish()
    }
}

/// Atomic record handler over AES-GCM and ChaCha20-Poly1305.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareRecordCipher;

impl RecordEncryptCallback for SoftwareRecordCipher {
    type Context = RecordCipherContext;

    fn encrypt_record(
        &self,
        session: &SessionView<'_>,
        ctx: &mut RecordCipherContext,
        content_type: ContentType,
        plaintext: &[u8],
        out: &mut [u8],
    ) -> Result<usize, CallbackError> {
        let needed = plaintext.len() + TAG_LEN;
        if needed > MAX_CIPHERTEXT_LEN {
            return Err(CallbackError::Operation(format!(
                "record plaintext of {} bytes exceeds the record limit",
                plaintext.len()
            )));
        }
        if out.len() < needed {
            return Err(CallbackError::BufferTooSmall { needed });
        }

        let keys = session.write_keys();
        let aead = RecordCipherContext::cipher_for(
            &mut ctx.write,
            &mut ctx.setup_attempts,
            keys,
        )?;
        let nonce = keys
            .map(|k| k.nonce(session.write_sequence()))
            .ok_or_else(|| CallbackError::Setup("no traffic keys installed".into()))?;
        let aad = record_aad(content_type, needed as u16);
        let sealed = aead
            .seal(&nonce, Payload { msg: plaintext, aad: &aad })
            .map_err(|_| CallbackError::Operation("record encryption failed".into()))?;

        out[..sealed.len()].copy_from_slice(&sealed);
        ctx.records += 1;
        Ok(sealed.len())
    }
}

impl RecordDecryptCallback for SoftwareRecordCipher {
    type Context = RecordCipherContext;

    fn decrypt_record(
        &self,
        session: &SessionView<'_>,
        ctx: &mut RecordCipherContext,
        content_type: ContentType,
        ciphertext: &[u8],
        out: &mut [u8],
    ) -> Result<usize, CallbackError> {
        if ciphertext.len() < TAG_LEN || ciphertext.len() > MAX_CIPHERTEXT_LEN {
            return Err(CallbackError::Operation(format!(
                "record length {} out of range",
                ciphertext.len()
            )));
        }
        let needed = ciphertext.len() - TAG_LEN;
        if out.len() < needed {
            return Err(CallbackError::BufferTooSmall { needed });
        }

        let keys = session.read_keys();
        let aead = RecordCipherContext::cipher_for(
            &mut ctx.read,
            &mut ctx.setup_attempts,
            keys,
        )?;
        let nonce = keys
            .map(|k| k.nonce(session.read_sequence()))
            .ok_or_else(|| CallbackError::Setup("no traffic keys installed".into()))?;
        let aad = record_aad(content_type, ciphertext.len() as u16);
        let plaintext = Zeroizing::new(
            aead.open(&nonce, Payload { msg: ciphertext, aad: &aad })
                .map_err(|_| CallbackError::Operation("record authentication failed".into()))?,
        );

        out[..plaintext.len()].copy_from_slice(&plaintext);
        ctx.records += 1;
        Ok(plaintext.len())
    }
}
