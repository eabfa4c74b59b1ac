//! Software RSA handlers (PKCS#1 v1.5).
//!
//! `key_der` arguments accept SubjectPublicKeyInfo DER or bare PKCS#1
//! `RSAPublicKey` DER. Signing keys never travel through the engine: the
//! private key lives in a [`SigningKeyContext`] the application attaches.

use std::fmt;

use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::callbacks::{RsaEncryptCallback, RsaSignCallback, RsaVerifyCallback};
use crate::error::CallbackError;
use crate::session::SessionView;

/// PKCS#1 v1.5 encryption padding overhead.
const PKCS1_OVERHEAD: usize = 11;

pub fn parse_public_key(der: &[u8]) -> Result<RsaPublicKey, CallbackError> {
    RsaPublicKey::from_public_key_der(der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(der))
        .map_err(|e| CallbackError::Operation(format!("malformed RSA public key: {e}")))
}

/// Handler for [`RsaEncryptCallback`], [`RsaSignCallback`] and
/// [`RsaVerifyCallback`] backed by the `rsa` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareRsa;

/// Private key handle for [`SoftwareRsa`] signing.
pub struct SigningKeyContext {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    signatures: u64,
}

impl SigningKeyContext {
    pub fn new(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        Self {
            private,
            public,
            signatures: 0,
        }
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Signatures produced through this context so far.
    pub fn signatures(&self) -> u64 {
        self.signatures
    }
}

impl fmt::Debug for SigningKeyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyContext")
            .field("modulus_bytes", &self.public.size())
            .field("signatures", &self.signatures)
            .finish_non_exhaustive()
    }
}

impl RsaEncryptCallback for SoftwareRsa {
    type Context = ();

    fn rsa_encrypt(
        &self,
        _session: &SessionView<'_>,
        _ctx: Option<&mut ()>,
        plaintext: &[u8],
        key_der: &[u8],
        out: &mut [u8],
    ) -> Result<usize, CallbackError> {
        let key = parse_public_key(key_der)?;
        let modulus = key.size();
        if plaintext.is_empty() || plaintext.len() + PKCS1_OVERHEAD > modulus {
            return Err(CallbackError::Operation(format!(
                "plaintext of {} bytes does not fit a {}-byte modulus",
                plaintext.len(),
                modulus
            )));
        }
        if out.len() < modulus {
            return Err(CallbackError::BufferTooSmall { needed: modulus });
        }

        let ciphertext = key
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)
            .map_err(|e| CallbackError::Operation(e.to_string()))?;
        out[..ciphertext.len()].copy_from_slice(&ciphertext);
        Ok(ciphertext.len())
    }
}

impl RsaSignCallback for SoftwareRsa {
    type Context = SigningKeyContext;

    fn rsa_sign(
        &self,
        _session: &SessionView<'_>,
        ctx: Option<&mut SigningKeyContext>,
        message: &[u8],
        key_der: &[u8],
        out: &mut [u8],
    ) -> Result<usize, CallbackError> {
        let ctx = ctx.ok_or_else(|| CallbackError::Setup("no signing key attached".into()))?;
        let expected = parse_public_key(key_der)?;
        if expected != ctx.public {
            return Err(CallbackError::Operation(
                "requested key does not match the attached signing key".into(),
            ));
        }
        let needed = ctx.public.size();
        if out.len() < needed {
            return Err(CallbackError::BufferTooSmall { needed });
        }

        let signer = SigningKey::<Sha256>::new(ctx.private.clone());
        let signature = signer
            .try_sign(message)
            .map_err(|e| CallbackError::Operation(e.to_string()))?
            .to_bytes();
        out[..signature.len()].copy_from_slice(&signature);
        ctx.signatures += 1;
        Ok(signature.len())
    }
}

impl RsaVerifyCallback for SoftwareRsa {
    type Context = ();

    fn rsa_verify(
        &self,
        _session: &SessionView<'_>,
        _ctx: Option<&mut ()>,
        message: &[u8],
        signature: &[u8],
        key_der: &[u8],
    ) -> Result<(), CallbackError> {
        let key = parse_public_key(key_der)?;
        let signature = Signature::try_from(signature)
            .map_err(|e| CallbackError::Operation(format!("malformed signature: {e}")))?;
        VerifyingKey::<Sha256>::new(key)
            .verify(message, &signature)
            .map_err(|_| CallbackError::Operation("signature does not verify".into()))
    }
}
