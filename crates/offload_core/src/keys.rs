//! Session-derived record key material.
//!
//! The engine installs one [`TrafficKeys`] per direction once the handshake
//! has negotiated a bulk cipher. Record handlers read it through the session
//! handle during their one-time setup; it is never passed as a callback
//! argument.
//!
//! Keys follow the TLS 1.3 layout:
//!   key = HKDF-Expand-Label(secret, "key", "", key_len)
//!   iv  = HKDF-Expand-Label(secret, "iv",  "", 12)
//!   nonce(seq) = iv XOR seq (big-endian, left-padded to 12 bytes)

use std::fmt;

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::OffloadError;

pub const IV_LEN: usize = 12;

/// Authentication tag appended by every AEAD the reference handlers support.
pub const TAG_LEN: usize = 16;

/// Largest protected record payload (2^14 plaintext + 256 expansion).
pub const MAX_CIPHERTEXT_LEN: usize = 16384 + 256;

/// Bulk cipher negotiated for a session. Discriminants are the wire values
/// used by the TLS engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BulkCipher {
    Null = 0,
    Rc4 = 1,
    Rc2 = 2,
    Des = 3,
    TripleDes = 4,
    Des40 = 5,
    Idea = 6,
    Aes = 7,
    AesGcm = 8,
    AesCcm = 9,
    #[serde(rename = "chacha")]
    ChaCha = 10,
    Camellia = 11,
    Hc128 = 12,
    Rabbit = 13,
}

impl BulkCipher {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Null,
            1 => Self::Rc4,
            2 => Self::Rc2,
            3 => Self::Des,
            4 => Self::TripleDes,
            5 => Self::Des40,
            6 => Self::Idea,
            7 => Self::Aes,
            8 => Self::AesGcm,
            9 => Self::AesCcm,
            10 => Self::ChaCha,
            11 => Self::Camellia,
            12 => Self::Hc128,
            13 => Self::Rabbit,
            _ => return None,
        })
    }

    /// Key length used when deriving keys from a traffic secret, for the
    /// AEADs this crate knows how to key.
    pub fn default_key_len(self) -> Option<usize> {
        match self {
            Self::AesGcm => Some(16),
            Self::ChaCha => Some(32),
            _ => None,
        }
    }
}

/// TLS record content type, authenticated as part of the record AAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

/// Additional data for one record: `type || 0x0303 || u16 length`.
pub fn record_aad(content_type: ContentType, ciphertext_len: u16) -> [u8; 5] {
    let len = ciphertext_len.to_be_bytes();
    [content_type as u8, 0x03, 0x03, len[0], len[1]]
}

/// Key material for one direction of a session. Zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct TrafficKeys {
    #[zeroize(skip)]
    cipher: BulkCipher,
    key: Vec<u8>,
    iv: [u8; IV_LEN],
}

impl TrafficKeys {
    pub fn new(cipher: BulkCipher, key: &[u8], iv: [u8; IV_LEN]) -> Self {
        Self {
            cipher,
            key: key.to_vec(),
            iv,
        }
    }

    /// Derive key and IV from a 32-byte traffic secret.
    pub fn derive(cipher: BulkCipher, secret: &[u8]) -> Result<Self, OffloadError> {
        let key_len = cipher.default_key_len().ok_or_else(|| {
            OffloadError::KeyDerivation(format!("no key schedule for {cipher:?}"))
        })?;
        let hk = Hkdf::<Sha256>::from_prk(secret)
            .map_err(|e| OffloadError::KeyDerivation(e.to_string()))?;

        let mut key = vec![0u8; key_len];
        let mut iv = [0u8; IV_LEN];
        expand_label(&hk, b"key", &mut key)?;
        expand_label(&hk, b"iv", &mut iv)?;
        Ok(Self { cipher, key, iv })
    }

    pub fn cipher(&self) -> BulkCipher {
        self.cipher
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    /// Per-record nonce for sequence number `seq`.
    pub fn nonce(&self, seq: u64) -> [u8; IV_LEN] {
        xor_nonce(&self.iv, seq)
    }
}

/// Expand a shared handshake secret into the 32-byte traffic secret for
/// `label` (e.g. `c ap traffic`).
pub fn traffic_secret(shared: &[u8], label: &[u8]) -> Result<Zeroizing<[u8; 32]>, OffloadError> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut secret = Zeroizing::new([0u8; 32]);
    expand_label(&hk, label, &mut *secret)?;
    Ok(secret)
}

/// `iv` XOR big-endian `seq`, left-padded to the IV length.
pub fn xor_nonce(iv: &[u8; IV_LEN], seq: u64) -> [u8; IV_LEN] {
    let mut nonce = *iv;
    for (n, s) in nonce[IV_LEN - 8..].iter_mut().zip(seq.to_be_bytes()) {
        *n ^= s;
    }
    nonce
}

impl fmt::Debug for TrafficKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrafficKeys")
            .field("cipher", &self.cipher)
            .field("key_len", &self.key.len())
            .finish_non_exhaustive()
    }
}

fn expand_label(hk: &Hkdf<Sha256>, label: &[u8], out: &mut [u8]) -> Result<(), OffloadError> {
    const PREFIX: &[u8] = b"tls13 ";
    let mut info = Vec::with_capacity(4 + PREFIX.len() + label.len());
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push((PREFIX.len() + label.len()) as u8);
    info.extend_from_slice(PREFIX);
    info.extend_from_slice(label);
    info.push(0); // empty context
    hk.expand(&info, out)
        .map_err(|e| OffloadError::KeyDerivation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_codes_roundtrip() {
        for code in 0..=13u8 {
            let cipher = BulkCipher::from_code(code).unwrap();
            assert_eq!(cipher.code(), code);
        }
        assert_eq!(BulkCipher::from_code(14), None);
    }

    #[test]
    fn derive_is_deterministic_and_sized() {
        let secret = [7u8; 32];
        let a = TrafficKeys::derive(BulkCipher::AesGcm, &secret).unwrap();
        let b = TrafficKeys::derive(BulkCipher::AesGcm, &secret).unwrap();
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().len(), 16);
        assert_eq!(a.nonce(0), b.nonce(0));

        let chacha = TrafficKeys::derive(BulkCipher::ChaCha, &secret).unwrap();
        assert_eq!(chacha.key().len(), 32);
    }

    #[test]
    fn derive_rejects_unkeyed_cipher_and_short_secret() {
        assert!(matches!(
            TrafficKeys::derive(BulkCipher::Rc4, &[1u8; 32]),
            Err(OffloadError::KeyDerivation(_))
        ));
        assert!(matches!(
            TrafficKeys::derive(BulkCipher::AesGcm, &[1u8; 8]),
            Err(OffloadError::KeyDerivation(_))
        ));
    }

    #[test]
    fn traffic_secrets_differ_per_label() {
        let c = traffic_secret(&[3u8; 32], b"c ap traffic").unwrap();
        let s = traffic_secret(&[3u8; 32], b"s ap traffic").unwrap();
        assert_ne!(*c, *s);
        let keys = TrafficKeys::derive(BulkCipher::AesGcm, &*c).unwrap();
        assert_eq!(keys.key().len(), 16);
    }

    #[test]
    fn nonce_xors_sequence_into_low_bytes() {
        let keys = TrafficKeys::new(BulkCipher::AesGcm, &[0u8; 16], [0xAA; IV_LEN]);
        let nonce = keys.nonce(1);
        assert_eq!(&nonce[..IV_LEN - 1], &[0xAA; IV_LEN - 1]);
        assert_eq!(nonce[IV_LEN - 1], 0xAB);
        assert_eq!(keys.nonce(0), [0xAA; IV_LEN]);
    }

    #[test]
    fn aad_layout() {
        assert_eq!(
            record_aad(ContentType::ApplicationData, 0x0120),
            [23, 0x03, 0x03, 0x01, 0x20]
        );
    }

    #[test]
    fn debug_hides_key_bytes() {
        let keys = TrafficKeys::new(BulkCipher::AesGcm, &[0x5A; 16], [0; IV_LEN]);
        let printed = format!("{keys:?}");
        assert!(!printed.contains("90")); // 0x5A
        assert!(printed.contains("key_len: 16"));
    }
}
