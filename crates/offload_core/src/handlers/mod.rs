//! Reference handlers bridging the offload seam to RustCrypto providers.
//!
//! - `pk`      RSA encrypt, sign and verify (`pk-callbacks` feature)
//! - `record`  atomic AEAD record encrypt and decrypt (`atomic-user` feature)

#[cfg(feature = "pk-callbacks")]
pub mod pk;
#[cfg(feature = "atomic-user")]
pub mod record;

#[cfg(feature = "pk-callbacks")]
pub use pk::{SigningKeyContext, SoftwareRsa};
#[cfg(feature = "atomic-user")]
pub use record::{RecordCipherContext, SoftwareRecordCipher};
