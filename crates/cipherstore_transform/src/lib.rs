//! # cipherstore transform
//!
//! Self-describing compress-then-encrypt codec for stored records and blobs.
//!
//! Every protected buffer starts with a 2-byte marker:
//!
//! - `.e` - the rest is ciphertext of a (possibly compressed) plaintext
//! - `.z` - the rest is a zlib stream (only ever seen inside ciphertext)
//! - no marker - raw plaintext written before encryption was enabled
//!
//! Protecting protected data is a no-op, and unprotecting unmarked data returns
//! it unchanged, so the codec can be applied to mixed datasets.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cipherstore_transform::EncryptionConfig;
//!
//! let config = EncryptionConfig::local("kek.key", "dek-storage");
//! let transform = config.build().unwrap();
//!
//! let framed = transform.protect(b"some record").unwrap();
//! assert!(framed.starts_with(b".e"));
//! assert_eq!(transform.unprotect(&framed).unwrap().as_ref(), b"some record");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod compress;
mod config;
mod error;
mod facility;
mod record;
mod utility;

pub use compress::{compress, decompress, is_compressed, COMPRESSION_MARKER, COMPRESSION_THRESHOLD};
pub use config::{EncryptionConfig, FacilityConfig};
pub use error::{TransformError, TransformResult};
pub use facility::{key_fingerprint, KeyFacility, LocalKeyFacility, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use record::{is_protected, FrameState, RecordTransform, CIPHERTEXT_MARKER};
pub use utility::{DecryptFallback, EncryptionUtility, KeyedEncryption, TrivialEncryption};
