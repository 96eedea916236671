//! Encryption utilities.
//!
//! An [`EncryptionUtility`] binds one key-encrypting key to one
//! [`KeyFacility`] and performs the encrypt/decrypt step of the record
//! transform. [`TrivialEncryption`] is the identity used when encryption is
//! disabled; [`KeyedEncryption`] is the real thing.
//!
//! ## Decrypt Fallback
//!
//! Ciphertext that fails validation is handled according to
//! [`DecryptFallback`]. The default, [`DecryptFallback::Passthrough`], returns
//! the input unchanged and logs a warning, so that partially migrated or
//! corrupt datasets keep loading. [`DecryptFallback::Strict`] surfaces the
//! error instead.

use crate::error::{TransformError, TransformResult};
use crate::facility::{key_fingerprint, write_secret_file, KeyFacility};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// What to do when ciphertext fails validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecryptFallback {
    /// Return the undecryptable bytes unchanged and log a warning.
    #[default]
    Passthrough,
    /// Fail with [`TransformError::Decryption`].
    Strict,
}

/// Applies the fallback policy to a failed decode of `data`.
///
/// Only recoverable errors (see [`TransformError::is_recoverable`]) are ever
/// swallowed.
pub(crate) fn apply_fallback(
    policy: DecryptFallback,
    error: TransformError,
    data: Vec<u8>,
) -> TransformResult<Vec<u8>> {
    if policy == DecryptFallback::Passthrough && error.is_recoverable() {
        warn!(len = data.len(), %error, "undecodable payload returned unchanged");
        Ok(data)
    } else {
        Err(error)
    }
}

/// Encrypts and decrypts byte buffers under one key.
pub trait EncryptionUtility: Send + Sync + fmt::Debug {
    /// Encrypts raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the facility fails.
    fn encrypt_bytes(&self, data: &[u8]) -> TransformResult<Vec<u8>>;

    /// Decrypts raw bytes, applying the decrypt fallback policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the facility fails and the policy does not recover.
    fn decrypt_bytes(&self, data: &[u8]) -> TransformResult<Vec<u8>>;

    /// Encrypts a stream.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the facility fails.
    fn encrypt_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> TransformResult<()>;

    /// Decrypts a stream, applying the decrypt fallback policy.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if decryption fails and the policy
    /// does not recover.
    fn decrypt_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> TransformResult<()>;

    /// Returns the policy used when decoding fails.
    fn decrypt_fallback(&self) -> DecryptFallback {
        DecryptFallback::Passthrough
    }

    /// Returns `true` if this utility does not change the bytes.
    fn is_trivial(&self) -> bool {
        false
    }

    /// Encrypts UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns an error if the facility fails.
    fn encrypt_text(&self, text: &str) -> TransformResult<Vec<u8>> {
        self.encrypt_bytes(text.as_bytes())
    }

    /// Decrypts bytes produced by [`encrypt_text`](Self::encrypt_text).
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::InvalidText`] if the result is not UTF-8.
    fn decrypt_text(&self, data: &[u8]) -> TransformResult<String> {
        Ok(String::from_utf8(self.decrypt_bytes(data)?)?)
    }
}

/// The identity utility, used when encryption is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialEncryption;

impl EncryptionUtility for TrivialEncryption {
    fn encrypt_bytes(&self, data: &[u8]) -> TransformResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decrypt_bytes(&self, data: &[u8]) -> TransformResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn encrypt_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> TransformResult<()> {
        io::copy(src, dst)?;
        Ok(())
    }

    fn decrypt_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> TransformResult<()> {
        io::copy(src, dst)?;
        Ok(())
    }

    fn is_trivial(&self) -> bool {
        true
    }
}

/// An encryption utility holding a key-encrypting key.
///
/// The key is read from `kek_path` if the file exists; otherwise the facility
/// generates one and it is written to `kek_path`. Subsequent instances over the
/// same path reuse the stored key.
///
/// # Example
///
/// ```no_run
/// use cipherstore_transform::{EncryptionUtility, KeyedEncryption, LocalKeyFacility};
/// use std::sync::Arc;
///
/// let facility = Arc::new(LocalKeyFacility::new("dek-storage").unwrap());
/// let util = KeyedEncryption::open("kek.key", facility).unwrap();
/// let sealed = util.encrypt_text("test").unwrap();
/// assert_eq!(util.decrypt_text(&sealed).unwrap(), "test");
/// ```
pub struct KeyedEncryption {
    key: Zeroizing<Vec<u8>>,
    kek_path: PathBuf,
    facility: Arc<dyn KeyFacility>,
    fallback: DecryptFallback,
}

impl KeyedEncryption {
    /// Loads the KEK from `kek_path`, generating and persisting it if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the key file cannot be read or written, or if the
    /// facility cannot generate a key.
    pub fn open(
        kek_path: impl AsRef<Path>,
        facility: Arc<dyn KeyFacility>,
    ) -> TransformResult<Self> {
        let kek_path = kek_path.as_ref().to_path_buf();
        let key = match fs::read(&kek_path) {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Self::generate_key(&kek_path, facility.as_ref())?
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            key,
            kek_path,
            facility,
            fallback: DecryptFallback::default(),
        })
    }

    fn generate_key(
        kek_path: &Path,
        facility: &dyn KeyFacility,
    ) -> TransformResult<Zeroizing<Vec<u8>>> {
        let key = Zeroizing::new(facility.generate()?);
        match write_secret_file(kek_path, &key) {
            Ok(()) => {
                debug!(path = %kek_path.display(), "generated key-encrypting key");
                Ok(key)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Ok(Zeroizing::new(fs::read(kek_path)?))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Sets the decrypt fallback policy.
    #[must_use]
    pub fn with_fallback(mut self, fallback: DecryptFallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// Returns the path of the key file.
    #[must_use]
    pub fn kek_path(&self) -> &Path {
        &self.kek_path
    }

    /// Returns the key facility.
    #[must_use]
    pub fn facility(&self) -> &Arc<dyn KeyFacility> {
        &self.facility
    }

    /// Returns a non-secret identifier of the key.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        key_fingerprint(&self.key)
    }
}

impl EncryptionUtility for KeyedEncryption {
    fn encrypt_bytes(&self, data: &[u8]) -> TransformResult<Vec<u8>> {
        self.facility.encrypt(&self.key, data)
    }

    fn decrypt_bytes(&self, data: &[u8]) -> TransformResult<Vec<u8>> {
        match self.facility.decrypt(&self.key, data) {
            Ok(plaintext) => Ok(plaintext),
            Err(err) => apply_fallback(self.fallback, err, data.to_vec()),
        }
    }

    fn encrypt_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> TransformResult<()> {
        self.facility.encrypt_stream(&self.key, src, dst)
    }

    fn decrypt_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> TransformResult<()> {
        match self.fallback {
            DecryptFallback::Strict => self.facility.decrypt_stream(&self.key, src, dst),
            DecryptFallback::Passthrough => {
                // The source must be kept around to copy it on failure.
                let mut buf = Vec::new();
                src.read_to_end(&mut buf)?;
                dst.write_all(&self.decrypt_bytes(&buf)?)?;
                Ok(())
            }
        }
    }

    fn decrypt_fallback(&self) -> DecryptFallback {
        self.fallback
    }
}

impl fmt::Debug for KeyedEncryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedEncryption")
            .field("key", &"[REDACTED]")
            .field("kek_path", &self.kek_path)
            .field("facility", &self.facility)
            .field("fallback", &self.fallback)
            .finish()
    }
}
