//! Key management facilities.
//!
//! A [`KeyFacility`] generates key-encrypting keys (KEKs) and performs the raw
//! encryption of byte buffers under a KEK. The record transform never looks
//! inside the facility's ciphertext format.
//!
//! ## Local Facility
//!
//! [`LocalKeyFacility`] keeps one data-encryption key (DEK) per KEK in a
//! directory:
//!
//! - DEK file name: first 32 hex digits of `sha256(kek)`, suffix `.dek`
//! - DEK file body: `nonce (12 bytes) || AES-256-GCM(wrap_key, dek) || tag (16 bytes)`
//! - `wrap_key` is derived from the KEK with HKDF-SHA256
//! - Data ciphertext: `nonce (12 bytes) || AES-256-GCM(dek, data) || tag (16 bytes)`

use crate::error::{TransformError, TransformResult};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use parking_lot::RwLock;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zeroize::Zeroizing;

/// Size of KEKs and DEKs in bytes (AES-256).
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// File extension of stored data-encryption keys.
const DEK_EXTENSION: &str = "dek";

/// HKDF info string for the DEK wrapping key.
const WRAP_KEY_INFO: &[u8] = b"cipherstore-dek-wrap-v1";

/// A key management facility.
///
/// Implementations must be `Send + Sync`; one facility instance is shared by
/// every transform built from the same configuration.
pub trait KeyFacility: Send + Sync + fmt::Debug {
    /// Generates a new key-encrypting key.
    ///
    /// # Errors
    ///
    /// Returns an error if key material cannot be created or persisted.
    fn generate(&self) -> TransformResult<Vec<u8>>;

    /// Encrypts `data` under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unusable or encryption fails.
    fn encrypt(&self, key: &[u8], data: &[u8]) -> TransformResult<Vec<u8>>;

    /// Decrypts `data` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::Decryption`] if `data` is not valid
    /// ciphertext for `key`, or another error if the key is unusable.
    fn decrypt(&self, key: &[u8], data: &[u8]) -> TransformResult<Vec<u8>>;

    /// Encrypts everything read from `src` into `dst`.
    ///
    /// The default implementation buffers the whole stream.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if encryption fails.
    fn encrypt_stream(
        &self,
        key: &[u8],
        src: &mut dyn Read,
        dst: &mut dyn Write,
    ) -> TransformResult<()> {
        let mut buf = Vec::new();
        src.read_to_end(&mut buf)?;
        dst.write_all(&self.encrypt(key, &buf)?)?;
        Ok(())
    }

    /// Decrypts everything read from `src` into `dst`.
    ///
    /// The default implementation buffers the whole stream.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if decryption fails.
    fn decrypt_stream(
        &self,
        key: &[u8],
        src: &mut dyn Read,
        dst: &mut dyn Write,
    ) -> TransformResult<()> {
        let mut buf = Vec::new();
        src.read_to_end(&mut buf)?;
        dst.write_all(&self.decrypt(key, &buf)?)?;
        Ok(())
    }
}

/// Returns a short, stable, non-secret identifier for a key.
///
/// This is the first 32 hex digits of the key's SHA-256 digest.
#[must_use]
pub fn key_fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    hex::encode(&digest[..16])
}

/// Writes secret key material to a new file.
///
/// Fails with [`io::ErrorKind::AlreadyExists`] if the file is already there,
/// so that concurrent creators never overwrite each other's keys.
pub(crate) fn write_secret_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn seal(cipher: &Aes256Gcm, plaintext: &[u8]) -> TransformResult<Vec<u8>> {
    let nonce_bytes = random_nonce();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| TransformError::encryption("AES-GCM encryption error"))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend(ciphertext);
    Ok(result)
}

fn open(cipher: &Aes256Gcm, sealed: &[u8]) -> TransformResult<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(TransformError::decryption("ciphertext too short"));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| TransformError::decryption("authentication failed"))
}

/// A key facility that stores data-encryption keys in a local directory.
///
/// # Example
///
/// ```no_run
/// use cipherstore_transform::{KeyFacility, LocalKeyFacility};
///
/// let facility = LocalKeyFacility::new("dek-storage").unwrap();
/// let kek = facility.generate().unwrap();
/// let sealed = facility.encrypt(&kek, b"secret").unwrap();
/// assert_eq!(facility.decrypt(&kek, &sealed).unwrap(), b"secret");
/// ```
pub struct LocalKeyFacility {
    storage_dir: PathBuf,
    /// Unwrapped DEKs by KEK fingerprint.
    deks: RwLock<HashMap<String, Zeroizing<[u8; KEY_SIZE]>>>,
}

impl LocalKeyFacility {
    /// Opens a facility over `storage_dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(storage_dir: impl Into<PathBuf>) -> TransformResult<Self> {
        let storage_dir = storage_dir.into();
        fs::create_dir_all(&storage_dir)?;
        Ok(Self {
            storage_dir,
            deks: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the directory holding the DEK files.
    #[must_use]
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Returns the path of the DEK file belonging to `kek`.
    #[must_use]
    pub fn dek_path(&self, kek: &[u8]) -> PathBuf {
        self.storage_dir
            .join(format!("{}.{DEK_EXTENSION}", key_fingerprint(kek)))
    }

    fn check_kek(kek: &[u8]) -> TransformResult<()> {
        if kek.len() != KEY_SIZE {
            return Err(TransformError::invalid_key_size(kek.len(), KEY_SIZE));
        }
        Ok(())
    }

    fn wrap_cipher(kek: &[u8]) -> TransformResult<Aes256Gcm> {
        let hk = Hkdf::<Sha256>::new(None, kek);
        let mut wrap_key = Zeroizing::new([0u8; KEY_SIZE]);
        hk.expand(WRAP_KEY_INFO, &mut wrap_key[..])
            .map_err(|_| TransformError::encryption("HKDF expand failed"))?;
        Aes256Gcm::new_from_slice(&wrap_key[..])
            .map_err(|_| TransformError::invalid_key_size(wrap_key.len(), KEY_SIZE))
    }

    /// Returns the DEK for `kek`, loading or creating its file on first use.
    fn dek_for(&self, kek: &[u8]) -> TransformResult<Zeroizing<[u8; KEY_SIZE]>> {
        Self::check_kek(kek)?;
        let id = key_fingerprint(kek);
        if let Some(dek) = self.deks.read().get(&id) {
            return Ok(dek.clone());
        }

        let wrap = Self::wrap_cipher(kek)?;
        let path = self.dek_path(kek);
        let dek = match fs::read(&path) {
            Ok(sealed) => Self::unwrap_dek(&wrap, &sealed)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.create_dek(&wrap, &path)?,
            Err(e) => return Err(e.into()),
        };

        self.deks.write().insert(id, dek.clone());
        Ok(dek)
    }

    fn create_dek(&self, wrap: &Aes256Gcm, path: &Path) -> TransformResult<Zeroizing<[u8; KEY_SIZE]>> {
        let mut dek = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(&mut dek[..]);
        let sealed = seal(wrap, &dek[..])?;

        match write_secret_file(path, &sealed) {
            Ok(()) => {
                debug!(path = %path.display(), "created data encryption key");
                Ok(dek)
            }
            // Another writer won the race; use its key.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Self::unwrap_dek(wrap, &fs::read(path)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn unwrap_dek(wrap: &Aes256Gcm, sealed: &[u8]) -> TransformResult<Zeroizing<[u8; KEY_SIZE]>> {
        // Reported as Encryption so the decrypt fallback never swallows it.
        let bytes = Zeroizing::new(
            open(wrap, sealed)
                .map_err(|_| TransformError::encryption("data key does not match key-encrypting key"))?,
        );
        if bytes.len() != KEY_SIZE {
            return Err(TransformError::invalid_key_size(bytes.len(), KEY_SIZE));
        }
        let mut dek = Zeroizing::new([0u8; KEY_SIZE]);
        dek.copy_from_slice(&bytes);
        Ok(dek)
    }

    fn data_cipher(&self, kek: &[u8]) -> TransformResult<Aes256Gcm> {
        let dek = self.dek_for(kek)?;
        Aes256Gcm::new_from_slice(&dek[..])
            .map_err(|_| TransformError::invalid_key_size(dek.len(), KEY_SIZE))
    }
}

impl KeyFacility for LocalKeyFacility {
    fn generate(&self) -> TransformResult<Vec<u8>> {
        let mut kek = vec![0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut kek);
        self.dek_for(&kek)?;
        Ok(kek)
    }

    fn encrypt(&self, key: &[u8], data: &[u8]) -> TransformResult<Vec<u8>> {
        seal(&self.data_cipher(key)?, data)
    }

    fn decrypt(&self, key: &[u8], data: &[u8]) -> TransformResult<Vec<u8>> {
        open(&self.data_cipher(key)?, data)
    }
}

impl fmt::Debug for LocalKeyFacility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyFacility")
            .field("storage_dir", &self.storage_dir)
            .field("cached_keys", &self.deks.read().len())
            .finish()
    }
}
