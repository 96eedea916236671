//! Encryption configuration.
//!
//! Configuration is read from the `[encryption]` table of a TOML file:
//!
//! ```toml
//! [encryption]
//! enabled = true
//! kek-path = "kek.key"
//! dek-storage-path = "dek-storage/"
//! decrypt-fallback = "passthrough"
//! ```
//!
//! `kmi-server` (a URL) may be given instead of `dek-storage-path`, never both.
//! Relative paths resolve against the directory holding the file.

use crate::error::{TransformError, TransformResult};
use crate::facility::{KeyFacility, LocalKeyFacility};
use crate::record::RecordTransform;
use crate::utility::{DecryptFallback, KeyedEncryption};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// Which key facility to bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FacilityConfig {
    /// Local DEK storage directory.
    Local {
        /// Directory holding the wrapped DEKs.
        dek_storage_path: PathBuf,
    },
    /// Remote key management server.
    Remote {
        /// Server URL.
        server: Url,
    },
}

/// Configuration of the record transform's encryption step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionConfig {
    /// Whether encryption is enabled. When disabled the transform still frames
    /// records but the encryption step is the identity.
    pub enabled: bool,

    /// Where the key-encrypting key is stored. Required when enabled.
    pub kek_path: Option<PathBuf>,

    /// The key facility. Required when enabled, unless one is injected with
    /// [`EncryptionConfig::build_with_facility`].
    pub facility: Option<FacilityConfig>,

    /// What to do with ciphertext that fails to decrypt.
    pub decrypt_fallback: DecryptFallback,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawEncryption {
    #[serde(default)]
    enabled: bool,
    kek_path: Option<PathBuf>,
    kmi_server: Option<String>,
    dek_storage_path: Option<PathBuf>,
    #[serde(default)]
    decrypt_fallback: DecryptFallback,
}

#[derive(Debug, Default, Deserialize)]
struct RawFile {
    #[serde(default)]
    encryption: RawEncryption,
}

fn resolve(here: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        here.join(path)
    }
}

impl EncryptionConfig {
    /// Creates a disabled configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an enabled configuration using local DEK storage.
    #[must_use]
    pub fn local(kek_path: impl Into<PathBuf>, dek_storage_path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            kek_path: Some(kek_path.into()),
            facility: Some(FacilityConfig::Local {
                dek_storage_path: dek_storage_path.into(),
            }),
            decrypt_fallback: DecryptFallback::default(),
        }
    }

    /// Creates an enabled configuration using a remote key server.
    #[must_use]
    pub fn remote(kek_path: impl Into<PathBuf>, server: Url) -> Self {
        Self {
            enabled: true,
            kek_path: Some(kek_path.into()),
            facility: Some(FacilityConfig::Remote { server }),
            decrypt_fallback: DecryptFallback::default(),
        }
    }

    /// Sets the decrypt fallback policy.
    #[must_use]
    pub const fn with_decrypt_fallback(mut self, fallback: DecryptFallback) -> Self {
        self.decrypt_fallback = fallback;
        self
    }

    /// Parses a TOML document. Relative paths are resolved against `here`.
    ///
    /// A document without an `[encryption]` table yields a disabled
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::Config`] if the document is malformed or
    /// fails validation.
    pub fn from_toml_str(text: &str, here: &Path) -> TransformResult<Self> {
        let raw: RawFile =
            toml::from_str(text).map_err(|e| TransformError::config(e.to_string()))?;
        let raw = raw.encryption;

        let facility = match (raw.kmi_server, raw.dek_storage_path) {
            (Some(_), Some(_)) => {
                return Err(TransformError::config(
                    "kmi-server and dek-storage-path are mutually exclusive",
                ))
            }
            (Some(server), None) => {
                let server = Url::parse(&server)
                    .map_err(|e| TransformError::config(format!("kmi-server: {e}")))?;
                Some(FacilityConfig::Remote { server })
            }
            (None, Some(dir)) => Some(FacilityConfig::Local {
                dek_storage_path: resolve(here, dir),
            }),
            (None, None) => None,
        };

        let config = Self {
            enabled: raw.enabled,
            kek_path: raw.kek_path.map(|p| resolve(here, p)),
            facility,
            decrypt_fallback: raw.decrypt_fallback,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    pub fn load(path: impl AsRef<Path>) -> TransformResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let here = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        Self::from_toml_str(&text, here)
    }

    /// Checks that an enabled configuration names a key path and a facility.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::Config`] describing the first problem.
    pub fn validate(&self) -> TransformResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.kek_path.is_none() {
            return Err(TransformError::config(
                "kek-path is required when encryption is enabled",
            ));
        }
        if self.facility.is_none() {
            return Err(TransformError::config(
                "one of kmi-server or dek-storage-path is required when encryption is enabled",
            ));
        }
        Ok(())
    }

    /// Builds the record transform.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::UnsupportedFacility`] for a remote key
    /// server, or any error from opening the key.
    pub fn build(&self) -> TransformResult<RecordTransform> {
        if !self.enabled {
            return Ok(RecordTransform::trivial());
        }
        Ok(RecordTransform::new(Arc::new(self.keyed_utility()?)))
    }

    /// Builds the record transform over a caller-provided key facility.
    ///
    /// The configured facility, if any, is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be loaded or generated.
    pub fn build_with_facility(
        &self,
        facility: Arc<dyn KeyFacility>,
    ) -> TransformResult<RecordTransform> {
        if !self.enabled {
            return Ok(RecordTransform::trivial());
        }
        Ok(RecordTransform::new(Arc::new(
            self.keyed_utility_with(facility)?,
        )))
    }

    /// Opens the keyed utility with the configured facility, regardless of
    /// `enabled`.
    ///
    /// # Errors
    ///
    /// See [`build`](Self::build).
    pub fn keyed_utility(&self) -> TransformResult<KeyedEncryption> {
        let facility: Arc<dyn KeyFacility> = match &self.facility {
            Some(FacilityConfig::Local { dek_storage_path }) => {
                Arc::new(LocalKeyFacility::new(dek_storage_path)?)
            }
            Some(FacilityConfig::Remote { server }) => {
                return Err(TransformError::UnsupportedFacility {
                    facility: format!("kmi-server {server}"),
                })
            }
            None => {
                return Err(TransformError::config("no key facility configured"));
            }
        };
        self.keyed_utility_with(facility)
    }

    /// Opens the keyed utility over `facility`, regardless of `enabled`.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::Config`] if no key path is set, or an error
    /// from opening the key.
    pub fn keyed_utility_with(
        &self,
        facility: Arc<dyn KeyFacility>,
    ) -> TransformResult<KeyedEncryption> {
        let kek_path = self
            .kek_path
            .as_ref()
            .ok_or_else(|| TransformError::config("kek-path is not configured"))?;
        Ok(KeyedEncryption::open(kek_path, facility)?.with_fallback(self.decrypt_fallback))
    }
}
