//! Error types for record transform operations.

use std::io;
use thiserror::Error;

/// Result type for transform operations.
pub type TransformResult<T> = Result<T, TransformError>;

/// Errors that can occur while framing, compressing or encrypting records.
#[derive(Debug, Error)]
pub enum TransformError {
    /// An I/O error occurred (key file, DEK storage, blob streams).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The key facility failed to encrypt a buffer.
    #[error("encryption failed: {message}")]
    Encryption {
        /// Description of the failure.
        message: String,
    },

    /// Ciphertext failed validation (bad format, truncated, wrong key).
    ///
    /// This is the recoverable condition the decrypt fallback policy acts on.
    #[error("decryption failed: {message}")]
    Decryption {
        /// Description of the failure.
        message: String,
    },

    /// A `.z` payload could not be inflated.
    #[error("decompression failed: {message}")]
    Decompression {
        /// Description of the failure.
        message: String,
    },

    /// A key had the wrong length.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },

    /// The encryption configuration is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// The configured key facility cannot be bound by this build.
    #[error("unsupported key facility: {facility}")]
    UnsupportedFacility {
        /// The facility that was requested.
        facility: String,
    },

    /// Decrypted text was not valid UTF-8.
    #[error("decrypted text is not valid UTF-8")]
    InvalidText(#[from] std::string::FromUtf8Error),
}

impl TransformError {
    /// Creates an encryption error.
    pub fn encryption(message: impl Into<String>) -> Self {
        Self::Encryption {
            message: message.into(),
        }
    }

    /// Creates a decryption error.
    pub fn decryption(message: impl Into<String>) -> Self {
        Self::Decryption {
            message: message.into(),
        }
    }

    /// Creates a decompression error.
    pub fn decompression(message: impl Into<String>) -> Self {
        Self::Decompression {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid key size error.
    pub fn invalid_key_size(actual: usize, expected: usize) -> Self {
        Self::InvalidKeySize { expected, actual }
    }

    /// Returns `true` for errors the decrypt fallback policy may recover from.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decryption { .. } | Self::Decompression { .. })
    }
}
