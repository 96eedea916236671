//! Record framing.
//!
//! A protected record is `.e` followed by the encryption of either the raw
//! plaintext or its `.z` compressed form. Records without the `.e` marker are
//! legacy plaintext and pass through [`RecordTransform::unprotect`] untouched,
//! so stores written before encryption was enabled keep loading.

use crate::compress::{compress, decompress, is_compressed};
use crate::error::TransformResult;
use crate::utility::{apply_fallback, EncryptionUtility, TrivialEncryption};
use std::borrow::Cow;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Prefix marking a buffer as ciphertext.
pub const CIPHERTEXT_MARKER: &[u8; 2] = b".e";

/// Returns `true` if `data` starts with the ciphertext marker.
#[must_use]
pub fn is_protected(data: &[u8]) -> bool {
    data.starts_with(CIPHERTEXT_MARKER)
}

/// The framing state of a buffer, as seen from its first two bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Starts with `.e`.
    Encrypted,
    /// Starts with `.z`.
    Compressed,
    /// No marker.
    Plain,
}

impl FrameState {
    /// Classifies `data`.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        if is_protected(data) {
            Self::Encrypted
        } else if is_compressed(data) {
            Self::Compressed
        } else {
            Self::Plain
        }
    }

    /// Returns the lowercase name of the state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Encrypted => "encrypted",
            Self::Compressed => "compressed",
            Self::Plain => "plain",
        }
    }
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compress-then-encrypt codec for record buffers and blob streams.
///
/// Cloning is cheap; clones share the same encryption utility.
///
/// # Example
///
/// ```
/// use cipherstore_transform::RecordTransform;
///
/// let transform = RecordTransform::trivial();
/// let framed = transform.protect(b"hello").unwrap();
/// assert!(framed.starts_with(b".e"));
/// assert_eq!(transform.unprotect(&framed).unwrap().as_ref(), b"hello");
/// ```
#[derive(Clone, Debug)]
pub struct RecordTransform {
    utility: Arc<dyn EncryptionUtility>,
}

impl RecordTransform {
    /// Creates a transform over the given utility.
    #[must_use]
    pub fn new(utility: Arc<dyn EncryptionUtility>) -> Self {
        Self { utility }
    }

    /// Creates a transform whose encryption step is the identity.
    #[must_use]
    pub fn trivial() -> Self {
        Self::new(Arc::new(TrivialEncryption))
    }

    /// Returns the encryption utility.
    #[must_use]
    pub fn utility(&self) -> &Arc<dyn EncryptionUtility> {
        &self.utility
    }

    /// Frames `data` as `.e` + encrypt(compress(data)).
    ///
    /// Already protected input is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if compression or encryption fails.
    pub fn protect<'a>(&self, data: &'a [u8]) -> TransformResult<Cow<'a, [u8]>> {
        if is_protected(data) {
            return Ok(Cow::Borrowed(data));
        }

        let compressed = compress(data)?;
        let sealed = self.utility.encrypt_bytes(&compressed)?;

        let mut out = Vec::with_capacity(CIPHERTEXT_MARKER.len() + sealed.len());
        out.extend_from_slice(CIPHERTEXT_MARKER);
        out.extend_from_slice(&sealed);
        Ok(Cow::Owned(out))
    }

    /// Reverses [`protect`](Self::protect).
    ///
    /// Unmarked input is returned unchanged. Undecryptable or uninflatable
    /// payloads follow the utility's decrypt fallback policy.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails and the policy is strict.
    pub fn unprotect<'a>(&self, data: &'a [u8]) -> TransformResult<Cow<'a, [u8]>> {
        if !is_protected(data) {
            return Ok(Cow::Borrowed(data));
        }

        let decrypted = self
            .utility
            .decrypt_bytes(&data[CIPHERTEXT_MARKER.len()..])?;
        if !is_compressed(&decrypted) {
            return Ok(Cow::Owned(decrypted));
        }

        let inflated = decompress(&decrypted).map(Cow::into_owned);
        match inflated {
            Ok(plain) => Ok(Cow::Owned(plain)),
            Err(err) => apply_fallback(self.utility.decrypt_fallback(), err, decrypted)
                .map(Cow::Owned),
        }
    }

    /// Protects an optional record slot; `None` passes through.
    ///
    /// # Errors
    ///
    /// See [`protect`](Self::protect).
    pub fn protect_opt(&self, data: Option<&[u8]>) -> TransformResult<Option<Vec<u8>>> {
        data.map(|d| self.protect(d).map(Cow::into_owned))
            .transpose()
    }

    /// Unprotects an optional record slot; `None` passes through.
    ///
    /// # Errors
    ///
    /// See [`unprotect`](Self::unprotect).
    pub fn unprotect_opt(&self, data: Option<&[u8]>) -> TransformResult<Option<Vec<u8>>> {
        data.map(|d| self.unprotect(d).map(Cow::into_owned))
            .transpose()
    }

    /// Writes `.e` + encrypt(src) to `dst`, without compression.
    ///
    /// A source that already starts with `.e` is copied verbatim.
    ///
    /// The ciphertext is a single AES-GCM message, so the local facility holds
    /// the whole stream in memory while sealing it. Blob files are bounded by
    /// available memory.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if encryption fails.
    pub fn protect_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> TransformResult<()> {
        let prefix = read_prefix(src)?;
        let mut rest = (&prefix[..]).chain(src);

        if is_protected(&prefix) {
            io::copy(&mut rest, dst)?;
            return Ok(());
        }

        dst.write_all(CIPHERTEXT_MARKER)?;
        self.utility.encrypt_stream(&mut rest, dst)
    }

    /// Decrypts a stream written by [`protect_stream`](Self::protect_stream).
    ///
    /// An unmarked source is copied verbatim. A marked source is read into
    /// memory in full before it is authenticated, as for
    /// [`protect_stream`](Self::protect_stream).
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, or if decryption fails and the policy
    /// is strict.
    pub fn unprotect_stream(
        &self,
        src: &mut dyn Read,
        dst: &mut dyn Write,
    ) -> TransformResult<()> {
        let prefix = read_prefix(src)?;
        if !is_protected(&prefix) {
            let mut rest = (&prefix[..]).chain(src);
            io::copy(&mut rest, dst)?;
            return Ok(());
        }

        self.utility.decrypt_stream(src, dst)
    }
}

impl Default for RecordTransform {
    fn default() -> Self {
        Self::trivial()
    }
}

/// Reads up to the marker length from `src`, stopping early only at EOF.
fn read_prefix(src: &mut dyn Read) -> io::Result<Vec<u8>> {
    let mut prefix = Vec::with_capacity(CIPHERTEXT_MARKER.len());
    src.take(CIPHERTEXT_MARKER.len() as u64)
        .read_to_end(&mut prefix)?;
    Ok(prefix)
}
