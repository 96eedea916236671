//! Blob side-channel.
//!
//! Blob files are transformed as a whole:
//!
//! - at store time the caller's file is encrypted in place
//! - at read time the committed file is decrypted into a private copy under
//!   `<blob_dir>/../tmp/`, mirroring its path relative to the blob directory
//!
//! Committed blob files are never modified. Every write goes to a uniquely
//! named temp file in the destination directory and is renamed into place.

use crate::error::{StorageError, StorageResult};
use cipherstore_transform::RecordTransform;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Returns the directory holding decrypted blob copies for `blob_dir`.
#[must_use]
pub fn temp_root(blob_dir: &Path) -> PathBuf {
    match blob_dir.parent() {
        Some(parent) => parent.join("tmp"),
        None => blob_dir.join("..").join("tmp"),
    }
}

/// Creates `dir` and its parents, owner-only on Unix.
fn create_private_dir(dir: &Path) -> StorageResult<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)?;
    Ok(())
}

fn parent_of(path: &Path) -> StorageResult<&Path> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => Ok(dir),
        Some(_) => Ok(Path::new(".")),
        None => Err(StorageError::invalid(format!(
            "{} has no parent directory",
            path.display()
        ))),
    }
}

/// Writes `tmp` through `write` and flushes it.
fn fill(
    tmp: &mut NamedTempFile,
    write: impl FnOnce(&mut dyn Write) -> StorageResult<()>,
) -> StorageResult<()> {
    let mut out = BufWriter::new(tmp.as_file_mut());
    write(&mut out)?;
    out.flush()?;
    Ok(())
}

/// Replaces the content of `path` with its protected form.
///
/// A file that is already protected is rewritten unchanged.
///
/// # Errors
///
/// Returns an error on I/O failure or if encryption fails.
pub fn encrypt_in_place(transform: &RecordTransform, path: &Path) -> StorageResult<()> {
    let mut src = File::open(path)?;
    let mut tmp = NamedTempFile::new_in(parent_of(path)?)?;
    fill(&mut tmp, |out| Ok(transform.protect_stream(&mut src, out)?))?;
    tmp.persist(path).map_err(|e| e.error)?;
    debug!(path = %path.display(), "encrypted blob file in place");
    Ok(())
}

/// Returns a plaintext copy of the committed blob at `path`.
///
/// The copy lives under [`temp_root`] at the same relative path as `path` has
/// inside `blob_dir`. An existing copy is returned as is.
///
/// # Errors
///
/// Returns an error if `path` is outside `blob_dir`, on I/O failure, or if
/// decryption fails under a strict fallback policy.
pub fn decrypt_to_temp(
    transform: &RecordTransform,
    path: &Path,
    blob_dir: &Path,
) -> StorageResult<PathBuf> {
    let relative = path.strip_prefix(blob_dir).map_err(|_| {
        StorageError::invalid(format!(
            "blob {} is outside {}",
            path.display(),
            blob_dir.display()
        ))
    })?;
    let target = temp_root(blob_dir).join(relative);
    if target.exists() {
        return Ok(target);
    }

    let dir = parent_of(&target)?;
    create_private_dir(dir)?;

    let mut src = File::open(path)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    fill(&mut tmp, |out| Ok(transform.unprotect_stream(&mut src, out)?))?;
    tmp.persist(&target).map_err(|e| e.error)?;
    debug!(src = %path.display(), dst = %target.display(), "decrypted blob copy");
    Ok(target)
}

/// Makes a plaintext copy of `path` with a unique name in `dir`, protecting it
/// again when `encrypt` is set. The source file is not touched.
///
/// The copy is kept on disk; ownership passes to the caller.
///
/// # Errors
///
/// Returns an error on I/O failure or if the transform fails.
pub fn private_copy(
    transform: &RecordTransform,
    path: &Path,
    dir: &Path,
    encrypt: bool,
) -> StorageResult<PathBuf> {
    create_private_dir(dir)?;

    let mut src = File::open(path)?;
    let mut tmp = tempfile::Builder::new()
        .prefix("restore-")
        .suffix(".blob")
        .tempfile_in(dir)?;
    fill(&mut tmp, |out| Ok(transform.unprotect_stream(&mut src, out)?))?;
    let (_, copy) = tmp.keep().map_err(|e| e.error)?;

    if encrypt {
        encrypt_in_place(transform, &copy)?;
    }
    debug!(src = %path.display(), copy = %copy.display(), "made private blob copy");
    Ok(copy)
}
