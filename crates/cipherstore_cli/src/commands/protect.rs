//! Protect and unprotect command implementations.

use super::load_transform;
use cipherstore_storage::blob;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::info;

/// Runs the protect command: encrypts `src` into `dst`, or in place.
pub fn protect(
    config: &Path,
    src: &Path,
    dst: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let transform = load_transform(config)?;
    match dst {
        None => blob::encrypt_in_place(&transform, src)?,
        Some(dst) => write_through(src, dst, |input, output| {
            transform.protect_stream(input, output)
        })?,
    }
    info!(src = %src.display(), "protected");
    Ok(())
}

/// Runs the unprotect command: decrypts `src` into `dst`.
pub fn unprotect(config: &Path, src: &Path, dst: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let transform = load_transform(config)?;
    write_through(src, dst, |input, output| {
        transform.unprotect_stream(input, output)
    })?;
    info!(src = %src.display(), dst = %dst.display(), "unprotected");
    Ok(())
}

/// Streams `src` through `op` into a temporary file next to `dst`, then
/// renames it over `dst`.
fn write_through<E>(
    src: &Path,
    dst: &Path,
    op: impl FnOnce(&mut dyn Read, &mut dyn Write) -> Result<(), E>,
) -> Result<(), Box<dyn std::error::Error>>
where
    E: std::error::Error + 'static,
{
    let dir = match dst.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut input = BufReader::new(File::open(src)?);
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut output = BufWriter::new(tmp.as_file_mut());
        let reader: &mut dyn Read = &mut input;
        let writer: &mut dyn Write = &mut output;
        op(reader, writer)?;
        output.flush()?;
    }
    tmp.persist(dst).map_err(|e| e.error)?;
    Ok(())
}
