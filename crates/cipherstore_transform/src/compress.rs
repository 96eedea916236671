//! `.z` compression layer.
//!
//! Compression is an intermediate encoding consumed by the record transform:
//! a compressed buffer is `.z` followed by a zlib (DEFLATE) stream of the
//! original bytes. The compressed form is only kept when it is strictly
//! shorter than the input.

use crate::error::{TransformError, TransformResult};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::borrow::Cow;
use std::io::{Read, Write};

/// Prefix marking a buffer as compressed plaintext.
pub const COMPRESSION_MARKER: &[u8; 2] = b".z";

/// Buffers of this length or shorter are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 20;

/// Returns `true` if `data` starts with the compression marker.
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.starts_with(COMPRESSION_MARKER)
}

/// Compresses `data` if doing so makes it smaller.
///
/// Input that already starts with `.z` is always wrapped, whatever its size,
/// so that [`decompress`] restores it exactly instead of mistaking it for a
/// compressed payload.
///
/// # Errors
///
/// Returns an error if the zlib encoder fails.
pub fn compress(data: &[u8]) -> TransformResult<Cow<'_, [u8]>> {
    if is_compressed(data) {
        return Ok(Cow::Owned(deflate(data)?));
    }
    if data.len() <= COMPRESSION_THRESHOLD {
        return Ok(Cow::Borrowed(data));
    }

    let compressed = deflate(data)?;
    if compressed.len() < data.len() {
        Ok(Cow::Owned(compressed))
    } else {
        Ok(Cow::Borrowed(data))
    }
}

/// Inflates a `.z` buffer; anything else is returned as-is.
///
/// # Errors
///
/// Returns [`TransformError::Decompression`] if the payload after the marker
/// is not a valid zlib stream.
pub fn decompress(data: &[u8]) -> TransformResult<Cow<'_, [u8]>> {
    if !is_compressed(data) {
        return Ok(Cow::Borrowed(data));
    }

    let mut decoder = ZlibDecoder::new(&data[COMPRESSION_MARKER.len()..]);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| TransformError::decompression(e.to_string()))?;
    Ok(Cow::Owned(out))
}

/// Produces `.z` + zlib(data).
fn deflate(data: &[u8]) -> TransformResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2 + COMPRESSION_MARKER.len());
    out.extend_from_slice(COMPRESSION_MARKER);
    let mut encoder = ZlibEncoder::new(out, Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_is_left_alone() {
        let data = b"01234567890123456789";
        assert!(matches!(compress(data).unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn compressible_input_shrinks() {
        let data = vec![b'a'; 500];
        let compressed = compress(&data).unwrap();
        assert!(is_compressed(&compressed));
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed).unwrap().as_ref(), data.as_slice());
    }

    #[test]
    fn zlib_header_follows_marker() {
        let data = b"0 1 2 3 4 5 6 7 8 0 1 2 3 4 5 6 7 8 0 1 2 3 4 5 6 7 8";
        let compressed = compress(data).unwrap();
        // zlib header for the default compression level
        assert_eq!(&compressed[..4], b".zx\x9c");
    }

    #[test]
    fn incompressible_input_is_kept() {
        let data: Vec<u8> = (0..64u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let out = compress(&data).unwrap();
        if let Cow::Owned(compressed) = &out {
            assert!(compressed.len() < data.len());
        } else {
            assert_eq!(out.as_ref(), data.as_slice());
        }
    }

    #[test]
    fn marker_prefixed_input_is_wrapped() {
        let data = b".zshort";
        let compressed = compress(data).unwrap();
        assert!(is_compressed(&compressed));
        assert_ne!(compressed.as_ref(), data.as_slice());
        assert_eq!(decompress(&compressed).unwrap().as_ref(), data.as_slice());
    }

    #[test]
    fn unmarked_input_is_not_inflated() {
        let data = b"plain bytes";
        assert!(matches!(decompress(data).unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn corrupt_payload_fails() {
        let result = decompress(b".znot a zlib stream");
        assert!(matches!(result, Err(TransformError::Decompression { .. })));
    }
}
