//! Deflate framing used for compressed file data and the name table.
//!
//! Stored data is a two byte `78 5E` prefix followed by a raw Deflate
//! stream without the trailing Adler-32. The prefix is never validated.

use std::io::{Read, Write};

use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use tracing::warn;

use crate::error::{ArcError, ArcResult};

pub const DEFLATE_PREFIX: [u8; 2] = [0x78, 0x5E];

pub fn compress(data: &[u8]) -> ArcResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2 + DEFLATE_PREFIX.len());
    out.extend_from_slice(&DEFLATE_PREFIX);
    let mut encoder = DeflateEncoder::new(out, Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflates `data`, using `raw_size` only as an allocation hint.
pub fn decompress(data: &[u8], raw_size: u32) -> ArcResult<Vec<u8>> {
    let Some(stream) = data.get(DEFLATE_PREFIX.len()..) else {
        return Err(ArcError::DecompressionFailure(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "compressed data shorter than its prefix",
        )));
    };
    let mut out = Vec::with_capacity(raw_size as usize);
    DeflateDecoder::new(stream)
        .read_to_end(&mut out)
        .map_err(ArcError::DecompressionFailure)?;
    if out.len() != raw_size as usize {
        warn!(
            expected = raw_size,
            actual = out.len(),
            "decompressed size differs from recorded raw size"
        );
    }
    Ok(out)
}
