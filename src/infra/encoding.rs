//! Content-encoding decode for request bodies entering the rewriter.
//!
//! Rewritten bodies always go out identity-encoded with `Content-Encoding`
//! removed; bodies the rewriter leaves untouched are forwarded verbatim.

use std::io::Read;

use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

/// Decode a request body per its declared `Content-Encoding`.
///
/// # Errors
///
/// Returns a description when the encoding is unknown or the payload is
/// corrupt.
pub fn decode_body(content: &[u8], encoding: &str) -> Result<Bytes, String> {
    match encoding.trim().to_ascii_lowercase().as_str() {
        "" | "identity" => Ok(Bytes::copy_from_slice(content)),
        "gzip" => {
            let mut out = Vec::new();
            GzDecoder::new(content)
                .read_to_end(&mut out)
                .map_err(|e| format!("gzip decode failed: {e}"))?;
            Ok(Bytes::from(out))
        }
        "deflate" => {
            // Zlib-wrapped per the RFC, but raw deflate exists in the wild.
            let mut out = Vec::new();
            if ZlibDecoder::new(content).read_to_end(&mut out).is_ok() {
                return Ok(Bytes::from(out));
            }
            let mut out = Vec::new();
            DeflateDecoder::new(content)
                .read_to_end(&mut out)
                .map_err(|e| format!("deflate decode failed: {e}"))?;
            Ok(Bytes::from(out))
        }
        "br" => {
            let mut out = Vec::new();
            brotli::Decompressor::new(content, 4096)
                .read_to_end(&mut out)
                .map_err(|e| format!("brotli decode failed: {e}"))?;
            Ok(Bytes::from(out))
        }
        other => Err(format!("unsupported content-encoding '{other}'")),
    }
}
