//! Compression codec bridge shared by the stealth transport and the
//! response rewriter.
//!
//! Both call sites must agree on codec selection and token parsing, so the
//! logic lives here exactly once.

use std::io::{Cursor, Read, Write};

use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use hyper::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use hyper::Response;

use crate::error::{Result, ShroudError};

/// Content codings understood by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Gzip,
    Deflate,
    Brotli,
}

impl ContentCoding {
    /// Match a `Content-Encoding` token against the known codings.
    ///
    /// Matching is by substring containment, not exact equality, in fixed
    /// priority order: gzip, then deflate, then brotli. First match wins, so
    /// a list value like `gzip, br` selects gzip.
    pub fn from_token(token: &str) -> Option<Self> {
        if token.contains("gzip") {
            return Some(ContentCoding::Gzip);
        }
        if token.contains("deflate") {
            return Some(ContentCoding::Deflate);
        }
        if token.contains("br") {
            return Some(ContentCoding::Brotli);
        }
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCoding::Gzip => "gzip",
            ContentCoding::Deflate => "deflate",
            ContentCoding::Brotli => "br",
        }
    }
}

/// Decompress a buffered response in place.
///
/// No-op when the response carries no `Content-Encoding`. Otherwise the body
/// is run through the matched codec, the header is removed, and
/// `Content-Length` is updated to the decompressed size. An unrecognized
/// token is a hard error.
pub fn decompress_response(res: &mut Response<Bytes>) -> Result<()> {
    let Some(encoding) = res.headers().get(CONTENT_ENCODING) else {
        return Ok(());
    };
    let token = encoding
        .to_str()
        .map_err(|e| ShroudError::Codec(format!("unreadable Content-Encoding: {}", e)))?
        .to_string();
    let coding = ContentCoding::from_token(&token)
        .ok_or_else(|| ShroudError::UnknownEncoding(token.clone()))?;

    let plain = decompress(res.body(), coding)?;
    res.headers_mut().remove(CONTENT_ENCODING);
    res.headers_mut()
        .insert(CONTENT_LENGTH, plain.len().into());
    *res.body_mut() = Bytes::from(plain);
    Ok(())
}

/// Decompress a byte buffer with the given coding.
pub fn decompress(body: &[u8], coding: ContentCoding) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match coding {
        ContentCoding::Gzip => {
            let mut decoder = GzDecoder::new(Cursor::new(body));
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ShroudError::Codec(format!("gzip decompress: {}", e)))?;
        }
        ContentCoding::Deflate => {
            let mut decoder = DeflateDecoder::new(Cursor::new(body));
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ShroudError::Codec(format!("deflate decompress: {}", e)))?;
        }
        ContentCoding::Brotli => {
            let mut decoder = brotli::Decompressor::new(Cursor::new(body), 4096);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ShroudError::Codec(format!("brotli decompress: {}", e)))?;
        }
    }
    Ok(out)
}

/// Compress a byte buffer with the given coding, using the best-compression
/// setting where the codec exposes one.
pub fn compress(body: &[u8], coding: ContentCoding) -> Result<Vec<u8>> {
    match coding {
        ContentCoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
            encoder
                .write_all(body)
                .map_err(|e| ShroudError::Codec(format!("gzip compress: {}", e)))?;
            encoder
                .finish()
                .map_err(|e| ShroudError::Codec(format!("gzip compress: {}", e)))
        }
        ContentCoding::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
            encoder
                .write_all(body)
                .map_err(|e| ShroudError::Codec(format!("deflate compress: {}", e)))?;
            encoder
                .finish()
                .map_err(|e| ShroudError::Codec(format!("deflate compress: {}", e)))
        }
        ContentCoding::Brotli => {
            let mut out = Vec::new();
            {
                let mut encoder = brotli::CompressorWriter::new(&mut out, 4096, 11, 22);
                encoder
                    .write_all(body)
                    .map_err(|e| ShroudError::Codec(format!("brotli compress: {}", e)))?;
                encoder
                    .flush()
                    .map_err(|e| ShroudError::Codec(format!("brotli compress: {}", e)))?;
            }
            Ok(out)
        }
    }
}

/// Compress against a raw `Content-Encoding` token (used when restoring the
/// original encoding after a rewrite). Unknown token is a hard error.
pub fn compress_with_token(body: &[u8], token: &str) -> Result<Vec<u8>> {
    let coding = ContentCoding::from_token(token)
        .ok_or_else(|| ShroudError::UnknownEncoding(token.to_string()))?;
    compress(body, coding)
}
