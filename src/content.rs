//! HTTP body rendering: placeholders, the content-type gate and
//! content-encoding decompression.

use std::io::Read;

use flate2::read::GzDecoder;
use thiserror::Error;

pub const NO_DATA: &str = "[no data]";
pub const BINARY_DATA: &str = "[binary data]";

const BROTLI_BUFFER: usize = 4096;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("gzip: {0}")]
    Gzip(std::io::Error),
    #[error("brotli: {0}")]
    Brotli(std::io::Error),
    #[error("zstd: {0}")]
    Zstd(std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Brotli,
    Zstd,
    Identity,
}

impl Encoding {
    pub fn parse(token: &str) -> Self {
        let token = token.trim();
        if token.eq_ignore_ascii_case("gzip") || token.eq_ignore_ascii_case("x-gzip") {
            Encoding::Gzip
        } else if token.eq_ignore_ascii_case("br") {
            Encoding::Brotli
        } else if token.eq_ignore_ascii_case("zstd") {
            Encoding::Zstd
        } else {
            Encoding::Identity
        }
    }

    fn decode(self, body: Vec<u8>) -> Result<Vec<u8>, DecodeError> {
        let mut out = Vec::new();
        match self {
            Encoding::Gzip => {
                GzDecoder::new(body.as_slice())
                    .read_to_end(&mut out)
                    .map_err(DecodeError::Gzip)?;
            }
            Encoding::Brotli => {
                brotli::Decompressor::new(body.as_slice(), BROTLI_BUFFER)
                    .read_to_end(&mut out)
                    .map_err(DecodeError::Brotli)?;
            }
            Encoding::Zstd => {
                out = zstd::stream::decode_all(body.as_slice()).map_err(DecodeError::Zstd)?;
            }
            Encoding::Identity => return Ok(body),
        }
        Ok(out)
    }
}

/// Undo a `Content-Encoding`. Codings listed as `a, b` were applied in that
/// order and are removed in reverse.
pub fn decompress(body: &[u8], content_encoding: Option<&str>) -> Result<Vec<u8>, DecodeError> {
    let mut data = body.to_vec();
    let Some(header) = content_encoding else {
        return Ok(data);
    };
    for token in header.rsplit(',') {
        data = Encoding::parse(token).decode(data)?;
    }
    Ok(data)
}

/// Decoded body text. A decompression failure becomes the body itself so it
/// stays visible to the user.
pub fn decode_body(body: &[u8], content_encoding: Option<&str>) -> String {
    if body.is_empty() {
        return NO_DATA.to_string();
    }
    match decompress(body, content_encoding) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => e.to_string(),
    }
}

/// `text/*` or anything mentioning json.
pub fn is_textual(content_type: Option<&str>) -> bool {
    match content_type.map(str::trim) {
        None | Some("") => false,
        Some(ct) => {
            let lower = ct.to_ascii_lowercase();
            lower.starts_with("text/") || lower.contains("json")
        }
    }
}

pub fn binary_placeholder(content_type: Option<&str>) -> String {
    format!("{BINARY_DATA}{}", content_type.unwrap_or(""))
}

/// Full rendering rule for a response body: empty bodies first, then the
/// content-type gate, then decompression.
pub fn render_body(body: &[u8], content_type: Option<&str>, content_encoding: Option<&str>) -> String {
    if body.is_empty() {
        return NO_DATA.to_string();
    }
    if !is_textual(content_type) {
        return binary_placeholder(content_type);
    }
    decode_body(body, content_encoding)
}
