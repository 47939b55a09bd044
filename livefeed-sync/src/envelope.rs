//! Optional compression envelope around a complete message.
//!
//! ```text
//! BASE64/GZIP:H4sIAAAAAAAA…   ──► base64 ──► gunzip ──► UTF-8 JSON
//! {"Athletes":{…}}            ──► passed through unchanged
//! ```

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::DecodeError;

/// Marker announcing a base64-encoded gzip payload.
pub const ENVELOPE_PREFIX: &str = "BASE64/GZIP:";

/// Plain message text recovered from an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    pub text: String,
    /// Whether the text came out of a compressed envelope
    pub compressed: bool,
}

/// Strip the envelope if present.
pub fn open_envelope(text: String) -> Result<Opened, DecodeError> {
    if !text.starts_with(ENVELOPE_PREFIX) {
        return Ok(Opened {
            text,
            compressed: false,
        });
    }

    let gz = STANDARD.decode(text[ENVELOPE_PREFIX.len()..].trim())?;
    let mut plain = Vec::with_capacity(gz.len().saturating_mul(4));
    GzDecoder::new(gz.as_slice())
        .read_to_end(&mut plain)
        .map_err(DecodeError::Decompress)?;

    Ok(Opened {
        text: String::from_utf8(plain)?,
        compressed: true,
    })
}

/// Wrap `plain` in a compressed envelope.
pub fn encode_envelope(plain: &str) -> std::io::Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(plain.as_bytes())?;
    let gz = encoder.finish()?;
    Ok(format!("{ENVELOPE_PREFIX}{}", STANDARD.encode(gz)))
}
