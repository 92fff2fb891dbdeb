//! Gzip+base64 codec for the descriptor payloads passed on the command line.
//!
//! The host compresses the workspace and setup descriptors before handing
//! them to the agent as flag values; the same encoding is used when payloads
//! are passed through to background re-invocations.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

pub fn decode(payload: &str) -> Result<String> {
    let raw = STANDARD
        .decode(payload.trim())
        .context("payload is not valid base64")?;
    let mut out = String::new();
    GzDecoder::new(raw.as_slice())
        .read_to_string(&mut out)
        .context("payload is not valid gzip")?;
    Ok(out)
}

pub fn encode(data: &str) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(compressed))
}
