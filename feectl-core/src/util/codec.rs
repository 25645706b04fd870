use std::io::{self, Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

/// Hex encoded SHA-256 of the payload
pub fn content_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Gzip the payload
pub fn compress(payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()
}

/// Inflate a gzip payload
pub fn decompress(compressed: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Encode binary data for storage in a text document
pub fn to_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode binary data stored in a text document
pub fn from_base64(data: &str) -> io::Result<Vec<u8>> {
    BASE64.decode(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
