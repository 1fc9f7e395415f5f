//! Value encoding pipeline.
//!
//! Every value crosses the backend boundary inside a small versioned envelope:
//!
//! ```text
//! [MAGIC: 4 bytes "CMSH"] [VERSION: u16 LE] [FLAGS: u8] [PAYLOAD]
//! ```
//!
//! `FLAGS` bit 0 marks an LZ4-compressed payload; bits 1-2 carry the codec.
//! Decoding trusts the flags rather than the reader's configuration, so
//! engines with different serialization modes can share a store.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Envelope magic header.
pub const CACHE_MAGIC: [u8; 4] = *b"CMSH";

/// Bumped whenever the envelope layout changes.
pub const CURRENT_SCHEMA_VERSION: u16 = 1;

/// Payloads smaller than this are stored uncompressed even when compression is on.
pub const COMPRESSION_THRESHOLD: usize = 256;

/// Upper bound on LZ4 expansion per compressed byte.
const MAX_INFLATION: usize = 256;

const HEADER_LEN: usize = 7;
const FLAG_COMPRESSED: u8 = 0b0000_0001;
const CODEC_SHIFT: u8 = 1;
const CODEC_MASK: u8 = 0b0000_0110;

/// Payload codec.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SerializationMode {
    /// Compact binary encoding.
    #[default]
    Postcard,
    /// Human-readable, interoperable with non-Rust readers.
    Json,
}

impl SerializationMode {
    fn tag(self) -> u8 {
        match self {
            SerializationMode::Postcard => 0,
            SerializationMode::Json => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(SerializationMode::Postcard),
            1 => Ok(SerializationMode::Json),
            other => Err(Error::InvalidCacheEntry(format!(
                "Unknown codec tag {}",
                other
            ))),
        }
    }
}

/// Encoder/decoder configured from [`CacheConfig`](crate::CacheConfig).
#[derive(Clone, Copy, Debug, Default)]
pub struct ValueCodec {
    mode: SerializationMode,
    compress: bool,
}

impl ValueCodec {
    pub fn new(mode: SerializationMode, compress: bool) -> Self {
        ValueCodec { mode, compress }
    }

    pub fn mode(&self) -> SerializationMode {
        self.mode
    }

    /// Serialize `value` and wrap it in an envelope.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let payload = match self.mode {
            SerializationMode::Postcard => postcard::to_allocvec(value)
                .map_err(|e| Error::SerializationError(e.to_string()))?,
            SerializationMode::Json => serde_json::to_vec(value)
                .map_err(|e| Error::SerializationError(e.to_string()))?,
        };

        let mut flags = self.mode.tag() << CODEC_SHIFT;
        let payload = if self.compress && payload.len() >= COMPRESSION_THRESHOLD {
            flags |= FLAG_COMPRESSED;
            lz4_flex::compress_prepend_size(&payload)
        } else {
            payload
        };

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(&CACHE_MAGIC);
        out.extend_from_slice(&CURRENT_SCHEMA_VERSION.to_le_bytes());
        out.push(flags);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Validate the envelope and deserialize its payload.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidCacheEntry`: bad magic, truncated header or unknown codec
    /// - `Error::VersionMismatch`: written by another schema version
    /// - `Error::DeserializationError`: corrupt or mistyped payload
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidCacheEntry(format!(
                "Entry too short: {} bytes",
                bytes.len()
            )));
        }
        if bytes[..4] != CACHE_MAGIC {
            return Err(Error::InvalidCacheEntry("Bad magic header".into()));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != CURRENT_SCHEMA_VERSION {
            return Err(Error::VersionMismatch {
                expected: CURRENT_SCHEMA_VERSION,
                found: version,
            });
        }

        let flags = bytes[6];
        let mode = SerializationMode::from_tag((flags & CODEC_MASK) >> CODEC_SHIFT)?;
        let body = &bytes[HEADER_LEN..];
        let decompressed;
        let payload = if flags & FLAG_COMPRESSED != 0 {
            decompressed = decompress(body)?;
            decompressed.as_slice()
        } else {
            body
        };

        match mode {
            SerializationMode::Postcard => Ok(postcard::from_bytes(payload)?),
            SerializationMode::Json => Ok(serde_json::from_slice(payload)?),
        }
    }
}

/// Inflate a size-prepended LZ4 block, refusing sizes the block cannot hold.
fn decompress(body: &[u8]) -> Result<Vec<u8>> {
    let [a, b, c, d, block @ ..] = body else {
        return Err(Error::InvalidCacheEntry(
            "Compressed payload missing size prefix".into(),
        ));
    };
    let declared = u32::from_le_bytes([*a, *b, *c, *d]) as usize;
    let limit = block.len().saturating_mul(MAX_INFLATION);
    if declared > limit {
        return Err(Error::InvalidCacheEntry(format!(
            "Declared size {} exceeds {} for a {} byte block",
            declared,
            limit,
            block.len()
        )));
    }
    lz4_flex::decompress_size_prepended(body)
        .map_err(|e| Error::DeserializationError(format!("LZ4: {}", e)))
}
