//! Compression Layer
//!
//! Serializes values with serde_json and deflates them above a size threshold.
//! Callers of the store only ever see the original value.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::entry::Payload;
use crate::error::{CacheError, Result};

// == Encoded Value ==
/// Result of running a value through the codec.
#[derive(Debug)]
pub struct Encoded<V> {
    pub payload: Payload<V>,
    /// Bytes the payload occupies
    pub size_bytes: usize,
    /// Serialized size before compression
    pub original_size: usize,
    /// Recovered failure, if the codec had to fall back
    pub failure: Option<CacheError>,
}

// == Codec ==
/// Size accounting plus optional compression for stored values.
#[derive(Debug, Clone)]
pub struct Codec {
    enabled: bool,
    threshold: usize,
}

impl Codec {
    pub fn new(enabled: bool, threshold: usize) -> Self {
        Self { enabled, threshold }
    }

    /// Whether a serialized value of `size` bytes gets compressed.
    pub fn should_compress(&self, size: usize) -> bool {
        self.enabled && size > self.threshold
    }

    // == Encode ==
    /// Computes the size of `value` and compresses it when it is large enough.
    ///
    /// Never fails: a value that cannot be serialized is kept as-is with an
    /// estimated size, and a compression error keeps the plain value. Either
    /// way the failure is handed back in `failure` for the caller to record.
    pub fn encode<V: Serialize>(&self, value: V) -> Encoded<V> {
        let bytes = match serde_json::to_vec(&value) {
            Ok(bytes) => bytes,
            Err(err) => {
                let estimate = std::mem::size_of::<V>();
                return Encoded {
                    payload: Payload::Plain(value),
                    size_bytes: estimate,
                    original_size: estimate,
                    failure: Some(err.into()),
                };
            }
        };

        let original_size = bytes.len();
        if !self.should_compress(original_size) {
            return Encoded {
                payload: Payload::Plain(value),
                size_bytes: original_size,
                original_size,
                failure: None,
            };
        }

        match compress(&bytes) {
            Ok(compressed) => Encoded {
                size_bytes: compressed.len(),
                payload: Payload::Compressed(compressed),
                original_size,
                failure: None,
            },
            Err(err) => Encoded {
                payload: Payload::Plain(value),
                size_bytes: original_size,
                original_size,
                failure: Some(err),
            },
        }
    }

    // == Decode ==
    /// Returns the logical value held by `payload`.
    pub fn decode<V: DeserializeOwned + Clone>(&self, payload: &Payload<V>) -> Result<V> {
        match payload {
            Payload::Plain(value) => Ok(value.clone()),
            Payload::Compressed(bytes) => {
                let raw = decompress(bytes)?;
                Ok(serde_json::from_slice(&raw)?)
            }
        }
    }
}

// == Persisted Representation ==
/// JSON form of a payload for the persistent store.
///
/// Compressed payloads become a base64 string of the deflate bytes.
pub fn to_persisted_data<V: Serialize>(payload: &Payload<V>) -> Result<serde_json::Value> {
    match payload {
        Payload::Plain(value) => Ok(serde_json::to_value(value)?),
        Payload::Compressed(bytes) => Ok(serde_json::Value::String(BASE64.encode(bytes))),
    }
}

/// Inverse of [`to_persisted_data`], returning both payload and logical value.
pub fn from_persisted_data<V: DeserializeOwned + Clone>(
    data: serde_json::Value,
    compressed: bool,
) -> Result<(Payload<V>, V)> {
    if !compressed {
        let value: V = serde_json::from_value(data)?;
        return Ok((Payload::Plain(value.clone()), value));
    }

    let encoded = data
        .as_str()
        .ok_or_else(|| CacheError::Compression("compressed data is not a string".to_string()))?;
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| CacheError::Compression(format!("invalid base64: {}", e)))?;
    let value: V = serde_json::from_slice(&decompress(&bytes)?)?;
    Ok((Payload::Compressed(bytes), value))
}

// == Raw Transforms ==
/// Deflates `data`.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CacheError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CacheError::Compression(e.to_string()))
}

/// Inflates `data` produced by [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CacheError::Compression(e.to_string()))?;
    Ok(out)
}
