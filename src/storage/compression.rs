//! Record compression
//!
//! Stored values are `[flag: u8][payload]`:
//! - `flag = 0`: payload is the raw JSON (UTF-8)
//! - `flag = 1`: payload is the JSON as a zlib (deflate) stream
//!
//! Compression is only applied when the JSON is at least `min_size` bytes
//! and the compressed form is strictly smaller.

use crate::storage::error::{StorageError, StorageResult};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::Value;
use std::borrow::Cow;
use std::io::{Read, Write};

/// Flag byte for uncompressed payloads
pub const FLAG_RAW: u8 = 0;

/// Flag byte for deflate payloads
pub const FLAG_DEFLATE: u8 = 1;

/// Default minimum size before compression is attempted
pub const DEFAULT_MIN_SIZE: usize = 256;

/// Refuse to inflate payloads past this many bytes
const MAX_DECOMPRESSED_SIZE: u64 = 16 * 1024 * 1024;

/// Compression settings for record payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compressor {
    enabled: bool,
    min_size: usize,
}

impl Default for Compressor {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: DEFAULT_MIN_SIZE,
        }
    }
}

impl Compressor {
    pub fn new(enabled: bool, min_size: usize) -> Self {
        Self { enabled, min_size }
    }

    pub fn disabled() -> Self {
        Self::new(false, DEFAULT_MIN_SIZE)
    }

    /// Compress `data` if that pays off; the flag tells which form came back
    pub fn compress<'a>(&self, data: &'a [u8]) -> (Cow<'a, [u8]>, bool) {
        if !self.enabled || data.len() < self.min_size {
            return (Cow::Borrowed(data), false);
        }

        match deflate(data) {
            Ok(compressed) if compressed.len() < data.len() => (Cow::Owned(compressed), true),
            Ok(_) => (Cow::Borrowed(data), false),
            Err(e) => {
                tracing::warn!("Deflate failed, storing raw: {}", e);
                (Cow::Borrowed(data), false)
            }
        }
    }

    /// Undo `compress`
    ///
    /// A payload that fails to inflate is handed back unchanged; the caller
    /// then fails on JSON parsing if it really was garbage.
    pub fn decompress<'a>(&self, data: &'a [u8], was_compressed: bool) -> Cow<'a, [u8]> {
        if !was_compressed {
            return Cow::Borrowed(data);
        }

        let mut out = Vec::with_capacity(data.len() * 4);
        let read = ZlibDecoder::new(data)
            .take(MAX_DECOMPRESSED_SIZE + 1)
            .read_to_end(&mut out);

        match read {
            Ok(n) if n as u64 > MAX_DECOMPRESSED_SIZE => {
                tracing::warn!("Decode error: deflate payload inflates past {} bytes", MAX_DECOMPRESSED_SIZE);
                Cow::Borrowed(data)
            }
            Ok(_) => Cow::Owned(out),
            Err(e) => {
                tracing::warn!("Decode error: inflate failed: {}", e);
                Cow::Borrowed(data)
            }
        }
    }

    /// Serialize a document into a flagged record
    pub fn encode_record(&self, json: &[u8]) -> Vec<u8> {
        let (payload, compressed) = self.compress(json);
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(if compressed { FLAG_DEFLATE } else { FLAG_RAW });
        out.extend_from_slice(&payload);
        out
    }

    /// Turn a flagged record back into a JSON value
    pub fn decode_record(&self, record: &[u8]) -> StorageResult<Value> {
        let (&flag, payload) = record
            .split_first()
            .ok_or_else(|| StorageError::Decode("empty record".to_string()))?;

        let json = match flag {
            FLAG_RAW => Cow::Borrowed(payload),
            FLAG_DEFLATE => self.decompress(payload, true),
            other => {
                return Err(StorageError::Decode(format!(
                    "unknown record flag: {}",
                    other
                )))
            }
        };

        serde_json::from_slice(&json).map_err(|e| StorageError::Decode(e.to_string()))
    }
}

fn deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sensor_document(readings: usize) -> Value {
        let samples: Vec<Value> = (0..readings)
            .map(|i| json!({"sensor": "temperature", "unit": "celsius", "value": 20 + (i % 5)}))
            .collect();
        json!({"device": "greenhouse-1", "samples": samples})
    }

    #[test]
    fn test_small_payload_stays_raw() {
        let compressor = Compressor::default();
        let data = br#"{"x":1}"#;

        let (out, compressed) = compressor.compress(data);
        assert!(!compressed);
        assert_eq!(&*out, &data[..]);

        let record = compressor.encode_record(data);
        assert_eq!(record[0], FLAG_RAW);
        assert_eq!(&record[1..], &data[..]);
    }

    #[test]
    fn test_large_payload_round_trip() {
        let compressor = Compressor::default();
        let doc = sensor_document(100);
        let json = serde_json::to_vec(&doc).unwrap();
        assert!(json.len() >= DEFAULT_MIN_SIZE);

        let record = compressor.encode_record(&json);
        assert_eq!(record[0], FLAG_DEFLATE);
        assert!(record.len() < json.len());

        let (payload, _) = compressor.compress(&json);
        assert_eq!(&*compressor.decompress(&payload, true), &json[..]);
        assert_eq!(compressor.decode_record(&record).unwrap(), doc);
    }

    #[test]
    fn test_decodes_external_zlib_record() {
        let doc = json!({"payload": "a".repeat(400)});
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&serde_json::to_vec(&doc).unwrap()).unwrap();

        let mut record = vec![FLAG_DEFLATE];
        record.extend(encoder.finish().unwrap());

        assert_eq!(Compressor::default().decode_record(&record).unwrap(), doc);
        // Decoding does not depend on the local compression settings
        assert_eq!(Compressor::disabled().decode_record(&record).unwrap(), doc);
    }

    #[test]
    fn test_incompressible_payload_stays_raw() {
        let compressor = Compressor::new(true, 16);
        // Distinct bytes with no repetition: zlib output is never smaller
        let data: Vec<u8> = (0u8..=255).collect();

        let (out, compressed) = compressor.compress(&data);
        assert!(!compressed);
        assert_eq!(out.len(), data.len());
    }

    #[test]
    fn test_disabled_never_compresses() {
        let compressor = Compressor::disabled();
        let json = serde_json::to_vec(&sensor_document(100)).unwrap();

        let record = compressor.encode_record(&json);
        assert_eq!(record[0], FLAG_RAW);
        assert_eq!(record.len(), json.len() + 1);
    }

    #[test]
    fn test_bad_deflate_payload_returned_unchanged() {
        let compressor = Compressor::default();
        let garbage = [10u8, 0, 0, 0, 0xF0, 1, 2];

        assert_eq!(&*compressor.decompress(&garbage, true), &garbage[..]);

        let mut record = vec![FLAG_DEFLATE];
        record.extend_from_slice(&garbage);
        assert!(matches!(
            compressor.decode_record(&record),
            Err(StorageError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_flag_and_empty() {
        let compressor = Compressor::default();
        assert!(matches!(
            compressor.decode_record(&[7, b'{', b'}']),
            Err(StorageError::Decode(_))
        ));
        assert!(matches!(
            compressor.decode_record(&[]),
            Err(StorageError::Decode(_))
        ));
    }
}
