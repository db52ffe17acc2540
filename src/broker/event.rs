// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event payload encoding.
//!
//! # Stream Format
//!
//! ```text
//! XADD {stream} *
//!   data  <json or zstd(json)>
//!   meta  '{"published_at":1735776000000}'
//! ```
//!
//! Payloads are serialized to JSON and zstd-compressed when that makes them
//! smaller. Readers detect compression by the zstd magic bytes.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::BrokerError;
use crate::storage::StreamEntry;

/// zstd magic bytes: 0x28 0xB5 0x2F 0xFD
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Payloads below this size are stored uncompressed.
const COMPRESSION_THRESHOLD: usize = 256;

pub(crate) const DATA_FIELD: &str = "data";
pub(crate) const META_FIELD: &str = "meta";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Unix millis at publish time.
    pub published_at: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// One delivered stream entry.
#[derive(Debug)]
pub struct Event {
    id: String,
    stream: String,
    data: Vec<u8>,
    meta: EventMeta,
    acked: AtomicBool,
}

impl Event {
    pub(crate) fn from_entry(stream: &str, entry: StreamEntry) -> Result<Self, BrokerError> {
        let decode_error = |reason: String| BrokerError::Decode {
            id: entry.id.clone(),
            reason,
        };
        let raw = entry
            .field(DATA_FIELD)
            .ok_or_else(|| decode_error("missing data field".into()))?;
        let data = maybe_decompress(raw).map_err(|e| decode_error(e.to_string()))?;
        let meta = match entry.field(META_FIELD) {
            Some(meta) => serde_json::from_slice(meta).map_err(|e| decode_error(e.to_string()))?,
            None => EventMeta::default(),
        };
        Ok(Self {
            id: entry.id,
            stream: stream.to_string(),
            data,
            meta,
            acked: AtomicBool::new(false),
        })
    }

    /// Delivery id assigned by the stream.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    #[must_use]
    pub fn meta(&self) -> &EventMeta {
        &self.meta
    }

    /// Raw JSON payload.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
        serde_json::from_slice(&self.data).map_err(|e| BrokerError::Decode {
            id: self.id.clone(),
            reason: e.to_string(),
        })
    }

    /// Acknowledge this event even if the handler later fails.
    pub fn ack(&self) {
        self.acked.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }
}

/// Stream fields for one payload.
pub(crate) fn encode<T: Serialize + ?Sized>(payload: &T, meta: &EventMeta) -> Result<Vec<(String, Vec<u8>)>, BrokerError> {
    let json = serde_json::to_vec(payload).map_err(|e| BrokerError::Encode(e.to_string()))?;
    let meta = serde_json::to_vec(meta).map_err(|e| BrokerError::Encode(e.to_string()))?;
    Ok(vec![
        (DATA_FIELD.to_string(), maybe_compress(&json)),
        (META_FIELD.to_string(), meta),
    ])
}

/// Compress data with zstd when it is large enough and actually shrinks.
pub fn maybe_compress(data: &[u8]) -> Vec<u8> {
    if data.len() < COMPRESSION_THRESHOLD || is_zstd_compressed(data) {
        return data.to_vec();
    }
    match zstd::encode_all(data, 3) {
        Ok(compressed) if compressed.len() < data.len() => compressed,
        _ => data.to_vec(),
    }
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    if is_zstd_compressed(data) {
        let mut decoder = zstd::Decoder::new(data)?;
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

#[must_use]
pub fn is_zstd_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fields: Vec<(String, Vec<u8>)>) -> StreamEntry {
        StreamEntry {
            id: "1-0".into(),
            fields,
        }
    }

    #[test]
    fn test_small_payload_is_stored_plain() {
        let fields = encode(&vec![1, 2, 3], &EventMeta::default()).unwrap();
        assert_eq!(fields[0].1, b"[1,2,3]".to_vec());
    }

    #[test]
    fn test_large_payload_is_compressed_and_readable() {
        let payload: Vec<String> = (0..200).map(|_| "repeated data".to_string()).collect();
        let meta = EventMeta {
            published_at: 42,
            ..Default::default()
        };
        let fields = encode(&payload, &meta).unwrap();
        assert!(is_zstd_compressed(&fields[0].1));

        let event = Event::from_entry("events", entry(fields)).unwrap();
        assert_eq!(event.deserialize::<Vec<String>>().unwrap(), payload);
        assert_eq!(event.meta().published_at, 42);
        assert_eq!(event.stream(), "events");
    }

    #[test]
    fn test_missing_data_field_is_a_decode_error() {
        let err = Event::from_entry("events", entry(vec![])).unwrap_err();
        assert!(matches!(err, BrokerError::Decode { .. }));
    }

    #[test]
    fn test_ack_flag() {
        let event = Event::from_entry("events", entry(vec![("data".into(), b"1".to_vec())])).unwrap();
        assert!(!event.is_acked());
        event.ack();
        assert!(event.is_acked());
    }
}
