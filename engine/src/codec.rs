//! Payload encoding: checksums and compression.
//!
//! Checksums are hex SHA-256 over the canonical (compact JSON) encoding of a
//! payload. Compression is LZ4 with the original size prepended. Compression
//! runs on a blocking task under a time budget; when the budget is exceeded
//! the raw payload is sent instead.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

/// Canonical byte encoding of a payload.
///
/// `serde_json` objects are key-sorted, so equal values encode identically.
pub fn canonical_bytes(value: &serde_json::Value) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// Checksum of a payload.
pub fn checksum(value: &serde_json::Value) -> String {
    checksum_bytes(&canonical_bytes(value))
}

/// Checksum of raw bytes.
pub fn checksum_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Compress bytes with LZ4, prepending the original size.
pub fn compress(bytes: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(bytes)
}

/// Inverse of [`compress`].
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    lz4_flex::decompress_size_prepended(bytes).map_err(|e| Error::Compression(e.to_string()))
}

/// When and how long to compress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionPolicy {
    /// Payloads smaller than this are sent raw unless compression is forced
    pub threshold_bytes: usize,
    /// Longest time compression may take before the raw payload is sent
    pub budget: Duration,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            threshold_bytes: 1024,
            budget: Duration::from_millis(50),
        }
    }
}

/// A payload ready for the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedPayload {
    pub bytes: Vec<u8>,
    pub compressed: bool,
    pub original_len: usize,
    /// Checksum of the uncompressed canonical bytes
    pub checksum: String,
}

impl EncodedPayload {
    /// Encode without compression.
    pub fn raw(value: &serde_json::Value) -> Self {
        let bytes = canonical_bytes(value);
        Self {
            checksum: checksum_bytes(&bytes),
            original_len: bytes.len(),
            bytes,
            compressed: false,
        }
    }

    /// Compressed size over original size, if compressed.
    pub fn ratio(&self) -> Option<f64> {
        (self.compressed && self.original_len > 0)
            .then(|| self.bytes.len() as f64 / self.original_len as f64)
    }

    /// Bytes on the wire.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode back into a JSON value, verifying the checksum.
    pub fn decode(&self) -> Result<serde_json::Value> {
        let raw = if self.compressed {
            decompress(&self.bytes)?
        } else {
            self.bytes.clone()
        };

        if checksum_bytes(&raw) != self.checksum {
            return Err(Error::IntegrityViolation(
                "payload checksum does not match content".into(),
            ));
        }

        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Encode a payload for transmission.
///
/// Compression is attempted when the payload is at least
/// `policy.threshold_bytes` long or `force` is set, and only kept when it
/// actually shrinks the payload.
pub async fn encode(
    value: &serde_json::Value,
    policy: &CompressionPolicy,
    force: bool,
) -> EncodedPayload {
    let raw = EncodedPayload::raw(value);
    if raw.is_empty() || policy.budget.is_zero() {
        return raw;
    }
    if !force && raw.original_len < policy.threshold_bytes {
        return raw;
    }

    let input = raw.bytes.clone();
    let job = tokio::task::spawn_blocking(move || compress(&input));

    match tokio::time::timeout(policy.budget, job).await {
        Ok(Ok(compressed)) if compressed.len() < raw.original_len => EncodedPayload {
            bytes: compressed,
            compressed: true,
            original_len: raw.original_len,
            checksum: raw.checksum,
        },
        Ok(Ok(_)) => raw,
        Ok(Err(err)) => {
            warn!(error = %err, "compression task failed, sending raw payload");
            raw
        }
        Err(_) => {
            debug!(
                size = raw.original_len,
                budget_ms = policy.budget.as_millis() as u64,
                "compression budget exceeded, sending raw payload"
            );
            raw
        }
    }
}
