//! Binary on-disk encoding of a `QueueEntry`, per the persistence layout in
//! spec §6:
//!
//! ```text
//! [u32 version][u32 payload_len][payload_len bytes of Request serialization]
//! [u64 enqueuedAtEpochMillis][u32 attemptCount]
//! ```
//!
//! `position` is not part of the payload; it is carried by the entry's file
//! name and supplied back in on `decode`.

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{QueueError, Result};
use crate::request::types::{QueueEntry, Request};

/// Current on-disk format version. Bump when the payload layout changes.
pub const FORMAT_VERSION: u32 = 1;

/// Serialize a `QueueEntry`'s payload (everything except `position`).
pub fn encode_entry(entry: &QueueEntry) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(&entry.request)?;
    let mut buf = Vec::with_capacity(4 + 4 + payload.len() + 8 + 4);
    buf.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&(entry.enqueued_at.timestamp_millis() as u64).to_be_bytes());
    buf.extend_from_slice(&entry.attempt_count.to_be_bytes());
    Ok(buf)
}

/// Deserialize a payload previously produced by `encode_entry`, attaching the
/// `position` carried by the file name.
pub fn decode_entry(position: u64, bytes: &[u8]) -> Result<QueueEntry> {
    if bytes.len() < 4 + 4 {
        return Err(decode_err("entry shorter than header"));
    }
    let version = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(decode_err(&format!("unsupported entry version {version}")));
    }
    let payload_len = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
    let payload_start = 8;
    let payload_end = payload_start + payload_len;
    let trailer_end = payload_end + 8 + 4;
    if bytes.len() < trailer_end {
        return Err(decode_err("entry truncated before trailer"));
    }
    let payload = &bytes[payload_start..payload_end];
    let request: Request = serde_json::from_slice(payload)?;

    let millis = u64::from_be_bytes(bytes[payload_end..payload_end + 8].try_into().unwrap());
    let enqueued_at: DateTime<Utc> = Utc
        .timestamp_millis_opt(millis as i64)
        .single()
        .ok_or_else(|| decode_err("invalid enqueuedAt timestamp"))?;
    let attempt_count = u32::from_be_bytes(
        bytes[payload_end + 8..payload_end + 12]
            .try_into()
            .unwrap(),
    );

    Ok(QueueEntry {
        position,
        request,
        enqueued_at,
        attempt_count,
    })
}

fn decode_err(msg: &str) -> QueueError {
    tracing::warn!(reason = %msg, "queue entry failed to decode");
    QueueError::DecodeError(msg.to_string())
}

/// Substitutes every occurrence of `needle` in `haystack` with `replacement`,
/// used by the identifier merger to rewrite serialized request bytes without
/// any structural knowledge of their contents.
pub fn substitute_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::types::{Body, Method, QueueingPolicy, RequestId};

    fn sample_entry() -> QueueEntry {
        QueueEntry::fresh(
            42,
            Request {
                id: RequestId::new(),
                config: crate::request::types::RequestConfig {
                    method: Method::Post,
                    path: "/widgets".to_string(),
                    host_override: None,
                    query: vec![],
                    headers: vec![],
                    body: Body::Raw(b"{}".to_vec()),
                    queueing_policy: QueueingPolicy::default(),
                    background: false,
                    timeout_secs: None,
                    deduplicate: false,
                    tag: String::new(),
                },
                identifier_snapshot: None,
            },
        )
    }

    #[test]
    fn round_trip_identity() {
        let entry = sample_entry();
        let bytes = encode_entry(&entry).unwrap();
        let decoded = decode_entry(entry.position, &bytes).unwrap();
        assert_eq!(decoded.request, entry.request);
        assert_eq!(decoded.attempt_count, entry.attempt_count);
        assert_eq!(
            decoded.enqueued_at.timestamp_millis(),
            entry.enqueued_at.timestamp_millis()
        );
    }

    #[test]
    fn rejects_truncated_entry() {
        let entry = sample_entry();
        let bytes = encode_entry(&entry).unwrap();
        let truncated = &bytes[..bytes.len() - 5];
        assert!(decode_entry(entry.position, truncated).is_err());
    }

    #[test]
    fn substitute_replaces_all_occurrences() {
        let haystack = b"id=AA&other=AA-suffix";
        let out = substitute_bytes(haystack, b"AA", b"ZZZ");
        assert_eq!(out, b"id=ZZZ&other=ZZZ-suffix".to_vec());
    }

    #[test]
    fn substitute_noop_when_absent() {
        let haystack = b"id=BB";
        let out = substitute_bytes(haystack, b"AA", b"ZZZ");
        assert_eq!(out, haystack.to_vec());
    }
}
