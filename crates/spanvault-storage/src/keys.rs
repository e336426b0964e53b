//! Binary key encodings for the state stores.
//!
//! All keys sort meaningfully under fjall's lexicographic byte order:
//! big-endian timestamps put older entries first, and `\0`-separated string
//! pairs make `{service}\0` a prefix-scannable namespace (service and
//! operation names never contain NUL).

use spanvault_core::span::{SpanId, TraceId};

/// Width of a dependency time bucket: one day, in microseconds.
pub const DEPENDENCY_BUCKET_MICROS: u64 = 86_400_000_000;

/// Start of the bucket containing `timestamp_micros`.
pub fn bucket_of(timestamp_micros: u64) -> u64 {
    timestamp_micros - timestamp_micros % DEPENDENCY_BUCKET_MICROS
}

/// `traces` key: `{trace_id (16B)}`.
pub fn trace_key(trace_id: &TraceId) -> [u8; 16] {
    *trace_id.as_bytes()
}

/// `trace_index` key: `{first_seen_micros_be (8B)}{trace_id (16B)}`.
pub fn trace_index_key(first_seen_micros: u64, trace_id: &TraceId) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&first_seen_micros.to_be_bytes());
    key[8..].copy_from_slice(trace_id.as_bytes());
    key
}

pub fn split_trace_index_key(key: &[u8]) -> Option<(u64, TraceId)> {
    if key.len() != 24 {
        return None;
    }
    let micros = u64::from_be_bytes(key[..8].try_into().ok()?);
    let trace_id = TraceId(key[8..].try_into().ok()?);
    Some((micros, trace_id))
}

/// `service_operations` key: `{service}\0{operation}`.
pub fn service_op_key(service: &str, operation: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(service.len() + 1 + operation.len());
    key.extend_from_slice(service.as_bytes());
    key.push(0);
    key.extend_from_slice(operation.as_bytes());
    key
}

/// Prefix covering every operation of one service.
pub fn service_prefix(service: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(service.len() + 1);
    prefix.extend_from_slice(service.as_bytes());
    prefix.push(0);
    prefix
}

pub fn split_service_op_key(key: &[u8]) -> Option<(String, String)> {
    let sep = key.iter().position(|b| *b == 0)?;
    let service = String::from_utf8(key[..sep].to_vec()).ok()?;
    let operation = String::from_utf8(key[sep + 1..].to_vec()).ok()?;
    Some((service, operation))
}

/// `dependencies` key: `{bucket_micros_be (8B)}{parent}\0{child}`.
pub fn dependency_key(bucket_micros: u64, parent: &str, child: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + parent.len() + 1 + child.len());
    key.extend_from_slice(&bucket_micros.to_be_bytes());
    key.extend_from_slice(parent.as_bytes());
    key.push(0);
    key.extend_from_slice(child.as_bytes());
    key
}

pub fn split_dependency_key(key: &[u8]) -> Option<(u64, String, String)> {
    if key.len() < 8 {
        return None;
    }
    let bucket = u64::from_be_bytes(key[..8].try_into().ok()?);
    let (parent, child) = split_service_op_key(&key[8..])?;
    Some((bucket, parent, child))
}

/// `pending_links` / `link_seen` key: `{trace_id (16B)}{span_id (8B)}`.
pub fn link_key(trace_id: &TraceId, span_id: &SpanId) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(trace_id.as_bytes());
    key[16..].copy_from_slice(span_id.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_boundaries() {
        assert_eq!(bucket_of(0), 0);
        assert_eq!(bucket_of(DEPENDENCY_BUCKET_MICROS - 1), 0);
        assert_eq!(bucket_of(DEPENDENCY_BUCKET_MICROS), DEPENDENCY_BUCKET_MICROS);
        assert_eq!(
            bucket_of(3 * DEPENDENCY_BUCKET_MICROS + 17),
            3 * DEPENDENCY_BUCKET_MICROS
        );
    }

    #[test]
    fn service_op_key_round_trip() {
        let key = service_op_key("checkout", "GET /cart");
        let (service, operation) = split_service_op_key(&key).unwrap();
        assert_eq!(service, "checkout");
        assert_eq!(operation, "GET /cart");
        assert!(key.starts_with(&service_prefix("checkout")));
        assert!(!key.starts_with(&service_prefix("check")));
    }

    #[test]
    fn dependency_key_round_trip_and_ordering() {
        let early = dependency_key(0, "a", "b");
        let late = dependency_key(DEPENDENCY_BUCKET_MICROS, "a", "b");
        assert!(early < late);

        let (bucket, parent, child) =
            split_dependency_key(&dependency_key(DEPENDENCY_BUCKET_MICROS, "front", "back"))
                .unwrap();
        assert_eq!(bucket, DEPENDENCY_BUCKET_MICROS);
        assert_eq!(parent, "front");
        assert_eq!(child, "back");
    }

    #[test]
    fn trace_index_key_orders_by_time() {
        let id = TraceId([7; 16]);
        let older = trace_index_key(100, &id);
        let newer = trace_index_key(200, &id);
        assert!(older < newer);

        let (micros, back) = split_trace_index_key(&older).unwrap();
        assert_eq!(micros, 100);
        assert_eq!(back, id);
    }
}
