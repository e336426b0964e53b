use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{IdParseError, SpanRejection};

/// Tag key marking a span as errored; its presence feeds dependency error counts.
pub const ERROR_TAG: &str = "error";

fn decode_hex<const N: usize>(s: &str) -> Option<[u8; N]> {
    if s.len() != N * 2 || !s.is_ascii() {
        return None;
    }
    let mut out = [0u8; N];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}

/// Unique identifier for a trace (strict 128-bit only; the all-zero ID is invalid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(pub [u8; 16]);

impl TraceId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for TraceId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex::<16>(s).map(TraceId).ok_or(IdParseError {
            what: "trace ID",
            input: s.to_string(),
            expected: 32,
        })
    }
}

impl Serialize for TraceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TraceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Unique identifier for a span within a trace (64-bit; all-zero is invalid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(pub [u8; 8]);

impl SpanId {
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for SpanId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex::<8>(s).map(SpanId).ok_or(IdParseError {
            what: "span ID",
            input: s.to_string(),
            expected: 16,
        })
    }
}

impl Serialize for SpanId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SpanId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Role a span played in the request it belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanKind {
    Client,
    Server,
    Producer,
    Consumer,
    #[default]
    Unspecified,
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Client => "CLIENT",
            Self::Server => "SERVER",
            Self::Producer => "PRODUCER",
            Self::Consumer => "CONSUMER",
            Self::Unspecified => "UNSPECIFIED",
        };
        f.write_str(s)
    }
}

/// A single timed operation within a distributed request.
///
/// Spans sharing a `trace_id` form one trace. A client span and the server
/// span it called share the same `span_id` and are correlated into a
/// dependency edge during aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(default)]
    pub parent_span_id: Option<SpanId>,
    pub service: String,
    pub operation: String,
    /// Microseconds since UNIX epoch.
    pub timestamp_micros: u64,
    #[serde(default)]
    pub duration_micros: u64,
    #[serde(default)]
    pub kind: SpanKind,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Span {
    /// Whether this span carries the error tag.
    pub fn is_errored(&self) -> bool {
        self.tags.contains_key(ERROR_TAG)
    }

    /// Well-formedness check applied at the write path before a span is
    /// appended to the log.
    pub fn validate(&self) -> Result<(), SpanRejection> {
        if self.trace_id.is_zero() {
            return Err(SpanRejection::ZeroTraceId);
        }
        if self.span_id.is_zero() {
            return Err(SpanRejection::ZeroSpanId);
        }
        if self.service.is_empty() {
            return Err(SpanRejection::EmptyServiceName);
        }
        Ok(())
    }
}

/// Aggregated call-count relationship between two services, merged across
/// time buckets at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyLink {
    pub parent: String,
    pub child: String,
    pub call_count: u64,
    pub error_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_hex_round_trip() {
        let id = TraceId([
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0xff,
        ]);
        let hex = id.to_string();
        assert_eq!(hex, "000102030405060708090a0b0c0d0eff");
        assert_eq!(hex.parse::<TraceId>().unwrap(), id);
    }

    #[test]
    fn span_id_hex_round_trip() {
        let id = SpanId([0xde, 0xad, 0xbe, 0xef, 0x00, 0x11, 0x22, 0x33]);
        assert_eq!(id.to_string(), "deadbeef00112233");
        assert_eq!("deadbeef00112233".parse::<SpanId>().unwrap(), id);
    }

    #[test]
    fn id_parse_rejects_bad_input() {
        assert!("xyz".parse::<TraceId>().is_err());
        assert!("00".parse::<TraceId>().is_err());
        assert!("deadbeef".parse::<SpanId>().is_err());
        assert!("zzzzzzzzzzzzzzzz".parse::<SpanId>().is_err());
    }

    #[test]
    fn ids_serialize_as_hex_strings() {
        let id = TraceId([0xab; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abababababababababababababababab\"");
        let back: TraceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn validate_rejects_malformed_spans() {
        let mut span = Span {
            trace_id: TraceId([1; 16]),
            span_id: SpanId([2; 8]),
            parent_span_id: None,
            service: "checkout".to_string(),
            operation: "GET /cart".to_string(),
            timestamp_micros: 1,
            duration_micros: 10,
            kind: SpanKind::Server,
            tags: BTreeMap::new(),
        };
        assert!(span.validate().is_ok());

        span.trace_id = TraceId([0; 16]);
        assert_eq!(span.validate(), Err(SpanRejection::ZeroTraceId));

        span.trace_id = TraceId([1; 16]);
        span.span_id = SpanId([0; 8]);
        assert_eq!(span.validate(), Err(SpanRejection::ZeroSpanId));

        span.span_id = SpanId([2; 8]);
        span.service.clear();
        assert_eq!(span.validate(), Err(SpanRejection::EmptyServiceName));
    }

    #[test]
    fn error_tag_marks_span_as_errored() {
        let mut span = Span {
            trace_id: TraceId([1; 16]),
            span_id: SpanId([2; 8]),
            parent_span_id: None,
            service: "a".to_string(),
            operation: "op".to_string(),
            timestamp_micros: 1,
            duration_micros: 1,
            kind: SpanKind::Client,
            tags: BTreeMap::new(),
        };
        assert!(!span.is_errored());
        span.tags.insert(ERROR_TAG.to_string(), "timeout".to_string());
        assert!(span.is_errored());
    }
}
