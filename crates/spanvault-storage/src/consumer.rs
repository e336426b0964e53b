use std::sync::Arc;

use spanvault_core::error::LogError;
use spanvault_core::span::Span;
use spanvault_core::storage::{AcceptReport, SpanConsumer};
use spanvault_log::FjallSpanLog;
use tracing::debug;

/// Write path: validates spans and durably appends them to the spans topic,
/// keyed by trace ID. No aggregation happens here.
pub struct LogSpanConsumer {
    log: Arc<FjallSpanLog>,
    spans_topic: String,
}

impl LogSpanConsumer {
    pub(crate) fn new(log: Arc<FjallSpanLog>, spans_topic: String) -> Self {
        Self { log, spans_topic }
    }
}

impl SpanConsumer for LogSpanConsumer {
    fn accept(&self, spans: Vec<Span>) -> Result<AcceptReport, LogError> {
        let mut report = AcceptReport::default();
        for (index, span) in spans.into_iter().enumerate() {
            // Malformed spans are refused individually; the rest of the
            // batch still goes through.
            if let Err(reason) = span.validate() {
                debug!(index, %reason, "rejected span");
                report.rejected.push((index, reason));
                continue;
            }
            let value = serde_json::to_vec(&span).map_err(|e| LogError::Codec(e.to_string()))?;
            self.log
                .append(&self.spans_topic, span.trace_id.as_bytes(), &value)?;
            report.accepted += 1;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use spanvault_core::config::{CompressionCodec, TopicConfig};
    use spanvault_core::error::SpanRejection;
    use spanvault_core::span::{SpanId, SpanKind, TraceId};

    fn span(trace: [u8; 16], id: [u8; 8], service: &str) -> Span {
        Span {
            trace_id: TraceId(trace),
            span_id: SpanId(id),
            parent_span_id: None,
            service: service.to_string(),
            operation: "GET /".to_string(),
            timestamp_micros: 1,
            duration_micros: 1,
            kind: SpanKind::Server,
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn mixed_batch_reports_per_span() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(FjallSpanLog::open(dir.path(), CompressionCodec::None).unwrap());
        log.create_topic(&TopicConfig::new("spans").partitions(2))
            .unwrap();

        let consumer = LogSpanConsumer::new(log.clone(), "spans".to_string());
        let report = consumer
            .accept(vec![
                span([1; 16], [1; 8], "a"),
                span([0; 16], [2; 8], "b"),
                span([3; 16], [3; 8], ""),
                span([4; 16], [4; 8], "c"),
            ])
            .unwrap();

        assert_eq!(report.accepted, 2);
        assert_eq!(
            report.rejected,
            vec![
                (1, SpanRejection::ZeroTraceId),
                (2, SpanRejection::EmptyServiceName),
            ]
        );

        let total: usize = (0u16..2)
            .map(|p| log.fetch("spans", p, 0, 100).unwrap().len())
            .sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn spans_of_one_trace_share_a_partition() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(FjallSpanLog::open(dir.path(), CompressionCodec::None).unwrap());
        log.create_topic(&TopicConfig::new("spans").partitions(4))
            .unwrap();

        let consumer = LogSpanConsumer::new(log.clone(), "spans".to_string());
        consumer
            .accept(vec![span([9; 16], [1; 8], "a"), span([9; 16], [2; 8], "b")])
            .unwrap();

        let populated: Vec<u16> = (0u16..4)
            .filter(|p| !log.fetch("spans", *p, 0, 100).unwrap().is_empty())
            .collect();
        assert_eq!(populated.len(), 1);
        assert_eq!(log.fetch("spans", populated[0], 0, 100).unwrap().len(), 2);
    }
}
