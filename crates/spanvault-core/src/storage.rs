use std::collections::BTreeMap;

use crate::error::{LogError, QueryError, SpanRejection};
use crate::span::{DependencyLink, Span, TraceId};

/// Per-span outcome of a consumer batch. Partial failures are reported
/// span by span, never as an all-or-nothing batch failure.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AcceptReport {
    pub accepted: usize,
    /// `(index into the submitted batch, reason)` for each refused span.
    pub rejected: Vec<(usize, SpanRejection)>,
}

/// Write path: durably appends spans to the span log. Performs no
/// aggregation and holds no state of its own.
pub trait SpanConsumer: Send + Sync {
    fn accept(&self, spans: Vec<Span>) -> Result<AcceptReport, LogError>;
}

/// Shape of a trace search. Modeled so the read path can reject it
/// explicitly: search is unsupported by construction, and callers must be
/// told so rather than silently given empty results.
#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    pub service: Option<String>,
    pub operation: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub min_duration_micros: Option<u64>,
    pub max_duration_micros: Option<u64>,
}

/// Read path over the live materializations. Reads take no locks and
/// observe whatever the aggregation topology has committed so far.
pub trait SpanStore: Send + Sync {
    /// All spans accumulated so far for a trace; empty when unknown.
    fn trace(&self, trace_id: &TraceId) -> Result<Vec<Span>, QueryError>;

    /// Distinct service names observed in at least one span.
    fn service_names(&self) -> Result<Vec<String>, QueryError>;

    /// Distinct operation names observed for one service.
    fn operation_names(&self, service: &str) -> Result<Vec<String>, QueryError>;

    /// Dependency edges whose time buckets intersect
    /// `[min_micros, max_micros]`, with call/error counts merged per
    /// (parent, child) pair.
    fn dependencies(
        &self,
        min_micros: u64,
        max_micros: u64,
    ) -> Result<Vec<DependencyLink>, QueryError>;

    /// Always `Err(QueryError::Unsupported)`.
    fn search_traces(&self, query: &TraceQuery) -> Result<Vec<Vec<Span>>, QueryError>;
}
