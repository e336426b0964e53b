use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use spanvault_core::error::{QueryError, StorageError};
use spanvault_core::span::{DependencyLink, Span, TraceId};
use spanvault_core::storage::{SpanStore, TraceQuery};

use crate::keys;
use crate::stores::{EdgeCounts, StateStores, get_json};

/// Read path over the live state keyspace. Lock-free: every query observes
/// whatever the topology has committed as of the read, which may trail
/// in-flight aggregation by a few records.
pub struct FjallSpanStore {
    stores: Arc<StateStores>,
}

impl FjallSpanStore {
    pub(crate) fn new(stores: Arc<StateStores>) -> Self {
        Self { stores }
    }
}

impl SpanStore for FjallSpanStore {
    fn trace(&self, trace_id: &TraceId) -> Result<Vec<Span>, QueryError> {
        let spans: Option<Vec<Span>> =
            get_json(&self.stores.traces, &keys::trace_key(trace_id))?;
        Ok(spans.unwrap_or_default())
    }

    fn service_names(&self) -> Result<Vec<String>, QueryError> {
        let mut names = BTreeSet::new();
        for entry in self.stores.service_operations.iter() {
            let (key, _) = entry.map_err(|e| StorageError::Read(e.to_string()))?;
            if let Some((service, _)) = keys::split_service_op_key(&key) {
                names.insert(service);
            }
        }
        Ok(names.into_iter().collect())
    }

    fn operation_names(&self, service: &str) -> Result<Vec<String>, QueryError> {
        let mut names = Vec::new();
        for entry in self
            .stores
            .service_operations
            .prefix(keys::service_prefix(service))
        {
            let (key, _) = entry.map_err(|e| StorageError::Read(e.to_string()))?;
            if let Some((_, operation)) = keys::split_service_op_key(&key) {
                names.push(operation);
            }
        }
        Ok(names)
    }

    fn dependencies(
        &self,
        min_micros: u64,
        max_micros: u64,
    ) -> Result<Vec<DependencyLink>, QueryError> {
        let mut merged: BTreeMap<(String, String), EdgeCounts> = BTreeMap::new();
        let start = keys::bucket_of(min_micros).to_be_bytes();
        for entry in self.stores.dependencies.range(start..) {
            let (key, value) = entry.map_err(|e| StorageError::Read(e.to_string()))?;
            let Some((bucket, parent, child)) = keys::split_dependency_key(&key) else {
                continue;
            };
            if bucket > max_micros {
                break;
            }
            let counts: EdgeCounts = serde_json::from_slice(&value)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            let slot = merged.entry((parent, child)).or_default();
            slot.call_count += counts.call_count;
            slot.error_count += counts.error_count;
        }

        Ok(merged
            .into_iter()
            .map(|((parent, child), counts)| DependencyLink {
                parent,
                child,
                call_count: counts.call_count,
                error_count: counts.error_count,
            })
            .collect())
    }

    fn search_traces(&self, _query: &TraceQuery) -> Result<Vec<Vec<Span>>, QueryError> {
        Err(QueryError::Unsupported(
            "trace search by criteria; only trace lookup, service/operation \
             listing and dependency listing are supported",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DEPENDENCY_BUCKET_MICROS;
    use crate::stores::to_json;

    fn store(dir: &std::path::Path) -> (Arc<StateStores>, FjallSpanStore) {
        let stores = Arc::new(StateStores::open(dir).unwrap());
        let reader = FjallSpanStore::new(stores.clone());
        (stores, reader)
    }

    fn put_edge(stores: &StateStores, bucket: u64, parent: &str, child: &str, counts: EdgeCounts) {
        stores
            .dependencies
            .insert(
                keys::dependency_key(bucket, parent, child),
                to_json(&counts).unwrap(),
            )
            .unwrap();
    }

    #[test]
    fn unknown_trace_is_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_stores, reader) = store(dir.path());
        assert!(reader.trace(&TraceId([5; 16])).unwrap().is_empty());
    }

    #[test]
    fn listings_over_service_operation_keys() {
        let dir = tempfile::tempdir().unwrap();
        let (stores, reader) = store(dir.path());
        for (s, o) in [("a", "GET /x"), ("a", "POST /y"), ("b", "GET /z")] {
            stores
                .service_operations
                .insert(keys::service_op_key(s, o), [])
                .unwrap();
        }

        assert_eq!(reader.service_names().unwrap(), vec!["a", "b"]);
        assert_eq!(
            reader.operation_names("a").unwrap(),
            vec!["GET /x", "POST /y"]
        );
        assert!(reader.operation_names("missing").unwrap().is_empty());
    }

    #[test]
    fn dependencies_merge_across_buckets_within_range() {
        let dir = tempfile::tempdir().unwrap();
        let (stores, reader) = store(dir.path());

        let day = DEPENDENCY_BUCKET_MICROS;
        put_edge(&stores, 0, "a", "b", EdgeCounts { call_count: 2, error_count: 1 });
        put_edge(&stores, day, "a", "b", EdgeCounts { call_count: 3, error_count: 0 });
        put_edge(&stores, day, "a", "c", EdgeCounts { call_count: 1, error_count: 0 });
        put_edge(&stores, 3 * day, "a", "b", EdgeCounts { call_count: 10, error_count: 5 });

        // Range covering the first two days only.
        let links = reader.dependencies(10, day + 10).unwrap();
        assert_eq!(
            links,
            vec![
                DependencyLink {
                    parent: "a".to_string(),
                    child: "b".to_string(),
                    call_count: 5,
                    error_count: 1,
                },
                DependencyLink {
                    parent: "a".to_string(),
                    child: "c".to_string(),
                    call_count: 1,
                    error_count: 0,
                },
            ]
        );

        assert!(reader.dependencies(5 * day, 6 * day).unwrap().is_empty());
    }

    #[test]
    fn search_is_declared_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let (_stores, reader) = store(dir.path());
        let err = reader.search_traces(&TraceQuery::default()).unwrap_err();
        assert!(matches!(err, QueryError::Unsupported(_)));
    }
}
