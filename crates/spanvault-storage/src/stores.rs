use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use spanvault_core::error::StorageError;
use spanvault_core::span::SpanKind;

/// The state keyspace: the three materializations plus the bookkeeping that
/// makes their updates exactly-once.
///
/// Every topology mutation commits through a single cross-partition batch
/// that also advances the worker's consumed offset, so state and log
/// position move as a unit and crash recovery replays only records whose
/// effects were never committed.
pub struct StateStores {
    pub keyspace: Keyspace,
    /// `{trace_id}` → JSON `Vec<Span>`, the growing trace aggregate.
    pub traces: PartitionHandle,
    /// `{first_seen_be}{trace_id}` → empty; drives retention sweeps.
    pub trace_index: PartitionHandle,
    /// `{service}\0{operation}` → empty; membership set.
    pub service_operations: PartitionHandle,
    /// `{bucket_be}{parent}\0{child}` → JSON [`EdgeCounts`].
    pub dependencies: PartitionHandle,
    /// `{trace_id}{span_id}` → JSON [`LinkState`], client/server pairing.
    pub pending_links: PartitionHandle,
    /// `{trace_id}{span_id}` → `{seen_at_be}`; dedup markers keyed by input
    /// record identity so dependency counts survive replay exactly.
    pub link_seen: PartitionHandle,
    /// `{group}\0{topic}\0{partition_be}` → `{next_offset_be}`.
    pub offsets: PartitionHandle,
}

impl StateStores {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        let keyspace = Config::new(path)
            .open()
            .map_err(|e| StorageError::Open(e.to_string()))?;

        // Trace aggregates grow without bound within the retention window;
        // keep their values out of the LSM tree proper.
        let kv_sep_opts = PartitionCreateOptions::default()
            .with_kv_separation(fjall::KvSeparationOptions::default());

        let open = |name: &str, opts: PartitionCreateOptions| {
            keyspace
                .open_partition(name, opts)
                .map_err(|e| StorageError::Open(e.to_string()))
        };

        let traces = open("traces", kv_sep_opts)?;
        let trace_index = open("trace_index", PartitionCreateOptions::default())?;
        let service_operations = open("service_operations", PartitionCreateOptions::default())?;
        let dependencies = open("dependencies", PartitionCreateOptions::default())?;
        let pending_links = open("pending_links", PartitionCreateOptions::default())?;
        let link_seen = open("link_seen", PartitionCreateOptions::default())?;
        let offsets = open("offsets", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            traces,
            trace_index,
            service_operations,
            dependencies,
            pending_links,
            link_seen,
            offsets,
        })
    }

    /// Next offset a worker group should consume from `topic`/`partition`;
    /// zero when the group has never committed.
    pub fn committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: u16,
    ) -> Result<u64, StorageError> {
        let Some(value) = self
            .offsets
            .get(offset_key(group, topic, partition))
            .map_err(|e| StorageError::Read(e.to_string()))?
        else {
            return Ok(0);
        };
        let bytes: [u8; 8] = value
            .as_ref()
            .try_into()
            .map_err(|_| StorageError::Read("malformed committed offset".to_string()))?;
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn persist(&self) -> Result<(), StorageError> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(|e| StorageError::Write(e.to_string()))
    }
}

pub fn offset_key(group: &str, topic: &str, partition: u16) -> Vec<u8> {
    let mut key = Vec::with_capacity(group.len() + topic.len() + 4);
    key.extend_from_slice(group.as_bytes());
    key.push(0);
    key.extend_from_slice(topic.as_bytes());
    key.push(0);
    key.extend_from_slice(&partition.to_be_bytes());
    key
}

/// Decode a JSON value out of a store partition.
pub fn get_json<T: DeserializeOwned>(
    handle: &PartitionHandle,
    key: &[u8],
) -> Result<Option<T>, StorageError> {
    let Some(value) = handle
        .get(key)
        .map_err(|e| StorageError::Read(e.to_string()))?
    else {
        return Ok(None);
    };
    let decoded =
        serde_json::from_slice(&value).map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(Some(decoded))
}

pub fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Bucketed call/error counters of one dependency edge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeCounts {
    pub call_count: u64,
    pub error_count: u64,
}

/// Client/server pairing state for one `{trace_id}{span_id}` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkState {
    /// One side arrived; the other is awaited until the pairing timeout.
    AwaitingPeer {
        kind: SpanKind,
        service: String,
        errored: bool,
        timestamp_micros: u64,
        since_micros: u64,
    },
    /// Both sides arrived and the edge event was emitted; kept so replayed
    /// spans cannot re-open the pairing.
    Completed { since_micros: u64 },
}

impl LinkState {
    pub fn since_micros(&self) -> u64 {
        match self {
            Self::AwaitingPeer { since_micros, .. } | Self::Completed { since_micros } => {
                *since_micros
            }
        }
    }
}

/// Wall clock in microseconds since UNIX epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_offset_defaults_to_zero_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let stores = StateStores::open(dir.path()).unwrap();

        assert_eq!(stores.committed_offset("g", "spans", 0).unwrap(), 0);

        let mut batch = stores.keyspace.batch();
        batch.insert(&stores.offsets, offset_key("g", "spans", 0), 42u64.to_be_bytes());
        batch.commit().unwrap();

        assert_eq!(stores.committed_offset("g", "spans", 0).unwrap(), 42);
        assert_eq!(stores.committed_offset("g", "spans", 1).unwrap(), 0);
        assert_eq!(stores.committed_offset("other", "spans", 0).unwrap(), 0);
    }

    #[test]
    fn offset_keys_are_distinct_per_group_topic_partition() {
        let a = offset_key("g", "spans", 0);
        let b = offset_key("g", "spans", 1);
        let c = offset_key("g", "traces", 0);
        let d = offset_key("h", "spans", 0);
        assert!(a != b && a != c && a != d && b != c);
    }

    #[test]
    fn link_state_json_round_trip() {
        let awaiting = LinkState::AwaitingPeer {
            kind: SpanKind::Client,
            service: "front".to_string(),
            errored: false,
            timestamp_micros: 123,
            since_micros: 456,
        };
        let back: LinkState = serde_json::from_slice(&to_json(&awaiting).unwrap()).unwrap();
        assert_eq!(back, awaiting);
        assert_eq!(back.since_micros(), 456);

        let done = LinkState::Completed { since_micros: 9 };
        let back: LinkState = serde_json::from_slice(&to_json(&done).unwrap()).unwrap();
        assert_eq!(back.since_micros(), 9);
    }
}
