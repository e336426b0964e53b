use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use spanvault_core::config::{CompressionCodec, EngineConfig, TopicConfig};
use spanvault_core::error::{ConfigError, LogError, StorageError};
use spanvault_log::FjallSpanLog;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::consumer::LogSpanConsumer;
use crate::read::FjallSpanStore;
use crate::stores::StateStores;
use crate::topology::{
    GROUP_DEPENDENCIES, GROUP_ROUTER, GROUP_SERVICES, GROUP_TRACES, Topology,
};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Builds a [`StorageEngine`], validating every option before any log or
/// store is opened. Unsupported settings are rejected here, not silently
/// degraded: loose trace IDs, search, and autocomplete keys are permanent
/// capability gaps of this backend.
pub struct EngineBuilder {
    config: EngineConfig,
    strict_trace_ids: bool,
    search_enabled: bool,
    autocomplete_keys: Vec<String>,
}

impl EngineBuilder {
    pub fn new(log_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            config: EngineConfig::new(log_dir, state_dir),
            strict_trace_ids: true,
            search_enabled: false,
            autocomplete_keys: Vec::new(),
        }
    }

    pub fn compression(mut self, codec: CompressionCodec) -> Self {
        self.config.codec = codec;
        self
    }

    pub fn spans_topic(mut self, topic: TopicConfig) -> Self {
        self.config.spans_topic = topic;
        self
    }

    pub fn traces_topic(mut self, topic: TopicConfig) -> Self {
        self.config.traces_topic = topic;
        self
    }

    pub fn services_topic(mut self, topic: TopicConfig) -> Self {
        self.config.services_topic = topic;
        self
    }

    pub fn dependencies_topic(mut self, topic: TopicConfig) -> Self {
        self.config.dependencies_topic = topic;
        self
    }

    pub fn ensure_topics(mut self, ensure: bool) -> Self {
        self.config.ensure_topics = ensure;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.config.retention = retention;
        self
    }

    pub fn link_timeout(mut self, timeout: Duration) -> Self {
        self.config.link_timeout = timeout;
        self
    }

    /// This backend only supports strict 128-bit trace IDs; passing `false`
    /// is a configuration error.
    pub fn strict_trace_ids(mut self, strict: bool) -> Self {
        self.strict_trace_ids = strict;
        self
    }

    /// Search is unsupported by construction; passing `true` is a
    /// configuration error.
    pub fn search_enabled(mut self, enabled: bool) -> Self {
        self.search_enabled = enabled;
        self
    }

    /// Autocomplete keys are unsupported; any non-empty list is a
    /// configuration error.
    pub fn autocomplete_keys(mut self, keys: Vec<String>) -> Self {
        self.autocomplete_keys = keys;
        self
    }

    /// Validate, open log and state keyspaces, provision topics, and start
    /// the aggregation topology from its last committed offsets.
    ///
    /// Must be called within a tokio runtime; the topology runs as spawned
    /// tasks.
    pub fn build(self) -> Result<StorageEngine, BuildError> {
        if !self.strict_trace_ids {
            return Err(ConfigError::LooseTraceIds.into());
        }
        if self.search_enabled {
            return Err(ConfigError::SearchNotSupported.into());
        }
        if !self.autocomplete_keys.is_empty() {
            return Err(ConfigError::AutocompleteNotSupported.into());
        }
        self.config.validate()?;

        let cfg = Arc::new(self.config);
        let log = Arc::new(FjallSpanLog::open(&cfg.log_dir, cfg.codec)?);

        let topics = [
            &cfg.spans_topic,
            &cfg.traces_topic,
            &cfg.services_topic,
            &cfg.dependencies_topic,
        ];
        for topic in topics {
            if cfg.ensure_topics {
                log.create_topic(topic)?;
            } else if !log.has_topic(&topic.name) {
                return Err(LogError::UnknownTopic(topic.name.clone()).into());
            }
        }
        // The repartition topic is internal and always provisioned.
        log.create_topic(&cfg.repartition_topic())?;

        let stores = Arc::new(StateStores::open(&cfg.state_dir)?);
        let topology = Topology::spawn(log.clone(), stores.clone(), cfg.clone());
        info!(
            log_dir = %cfg.log_dir.display(),
            state_dir = %cfg.state_dir.display(),
            "storage engine started"
        );

        Ok(StorageEngine {
            log,
            stores,
            cfg,
            topology,
        })
    }
}

/// The running storage backend: span log, state stores, and the aggregation
/// topology, with the write and read paths hanging off it.
pub struct StorageEngine {
    log: Arc<FjallSpanLog>,
    stores: Arc<StateStores>,
    cfg: Arc<EngineConfig>,
    topology: Topology,
}

impl StorageEngine {
    pub fn span_consumer(&self) -> LogSpanConsumer {
        LogSpanConsumer::new(self.log.clone(), self.cfg.spans_topic.name.clone())
    }

    pub fn span_store(&self) -> FjallSpanStore {
        FjallSpanStore::new(self.stores.clone())
    }

    /// How many log records the topology has skipped as malformed.
    pub fn malformed_records(&self) -> u64 {
        self.topology.malformed_count()
    }

    /// Whether every worker group has committed up to its topic's end
    /// offset. Checked in pipeline order so records still moving between
    /// stages are seen by a later check in the same pass.
    fn is_idle(&self) -> bool {
        let stages = [
            (GROUP_ROUTER, self.cfg.spans_topic.name.clone()),
            (GROUP_TRACES, self.cfg.repartition_topic().name),
            (GROUP_SERVICES, self.cfg.services_topic.name.clone()),
            (GROUP_DEPENDENCIES, self.cfg.dependencies_topic.name.clone()),
        ];
        for (group, topic) in stages {
            let Ok(partitions) = self.log.partitions(&topic) else {
                return false;
            };
            for partition in 0..partitions {
                let end = match self.log.end_offset(&topic, partition) {
                    Ok(end) => end,
                    Err(_) => return false,
                };
                match self.stores.committed_offset(group, &topic, partition) {
                    Ok(committed) if committed >= end => {}
                    _ => return false,
                }
            }
        }
        true
    }

    /// Wait until the topology has caught up with everything appended so
    /// far, or `timeout` elapses. Returns whether it drained.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Drain in-flight aggregation, stop the topology within the grace
    /// period (forcefully past it), and flush both keyspaces.
    pub async fn close(self, grace: Duration) {
        if !self.wait_until_idle(grace).await {
            warn!("shutting down with aggregation still in flight");
        }
        self.topology.shutdown(grace).await;
        if let Err(e) = self.log.flush() {
            warn!(error = %e, "log flush failed during shutdown");
        }
        if let Err(e) = self.stores.persist() {
            warn!(error = %e, "state flush failed during shutdown");
        }
        info!("storage engine stopped");
    }
}
