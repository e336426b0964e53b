use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Compression applied to span log partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    #[default]
    None,
    Lz4,
}

impl FromStr for CompressionCodec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            other => Err(ConfigError::InvalidCodec(other.to_string())),
        }
    }
}

/// Name, partition count and replication factor of one log topic.
///
/// The embedded log keeps a single local replica; the replication factor is
/// recorded in topic metadata for parity with networked log deployments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    pub partitions: u16,
    pub replication_factor: u16,
}

impl TopicConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: 1,
            replication_factor: 1,
        }
    }

    pub fn partitions(mut self, partitions: u16) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn replication_factor(mut self, replication_factor: u16) -> Self {
        self.replication_factor = replication_factor;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidTopic("empty topic name".to_string()));
        }
        if self.name.contains('/') {
            return Err(ConfigError::InvalidTopic(format!(
                "topic name {:?} contains '/'",
                self.name
            )));
        }
        if self.partitions == 0 {
            return Err(ConfigError::InvalidTopic(format!(
                "topic {:?} needs at least one partition",
                self.name
            )));
        }
        if self.replication_factor == 0 {
            return Err(ConfigError::InvalidTopic(format!(
                "topic {:?} needs a replication factor of at least one",
                self.name
            )));
        }
        Ok(())
    }
}

/// Resolved storage-engine configuration, produced by the engine builder
/// after fail-fast validation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the span log keyspace.
    pub log_dir: PathBuf,
    /// Directory holding the state-store keyspace.
    pub state_dir: PathBuf,
    pub codec: CompressionCodec,
    pub spans_topic: TopicConfig,
    pub traces_topic: TopicConfig,
    pub services_topic: TopicConfig,
    pub dependencies_topic: TopicConfig,
    /// Provision missing topics on startup.
    pub ensure_topics: bool,
    /// How long traces and dependency buckets are kept before eviction.
    pub retention: Duration,
    /// How long a one-sided client/server link waits for its peer.
    pub link_timeout: Duration,
}

impl EngineConfig {
    pub fn new(log_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            state_dir: state_dir.into(),
            codec: CompressionCodec::None,
            spans_topic: TopicConfig::new("spans").partitions(4),
            traces_topic: TopicConfig::new("traces").partitions(4),
            services_topic: TopicConfig::new("services"),
            dependencies_topic: TopicConfig::new("dependencies"),
            ensure_topics: true,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            link_timeout: Duration::from_secs(5 * 60),
        }
    }

    /// Internal repartition topic carrying spans re-keyed by trace ID.
    /// Partitioned like the traces topic so each aggregation worker owns a
    /// disjoint set of traces.
    pub fn repartition_topic(&self) -> TopicConfig {
        TopicConfig::new(format!("{}-by-trace", self.spans_topic.name))
            .partitions(self.traces_topic.partitions)
            .replication_factor(self.traces_topic.replication_factor)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.spans_topic.validate()?;
        self.traces_topic.validate()?;
        self.services_topic.validate()?;
        self.dependencies_topic.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_parses_known_names() {
        assert_eq!("none".parse::<CompressionCodec>().unwrap(), CompressionCodec::None);
        assert_eq!("LZ4".parse::<CompressionCodec>().unwrap(), CompressionCodec::Lz4);
        assert_eq!(
            "snappy".parse::<CompressionCodec>(),
            Err(ConfigError::InvalidCodec("snappy".to_string()))
        );
    }

    #[test]
    fn topic_validation() {
        assert!(TopicConfig::new("spans").validate().is_ok());
        assert!(TopicConfig::new("").validate().is_err());
        assert!(TopicConfig::new("a/b").validate().is_err());
        assert!(TopicConfig::new("spans").partitions(0).validate().is_err());
        assert!(
            TopicConfig::new("spans")
                .replication_factor(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn repartition_topic_follows_traces_partitioning() {
        let mut cfg = EngineConfig::new("/tmp/log", "/tmp/state");
        cfg.traces_topic = TopicConfig::new("traces").partitions(7);
        let internal = cfg.repartition_topic();
        assert_eq!(internal.name, "spans-by-trace");
        assert_eq!(internal.partitions, 7);
    }
}
