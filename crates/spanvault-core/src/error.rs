use thiserror::Error;

/// Rejected configuration, surfaced synchronously at build time before any
/// log or store is opened.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("loose trace IDs not supported: 128-bit trace IDs are mandatory")]
    LooseTraceIds,
    #[error("search not supported")]
    SearchNotSupported,
    #[error("autocomplete keys not supported")]
    AutocompleteNotSupported,
    #[error("unknown compression codec: {0}")]
    InvalidCodec(String),
    #[error("invalid topic config: {0}")]
    InvalidTopic(String),
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to open log: {0}")]
    Open(String),
    #[error("failed to append: {0}")]
    Append(String),
    #[error("failed to read: {0}")]
    Read(String),
    #[error("record codec error: {0}")]
    Codec(String),
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open storage: {0}")]
    Open(String),
    #[error("failed to write: {0}")]
    Write(String),
    #[error("failed to read: {0}")]
    Read(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Read-path failure. `Unsupported` is a declared capability gap, distinct
/// from an empty result.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unsupported query: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Why an individual span was refused at the write path.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SpanRejection {
    #[error("trace ID is all zero")]
    ZeroTraceId,
    #[error("span ID is all zero")]
    ZeroSpanId,
    #[error("service name is empty")]
    EmptyServiceName,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid {what} {input:?}: expected {expected} hex characters")]
pub struct IdParseError {
    pub what: &'static str,
    pub input: String,
    pub expected: usize,
}
