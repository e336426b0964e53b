//! Log-backed trace storage: a durable span log feeding a streaming
//! aggregation topology, with materialized traces, a service/operation
//! index, and a service dependency graph served straight from fjall.

mod consumer;
mod engine;
mod keys;
mod read;
mod stores;
mod topology;

pub use consumer::LogSpanConsumer;
pub use engine::{BuildError, EngineBuilder, StorageEngine};
pub use read::FjallSpanStore;
