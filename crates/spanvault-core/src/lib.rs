pub mod config;
pub mod error;
pub mod span;
pub mod storage;
