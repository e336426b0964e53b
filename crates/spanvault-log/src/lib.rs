mod fjall_log;

pub use fjall_log::{FjallSpanLog, LogRecord};
