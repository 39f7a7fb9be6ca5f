//! Default configuration values for rpc-reactor.
//!
//! Every settings section falls back to these when a field is missing from
//! the TOML file, so an empty file is a valid configuration.

use super::settings::{
    HaltPolicy, HandlerErrorPolicy, LoggingConfig, SchedulerConfig, TransportConfig,
};

pub const DEFAULT_SCHEDULER_THREAD_NAME: &str = "reactor-scheduler";
pub const DEFAULT_TRANSPORT_THREAD_NAME: &str = "rpc-transport";
pub const DEFAULT_TRANSPORT_WORKERS: usize = 2;
pub const DEFAULT_LOG_FILTER: &str = "info";

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_name: DEFAULT_SCHEDULER_THREAD_NAME.to_string(),
            error_policy: HandlerErrorPolicy::default(),
            halt_policy: HaltPolicy::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_TRANSPORT_WORKERS,
            thread_name: DEFAULT_TRANSPORT_THREAD_NAME.to_string(),
            latency_ms: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}
