use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level settings file layout.
///
/// ```toml
/// [scheduler]
/// thread_name = "reactor-scheduler"
/// error_policy = "log_and_continue"
/// halt_policy = "drain"
///
/// [transport]
/// worker_threads = 2
/// latency_ms = 0
///
/// [logging]
/// filter = "info"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub scheduler: SchedulerConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Name of the consumer thread spawned in background mode.
    pub thread_name: String,
    pub error_policy: HandlerErrorPolicy,
    pub halt_policy: HaltPolicy,
}

/// What the consumer loop does when a handler fails or panics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorPolicy {
    /// Log the failure and dispatch the next event.
    #[default]
    LogAndContinue,
    /// Stop the loop and return the failure from `run`/`join`.
    Propagate,
}

/// What happens to queued events when the scheduler is halted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltPolicy {
    /// Dispatch everything enqueued before the halt request, then stop.
    #[default]
    Drain,
    /// Stop before the next event. Undispatched events stay queued.
    Abandon,
}

/// Settings of the in-process transport.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub worker_threads: usize,
    pub thread_name: String,
    /// Artificial delay before each response, in milliseconds.
    pub latency_ms: u64,
}

impl TransportConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `env_logger` filter used when `RUST_LOG` is not set.
    pub filter: String,
}
