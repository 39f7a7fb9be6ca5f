//! Scheduler and transport setup shared by the scenario tests.

use rpc_reactor::config::{SchedulerConfig, TransportConfig};
use rpc_reactor::{MemChannel, Scheduler};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn scheduler() -> Arc<Scheduler> {
    Arc::new(Scheduler::new(SchedulerConfig::default()))
}

pub fn mem_channel(latency_ms: u64) -> MemChannel {
    let config = TransportConfig {
        latency_ms,
        ..TransportConfig::default()
    };
    MemChannel::new(&config).expect("failed to start transport runtime")
}

/// Register a handler named `name` that halts `scheduler`.
pub fn register_stop(scheduler: &Arc<Scheduler>, name: &str) {
    let weak = Arc::downgrade(scheduler);
    scheduler
        .register_handler(name, move |_| {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.halt();
            }
            Ok(())
        })
        .expect("stop handler registered twice");
}
