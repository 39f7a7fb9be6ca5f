//! Settings loading for rpc-reactor.
//!
//! Settings come from a single TOML file. Every field has a default, so a
//! missing file and an empty file both yield [`Settings::default`].

pub mod defaults;
pub mod settings;
pub mod user;

use std::fs;
use std::io;
use std::path::Path;

pub use settings::{
    HaltPolicy, HandlerErrorPolicy, LoggingConfig, SchedulerConfig, Settings, TransportConfig,
};
pub use user::user_config_path;

use crate::error::{BridgeError, BridgeResult};

impl Settings {
    /// Parse and validate settings from TOML text.
    pub fn from_toml_str(contents: &str) -> BridgeResult<Self> {
        let settings: Settings = toml::from_str(contents)
            .map_err(|err| BridgeError::config(format!("failed to parse settings: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from `path`. The file must exist.
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let contents = fs::read_to_string(path)?;
        log::debug!(
            target: "rpc_reactor::config",
            "Loaded settings from {}",
            path.display()
        );
        Self::from_toml_str(&contents)
    }

    /// Load settings from `path`, or from the user config file when no path
    /// is given. A missing file yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> BridgeResult<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match user_config_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        match Self::load(&path) {
            Err(BridgeError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    target: "rpc_reactor::config",
                    "No settings file at {}, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Reject values no component can run with.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.scheduler.thread_name.trim().is_empty() {
            return Err(BridgeError::config("scheduler.thread_name must not be empty"));
        }
        if self.transport.worker_threads == 0 {
            return Err(BridgeError::config(
                "transport.worker_threads must be at least 1",
            ));
        }
        if self.transport.thread_name.trim().is_empty() {
            return Err(BridgeError::config("transport.thread_name must not be empty"));
        }
        Ok(())
    }

    /// Render the effective settings as TOML.
    pub fn to_toml_string(&self) -> BridgeResult<String> {
        toml::to_string_pretty(self)
            .map_err(|err| BridgeError::config(format!("failed to serialize settings: {err}")))
    }
}
