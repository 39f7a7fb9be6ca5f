//! User configuration location for rpc-reactor.
//!
//! User config location: $XDG_CONFIG_HOME/rpc-reactor/rpc-reactor.toml

use std::path::PathBuf;

/// Returns the path to the user configuration file, if `$XDG_CONFIG_HOME`
/// is set.
pub fn user_config_path() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .filter(|value| !value.is_empty())
        .map(|xdg_config| {
            PathBuf::from(xdg_config)
                .join("rpc-reactor")
                .join("rpc-reactor.toml")
        })
}
