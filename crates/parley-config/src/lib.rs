//! Configuration system for Parley.
//!
//! Provides TOML-based configuration with:
//! - Sections for the server, backing store, caches and rate limits
//! - Defaults for every field
//! - Config file layering (XDG user config + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_from,
    save_config, xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
