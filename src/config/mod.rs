//! TOML configuration schema and loader.
//!
//! Grounded on the teacher's `config::schema`/`config::loader` split and
//! its `redact_debug!` macro for secret-safe `Debug` impls, adapted from
//! the teacher's JSON file to the single TOML file this spec calls for
//! (spec §9 "configuration file parsing" is explicitly out of the core's
//! scope as a *feature*, but the ambient act of loading one is not).

mod loader;
mod schema;

pub use loader::{load_config, ConfigError};
pub use schema::{
    ChatConfig, Config, GatewayConfig, RetryTuning, ServerEntryConfig, ServerKind, StorageConfig,
};
