//! libbwt core library — configuration, domain types, errors.
//!
//! Public API surface:
//! - [`config`] — [`BwtConfig`] parsing and validation
//! - [`types`] — handles, lifecycle state, progress and events
//! - [`error`] — [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::BwtConfig;
pub use error::ConfigError;
pub use types::{
    clamp_progress, DaemonEvent, DaemonState, Network, Progress, ServerKind, ShutdownHandle,
};
