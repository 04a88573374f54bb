//! Roam Agent - background process that keeps a device's local store in sync
//! with the remote sync API.

pub mod config;
pub mod error;
pub mod http;
pub mod store;

pub use config::{Config, ConfigError};
pub use error::{AgentError, Result};
pub use http::HttpRemoteStore;
pub use store::FileLocalStore;
