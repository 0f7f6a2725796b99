//! conduit-config: configuration for the conduit proxy
//!
//! This crate provides configuration parsing, validation, and hot reload
//! of listeners, routes and upstream clusters.

pub mod config;
pub mod watcher;

pub use config::*;
pub use watcher::{ConfigUpdate, ConfigWatcher, ReloadManager};

/// Filter settings are raw TOML values
pub use toml;
