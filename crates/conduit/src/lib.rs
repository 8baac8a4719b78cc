//! Conduit - Plugin Host
//!
//! This crate provides the host side of the plugin system, including:
//! - The plugin registry and per-plugin instances with their streams
//! - Code unit loading from the builtin catalogue or a child process
//! - Persisted plugin code and best-effort requirement installation
//! - The WebSocket gateway and HTTP status endpoints
//!
//! Plugin-side types (entry points, shapes, the dispatcher and the IPC
//! protocol) live in `conduit_plugin`.

// Re-export the plugin contract
pub use conduit_plugin;

// Command line / environment configuration
pub mod config;

pub mod error;

// Requirement installation
pub mod install;

// Loaded plugins and their streams
pub mod instance;

// Code unit loaders
pub mod loader;

pub mod registry;

// WebSocket gateway
pub mod server;

// Persisted plugin code
pub mod store;

pub use error::{HostError, HostResult};
pub use registry::{LoadRequest, PluginRegistry};
