//! Host errors
//!
//! Every registry operation returns [`HostResult`]. The gateway turns these into
//! `error` fields on the wire; none of them abort the host.

use conduit_plugin::{DispatchError, Shape};

/// Errors produced by the plugin host
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Failed to load plugin {plugin}: {reason}")]
    Load { plugin: String, reason: String },

    #[error("Plugin {0} not loaded")]
    NotLoaded(String),

    #[error("Function {function} not found in plugin {plugin}")]
    FunctionNotFound { plugin: String, function: String },

    #[error("Function {function} has shape `{shape}`; use stream_start instead")]
    ShapeMismatch { function: String, shape: Shape },

    #[error("{0}")]
    Execution(String),

    #[error("Stream {stream_id} failed: {reason}")]
    StreamProducer { stream_id: String, reason: String },

    #[error("Stream {0} timed out")]
    StreamTimeout(String),

    #[error("Stream {0} is already active")]
    StreamInUse(String),

    #[error("Invalid plugin id: {0:?}")]
    InvalidPluginId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    pub fn load(plugin: impl Into<String>, reason: impl ToString) -> Self {
        Self::Load {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }

    /// Map a dispatcher failure for `function` into a host error
    pub fn from_dispatch(function: &str, err: DispatchError) -> Self {
        match err {
            DispatchError::ShapeMismatch { shape } => Self::ShapeMismatch {
                function: function.to_string(),
                shape,
            },
            other => Self::Execution(other.to_string()),
        }
    }
}

/// Result type for host operations
pub type HostResult<T> = Result<T, HostError>;
