//! Plugin and dispatch errors

use std::any::Any;

use crate::entry::Shape;

/// Error raised by plugin code while running an entry point.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PluginError {
    message: String,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for PluginError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for PluginError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Errors produced while dispatching an entry point
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("entry point has shape `{shape}`, which produces a sequence; start a stream instead")]
    ShapeMismatch { shape: Shape },

    #[error("{0}")]
    Raised(#[from] PluginError),

    #[error("invocation cancelled")]
    Cancelled,

    #[error("entry point panicked: {0}")]
    Panicked(String),

    #[error("worker task failed: {0}")]
    WorkerLost(String),
}

impl DispatchError {
    /// Wrap the payload of a caught panic
    pub fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(message)
    }
}
