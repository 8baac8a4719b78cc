//! Server Application State
//!
//! Shared state accessible by all WebSocket handlers.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::registry::PluginRegistry;

use super::protocol::ServerMessage;

/// Gateway behaviour switches
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Send `stream_end` when a stream finishes
    pub emit_stream_end: bool,
    /// Messages buffered per connection before senders wait
    pub outbound_capacity: usize,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            emit_stream_end: false,
            outbound_capacity: 256,
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Plugin registry
    registry: Arc<PluginRegistry>,

    /// Live connection per plugin id
    connections: DashMap<String, Connection>,

    options: GatewayOptions,
}

/// The connection currently bound to a plugin id
#[derive(Debug, Clone)]
pub struct Connection {
    pub connection_id: Uuid,

    /// Channel to send messages to this client
    pub tx: mpsc::Sender<ServerMessage>,
}

impl AppState {
    pub fn new(registry: Arc<PluginRegistry>, options: GatewayOptions) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                registry,
                connections: DashMap::new(),
                options,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.inner.registry
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.inner.options
    }

    /// Bind a new connection to `plugin_id`, replacing any previous one
    pub fn register_connection(&self, plugin_id: &str, tx: mpsc::Sender<ServerMessage>) -> Uuid {
        let connection_id = Uuid::new_v4();
        let previous = self
            .inner
            .connections
            .insert(plugin_id.to_string(), Connection { connection_id, tx });

        match previous {
            Some(old) => tracing::info!(
                plugin_id = %plugin_id,
                replaced = %old.connection_id,
                "Client connected: {}",
                connection_id
            ),
            None => tracing::info!(plugin_id = %plugin_id, "Client connected: {}", connection_id),
        }
        connection_id
    }

    /// Unbind a connection. Returns false if a newer connection had replaced it.
    pub fn remove_connection(&self, plugin_id: &str, connection_id: Uuid) -> bool {
        let removed = self
            .inner
            .connections
            .remove_if(plugin_id, |_, c| c.connection_id == connection_id)
            .is_some();
        tracing::info!(plugin_id = %plugin_id, current = removed, "Client disconnected: {}", connection_id);
        removed
    }

    /// The connection currently bound to `plugin_id`
    pub fn connection(&self, plugin_id: &str) -> Option<Connection> {
        self.inner.connections.get(plugin_id).map(|c| c.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PluginStore;

    fn state() -> AppState {
        let registry = PluginRegistry::new(PluginStore::new("unused", "main.py"));
        AppState::new(Arc::new(registry), GatewayOptions::default())
    }

    #[test]
    fn test_replaced_connection_is_not_current() {
        let state = state();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);

        let first = state.register_connection("p", tx1);
        let second = state.register_connection("p", tx2);
        assert_eq!(state.connection_count(), 1);
        assert_eq!(state.connection("p").map(|c| c.connection_id), Some(second));

        assert!(!state.remove_connection("p", first));
        assert_eq!(state.connection_count(), 1);
        assert!(state.remove_connection("p", second));
        assert_eq!(state.connection_count(), 0);
    }
}
