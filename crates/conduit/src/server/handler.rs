//! WebSocket Connection Handler
//!
//! Handles one plugin's WebSocket connection and dispatches its messages to the
//! registry. `load` and `unload` are handled in arrival order; `execute` calls
//! and stream relays run as their own tasks and reply through the same
//! outbound channel.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use conduit_plugin::CallArgs;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, ServerMessage};
use super::state::AppState;
use crate::instance::{StreamChannel, StreamEvent};
use crate::registry::LoadRequest;

/// Handle a WebSocket connection bound to `plugin_id`
pub async fn handle_websocket(socket: WebSocket, state: AppState, plugin_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.options().outbound_capacity);

    let connection_id = state.register_connection(&plugin_id, tx.clone());

    // Spawn task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode server message: {}", e),
            }
        }
    });

    // Process incoming messages
    let mut recv_task = {
        let state = state.clone();
        let plugin_id = plugin_id.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = ws_receiver.next().await {
                match msg {
                    Message::Text(text) => {
                        handle_message(&state, &plugin_id, &tx, &text).await;
                    }
                    Message::Binary(bytes) => match String::from_utf8(bytes) {
                        Ok(text) => handle_message(&state, &plugin_id, &tx, &text).await,
                        Err(_) => {
                            send(&tx, ServerMessage::error(None, "Binary frame is not valid UTF-8"))
                                .await;
                        }
                    },
                    Message::Close(_) => {
                        break;
                    }
                    Message::Ping(_data) => {
                        // Pong is handled automatically by axum
                        tracing::trace!("Received ping for {}", plugin_id);
                    }
                    _ => {}
                }
            }
        })
    };

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Only the connection still bound to the id owns its streams
    if state.remove_connection(&plugin_id, connection_id) {
        let stopped = state.registry().stop_all(&plugin_id);
        info!(plugin_id = %plugin_id, stopped, "Stopped streams of disconnected client");
    }
}

/// Decode one client message and act on it, replying through `tx`
pub async fn handle_message(
    state: &AppState,
    plugin_id: &str,
    tx: &mpsc::Sender<ServerMessage>,
    text: &str,
) {
    let raw: Value = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Failed to parse client message: {}", e);
            send(tx, ServerMessage::error(None, format!("Invalid JSON: {e}"))).await;
            return;
        }
    };
    let request_id = raw.get("id").filter(|id| !id.is_null()).cloned();

    let msg: ClientMessage = match serde_json::from_value(raw) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Invalid client message: {}", e);
            send(tx, ServerMessage::error(request_id, format!("Invalid message: {e}"))).await;
            return;
        }
    };

    let registry = state.registry();
    match msg {
        ClientMessage::Load {
            id,
            code,
            requirements,
            runtime,
        } => {
            let request = LoadRequest {
                code,
                requirements,
                runtime,
            };
            let result = registry.load(plugin_id, request).await;
            if let Err(e) = &result {
                warn!(plugin_id = %plugin_id, error = %e, "Plugin load failed");
            }
            send(tx, ServerMessage::load_response(id, result)).await;
        }

        ClientMessage::Unload { id } => {
            registry.unload(plugin_id).await;
            send(tx, ServerMessage::UnloadResponse { id, success: true }).await;
        }

        ClientMessage::Execute {
            id,
            function,
            args,
            kwargs,
        } => {
            let registry = Arc::clone(registry);
            let plugin_id = plugin_id.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = registry
                    .execute(&plugin_id, &function, CallArgs::new(args, kwargs))
                    .await;
                if let Err(e) = &result {
                    debug!(plugin_id = %plugin_id, function = %function, error = %e, "Execute failed");
                }
                send(&tx, ServerMessage::execute_response(id, result)).await;
            });
        }

        ClientMessage::StreamStart {
            id,
            stream_id,
            function,
            args,
            kwargs,
        } => {
            let call = CallArgs::new(args, kwargs);
            match registry.stream_start(plugin_id, &stream_id, &function, call) {
                Ok(channel) => {
                    send(tx, ServerMessage::stream_start_response(id, stream_id, Ok(()))).await;
                    let emit_end = state.options().emit_stream_end;
                    tokio::spawn(relay_stream(channel, tx.clone(), emit_end));
                }
                Err(e) => {
                    debug!(plugin_id = %plugin_id, stream_id = %stream_id, error = %e, "Stream start failed");
                    send(tx, ServerMessage::stream_start_response(id, stream_id, Err(e))).await;
                }
            }
        }

        ClientMessage::StreamStop { id, stream_id } => {
            let stopped = registry.stream_stop(plugin_id, &stream_id);
            debug!(plugin_id = %plugin_id, stream_id = %stream_id, stopped, "Stream stop requested");
            send(
                tx,
                ServerMessage::StreamStopResponse {
                    id,
                    stream_id,
                    success: true,
                },
            )
            .await;
        }
    }
}

/// Forward a stream's events to the connection that started it
async fn relay_stream(mut channel: StreamChannel, tx: mpsc::Sender<ServerMessage>, emit_end: bool) {
    let stream_id = channel.stream_id().to_string();
    loop {
        let msg = match channel.pull().await {
            StreamEvent::Data(data) => ServerMessage::StreamData {
                stream_id: stream_id.clone(),
                data,
            },
            StreamEvent::Error(error) => ServerMessage::StreamError {
                stream_id: stream_id.clone(),
                error,
            },
            StreamEvent::Finished(reason) => {
                debug!(plugin_id = %channel.plugin_id(), stream_id = %stream_id, ?reason, "Stream finished");
                if emit_end {
                    send(&tx, ServerMessage::StreamEnd { stream_id, reason }).await;
                }
                return;
            }
        };

        // The client is gone; dropping the channel cancels the producer
        if tx.send(msg).await.is_err() {
            return;
        }
    }
}

async fn send(tx: &mpsc::Sender<ServerMessage>, message: ServerMessage) {
    if tx.send(message).await.is_err() {
        debug!("Connection closed, dropping message");
    }
}
