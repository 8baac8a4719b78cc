//! WebSocket Protocol Messages
//!
//! Defines the message envelopes exchanged between a client and the gateway.
//! Every response echoes the request's `id`; stream events carry `streamId`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::HostResult;
use crate::instance::StreamEnd;
use crate::loader::Runtime;

/// Messages sent from client to server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Load (or replace) the plugin bound to this connection
    Load {
        /// Request ID for correlation
        #[serde(default)]
        id: Option<Value>,
        /// Code text; omitted to reload the persisted code
        #[serde(default, rename = "pythonCode", alias = "codeText", alias = "code")]
        code: Option<String>,
        #[serde(default)]
        requirements: Vec<String>,
        #[serde(default)]
        runtime: Option<Runtime>,
    },

    /// Call a single-value entry point
    Execute {
        #[serde(default)]
        id: Option<Value>,
        function: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
    },

    /// Start streaming an entry point's results
    StreamStart {
        #[serde(default)]
        id: Option<Value>,
        #[serde(rename = "streamId")]
        stream_id: String,
        function: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
    },

    /// Stop a running stream
    StreamStop {
        #[serde(default)]
        id: Option<Value>,
        #[serde(rename = "streamId")]
        stream_id: String,
    },

    /// Unload the plugin bound to this connection
    Unload {
        #[serde(default)]
        id: Option<Value>,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    LoadResponse {
        id: Option<Value>,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    ExecuteResponse {
        id: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    StreamStartResponse {
        id: Option<Value>,
        #[serde(rename = "streamId")]
        stream_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    StreamStopResponse {
        id: Option<Value>,
        #[serde(rename = "streamId")]
        stream_id: String,
        success: bool,
    },

    UnloadResponse {
        id: Option<Value>,
        success: bool,
    },

    /// One item produced by a stream
    StreamData {
        #[serde(rename = "streamId")]
        stream_id: String,
        data: Value,
    },

    /// The stream's producer failed
    StreamError {
        #[serde(rename = "streamId")]
        stream_id: String,
        error: String,
    },

    /// The stream finished (only sent when enabled)
    StreamEnd {
        #[serde(rename = "streamId")]
        stream_id: String,
        reason: StreamEnd,
    },

    /// The request could not be decoded or handled
    Error {
        id: Option<Value>,
        error: String,
    },
}

impl ServerMessage {
    pub fn load_response(id: Option<Value>, result: HostResult<()>) -> Self {
        let (success, error) = split(result);
        ServerMessage::LoadResponse { id, success, error }
    }

    pub fn execute_response(id: Option<Value>, result: HostResult<Value>) -> Self {
        match result {
            Ok(value) => ServerMessage::ExecuteResponse {
                id,
                result: Some(value),
                error: None,
            },
            Err(e) => ServerMessage::ExecuteResponse {
                id,
                result: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn stream_start_response(id: Option<Value>, stream_id: String, result: HostResult<()>) -> Self {
        let (success, error) = split(result);
        ServerMessage::StreamStartResponse {
            id,
            stream_id,
            success,
            error,
        }
    }

    pub fn error(id: Option<Value>, error: impl Into<String>) -> Self {
        ServerMessage::Error {
            id,
            error: error.into(),
        }
    }
}

fn split(result: HostResult<()>) -> (bool, Option<String>) {
    match result {
        Ok(()) => (true, None),
        Err(e) => (false, Some(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;
    use serde_json::json;

    #[test]
    fn test_decode_load_aliases() {
        for field in ["pythonCode", "codeText", "code"] {
            let msg: ClientMessage = serde_json::from_value(json!({
                "type": "load",
                "id": 1,
                field: "samples",
                "requirements": ["numpy"]
            }))
            .unwrap();
            match msg {
                ClientMessage::Load {
                    id,
                    code,
                    requirements,
                    runtime,
                } => {
                    assert_eq!(id, Some(json!(1)));
                    assert_eq!(code.as_deref(), Some("samples"));
                    assert_eq!(requirements, vec!["numpy"]);
                    assert_eq!(runtime, None);
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[test]
    fn test_decode_stream_start_defaults() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "stream_start",
            "id": "req-7",
            "streamId": "s1",
            "function": "count"
        }))
        .unwrap();
        match msg {
            ClientMessage::StreamStart {
                stream_id,
                args,
                kwargs,
                ..
            } => {
                assert_eq!(stream_id, "s1");
                assert!(args.is_empty());
                assert!(kwargs.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = serde_json::from_value::<ClientMessage>(json!({"type": "reboot"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_encode_responses() {
        let ok = ServerMessage::execute_response(Some(json!(3)), Ok(json!(null)));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"type": "execute_response", "id": 3, "result": null})
        );

        let err = ServerMessage::load_response(None, Err(HostError::NotLoaded("p".into())));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"type": "load_response", "id": null, "success": false, "error": "Plugin p not loaded"})
        );

        let end = ServerMessage::StreamEnd {
            stream_id: "s1".into(),
            reason: StreamEnd::Timeout,
        };
        assert_eq!(
            serde_json::to_value(&end).unwrap(),
            json!({"type": "stream_end", "streamId": "s1", "reason": "timeout"})
        );
    }
}
