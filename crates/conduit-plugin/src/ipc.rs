//! IPC protocol for communicating with plugin processes
//!
//! Every frame is a 4-byte big-endian length (covering the type byte and the
//! payload), one message type byte, then a JSON payload. Calls are multiplexed
//! by `callId`, so one process can serve many concurrent calls and streams.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::entry::{CallArgs, EntryDescriptor};

/// Largest frame either side accepts
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors from the IPC layer
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("IPC I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid IPC payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("empty frame")]
    EmptyFrame,

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
}

/// Message types for IPC protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Host → Plugin
    Describe = 1,
    Call = 2,
    Cancel = 3,
    Shutdown = 4,
    Credit = 5,

    // Plugin → Host
    Manifest = 10,
    Log = 11,
    Value = 12,
    Item = 13,
    End = 14,
    Error = 15,
}

impl TryFrom<u8> for MessageType {
    type Error = IpcError;

    fn try_from(value: u8) -> Result<Self, IpcError> {
        match value {
            1 => Ok(MessageType::Describe),
            2 => Ok(MessageType::Call),
            3 => Ok(MessageType::Cancel),
            4 => Ok(MessageType::Shutdown),
            5 => Ok(MessageType::Credit),
            10 => Ok(MessageType::Manifest),
            11 => Ok(MessageType::Log),
            12 => Ok(MessageType::Value),
            13 => Ok(MessageType::Item),
            14 => Ok(MessageType::End),
            15 => Ok(MessageType::Error),
            other => Err(IpcError::UnknownMessageType(other)),
        }
    }
}

/// A frame received from or sent to the other side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    pub fn empty(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            payload: Vec::new(),
        }
    }

    /// Build a frame with a JSON payload
    pub fn json<T: Serialize>(msg_type: MessageType, data: &T) -> Result<Self, IpcError> {
        Ok(Self::new(msg_type, serde_json::to_vec(data)?))
    }

    /// Parse payload as JSON
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, IpcError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Invoke an entry point (`Call`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub call_id: u64,
    pub function: String,
    #[serde(flatten)]
    pub call: CallArgs,
    /// Stream the result as `Item` frames followed by `End`
    #[serde(default)]
    pub stream: bool,
}

/// Abandon an in-flight call (`Cancel`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub call_id: u64,
}

/// Allow `n` more `Item` frames on a streamed call (`Credit`)
///
/// The host grants an initial window right after the `Call` and one credit per
/// item it consumes. `Error` and `End` frames need no credit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditMessage {
    pub call_id: u64,
    pub n: u32,
}

/// Entry points exposed by the plugin (`Manifest`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMessage {
    pub entry_points: Vec<EntryDescriptor>,
}

/// Log line from the plugin (`Log`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
}

/// Result of a call (`Value`) or one stream item (`Item`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueMessage {
    pub call_id: u64,
    pub value: Value,
}

/// End of a streamed call (`End`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndMessage {
    pub call_id: u64,
}

/// Failure of a call, or of the protocol when `call_id` is absent (`Error`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<u64>,
    pub message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader / Writer
// ─────────────────────────────────────────────────────────────────────────────

/// IPC writer for sending frames to the other side
pub struct IpcWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> IpcWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send a frame
    pub async fn send(&mut self, frame: &Frame) -> Result<(), IpcError> {
        let len = 1 + frame.payload.len();
        if len > MAX_FRAME_LEN {
            return Err(IpcError::FrameTooLarge(len));
        }
        self.inner.write_all(&(len as u32).to_be_bytes()).await?;
        self.inner.write_all(&[frame.msg_type as u8]).await?;
        self.inner.write_all(&frame.payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Send a frame with JSON payload
    pub async fn send_json<T: Serialize>(
        &mut self,
        msg_type: MessageType,
        data: &T,
    ) -> Result<(), IpcError> {
        self.send(&Frame::json(msg_type, data)?).await
    }
}

/// IPC reader for receiving frames from the other side
pub struct IpcReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> IpcReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive a frame; `None` on a clean end of stream
    pub async fn recv(&mut self) -> Result<Option<Frame>, IpcError> {
        // Read length (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Err(IpcError::EmptyFrame);
        }
        if len > MAX_FRAME_LEN {
            return Err(IpcError::FrameTooLarge(len));
        }

        // Read message type (1 byte)
        let mut type_buf = [0u8; 1];
        self.inner.read_exact(&mut type_buf).await?;
        let msg_type = MessageType::try_from(type_buf[0])?;

        // Read payload
        let mut payload = vec![0u8; len - 1];
        if !payload.is_empty() {
            self.inner.read_exact(&mut payload).await?;
        }

        Ok(Some(Frame::new(msg_type, payload)))
    }
}
