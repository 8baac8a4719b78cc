//! Plugin-side runtime
//!
//! Exposes a [`Module`] over the IPC protocol. A plugin executable only needs:
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     conduit_plugin::serve_stdio(my_module()).await?;
//!     Ok(())
//! }
//! ```
//!
//! Stdout carries frames, so plugins must log to stderr.
//!
//! Streamed calls are paced by the host: an `Item` frame is only written
//! against a credit granted by a `Credit` frame for that call.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatch::Dispatcher;
use crate::error::DispatchError;
use crate::ipc::{
    CallRequest, CancelRequest, CreditMessage, EndMessage, ErrorMessage, Frame, IpcError,
    IpcReader, IpcWriter, ManifestMessage, MessageType, ValueMessage,
};
use crate::module::Module;
use crate::pool::WorkerPool;
use crate::stream::{self, StreamItem};

/// How long to wait for in-flight replies to flush after shutdown
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// A call in flight
#[derive(Debug, Clone)]
struct CallState {
    token: CancellationToken,
    /// Items the host is ready to accept
    credit: Arc<Semaphore>,
}

impl CallState {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            credit: Arc::new(Semaphore::new(0)),
        }
    }

    fn grant(&self, n: u32) {
        let room = Semaphore::MAX_PERMITS - self.credit.available_permits();
        self.credit.add_permits((n as usize).min(room));
    }
}

type Calls = Arc<DashMap<u64, CallState>>;

/// Serve a module over this process's stdin/stdout
pub async fn serve_stdio(module: Module) -> Result<(), IpcError> {
    serve(module, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve a module over an arbitrary reader/writer pair until `Shutdown` or end of input
pub async fn serve<R, W>(module: Module, reader: R, writer: W) -> Result<(), IpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let module = Arc::new(module);
    let dispatcher = Arc::new(Dispatcher::new(WorkerPool::with_default_size()));
    let calls: Calls = Arc::new(DashMap::new());

    // All replies funnel through one writer task so frames never interleave.
    // Items are credit-gated, so the queue holds at most one window per stream.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(async move {
        let mut writer = IpcWriter::new(writer);
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = writer.send(&frame).await {
                warn!("Failed to write IPC frame: {}", e);
                break;
            }
        }
    });

    let mut reader = IpcReader::new(reader);
    let result = loop {
        let frame = match reader.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        match frame.msg_type {
            MessageType::Describe => {
                let manifest = ManifestMessage {
                    entry_points: module.descriptors(),
                };
                emit(&out_tx, MessageType::Manifest, &manifest);
            }
            MessageType::Call => {
                let request: CallRequest = match frame.parse_json() {
                    Ok(request) => request,
                    Err(e) => {
                        let error = ErrorMessage {
                            call_id: None,
                            message: e.to_string(),
                        };
                        emit(&out_tx, MessageType::Error, &error);
                        continue;
                    }
                };
                let state = CallState::new();
                calls.insert(request.call_id, state.clone());
                tokio::spawn(run_call(
                    Arc::clone(&dispatcher),
                    Arc::clone(&module),
                    request,
                    state,
                    out_tx.clone(),
                    Arc::clone(&calls),
                ));
            }
            MessageType::Cancel => match frame.parse_json::<CancelRequest>() {
                Ok(cancel) => {
                    if let Some((_, state)) = calls.remove(&cancel.call_id) {
                        debug!(call_id = cancel.call_id, "Call cancelled by host");
                        state.token.cancel();
                    }
                }
                Err(e) => warn!("Malformed cancel request: {}", e),
            },
            MessageType::Credit => match frame.parse_json::<CreditMessage>() {
                Ok(credit) => {
                    if let Some(state) = calls.get(&credit.call_id) {
                        state.grant(credit.n);
                    }
                }
                Err(e) => warn!("Malformed credit grant: {}", e),
            },
            MessageType::Shutdown => break Ok(()),
            other => warn!("Unexpected message type from host: {:?}", other),
        }
    };

    for call in calls.iter() {
        call.value().token.cancel();
    }
    drop(out_tx);
    if tokio::time::timeout(FLUSH_TIMEOUT, writer_task).await.is_err() {
        warn!("Timed out flushing replies during shutdown");
    }

    result
}

async fn run_call(
    dispatcher: Arc<Dispatcher>,
    module: Arc<Module>,
    request: CallRequest,
    state: CallState,
    out: mpsc::UnboundedSender<Frame>,
    calls: Calls,
) {
    let call_id = request.call_id;
    let token = state.token;

    let Some(entry) = module.resolve(&request.function).cloned() else {
        let error = ErrorMessage {
            call_id: Some(call_id),
            message: format!("function `{}` not found", request.function),
        };
        emit(&out, MessageType::Error, &error);
        calls.remove(&call_id);
        return;
    };

    if request.stream {
        // Credit paces the producer, so one item of slack is enough
        let (sink, mut items) = stream::channel(1);
        let producer = {
            let dispatcher = Arc::clone(&dispatcher);
            let token = token.clone();
            let call = request.call;
            tokio::spawn(async move { dispatcher.produce(entry, call, sink, token).await })
        };

        while let Some(item) = items.recv().await {
            match item {
                StreamItem::Data(value) => {
                    let granted = tokio::select! {
                        biased;
                        _ = token.cancelled() => false,
                        permit = state.credit.acquire() => match permit {
                            Ok(permit) => {
                                permit.forget();
                                true
                            }
                            Err(_) => false,
                        },
                    };
                    if !granted {
                        break;
                    }
                    emit(&out, MessageType::Item, &ValueMessage { call_id, value });
                }
                StreamItem::Error(message) => {
                    let error = ErrorMessage {
                        call_id: Some(call_id),
                        message,
                    };
                    emit(&out, MessageType::Error, &error);
                }
                StreamItem::End => break,
            }
        }
        drop(items);
        let _ = producer.await;
        emit(&out, MessageType::End, &EndMessage { call_id });
    } else {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(DispatchError::Cancelled),
            result = dispatcher.execute(&entry, request.call) => result,
        };
        match result {
            Ok(value) => emit(&out, MessageType::Value, &ValueMessage { call_id, value }),
            Err(DispatchError::Cancelled) => {}
            Err(e) => {
                let error = ErrorMessage {
                    call_id: Some(call_id),
                    message: e.to_string(),
                };
                emit(&out, MessageType::Error, &error);
            }
        }
    }

    calls.remove(&call_id);
}

fn emit<T: Serialize>(out: &mpsc::UnboundedSender<Frame>, msg_type: MessageType, data: &T) {
    match Frame::json(msg_type, data) {
        Ok(frame) => {
            // The writer task is gone only after shutdown; late replies are dropped
            let _ = out.send(frame);
        }
        Err(e) => warn!("Failed to encode {:?} frame: {}", msg_type, e),
    }
}
