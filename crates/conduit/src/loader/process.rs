//! Process-isolated code units
//!
//! Spawns the persisted entry file as a child process and talks to it over its
//! stdin/stdout with the plugin IPC protocol. Every remote entry point becomes a
//! deferred (or deferred-sequence) [`EntryPoint`], so the dispatcher drives a
//! process plugin exactly like an in-process one.
//!
//! Streamed calls are flow controlled: the host grants `stream_window` credits
//! when it starts the call and one more per item the consumer takes, so a fast
//! plugin can never have more than a window of items in flight.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conduit_plugin::ipc::{
    CallRequest, CancelRequest, CreditMessage, EndMessage, ErrorMessage, Frame, IpcReader,
    IpcWriter, LogMessage, ManifestMessage, MessageType, ValueMessage,
};
use conduit_plugin::{CallArgs, EntryDescriptor, EntryPoint, Module, PluginError};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::CodeUnit;
use crate::error::{HostError, HostResult};

/// How process plugins are started and stopped
#[derive(Debug, Clone)]
pub struct ProcessSettings {
    /// Program that runs the entry file; `None` executes the file itself
    pub interpreter: Option<String>,
    /// How long to wait for the plugin's manifest
    pub describe_timeout: Duration,
    /// Grace period between `Shutdown` and kill
    pub shutdown_timeout: Duration,
    /// Stream items a plugin may send ahead of the consumer
    pub stream_window: u32,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            interpreter: Some("python3".to_string()),
            describe_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            stream_window: 16,
        }
    }
}

/// A plugin running in a child process
pub struct ProcessUnit {
    plugin_id: String,
    client: Arc<IpcClient>,
    module: Module,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl ProcessUnit {
    /// Spawn the entry file and wait for its manifest
    pub async fn spawn(plugin_id: &str, entry: &Path, settings: &ProcessSettings) -> HostResult<Self> {
        let entry = tokio::fs::canonicalize(entry)
            .await
            .map_err(|e| HostError::load(plugin_id, format!("entry file {}: {}", entry.display(), e)))?;

        let mut cmd = match &settings.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&entry);
                cmd
            }
            None => Command::new(&entry),
        };
        if let Some(dir) = entry.parent() {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Plugin stderr goes to our stderr
            .kill_on_drop(true);

        info!(
            plugin_id = %plugin_id,
            interpreter = ?settings.interpreter,
            entry = %entry.display(),
            "Spawning plugin process"
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| HostError::load(plugin_id, format!("failed to spawn plugin process: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HostError::load(plugin_id, "failed to get stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::load(plugin_id, "failed to get stdout"))?;

        // On failure the child is dropped here and killed
        let unit = Self::connect(plugin_id, stdout, stdin, settings).await?;
        *unit.child.lock().await = Some(child);
        Ok(unit)
    }

    /// Speak the IPC protocol over an existing reader/writer pair
    pub async fn connect<R, W>(
        plugin_id: &str,
        reader: R,
        writer: W,
        settings: &ProcessSettings,
    ) -> HostResult<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (client, manifest_rx, tasks) =
            IpcClient::start(plugin_id, settings.stream_window, reader, writer);
        let abort_all = |tasks: &[JoinHandle<()>]| tasks.iter().for_each(JoinHandle::abort);

        client.send(Frame::empty(MessageType::Describe));
        let manifest = match tokio::time::timeout(settings.describe_timeout, manifest_rx).await {
            Ok(Ok(manifest)) => manifest,
            Ok(Err(_)) => {
                abort_all(&tasks);
                return Err(HostError::load(
                    plugin_id,
                    "plugin process closed before sending its manifest",
                ));
            }
            Err(_) => {
                abort_all(&tasks);
                return Err(HostError::load(plugin_id, "timeout waiting for plugin manifest"));
            }
        };

        let mut module = Module::new(plugin_id);
        for descriptor in &manifest.entry_points {
            module.insert(descriptor.name.clone(), remote_entry(&client, descriptor));
        }
        debug!(plugin_id = %plugin_id, entry_points = module.len(), "Plugin process is ready");

        Ok(Self {
            plugin_id: plugin_id.to_string(),
            client,
            module,
            child: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(tasks),
            shutdown_timeout: settings.shutdown_timeout,
        })
    }
}

#[async_trait]
impl CodeUnit for ProcessUnit {
    fn entry_point(&self, name: &str) -> Option<EntryPoint> {
        self.module.resolve(name).cloned()
    }

    fn entry_points(&self) -> Vec<EntryDescriptor> {
        self.module.descriptors()
    }

    async fn release(&self) {
        self.client.send(Frame::empty(MessageType::Shutdown));

        // Wait for process to exit gracefully
        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("Plugin {} exited with status: {}", self.plugin_id, status);
                }
                Ok(Err(e)) => {
                    error!("Error waiting for plugin {}: {}", self.plugin_id, e);
                }
                Err(_) => {
                    warn!("Plugin {} did not exit in time, killing", self.plugin_id);
                    let _ = child.kill().await;
                }
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.client.close();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// IPC client
// ─────────────────────────────────────────────────────────────────────────────

/// Reply routed to one in-flight call
#[derive(Debug)]
enum Reply {
    Value(Value),
    Item(Value),
    End,
    Error(String),
}

/// Multiplexes calls over one plugin connection by `callId`
struct IpcClient {
    plugin_id: String,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: DashMap<u64, mpsc::Sender<Reply>>,
    next_call_id: AtomicU64,
    stream_window: u32,
    closed: AtomicBool,
}

impl IpcClient {
    fn start<R, W>(
        plugin_id: &str,
        stream_window: u32,
        reader: R,
        writer: W,
    ) -> (Arc<Self>, oneshot::Receiver<ManifestMessage>, Vec<JoinHandle<()>>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let client = Arc::new(Self {
            plugin_id: plugin_id.to_string(),
            outbound,
            pending: DashMap::new(),
            next_call_id: AtomicU64::new(1),
            stream_window: stream_window.max(1),
            closed: AtomicBool::new(false),
        });

        let writer_task = {
            let plugin_id = plugin_id.to_string();
            tokio::spawn(async move {
                let mut writer = IpcWriter::new(writer);
                while let Some(frame) = outbound_rx.recv().await {
                    if let Err(e) = writer.send(&frame).await {
                        warn!("Failed to write to plugin {}: {}", plugin_id, e);
                        break;
                    }
                }
            })
        };

        let (manifest_tx, manifest_rx) = oneshot::channel();
        let reader_task = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client.read_loop(IpcReader::new(reader), manifest_tx).await;
            })
        };

        (client, manifest_rx, vec![writer_task, reader_task])
    }

    async fn read_loop<R: AsyncRead + Unpin>(
        &self,
        mut reader: IpcReader<R>,
        manifest_tx: oneshot::Sender<ManifestMessage>,
    ) {
        let plugin_id = &self.plugin_id;
        let mut manifest_tx = Some(manifest_tx);
        loop {
            let msg = match reader.recv().await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    info!("Plugin {} closed connection", plugin_id);
                    break;
                }
                Err(e) => {
                    error!("Error reading from plugin {}: {}", plugin_id, e);
                    break;
                }
            };

            match msg.msg_type {
                MessageType::Manifest => match msg.parse_json::<ManifestMessage>() {
                    Ok(manifest) => {
                        if let Some(tx) = manifest_tx.take() {
                            let _ = tx.send(manifest);
                        }
                    }
                    Err(e) => warn!("Plugin {} sent an invalid manifest: {}", plugin_id, e),
                },
                MessageType::Log => {
                    if let Ok(log) = msg.parse_json::<LogMessage>() {
                        match log.level.as_str() {
                            "trace" => tracing::trace!(target: "plugin", "[{}] {}", plugin_id, log.message),
                            "debug" => tracing::debug!(target: "plugin", "[{}] {}", plugin_id, log.message),
                            "info" => tracing::info!(target: "plugin", "[{}] {}", plugin_id, log.message),
                            "warn" => tracing::warn!(target: "plugin", "[{}] {}", plugin_id, log.message),
                            "error" => tracing::error!(target: "plugin", "[{}] {}", plugin_id, log.message),
                            _ => tracing::info!(target: "plugin", "[{}] {}", plugin_id, log.message),
                        }
                    }
                }
                MessageType::Value | MessageType::Item => match msg.parse_json::<ValueMessage>() {
                    Ok(reply) => {
                        let value = if msg.msg_type == MessageType::Value {
                            Reply::Value(reply.value)
                        } else {
                            Reply::Item(reply.value)
                        };
                        self.route(reply.call_id, value);
                    }
                    Err(e) => warn!("Plugin {} sent an invalid reply: {}", plugin_id, e),
                },
                MessageType::End => match msg.parse_json::<EndMessage>() {
                    Ok(end) => self.route(end.call_id, Reply::End),
                    Err(e) => warn!("Plugin {} sent an invalid end marker: {}", plugin_id, e),
                },
                MessageType::Error => match msg.parse_json::<ErrorMessage>() {
                    Ok(ErrorMessage {
                        call_id: Some(call_id),
                        message,
                    }) => self.route(call_id, Reply::Error(message)),
                    Ok(ErrorMessage { message, .. }) => {
                        error!("Plugin {} error: {}", plugin_id, message);
                    }
                    Err(e) => warn!("Plugin {} sent an invalid error: {}", plugin_id, e),
                },
                other => {
                    warn!("Unexpected message type from plugin: {:?}", other);
                }
            }
        }

        self.close();
    }

    fn route(&self, call_id: u64, reply: Reply) {
        let overrun = match self.pending.get(&call_id) {
            Some(tx) => matches!(tx.try_send(reply), Err(TrySendError::Full(_))),
            None => {
                debug!(call_id, "Dropping reply for finished call");
                false
            }
        };
        if overrun {
            // Dropping the sender fails the call; its guard cancels it remotely
            warn!(
                call_id,
                "Plugin {} sent more items than it was granted, failing the call", self.plugin_id
            );
            self.pending.remove(&call_id);
        }
    }

    fn send(&self, frame: Frame) {
        // Fails only once the writer task is gone; the reader reports that
        let _ = self.outbound.send(frame);
    }

    fn send_json<T: Serialize>(&self, msg_type: MessageType, data: &T) -> Result<(), PluginError> {
        let frame = Frame::json(msg_type, data).map_err(|e| PluginError::new(e.to_string()))?;
        self.send(frame);
        Ok(())
    }

    /// Fail every in-flight call and refuse new ones
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.clear();
    }

    fn exited(&self) -> PluginError {
        PluginError::new(format!("plugin process {} exited", self.plugin_id))
    }

    /// Why a call's reply channel closed without a final reply
    fn lost(&self) -> PluginError {
        if self.closed.load(Ordering::SeqCst) {
            self.exited()
        } else {
            PluginError::new(format!(
                "plugin {} overran its stream credit",
                self.plugin_id
            ))
        }
    }

    fn start_call(
        self: &Arc<Self>,
        function: &str,
        call: CallArgs,
        stream: bool,
    ) -> Result<(CallGuard, mpsc::Receiver<Reply>), PluginError> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        // Room for the whole window plus a trailing error and end marker
        let capacity = if stream {
            self.stream_window as usize + 2
        } else {
            2
        };
        let (tx, rx) = mpsc::channel(capacity);
        self.pending.insert(call_id, tx);
        let guard = CallGuard {
            client: Arc::clone(self),
            call_id,
            done: false,
        };

        // Checked after inserting so a concurrent close cannot strand the call
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.exited());
        }

        let request = CallRequest {
            call_id,
            function: function.to_string(),
            call,
            stream,
        };
        self.send_json(MessageType::Call, &request)?;
        if stream {
            guard.grant(self.stream_window)?;
        }
        Ok((guard, rx))
    }

    async fn invoke(self: &Arc<Self>, function: &str, call: CallArgs) -> Result<Value, PluginError> {
        let (mut guard, mut replies) = self.start_call(function, call, false)?;
        let result = match replies.recv().await {
            Some(Reply::Value(value)) => Ok(value),
            Some(Reply::Error(message)) => Err(PluginError::new(message)),
            Some(other) => Err(PluginError::new(format!(
                "unexpected reply to {function}: {other:?}"
            ))),
            None => Err(self.lost()),
        };
        guard.done = true;
        result
    }
}

/// Removes a call's routing entry on drop, cancelling it remotely if still running
struct CallGuard {
    client: Arc<IpcClient>,
    call_id: u64,
    done: bool,
}

impl CallGuard {
    /// Let the plugin send `n` more items
    fn grant(&self, n: u32) -> Result<(), PluginError> {
        let credit = CreditMessage {
            call_id: self.call_id,
            n,
        };
        self.client.send_json(MessageType::Credit, &credit)
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.client.pending.remove(&self.call_id);
        if !self.done && !self.client.closed.load(Ordering::SeqCst) {
            let cancel = CancelRequest {
                call_id: self.call_id,
            };
            let _ = self.client.send_json(MessageType::Cancel, &cancel);
        }
    }
}

type CallState = Option<Result<(CallGuard, mpsc::Receiver<Reply>), PluginError>>;

/// Wrap one remote entry point as a local one of the matching kind
fn remote_entry(client: &Arc<IpcClient>, descriptor: &EntryDescriptor) -> EntryPoint {
    let client = Arc::clone(client);
    let name = descriptor.name.clone();

    if descriptor.shape.is_sequence() {
        EntryPoint::deferred_sequence(move |call| {
            let state: CallState = Some(client.start_call(&name, call, true));
            let client = Arc::clone(&client);
            futures::stream::unfold(state, move |state| {
                let client = Arc::clone(&client);
                async move {
                    let (mut guard, mut replies) = match state? {
                        Ok(call) => call,
                        Err(e) => return Some((Err(e), None)),
                    };
                    match replies.recv().await {
                        Some(Reply::Item(value)) | Some(Reply::Value(value)) => {
                            if let Err(e) = guard.grant(1) {
                                return Some((Err(e), None));
                            }
                            Some((Ok(value), Some(Ok((guard, replies)))))
                        }
                        Some(Reply::Error(message)) => {
                            guard.done = true;
                            Some((Err(PluginError::new(message)), None))
                        }
                        Some(Reply::End) => {
                            guard.done = true;
                            None
                        }
                        None => Some((Err(client.lost()), None)),
                    }
                }
            })
        })
    } else {
        EntryPoint::deferred(move |call| {
            let client = Arc::clone(&client);
            let name = name.clone();
            async move { client.invoke(&name, call).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_plugin::{CancellationToken, Dispatcher, Shape, StreamItem, WorkerPool, stream};
    use serde_json::json;

    fn settings() -> ProcessSettings {
        ProcessSettings {
            interpreter: None,
            describe_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_millis(500),
            ..ProcessSettings::default()
        }
    }

    /// A unit connected to the sample module served in-process over a duplex pipe
    async fn connected() -> (ProcessUnit, JoinHandle<()>) {
        let (host_out, plugin_in) = tokio::io::duplex(64 * 1024);
        let (plugin_out, host_in) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let _ = conduit_plugin::serve(conduit_samples::module(), plugin_in, plugin_out).await;
        });
        let unit = ProcessUnit::connect("samples", host_in, host_out, &settings())
            .await
            .unwrap();
        (unit, server)
    }

    #[tokio::test]
    async fn test_manifest_becomes_remote_entries() {
        let (unit, _server) = connected().await;
        let shapes: Vec<_> = unit
            .entry_points()
            .into_iter()
            .map(|d| (d.name, d.shape))
            .collect();
        assert!(shapes.contains(&("add".to_string(), Shape::Deferred)));
        assert!(shapes.contains(&("count".to_string(), Shape::DeferredSequence)));
        assert!(shapes.contains(&("ticker".to_string(), Shape::DeferredSequence)));
    }

    #[tokio::test]
    async fn test_remote_execute() {
        let (unit, _server) = connected().await;
        let dispatcher = Dispatcher::new(WorkerPool::new(1));

        let add = unit.entry_point("add").unwrap();
        let value = dispatcher
            .execute(&add, CallArgs::positional(vec![json!(2), json!(3)]))
            .await
            .unwrap();
        assert_eq!(value, json!(5));

        let err = dispatcher
            .execute(&add, CallArgs::positional(vec![json!("x"), json!(3)]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("two numbers"));
    }

    #[tokio::test]
    async fn test_remote_stream_and_error() {
        let (unit, _server) = connected().await;
        let dispatcher = Dispatcher::new(WorkerPool::new(1));

        let (sink, mut rx) = stream::channel(8);
        let entry = unit.entry_point("fail_after").unwrap();
        let call = CallArgs::positional(vec![json!(2), json!("boom")]);
        let result = dispatcher
            .produce(entry, call, sink, CancellationToken::new())
            .await;
        assert!(result.is_err());

        assert_eq!(rx.recv().await, Some(StreamItem::Data(json!(1))));
        assert_eq!(rx.recv().await, Some(StreamItem::Data(json!(2))));
        assert_eq!(rx.recv().await, Some(StreamItem::Error("boom".into())));
        assert_eq!(rx.recv().await, Some(StreamItem::End));
    }

    #[tokio::test]
    async fn test_cancelled_stream_releases_call() {
        let (unit, _server) = connected().await;
        let dispatcher = Dispatcher::new(WorkerPool::new(1));

        let (sink, mut rx) = stream::channel(8);
        let token = CancellationToken::new();
        let entry = unit.entry_point("ticker").unwrap();
        let call = CallArgs::positional(vec![json!(1000), json!(10)]);
        let producer = {
            let token = token.clone();
            tokio::spawn(async move { dispatcher.produce(entry, call, sink, token).await })
        };

        assert_eq!(rx.recv().await, Some(StreamItem::Data(json!(0))));
        token.cancel();
        let result = producer.await.unwrap();
        assert!(matches!(result, Err(conduit_plugin::DispatchError::Cancelled)));
        assert!(unit.client.pending.is_empty());
    }

    #[tokio::test]
    async fn test_slow_consumer_paces_remote_producer() {
        let produced = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let module = {
            let produced = Arc::clone(&produced);
            Module::new("flood").with(
                "flood",
                EntryPoint::sequence(move |_| {
                    let produced = Arc::clone(&produced);
                    Ok((0..10_000).map(move |i| {
                        produced.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(i))
                    }))
                }),
            )
        };
        let (host_out, plugin_in) = tokio::io::duplex(64 * 1024);
        let (plugin_out, host_in) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = conduit_plugin::serve(module, plugin_in, plugin_out).await;
        });
        let settings = ProcessSettings {
            stream_window: 1,
            ..settings()
        };
        let unit = ProcessUnit::connect("flood", host_in, host_out, &settings)
            .await
            .unwrap();

        let (sink, mut rx) = stream::channel(1);
        let token = CancellationToken::new();
        let entry = unit.entry_point("flood").unwrap();
        let producer = {
            let token = token.clone();
            tokio::spawn(async move {
                Dispatcher::new(WorkerPool::new(1))
                    .produce(entry, CallArgs::default(), sink, token)
                    .await
            })
        };

        assert_eq!(rx.recv().await, Some(StreamItem::Data(json!(0))));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let ahead = produced.load(Ordering::SeqCst);
        assert!(ahead < 100, "plugin ran {ahead} items ahead of a stalled consumer");

        // Draining resumes the flow
        for i in 1..=50 {
            assert_eq!(rx.recv().await, Some(StreamItem::Data(json!(i))));
        }
        token.cancel();
        drop(rx);
        let _ = producer.await;
        assert!(unit.client.pending.is_empty());
    }

    #[tokio::test]
    async fn test_items_beyond_the_window_fail_the_call() {
        let (host_out, plugin_in) = tokio::io::duplex(64 * 1024);
        let (plugin_out, host_in) = tokio::io::duplex(64 * 1024);
        let plugin = tokio::spawn(async move {
            let mut reader = IpcReader::new(plugin_in);
            let mut writer = IpcWriter::new(plugin_out);
            while let Ok(Some(frame)) = reader.recv().await {
                match frame.msg_type {
                    MessageType::Describe => {
                        let manifest = ManifestMessage {
                            entry_points: vec![EntryDescriptor {
                                name: "spew".into(),
                                shape: Shape::Sequence,
                            }],
                        };
                        writer.send_json(MessageType::Manifest, &manifest).await.unwrap();
                    }
                    MessageType::Call => {
                        // Ignore credit and send far more than one window
                        let call: CallRequest = frame.parse_json().unwrap();
                        for i in 0..20 {
                            let item = ValueMessage {
                                call_id: call.call_id,
                                value: json!(i),
                            };
                            writer.send_json(MessageType::Item, &item).await.unwrap();
                        }
                    }
                    _ => {}
                }
            }
        });
        let settings = ProcessSettings {
            stream_window: 2,
            ..settings()
        };
        let unit = ProcessUnit::connect("spew", host_in, host_out, &settings)
            .await
            .unwrap();

        let (sink, rx) = stream::channel(64);
        let entry = unit.entry_point("spew").unwrap();
        let result = Dispatcher::new(WorkerPool::new(1))
            .produce(entry, CallArgs::default(), sink, CancellationToken::new())
            .await;
        assert!(result.unwrap_err().to_string().contains("overran its stream credit"));
        drop(rx);
        unit.release().await;
        plugin.abort();
    }

    #[tokio::test]
    async fn test_release_fails_in_flight_calls() {
        let (unit, server) = connected().await;
        unit.release().await;
        server.await.unwrap();

        let greet = unit.entry_point("greet").unwrap();
        let err = Dispatcher::new(WorkerPool::new(1))
            .execute(&greet, CallArgs::positional(vec![json!("Ada")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_fails_when_process_exits_early() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("main.sh");
        std::fs::write(&entry, "exit 0\n").unwrap();

        let settings = ProcessSettings {
            interpreter: Some("sh".into()),
            ..settings()
        };
        let err = ProcessUnit::spawn("early", &entry, &settings)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("closed before sending its manifest"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_times_out_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("main.sh");
        std::fs::write(&entry, "sleep 5\n").unwrap();

        let settings = ProcessSettings {
            interpreter: Some("sh".into()),
            describe_timeout: Duration::from_millis(200),
            ..settings()
        };
        let err = ProcessUnit::spawn("silent", &entry, &settings)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("timeout waiting for plugin manifest"));
    }
}
