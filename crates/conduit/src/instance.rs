//! Plugin instances and their streams
//!
//! A [`PluginInstance`] binds one loaded code unit to its plugin id and owns
//! every stream started against it. [`PluginInstance::start_stream`] hands the
//! consumer a [`StreamChannel`]; the producer runs as its own task and is
//! tracked by a cancellable handle until the stream ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_plugin::{
    CLEANUP, CallArgs, CancellationToken, DispatchError, Dispatcher, EntryDescriptor, EntryPoint,
    INITIALIZE, StreamItem, StreamReceiver, stream,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{HostError, HostResult};
use crate::loader::{CodeUnit, Runtime};

/// How long unload waits for a cancelled producer before aborting it
const PRODUCER_GRACE: Duration = Duration::from_secs(1);

/// Buffering and liveness limits for streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Items buffered between producer and consumer
    pub capacity: usize,
    /// Longest the consumer waits for the next item
    pub idle_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            capacity: stream::DEFAULT_CAPACITY,
            idle_timeout: Duration::from_secs(10),
        }
    }
}

struct StreamHandle {
    serial: u64,
    function: String,
    token: CancellationToken,
    producer: JoinHandle<()>,
}

/// Status listing entry for one plugin
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    pub id: String,
    pub runtime: Runtime,
    pub loaded_at: DateTime<Utc>,
    pub entry_points: Vec<EntryDescriptor>,
    pub active_streams: Vec<String>,
}

/// One loaded plugin
pub struct PluginInstance {
    id: String,
    runtime: Runtime,
    unit: Arc<dyn CodeUnit>,
    dispatcher: Dispatcher,
    settings: StreamSettings,
    loaded: AtomicBool,
    loaded_at: DateTime<Utc>,
    streams: Mutex<HashMap<String, StreamHandle>>,
    next_serial: AtomicU64,
}

impl PluginInstance {
    pub fn new(
        id: impl Into<String>,
        runtime: Runtime,
        unit: Arc<dyn CodeUnit>,
        dispatcher: Dispatcher,
        settings: StreamSettings,
    ) -> Self {
        Self {
            id: id.into(),
            runtime,
            unit,
            dispatcher,
            settings,
            loaded: AtomicBool::new(false),
            loaded_at: Utc::now(),
            streams: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn runtime(&self) -> Runtime {
        self.runtime
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Run the optional `initialize` entry point and mark the instance loaded.
    ///
    /// If `initialize` fails the code unit is released before returning.
    pub async fn load(&self) -> HostResult<()> {
        if let Some(init) = self.unit.entry_point(INITIALIZE) {
            match self.dispatcher.execute(&init, CallArgs::default()).await {
                Ok(result) => {
                    info!(plugin_id = %self.id, result = %result, "Plugin initialized");
                }
                Err(e) => {
                    self.unit.release().await;
                    return Err(HostError::load(&self.id, format!("initialize failed: {e}")));
                }
            }
        }
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resolve(&self, function: &str) -> HostResult<EntryPoint> {
        self.unit
            .entry_point(function)
            .ok_or_else(|| HostError::FunctionNotFound {
                plugin: self.id.clone(),
                function: function.to_string(),
            })
    }

    /// Invoke a single-value entry point
    pub async fn execute(&self, function: &str, call: CallArgs) -> HostResult<Value> {
        let entry = self.resolve(function)?;
        self.dispatcher
            .execute(&entry, call)
            .await
            .map_err(|e| HostError::from_dispatch(function, e))
    }

    /// Start `function` as a stream registered under `stream_id`
    pub fn start_stream(
        self: &Arc<Self>,
        stream_id: &str,
        function: &str,
        call: CallArgs,
    ) -> HostResult<StreamChannel> {
        let entry = self.resolve(function)?;

        let mut streams = self.streams.lock();
        if streams.contains_key(stream_id) {
            return Err(HostError::StreamInUse(stream_id.to_string()));
        }

        let (sink, receiver) = stream::channel(self.settings.capacity);
        let token = CancellationToken::new();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        let producer = {
            let dispatcher = self.dispatcher.clone();
            let token = token.clone();
            let plugin_id = self.id.clone();
            let stream_id = stream_id.to_string();
            tokio::spawn(async move {
                match dispatcher.produce(entry, call, sink, token).await {
                    Ok(items) => {
                        debug!(plugin_id = %plugin_id, stream_id = %stream_id, items, "Stream producer finished");
                    }
                    Err(DispatchError::Cancelled) => {
                        debug!(plugin_id = %plugin_id, stream_id = %stream_id, "Stream producer cancelled");
                    }
                    Err(e) => {
                        let err = HostError::StreamProducer {
                            stream_id,
                            reason: e.to_string(),
                        };
                        warn!(plugin_id = %plugin_id, "{}", err);
                    }
                }
            })
        };

        streams.insert(
            stream_id.to_string(),
            StreamHandle {
                serial,
                function: function.to_string(),
                token: token.clone(),
                producer,
            },
        );
        debug!(plugin_id = %self.id, stream_id = %stream_id, function = %function, "Stream started");

        Ok(StreamChannel {
            plugin_id: self.id.clone(),
            stream_id: stream_id.to_string(),
            receiver,
            token,
            idle_timeout: self.settings.idle_timeout,
            serial,
            instance: Arc::downgrade(self),
            failed: false,
        })
    }

    /// Cancel and remove a stream. Returns false if it was not active.
    pub fn stop_stream(&self, stream_id: &str) -> bool {
        let handle = self.streams.lock().remove(stream_id);
        match handle {
            Some(handle) => {
                handle.token.cancel();
                debug!(plugin_id = %self.id, stream_id = %stream_id, function = %handle.function, "Stream stopped");
                true
            }
            None => false,
        }
    }

    /// Cancel every active stream, keeping the instance loaded
    pub fn stop_all(&self) -> usize {
        let handles = self.drain_streams();
        let count = handles.len();
        for handle in handles {
            handle.token.cancel();
        }
        count
    }

    /// Cancel streams, run `cleanup`, then release the code unit
    pub async fn unload(&self) {
        self.loaded.store(false, Ordering::SeqCst);

        let handles = self.drain_streams();
        for handle in &handles {
            handle.token.cancel();
        }

        if let Some(cleanup) = self.unit.entry_point(CLEANUP) {
            match self.dispatcher.execute(&cleanup, CallArgs::default()).await {
                Ok(_) => debug!(plugin_id = %self.id, "Plugin cleanup finished"),
                Err(e) => warn!(plugin_id = %self.id, error = %e, "Plugin cleanup failed"),
            }
        }

        for handle in handles {
            let abort = handle.producer.abort_handle();
            if tokio::time::timeout(PRODUCER_GRACE, handle.producer)
                .await
                .is_err()
            {
                abort.abort();
            }
        }

        self.unit.release().await;
    }

    /// Ids of the active streams, sorted
    pub fn active_streams(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.streams.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            id: self.id.clone(),
            runtime: self.runtime,
            loaded_at: self.loaded_at,
            entry_points: self.unit.entry_points(),
            active_streams: self.active_streams(),
        }
    }

    fn drain_streams(&self) -> Vec<StreamHandle> {
        self.streams.lock().drain().map(|(_, handle)| handle).collect()
    }

    /// Remove a stream's handle unless it was already replaced by a newer stream
    fn release_stream(&self, stream_id: &str, serial: u64) {
        let mut streams = self.streams.lock();
        if streams.get(stream_id).is_some_and(|h| h.serial == serial) {
            streams.remove(stream_id);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream channel (consumer side)
// ─────────────────────────────────────────────────────────────────────────────

/// Why a stream finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEnd {
    /// The producer ran to completion
    Completed,
    /// The producer raised; a `stream_error` was already relayed
    Failed,
    /// The stream was stopped or its instance unloaded
    Stopped,
    /// The producer stayed silent past the idle timeout
    Timeout,
}

/// What the consumer observes next
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Data(Value),
    Error(String),
    Finished(StreamEnd),
}

/// Consumer half of a running stream
///
/// Dropping the channel cancels the producer and removes the stream.
pub struct StreamChannel {
    plugin_id: String,
    stream_id: String,
    receiver: StreamReceiver,
    token: CancellationToken,
    idle_timeout: Duration,
    serial: u64,
    instance: Weak<PluginInstance>,
    failed: bool,
}

impl StreamChannel {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Wait for the next event. After [`StreamEvent::Finished`] the stream is gone.
    pub async fn pull(&mut self) -> StreamEvent {
        let next = tokio::select! {
            biased;
            _ = self.token.cancelled() => return self.finish(StreamEnd::Stopped),
            next = tokio::time::timeout(self.idle_timeout, self.receiver.recv()) => next,
        };

        match next {
            Err(_) => {
                self.token.cancel();
                let err = HostError::StreamTimeout(self.stream_id.clone());
                info!(plugin_id = %self.plugin_id, "{}", err);
                self.finish(StreamEnd::Timeout)
            }
            Ok(Some(StreamItem::Data(value))) => StreamEvent::Data(value),
            Ok(Some(StreamItem::Error(message))) => {
                self.failed = true;
                StreamEvent::Error(message)
            }
            Ok(Some(StreamItem::End)) => {
                let end = if self.failed {
                    StreamEnd::Failed
                } else {
                    StreamEnd::Completed
                };
                self.finish(end)
            }
            // The producer went away without its end marker
            Ok(None) if !self.failed => {
                self.failed = true;
                warn!(
                    plugin_id = %self.plugin_id,
                    stream_id = %self.stream_id,
                    "Stream producer exited without an end marker"
                );
                StreamEvent::Error("stream producer exited unexpectedly".into())
            }
            Ok(None) => self.finish(StreamEnd::Failed),
        }
    }

    fn finish(&mut self, end: StreamEnd) -> StreamEvent {
        self.release();
        StreamEvent::Finished(end)
    }

    fn release(&mut self) {
        if let Some(instance) = self.instance.upgrade() {
            instance.release_stream(&self.stream_id, self.serial);
        }
        self.instance = Weak::new();
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.token.cancel();
        self.release();
    }
}
