//! Stream channel items
//!
//! Each streaming invocation gets its own bounded FIFO pipe. Items are tagged so
//! the end marker can never be confused with a data value.

use serde_json::Value;
use tokio::sync::mpsc;

/// Default number of items buffered between producer and consumer
pub const DEFAULT_CAPACITY: usize = 64;

/// One item travelling from a producer to its consumer
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// A value produced by the plugin function
    Data(Value),
    /// The producer failed; an `End` always follows
    Error(String),
    /// No more items will be produced
    End,
}

/// Create a stream channel buffering at most `capacity` items
pub fn channel(capacity: usize) -> (StreamSender, StreamReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (StreamSender { tx }, StreamReceiver { rx })
}

/// Producer half of a stream channel
#[derive(Debug, Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<StreamItem>,
}

impl StreamSender {
    /// Push an item, waiting for buffer space. Returns false once the consumer is gone.
    pub async fn push(&self, item: StreamItem) -> bool {
        self.tx.send(item).await.is_ok()
    }

    /// Push without waiting. Returns false if the buffer is full or the consumer is gone.
    pub fn try_push(&self, item: StreamItem) -> bool {
        self.tx.try_send(item).is_ok()
    }

    /// Whether the consumer has dropped its half
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a stream channel
#[derive(Debug)]
pub struct StreamReceiver {
    rx: mpsc::Receiver<StreamItem>,
}

impl StreamReceiver {
    /// Next item in arrival order, or `None` once every producer is gone
    pub async fn recv(&mut self) -> Option<StreamItem> {
        self.rx.recv().await
    }
}
