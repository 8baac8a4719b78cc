//! Execution Dispatcher
//!
//! Invokes every entry point shape through one calling convention:
//!
//! | shape              | single value (`execute`)   | stream (`produce`)                       |
//! |--------------------|----------------------------|------------------------------------------|
//! | `Plain`            | worker pool                | worker pool, one item                    |
//! | `Sequence`         | rejected                   | one worker pool hop per item             |
//! | `Deferred`         | awaited on the scheduler   | awaited on the scheduler, one item       |
//! | `DeferredSequence` | rejected                   | polled on the scheduler                  |
//!
//! Cancellation is cooperative: the token is raced against every await,
//! including each worker hop of a blocking sequence. A worker is never held
//! while an item waits for buffer space. Panics in plugin code surface as
//! [`DispatchError::Panicked`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::entry::{CallArgs, EntryPoint, ValueIter, ValueStream};
use crate::error::DispatchError;
use crate::pool::WorkerPool;
use crate::stream::{StreamItem, StreamSender};

/// Uniform invoker for plugin entry points
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    pool: WorkerPool,
}

impl Dispatcher {
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Invoke a single-value entry point and return its result.
    ///
    /// Sequence shapes are rejected with [`DispatchError::ShapeMismatch`].
    pub async fn execute(&self, entry: &EntryPoint, call: CallArgs) -> Result<Value, DispatchError> {
        match entry {
            EntryPoint::Plain(f) => {
                let f = Arc::clone(f);
                Ok(self.pool.run(move || f(call)).await??)
            }
            EntryPoint::Deferred(f) => {
                let f = Arc::clone(f);
                Ok(catch_panic(async move { f(call).await }).await??)
            }
            other => Err(DispatchError::ShapeMismatch {
                shape: other.shape(),
            }),
        }
    }

    /// Run an entry point as a stream, pushing each produced value into `sink`.
    ///
    /// Single-value shapes produce exactly one item. A failure is pushed as
    /// [`StreamItem::Error`]; [`StreamItem::End`] is always pushed last so the
    /// consumer terminates, unless the stream was cancelled and the buffer is
    /// full. Returns the number of data items pushed.
    pub async fn produce(
        &self,
        entry: EntryPoint,
        call: CallArgs,
        sink: StreamSender,
        token: CancellationToken,
    ) -> Result<usize, DispatchError> {
        let result = match entry {
            EntryPoint::Plain(f) => {
                let value = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(DispatchError::Cancelled),
                    result = self.pool.run(move || f(call)) => result.and_then(|r| r.map_err(Into::into)),
                };
                match value {
                    Ok(value) => push_data(&sink, &token, value).await.map(|_| 1),
                    Err(e) => Err(e),
                }
            }
            EntryPoint::Deferred(f) => {
                let value = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(DispatchError::Cancelled),
                    result = catch_panic(async move { f(call).await }) => result.and_then(|r| r.map_err(Into::into)),
                };
                match value {
                    Ok(value) => push_data(&sink, &token, value).await.map(|_| 1),
                    Err(e) => Err(e),
                }
            }
            EntryPoint::Sequence(f) => {
                let items = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(DispatchError::Cancelled),
                    result = self.pool.run(move || f(call)) => result.and_then(|r| r.map_err(Into::into)),
                };
                match items {
                    Ok(items) => self.drain_blocking(items, &sink, &token).await,
                    Err(e) => Err(e),
                }
            }
            EntryPoint::DeferredSequence(f) => {
                match std::panic::catch_unwind(AssertUnwindSafe(move || f(call))) {
                    Ok(items) => drain_stream(items, &sink, &token).await,
                    Err(payload) => Err(DispatchError::panicked(payload)),
                }
            }
        };

        match &result {
            // The consumer watches the same token, so the end marker is best effort
            Err(DispatchError::Cancelled) => {
                sink.try_push(StreamItem::End);
            }
            Err(e) => {
                sink.push(StreamItem::Error(e.to_string())).await;
                sink.push(StreamItem::End).await;
            }
            Ok(_) => {
                sink.push(StreamItem::End).await;
            }
        }

        result
    }

    /// Pull a blocking sequence one item per worker hop, pushing from the scheduler
    async fn drain_blocking(
        &self,
        mut items: ValueIter,
        sink: &StreamSender,
        token: &CancellationToken,
    ) -> Result<usize, DispatchError> {
        let mut count = 0;
        loop {
            let (next, rest) = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DispatchError::Cancelled),
                step = self.pool.run(move || {
                    let next = items.next();
                    (next, items)
                }) => step?,
            };
            items = rest;

            match next {
                Some(Ok(value)) => {
                    push_data(sink, token, value).await?;
                    count += 1;
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(count),
            }
        }
    }
}

/// Poll a deferred sequence on the scheduler
async fn drain_stream(
    mut items: ValueStream,
    sink: &StreamSender,
    token: &CancellationToken,
) -> Result<usize, DispatchError> {
    let mut count = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DispatchError::Cancelled),
            next = catch_panic(items.next()) => next?,
        };
        match next {
            Some(Ok(value)) => {
                push_data(sink, token, value).await?;
                count += 1;
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(count),
        }
    }
}

async fn catch_panic<F: Future>(future: F) -> Result<F::Output, DispatchError> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(DispatchError::panicked)
}

async fn push_data(
    sink: &StreamSender,
    token: &CancellationToken,
    value: Value,
) -> Result<(), DispatchError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(DispatchError::Cancelled),
        pushed = sink.push(StreamItem::Data(value)) => {
            if pushed { Ok(()) } else { Err(DispatchError::Cancelled) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Shape;
    use crate::error::PluginError;
    use crate::stream::{self, StreamReceiver};
    use serde_json::json;
    use std::time::Duration;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(WorkerPool::new(2))
    }

    async fn drain(mut rx: StreamReceiver) -> Vec<StreamItem> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            let end = item == StreamItem::End;
            items.push(item);
            if end {
                break;
            }
        }
        items
    }

    fn add() -> EntryPoint {
        EntryPoint::plain(|call| {
            let a: i64 = call.get(0, "a")?;
            let b: i64 = call.get(1, "b")?;
            Ok(json!(a + b))
        })
    }

    fn count_to(n: i64) -> EntryPoint {
        EntryPoint::sequence(move |_| Ok((1..=n).map(|i| Ok(json!(i)))))
    }

    #[tokio::test]
    async fn test_execute_plain_runs_in_pool() {
        let value = dispatcher()
            .execute(&add(), CallArgs::positional(vec![json!(2), json!(3)]))
            .await
            .unwrap();
        assert_eq!(value, json!(5));
    }

    #[tokio::test]
    async fn test_execute_deferred_is_awaited() {
        let entry = EntryPoint::deferred(|call| async move {
            let name: String = call.get(0, "name")?;
            Ok(json!(format!("hi {name}")))
        });
        let value = dispatcher()
            .execute(&entry, CallArgs::positional(vec![json!("ada")]))
            .await
            .unwrap();
        assert_eq!(value, json!("hi ada"));
    }

    #[tokio::test]
    async fn test_execute_rejects_sequences() {
        let err = dispatcher()
            .execute(&count_to(3), CallArgs::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::ShapeMismatch {
                shape: Shape::Sequence
            }
        );
    }

    #[tokio::test]
    async fn test_execute_propagates_plugin_error() {
        let entry = EntryPoint::plain(|_| Err(PluginError::new("division by zero")));
        let err = dispatcher()
            .execute(&entry, CallArgs::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "division by zero");
    }

    #[tokio::test]
    async fn test_produce_sequence_in_order_then_end() {
        let (sink, rx) = stream::channel(8);
        let produced = dispatcher()
            .produce(count_to(3), CallArgs::default(), sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(produced, 3);
        assert_eq!(
            drain(rx).await,
            vec![
                StreamItem::Data(json!(1)),
                StreamItem::Data(json!(2)),
                StreamItem::Data(json!(3)),
                StreamItem::End,
            ]
        );
    }

    #[tokio::test]
    async fn test_produce_single_value_shapes_yield_one_item() {
        let (sink, rx) = stream::channel(8);
        dispatcher()
            .produce(
                add(),
                CallArgs::positional(vec![json!(1), json!(1)]),
                sink,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            drain(rx).await,
            vec![StreamItem::Data(json!(2)), StreamItem::End]
        );
    }

    #[tokio::test]
    async fn test_produce_error_after_two_items() {
        let entry = EntryPoint::sequence(|_| {
            Ok(vec![
                Ok(json!("a")),
                Ok(json!("b")),
                Err(PluginError::new("sensor unplugged")),
                Ok(json!("never")),
            ])
        });
        let (sink, rx) = stream::channel(8);
        let result = dispatcher()
            .produce(entry, CallArgs::default(), sink, CancellationToken::new())
            .await;

        assert!(matches!(result, Err(DispatchError::Raised(_))));
        assert_eq!(
            drain(rx).await,
            vec![
                StreamItem::Data(json!("a")),
                StreamItem::Data(json!("b")),
                StreamItem::Error("sensor unplugged".into()),
                StreamItem::End,
            ]
        );
    }

    #[tokio::test]
    async fn test_produce_deferred_sequence_cancelled() {
        let entry = EntryPoint::deferred_sequence(|_| {
            futures::stream::unfold(0, |i| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Some((Ok(json!(i)), i + 1))
            })
        });
        let (sink, mut rx) = stream::channel(1);
        let token = CancellationToken::new();
        let dispatcher = dispatcher();
        let producer = {
            let token = token.clone();
            tokio::spawn(async move {
                dispatcher
                    .produce(entry, CallArgs::default(), sink, token)
                    .await
            })
        };

        assert_eq!(rx.recv().await, Some(StreamItem::Data(json!(0))));
        token.cancel();

        let result = producer.await.unwrap();
        assert_eq!(result, Err(DispatchError::Cancelled));

        // A cancelled stream never reports an error item
        let rest = drain(rx).await;
        assert!(!rest.iter().any(|i| matches!(i, StreamItem::Error(_))));
    }

    #[tokio::test]
    async fn test_produce_blocking_sequence_stops_at_next_item() {
        let entry = EntryPoint::sequence(|_| {
            Ok((0..).map(|i| {
                std::thread::sleep(Duration::from_millis(5));
                Ok(json!(i))
            }))
        });
        let (sink, mut rx) = stream::channel(1);
        let token = CancellationToken::new();
        let dispatcher = dispatcher();
        let producer = {
            let token = token.clone();
            tokio::spawn(async move {
                dispatcher
                    .produce(entry, CallArgs::default(), sink, token)
                    .await
            })
        };

        assert_eq!(rx.recv().await, Some(StreamItem::Data(json!(0))));
        token.cancel();
        let consumer = tokio::spawn(drain(rx));

        let result = tokio::time::timeout(Duration::from_secs(2), producer)
            .await
            .expect("producer should stop")
            .unwrap();
        assert_eq!(result, Err(DispatchError::Cancelled));
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn test_unread_stream_does_not_hold_a_worker() {
        let dispatcher = Dispatcher::new(WorkerPool::new(1));
        let (sink, mut rx) = stream::channel(1);
        let token = CancellationToken::new();
        let producer = {
            let dispatcher = dispatcher.clone();
            let token = token.clone();
            tokio::spawn(async move {
                dispatcher
                    .produce(count_to(1_000_000), CallArgs::default(), sink, token)
                    .await
            })
        };

        assert_eq!(rx.recv().await, Some(StreamItem::Data(json!(1))));

        // The stream is parked on a full buffer; the only worker must be free
        let value = tokio::time::timeout(
            Duration::from_secs(2),
            dispatcher.execute(&add(), CallArgs::positional(vec![json!(2), json!(2)])),
        )
        .await
        .expect("execute should not wait for the stream")
        .unwrap();
        assert_eq!(value, json!(4));

        token.cancel();
        drop(rx);
        assert_eq!(producer.await.unwrap(), Err(DispatchError::Cancelled));
    }

    #[tokio::test]
    async fn test_execute_deferred_panic_is_an_error() {
        let entry = EntryPoint::deferred(|_| async move {
            if true {
                panic!("lost the socket");
            }
            Ok::<_, PluginError>(json!(null))
        });
        let err = dispatcher()
            .execute(&entry, CallArgs::default())
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Panicked("lost the socket".into()));
    }

    #[tokio::test]
    async fn test_produce_deferred_panic_reports_error_then_end() {
        let entry = EntryPoint::deferred(|_| async move {
            if true {
                panic!("lost the socket");
            }
            Ok::<_, PluginError>(json!(null))
        });
        let (sink, rx) = stream::channel(4);
        let result = dispatcher()
            .produce(entry, CallArgs::default(), sink, CancellationToken::new())
            .await;

        assert!(matches!(result, Err(DispatchError::Panicked(_))));
        assert_eq!(
            drain(rx).await,
            vec![
                StreamItem::Error("entry point panicked: lost the socket".into()),
                StreamItem::End,
            ]
        );
    }

    #[tokio::test]
    async fn test_produce_deferred_sequence_panic_mid_stream() {
        let entry = EntryPoint::deferred_sequence(|_| {
            futures::stream::iter(0..3).map(|i| {
                if i == 1 {
                    panic!("bad frame");
                }
                Ok::<_, PluginError>(json!(i))
            })
        });
        let (sink, rx) = stream::channel(4);
        let result = dispatcher()
            .produce(entry, CallArgs::default(), sink, CancellationToken::new())
            .await;

        assert!(matches!(result, Err(DispatchError::Panicked(_))));
        assert_eq!(
            drain(rx).await,
            vec![
                StreamItem::Data(json!(0)),
                StreamItem::Error("entry point panicked: bad frame".into()),
                StreamItem::End,
            ]
        );
    }
}
