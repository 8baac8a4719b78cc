//! Sample plugin module
//!
//! One entry point of every shape. Registered in the host as the `samples`
//! builtin and served over IPC by the `conduit-sample-plugin` binary.

use std::time::Duration;

use conduit_plugin::{CallArgs, EntryPoint, Module, PluginError};
use futures::stream;
use serde_json::{Value, json};

/// Catalogue name of this module
pub const NAME: &str = "samples";

/// Build the sample module
pub fn module() -> Module {
    Module::new(NAME)
        .with("add", EntryPoint::plain(add))
        .with("greet", EntryPoint::deferred(greet))
        .with("count", EntryPoint::sequence(count))
        .with("ticker", EntryPoint::deferred_sequence(ticker))
        .with("fail_after", EntryPoint::sequence(fail_after))
}

/// `add(a, b)`: integer sum when both are integers, float sum otherwise
fn add(call: CallArgs) -> Result<Value, PluginError> {
    let a: Value = call.get(0, "a")?;
    let b: Value = call.get(1, "b")?;

    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a
            .checked_add(b)
            .map(Value::from)
            .ok_or_else(|| PluginError::new("integer overflow"));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(a + b)),
        _ => Err(PluginError::new("add expects two numbers")),
    }
}

/// `greet(name, delay_ms = 0)`
async fn greet(call: CallArgs) -> Result<Value, PluginError> {
    let name: String = call.get(0, "name")?;
    let delay: u64 = call.get_or(1, "delay_ms", 0)?;
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    Ok(json!(format!("Hello, {name}!")))
}

/// `count(n)`: yields 1..=n
fn count(call: CallArgs) -> Result<impl Iterator<Item = Result<Value, PluginError>>, PluginError> {
    let n: i64 = call.get(0, "n")?;
    Ok((1..=n).map(|i| Ok(json!(i))))
}

/// `ticker(count, interval_ms = 100)`: yields 0..count, sleeping before each item
fn ticker(call: CallArgs) -> impl futures::Stream<Item = Result<Value, PluginError>> {
    let params = call
        .get::<u64>(0, "count")
        .and_then(|count| Ok((count, call.get_or::<u64>(1, "interval_ms", 100)?)));

    stream::unfold((0u64, params), |(tick, params)| async move {
        match params {
            Err(e) => Some((Err(e), (tick, Ok((0, 0))))),
            Ok((count, _)) if tick >= count => None,
            Ok((count, interval)) => {
                tokio::time::sleep(Duration::from_millis(interval)).await;
                Some((Ok(json!(tick)), (tick + 1, Ok((count, interval)))))
            }
        }
    })
}

/// `fail_after(n, message = "failed")`: yields 1..=n, then raises
fn fail_after(
    call: CallArgs,
) -> Result<impl Iterator<Item = Result<Value, PluginError>>, PluginError> {
    let n: i64 = call.get(0, "n")?;
    let message: String = call.get_or(1, "message", "failed".to_string())?;
    Ok((1..=n)
        .map(|i| Ok(json!(i)))
        .chain(std::iter::once(Err(PluginError::new(message)))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_plugin::{CancellationToken, Dispatcher, Shape, StreamItem, WorkerPool, stream};

    fn args(values: Vec<Value>) -> CallArgs {
        CallArgs::positional(values)
    }

    #[test]
    fn test_module_exposes_every_shape() {
        let shapes: Vec<_> = module()
            .descriptors()
            .into_iter()
            .map(|d| (d.name, d.shape))
            .collect();
        assert_eq!(
            shapes,
            vec![
                ("add".to_string(), Shape::Plain),
                ("count".to_string(), Shape::Sequence),
                ("fail_after".to_string(), Shape::Sequence),
                ("greet".to_string(), Shape::Deferred),
                ("ticker".to_string(), Shape::DeferredSequence),
            ]
        );
    }

    #[test]
    fn test_add() {
        assert_eq!(add(args(vec![json!(2), json!(3)])).unwrap(), json!(5));
        assert_eq!(add(args(vec![json!(1.5), json!(2)])).unwrap(), json!(3.5));
        assert!(add(args(vec![json!("x"), json!(2)])).is_err());
    }

    #[tokio::test]
    async fn test_greet() {
        assert_eq!(greet(args(vec![json!("Ada")])).await.unwrap(), json!("Hello, Ada!"));
    }

    #[tokio::test]
    async fn test_ticker_and_fail_after_through_dispatcher() {
        let dispatcher = Dispatcher::new(WorkerPool::new(1));
        let m = module();

        let (sink, mut rx) = stream::channel(8);
        let entry = m.resolve("ticker").cloned().unwrap();
        let call = args(vec![json!(3), json!(1)]);
        dispatcher
            .produce(entry, call, sink, CancellationToken::new())
            .await
            .unwrap();
        for expected in 0..3 {
            assert_eq!(rx.recv().await, Some(StreamItem::Data(json!(expected))));
        }
        assert_eq!(rx.recv().await, Some(StreamItem::End));

        let (sink, mut rx) = stream::channel(8);
        let entry = m.resolve("fail_after").cloned().unwrap();
        let call = args(vec![json!(2), json!("boom")]);
        assert!(
            dispatcher
                .produce(entry, call, sink, CancellationToken::new())
                .await
                .is_err()
        );
        assert_eq!(rx.recv().await, Some(StreamItem::Data(json!(1))));
        assert_eq!(rx.recv().await, Some(StreamItem::Data(json!(2))));
        assert_eq!(rx.recv().await, Some(StreamItem::Error("boom".into())));
        assert_eq!(rx.recv().await, Some(StreamItem::End));
    }
}
