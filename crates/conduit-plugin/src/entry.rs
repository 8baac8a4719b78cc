//! Entry points and their execution shapes
//!
//! A plugin function is stored as an [`EntryPoint`] whose variant *is* its
//! shape. The shape is fixed when the function is registered, so the
//! dispatcher never has to inspect a callable at call time.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream};
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PluginError;

/// Execution convention of an entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    /// Returns one value synchronously
    Plain,
    /// Returns a finite lazy sequence synchronously
    Sequence,
    /// Suspends, then produces one value
    Deferred,
    /// Suspends between items of a finite lazy sequence
    DeferredSequence,
}

impl Shape {
    /// Whether the shape produces a sequence rather than a single value
    pub fn is_sequence(self) -> bool {
        matches!(self, Shape::Sequence | Shape::DeferredSequence)
    }

    /// Whether invoking the shape may block the calling thread
    pub fn is_blocking(self) -> bool {
        matches!(self, Shape::Plain | Shape::Sequence)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Shape::Plain => "plain",
            Shape::Sequence => "sequence",
            Shape::Deferred => "deferred",
            Shape::DeferredSequence => "deferred_sequence",
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of one invocation: positional values plus keyword values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    /// Read a parameter by keyword `name`, falling back to position `index`
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, PluginError> {
        let value = self
            .kwargs
            .get(name)
            .or_else(|| self.args.get(index))
            .ok_or_else(|| PluginError::new(format!("missing argument `{name}`")))?;

        serde_json::from_value(value.clone())
            .map_err(|e| PluginError::new(format!("invalid argument `{name}`: {e}")))
    }

    /// Like [`CallArgs::get`], but returns `default` when the parameter is absent
    pub fn get_or<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
        default: T,
    ) -> Result<T, PluginError> {
        if self.kwargs.contains_key(name) || index < self.args.len() {
            self.get(index, name)
        } else {
            Ok(default)
        }
    }
}

/// Lazy sequence returned by a [`Shape::Sequence`] entry point
pub type ValueIter = Box<dyn Iterator<Item = Result<Value, PluginError>> + Send>;

/// Lazy sequence returned by a [`Shape::DeferredSequence`] entry point
pub type ValueStream = BoxStream<'static, Result<Value, PluginError>>;

type PlainFn = dyn Fn(CallArgs) -> Result<Value, PluginError> + Send + Sync;
type SequenceFn = dyn Fn(CallArgs) -> Result<ValueIter, PluginError> + Send + Sync;
type DeferredFn = dyn Fn(CallArgs) -> BoxFuture<'static, Result<Value, PluginError>> + Send + Sync;
type DeferredSequenceFn = dyn Fn(CallArgs) -> ValueStream + Send + Sync;

/// A callable plugin function, tagged with its shape
#[derive(Clone)]
pub enum EntryPoint {
    Plain(Arc<PlainFn>),
    Sequence(Arc<SequenceFn>),
    Deferred(Arc<DeferredFn>),
    DeferredSequence(Arc<DeferredSequenceFn>),
}

impl EntryPoint {
    pub fn plain<F>(f: F) -> Self
    where
        F: Fn(CallArgs) -> Result<Value, PluginError> + Send + Sync + 'static,
    {
        Self::Plain(Arc::new(f))
    }

    pub fn sequence<F, I>(f: F) -> Self
    where
        F: Fn(CallArgs) -> Result<I, PluginError> + Send + Sync + 'static,
        I: IntoIterator<Item = Result<Value, PluginError>>,
        I::IntoIter: Send + 'static,
    {
        Self::Sequence(Arc::new(move |call| {
            f(call).map(|items| Box::new(items.into_iter()) as ValueIter)
        }))
    }

    pub fn deferred<F, Fut>(f: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, PluginError>> + Send + 'static,
    {
        Self::Deferred(Arc::new(move |call| f(call).boxed()))
    }

    pub fn deferred_sequence<F, S>(f: F) -> Self
    where
        F: Fn(CallArgs) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value, PluginError>> + Send + 'static,
    {
        Self::DeferredSequence(Arc::new(move |call| f(call).boxed()))
    }

    pub fn shape(&self) -> Shape {
        match self {
            EntryPoint::Plain(_) => Shape::Plain,
            EntryPoint::Sequence(_) => Shape::Sequence,
            EntryPoint::Deferred(_) => Shape::Deferred,
            EntryPoint::DeferredSequence(_) => Shape::DeferredSequence,
        }
    }
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EntryPoint").field(&self.shape()).finish()
    }
}

/// Name and shape of an entry point, as advertised in manifests and listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDescriptor {
    pub name: String,
    pub shape: Shape,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shape_is_fixed_by_constructor() {
        let plain = EntryPoint::plain(|_| Ok(json!(1)));
        let seq = EntryPoint::sequence(|_| Ok(vec![Ok(json!(1))]));
        let deferred = EntryPoint::deferred(|_| async { Ok(json!(1)) });
        let stream = EntryPoint::deferred_sequence(|_| futures::stream::iter(vec![Ok(json!(1))]));

        assert_eq!(plain.shape(), Shape::Plain);
        assert_eq!(seq.shape(), Shape::Sequence);
        assert_eq!(deferred.shape(), Shape::Deferred);
        assert_eq!(stream.shape(), Shape::DeferredSequence);
        assert!(seq.shape().is_sequence());
        assert!(!deferred.shape().is_sequence());
    }

    #[test]
    fn test_shape_serializes_snake_case() {
        let json = serde_json::to_string(&Shape::DeferredSequence).unwrap();
        assert_eq!(json, "\"deferred_sequence\"");
    }

    #[test]
    fn test_call_args_keyword_overrides_position() {
        let mut kwargs = Map::new();
        kwargs.insert("b".into(), json!(10));
        let call = CallArgs::new(vec![json!(1), json!(2)], kwargs);

        assert_eq!(call.get::<i64>(0, "a").unwrap(), 1);
        assert_eq!(call.get::<i64>(1, "b").unwrap(), 10);
        assert_eq!(call.get_or::<i64>(5, "c", 7).unwrap(), 7);
    }

    #[test]
    fn test_call_args_missing_and_invalid() {
        let call = CallArgs::positional(vec![json!("text")]);

        let missing = call.get::<i64>(3, "count").unwrap_err();
        assert!(missing.message().contains("missing argument `count`"));

        let invalid = call.get::<i64>(0, "count").unwrap_err();
        assert!(invalid.message().contains("invalid argument `count`"));
    }
}
