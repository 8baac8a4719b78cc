//! Conduit Plugin Contract
//!
//! Everything a plugin and the host agree on:
//! - [`Module`] and [`EntryPoint`]: the named functions a plugin exposes,
//!   each tagged with its execution [`Shape`]
//! - [`Dispatcher`]: uniform invocation of all four shapes, with blocking
//!   work isolated in a bounded [`WorkerPool`]
//! - [`stream`]: the tagged item type carried by a stream channel
//! - [`ipc`]: the framed wire protocol spoken by child-process plugins
//! - [`serve`]: the child-side runtime that exposes a [`Module`] over that protocol

mod dispatch;
mod entry;
mod error;
mod module;
mod pool;

pub mod ipc;
pub mod serve;
pub mod stream;

pub use dispatch::Dispatcher;
pub use entry::{CallArgs, EntryDescriptor, EntryPoint, Shape, ValueIter, ValueStream};
pub use error::{DispatchError, PluginError};
pub use module::{CLEANUP, INITIALIZE, Module};
pub use pool::WorkerPool;
pub use serve::{serve, serve_stdio};
pub use stream::{StreamItem, StreamReceiver, StreamSender};

// Re-exported so plugin crates and the host agree on the token type.
pub use tokio_util::sync::CancellationToken;
