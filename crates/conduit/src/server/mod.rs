//! WebSocket Gateway
//!
//! Exposes the plugin registry over one WebSocket per plugin id, plus HTTP
//! status endpoints.

mod handler;
mod protocol;
mod router;
mod state;

pub use handler::*;
pub use protocol::*;
pub use router::*;
pub use state::*;
