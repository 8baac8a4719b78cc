//! Sample plugin process
//!
//! Serves the sample module over stdin/stdout with the Conduit IPC protocol.
//! Point a process load at it with an empty `--interpreter` and an entry file
//! that execs this binary, or run it as the entry file itself.

use anyhow::Result;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Stdout is the IPC channel, so logs go to stderr
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Serving {} plugin v{}", conduit_samples::NAME, env!("CARGO_PKG_VERSION"));
    conduit_plugin::serve_stdio(conduit_samples::module()).await?;
    Ok(())
}
