//! Host configuration
//!
//! Every flag can also be set through the environment, so the binary runs the
//! same under a process supervisor as it does from a shell.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::http::{HeaderValue, Method};
use clap::{Parser, ValueEnum};
use conduit_plugin::WorkerPool;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::install::RequirementInstaller;
use crate::instance::StreamSettings;
use crate::loader::{ProcessSettings, Runtime};
use crate::server::GatewayOptions;

/// Conduit plugin host
#[derive(Parser, Debug, Clone)]
#[command(name = "conduit")]
#[command(about = "Plugin host with a multiplexed WebSocket transport", long_about = None)]
pub struct HostConfig {
    /// Server host address
    #[arg(long, env = "CONDUIT_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Server port
    #[arg(long, env = "CONDUIT_PORT", default_value_t = 8001)]
    pub port: u16,

    /// Directory where plugin code is persisted, one subdirectory per plugin id
    #[arg(long, env = "CONDUIT_PLUGINS_DIR", default_value = "plugins")]
    pub plugins_dir: PathBuf,

    /// Runtime used when a load request does not name one. Process plugins must
    /// speak the Conduit IPC frame protocol on stdin/stdout (see
    /// `conduit_plugin::serve`); `builtin` loads compiled-in catalogue modules
    #[arg(long, env = "CONDUIT_DEFAULT_RUNTIME", value_enum, default_value_t = Runtime::Process)]
    pub default_runtime: Runtime,

    /// Interpreter for process plugins; empty runs the entry file directly
    #[arg(long, env = "CONDUIT_INTERPRETER", default_value = "python3")]
    pub interpreter: String,

    /// File name the plugin code is stored under
    #[arg(long, env = "CONDUIT_ENTRY_FILE", default_value = "main.py")]
    pub entry_file: String,

    /// Command that installs a requirements file (its path is appended); empty disables installs
    #[arg(long, env = "CONDUIT_INSTALL_COMMAND", default_value = "python3 -m pip install -r")]
    pub install_command: String,

    /// Worker threads for blocking plugin code (defaults to available parallelism)
    #[arg(long, env = "CONDUIT_WORKERS")]
    pub workers: Option<usize>,

    /// Items buffered per stream
    #[arg(long, env = "CONDUIT_STREAM_CAPACITY", default_value_t = conduit_plugin::stream::DEFAULT_CAPACITY)]
    pub stream_capacity: usize,

    /// Seconds a stream may stay silent before it is torn down
    #[arg(
        long,
        env = "CONDUIT_STREAM_IDLE_TIMEOUT",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub stream_idle_timeout: u64,

    /// Stream items a process plugin may send before the consumer catches up
    #[arg(
        long,
        env = "CONDUIT_STREAM_WINDOW",
        default_value_t = 16,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub stream_window: u32,

    /// Send a `stream_end` event when a stream finishes
    #[arg(long, env = "CONDUIT_EMIT_STREAM_END")]
    pub emit_stream_end: bool,

    /// Allowed CORS origin; repeat for several, `*` allows any
    #[arg(
        long = "allowed-origin",
        env = "CONDUIT_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_values_t = [
            "http://localhost:3000".to_string(),
            "http://localhost:3001".to_string(),
        ]
    )]
    pub allowed_origins: Vec<String>,

    /// Log output format
    #[arg(long, env = "CONDUIT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl HostConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            capacity: self.stream_capacity.max(1),
            idle_timeout: Duration::from_secs(self.stream_idle_timeout),
        }
    }

    pub fn process_settings(&self) -> ProcessSettings {
        let interpreter = self.interpreter.trim();
        ProcessSettings {
            interpreter: (!interpreter.is_empty()).then(|| interpreter.to_string()),
            stream_window: self.stream_window,
            ..ProcessSettings::default()
        }
    }

    pub fn installer(&self) -> RequirementInstaller {
        RequirementInstaller::from_command_line(&self.install_command)
    }

    pub fn worker_pool(&self) -> WorkerPool {
        match self.workers {
            Some(size) => WorkerPool::new(size),
            None => WorkerPool::with_default_size(),
        }
    }

    pub fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions {
            emit_stream_end: self.emit_stream_end,
            ..GatewayOptions::default()
        }
    }

    /// CORS policy for the HTTP endpoints
    pub fn cors_layer(&self) -> CorsLayer {
        if self.allowed_origins.iter().any(|o| o.trim() == "*") {
            return CorsLayer::permissive();
        }

        let origins: Vec<HeaderValue> = self
            .allowed_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any)
    }
}
