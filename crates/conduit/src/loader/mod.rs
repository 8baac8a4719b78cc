//! Code unit loading
//!
//! A plugin's code unit is anything that satisfies [`CodeUnit`]: it resolves
//! entry points by name and can be released. Two runtimes provide one:
//! - [`Runtime::Builtin`]: a [`Module`] compiled into the host and registered
//!   in the [`PluginCatalog`]; the load request's code text names the module
//! - [`Runtime::Process`]: a child process speaking the plugin IPC protocol,
//!   started from the persisted entry file

mod catalog;
mod process;

pub use catalog::*;
pub use process::*;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use conduit_plugin::{EntryDescriptor, EntryPoint, Module};
use serde::{Deserialize, Serialize};

use crate::error::{HostError, HostResult};
use crate::store::StoredCode;

/// A loaded unit of plugin code
#[async_trait]
pub trait CodeUnit: Send + Sync {
    /// Resolve an entry point by name
    fn entry_point(&self, name: &str) -> Option<EntryPoint>;

    /// Every entry point with its shape, sorted by name
    fn entry_points(&self) -> Vec<EntryDescriptor>;

    /// Release resources held by the unit. Called once, after `cleanup`.
    async fn release(&self) {}
}

#[async_trait]
impl CodeUnit for Module {
    fn entry_point(&self, name: &str) -> Option<EntryPoint> {
        self.resolve(name).cloned()
    }

    fn entry_points(&self) -> Vec<EntryDescriptor> {
        self.descriptors()
    }
}

/// Where a plugin's code runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    /// Child process speaking the plugin IPC protocol
    #[default]
    Process,
    /// Module compiled into the host
    Builtin,
}

impl Runtime {
    pub fn as_str(self) -> &'static str {
        match self {
            Runtime::Process => "process",
            Runtime::Builtin => "builtin",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Turns persisted code into a live [`CodeUnit`]
#[derive(Clone, Default)]
pub struct PluginLoader {
    catalog: PluginCatalog,
    process: ProcessSettings,
}

impl PluginLoader {
    pub fn new(catalog: PluginCatalog, process: ProcessSettings) -> Self {
        Self { catalog, process }
    }

    pub fn catalog(&self) -> &PluginCatalog {
        &self.catalog
    }

    /// Load `code` for `plugin_id` under `runtime`
    pub async fn load(
        &self,
        plugin_id: &str,
        runtime: Runtime,
        code: &StoredCode,
    ) -> HostResult<Arc<dyn CodeUnit>> {
        match runtime {
            Runtime::Builtin => {
                let name = code.text.trim();
                let module = self.catalog.instantiate(name).ok_or_else(|| {
                    HostError::load(
                        plugin_id,
                        format!(
                            "no builtin module named `{}` (available: {})",
                            name,
                            self.catalog.names().join(", ")
                        ),
                    )
                })?;
                Ok(Arc::new(module))
            }
            Runtime::Process => {
                let unit = ProcessUnit::spawn(plugin_id, &code.path, &self.process).await?;
                Ok(Arc::new(unit))
            }
        }
    }
}
