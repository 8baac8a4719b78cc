//! Plugin Registry
//!
//! Owns every [`PluginInstance`], keyed by plugin id, and routes calls to them.
//! Load and unload of one id are serialized; different ids never wait on each
//! other.

use std::sync::Arc;

use conduit_plugin::{CallArgs, Dispatcher};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{HostError, HostResult};
use crate::install::RequirementInstaller;
use crate::instance::{PluginInstance, PluginSummary, StreamChannel, StreamSettings};
use crate::loader::{PluginLoader, Runtime};
use crate::store::{PluginStore, validate_plugin_id};

/// Parameters of a load
#[derive(Debug, Clone, Default)]
pub struct LoadRequest {
    /// Code text; `None` reuses the code persisted by an earlier load
    pub code: Option<String>,
    pub requirements: Vec<String>,
    /// Runtime override; `None` uses the registry default
    pub runtime: Option<Runtime>,
}

impl LoadRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Self::default()
        }
    }

    pub fn with_runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_requirements(mut self, requirements: Vec<String>) -> Self {
        self.requirements = requirements;
        self
    }
}

/// Registry of loaded plugins
pub struct PluginRegistry {
    plugins: DashMap<String, Arc<PluginInstance>>,
    lifecycle: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    loader: PluginLoader,
    store: PluginStore,
    installer: RequirementInstaller,
    dispatcher: Dispatcher,
    streams: StreamSettings,
    default_runtime: Runtime,
}

impl PluginRegistry {
    pub fn new(store: PluginStore) -> Self {
        Self {
            plugins: DashMap::new(),
            lifecycle: DashMap::new(),
            loader: PluginLoader::default(),
            store,
            installer: RequirementInstaller::disabled(),
            dispatcher: Dispatcher::default(),
            streams: StreamSettings::default(),
            default_runtime: Runtime::default(),
        }
    }

    pub fn with_loader(mut self, loader: PluginLoader) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_installer(mut self, installer: RequirementInstaller) -> Self {
        self.installer = installer;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_stream_settings(mut self, streams: StreamSettings) -> Self {
        self.streams = streams;
        self
    }

    pub fn with_default_runtime(mut self, runtime: Runtime) -> Self {
        self.default_runtime = runtime;
        self
    }

    fn lifecycle_lock(&self, plugin_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.lifecycle.entry(plugin_id.to_string()).or_default().value())
    }

    /// Drop the id's lock once no other operation holds or waits on it
    fn forget_lifecycle_lock(&self, plugin_id: &str) {
        self.lifecycle
            .remove_if(plugin_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn instance(&self, plugin_id: &str) -> HostResult<Arc<PluginInstance>> {
        self.get(plugin_id)
            .ok_or_else(|| HostError::NotLoaded(plugin_id.to_string()))
    }

    pub fn get(&self, plugin_id: &str) -> Option<Arc<PluginInstance>> {
        self.plugins.get(plugin_id).map(|p| Arc::clone(p.value()))
    }

    /// Persist, install, and load a plugin, replacing any instance under the same id.
    ///
    /// The previous instance is fully unloaded first; if the new load fails the
    /// id is left without an instance.
    pub async fn load(&self, plugin_id: &str, request: LoadRequest) -> HostResult<()> {
        validate_plugin_id(plugin_id)?;
        let lock = self.lifecycle_lock(plugin_id);
        let result = {
            let _guard = lock.lock().await;
            self.load_locked(plugin_id, request).await
        };
        drop(lock);
        self.forget_lifecycle_lock(plugin_id);
        result
    }

    async fn load_locked(&self, plugin_id: &str, request: LoadRequest) -> HostResult<()> {
        let runtime = request.runtime.unwrap_or(self.default_runtime);
        let code = match request.code {
            Some(text) => self.store.persist(plugin_id, &text).await?,
            None => self.store.load_existing(plugin_id).await?.ok_or_else(|| {
                HostError::load(plugin_id, "no code supplied and none persisted")
            })?,
        };

        if let Err(e) = self.installer.install(plugin_id, &request.requirements).await {
            warn!(plugin_id = %plugin_id, error = %e, "Requirement installation failed, continuing");
        }

        if let Some((_, previous)) = self.plugins.remove(plugin_id) {
            info!(plugin_id = %plugin_id, "Replacing loaded plugin");
            previous.unload().await;
        }

        let unit = self.loader.load(plugin_id, runtime, &code).await?;
        let instance = Arc::new(PluginInstance::new(
            plugin_id,
            runtime,
            unit,
            self.dispatcher.clone(),
            self.streams,
        ));
        instance.load().await?;

        self.plugins.insert(plugin_id.to_string(), instance);
        info!(plugin_id = %plugin_id, runtime = %runtime, "Plugin loaded");
        Ok(())
    }

    /// Unload a plugin. Returns false if it was not loaded.
    pub async fn unload(&self, plugin_id: &str) -> bool {
        let lock = self.lifecycle_lock(plugin_id);
        let unloaded = {
            let _guard = lock.lock().await;
            match self.plugins.remove(plugin_id) {
                Some((_, instance)) => {
                    instance.unload().await;
                    info!(plugin_id = %plugin_id, "Plugin unloaded");
                    true
                }
                None => false,
            }
        };
        drop(lock);
        self.forget_lifecycle_lock(plugin_id);
        unloaded
    }

    /// Invoke a single-value entry point of a loaded plugin
    pub async fn execute(&self, plugin_id: &str, function: &str, call: CallArgs) -> HostResult<Value> {
        self.instance(plugin_id)?.execute(function, call).await
    }

    /// Start a stream on a loaded plugin
    pub fn stream_start(
        &self,
        plugin_id: &str,
        stream_id: &str,
        function: &str,
        call: CallArgs,
    ) -> HostResult<StreamChannel> {
        self.instance(plugin_id)?.start_stream(stream_id, function, call)
    }

    /// Stop one stream. Returns false if the plugin or stream was not active.
    pub fn stream_stop(&self, plugin_id: &str, stream_id: &str) -> bool {
        self.get(plugin_id)
            .is_some_and(|instance| instance.stop_stream(stream_id))
    }

    /// Stop every stream of a plugin without unloading it
    pub fn stop_all(&self, plugin_id: &str) -> usize {
        self.get(plugin_id)
            .map(|instance| instance.stop_all())
            .unwrap_or(0)
    }

    /// Loaded plugin ids, sorted
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.plugins.iter().map(|p| p.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Status of every loaded plugin, sorted by id
    pub fn describe(&self) -> Vec<PluginSummary> {
        let instances: Vec<_> = self.plugins.iter().map(|p| Arc::clone(p.value())).collect();
        let mut summaries: Vec<_> = instances.iter().map(|p| p.summary()).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Unload every plugin
    pub async fn shutdown(&self) {
        let ids = self.list();
        info!("Unloading {} plugins", ids.len());
        for id in ids {
            self.unload(&id).await;
        }
    }
}
