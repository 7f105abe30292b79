//! Sandbox runtime: compiled-module cache and live plugin instances.
//!
//! Guest modules are compiled once per module path into an
//! [`extism::CompiledPlugin`] that is shared by every instantiation for the
//! engine's lifetime, so reloading or re-dispatching into the same module
//! reuses the compiled artifact. Instances live behind `Arc<Mutex<…>>`
//! because `extism::Plugin::call` takes `&mut self`; guest calls on the
//! same instance are therefore serialized, while calls into different
//! plugins proceed independently (which is what makes re-entrant
//! `CallHook` chains across plugins work).
//!
//! Instantiation is at-most-once per `(id, version)` between resets: a
//! second request for a live plugin returns the existing instance without
//! calling the guest `start` export again.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use extism::CancelHandle;
use extism::CompiledPlugin;
use extism::Function;
use extism::Manifest;
use extism::Plugin;
use extism::PluginBuilder;
use extism::Wasm;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::EngineError;
use crate::registry::PluginKey;

/// A live sandbox instance. The mutex serializes guest calls; a hook must
/// not `CallHook` back into its own plugin.
pub(crate) type Instance = Arc<Mutex<Plugin>>;

/// Owns compiled guest modules and live sandbox instances.
pub(crate) struct Runtime {
    /// Compiled modules keyed by module path. Engine-lifetime cache.
    compiled: Mutex<HashMap<PathBuf, Arc<CompiledPlugin>>>,
    /// Live instances keyed by plugin `(id, version)`.
    instances: Mutex<HashMap<PluginKey, Instance>>,
    /// Cancel handles for every instance ever created, fired when the
    /// engine's cancellation token fires.
    cancel_handles: Mutex<Vec<CancelHandle>>,
    cancel: CancellationToken,
    /// Wall-clock budget for a single guest call, baked into the Extism
    /// manifest at compile time.
    call_timeout: Option<Duration>,
}

impl Runtime {
    pub(crate) fn new(cancel: CancellationToken, call_timeout: Option<Duration>) -> Self {
        Self {
            compiled: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            cancel_handles: Mutex::new(Vec::new()),
            cancel,
            call_timeout,
        }
    }

    /// The live instance for `key`, if one exists.
    pub(crate) fn instance(&self, key: &PluginKey) -> Option<Instance> {
        self.instances.lock().get(key).map(Arc::clone)
    }

    /// Construct (or return) the sandbox instance for `key`.
    ///
    /// On first construction the guest `start` export is called exactly
    /// once with no arguments; a `start` failure is logged but leaves the
    /// instance usable. Returns `(instance, created)` where `created` is
    /// false when an existing instance was reused.
    ///
    /// # Errors
    ///
    /// `Instantiation` when module compilation or sandbox construction
    /// fails; `Cancelled` after the engine's token has fired.
    pub(crate) fn instantiate(
        &self,
        key: &PluginKey,
        module_path: &Path,
        host_functions: &[Function],
    ) -> Result<(Instance, bool), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if let Some(existing) = self.instance(key) {
            return Ok((existing, false));
        }

        let compiled = self.compiled_module(key, module_path, host_functions)?;
        let plugin = Plugin::new_from_compiled(&compiled).map_err(|e| EngineError::Instantiation {
            plugin: key.to_string(),
            message: e.to_string(),
        })?;
        self.cancel_handles.lock().push(plugin.cancel_handle());
        let instance = Arc::new(Mutex::new(plugin));

        // A concurrent instantiation may have won the race; first insert wins
        // so the guest sees exactly one `start`.
        let instance = match self.instances.lock().entry(key.clone()) {
            Entry::Occupied(entry) => return Ok((Arc::clone(entry.get()), false)),
            Entry::Vacant(entry) => Arc::clone(entry.insert(instance)),
        };

        info!(plugin = %key, module = %module_path.display(), "plugin instantiated");

        if let Err(e) = instance.lock().call::<Vec<u8>, Vec<u8>>("start", Vec::new()) {
            // Non-fatal: the instance stays usable for hook dispatch.
            warn!(plugin = %key, error = %e, "guest start export failed");
        }

        Ok((instance, true))
    }

    /// Compile the module at `module_path`, or reuse the cached artifact.
    fn compiled_module(
        &self,
        key: &PluginKey,
        module_path: &Path,
        host_functions: &[Function],
    ) -> Result<Arc<CompiledPlugin>, EngineError> {
        if let Some(cached) = self.compiled.lock().get(module_path) {
            debug!(plugin = %key, module = %module_path.display(), "reusing compiled module");
            return Ok(Arc::clone(cached));
        }

        let mut manifest = Manifest::new([Wasm::file(module_path)]);
        if let Some(timeout) = self.call_timeout {
            manifest = manifest.with_timeout(timeout);
        }
        let builder = PluginBuilder::new(manifest)
            .with_wasi(true)
            .with_functions(host_functions.iter().cloned());
        let compiled = Arc::new(CompiledPlugin::new(builder).map_err(|e| EngineError::Instantiation {
            plugin: key.to_string(),
            message: format!("failed to compile {}: {e}", module_path.display()),
        })?);

        // Keep the first compilation if another thread raced us here.
        Ok(Arc::clone(
            self.compiled.lock().entry(module_path.to_path_buf()).or_insert(compiled),
        ))
    }

    /// Drop the instance for `key`, if any. Used when a plugin is
    /// re-registered so the next dispatch loads the new module. The actual
    /// sandbox is freed once any in-flight guest call finishes.
    pub(crate) fn remove(&self, key: &PluginKey) {
        if self.instances.lock().remove(key).is_some() {
            debug!(plugin = %key, "dropped sandbox instance");
        }
    }

    /// Abort every in-flight guest call. Wired to the engine's cancellation
    /// token; registered plugins and the registry are unaffected.
    pub(crate) fn cancel_inflight(&self) {
        let handles = self.cancel_handles.lock();
        for handle in handles.iter() {
            if let Err(e) = handle.cancel() {
                debug!(error = %e, "cancel handle rejected");
            }
        }
    }

    /// Release every instance, cancel handle and compiled module. Called at
    /// engine shutdown.
    pub(crate) fn reset(&self) {
        self.instances.lock().clear();
        self.cancel_handles.lock().clear();
        self.compiled.lock().clear();
    }
}
