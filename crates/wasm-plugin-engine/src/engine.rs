//! Engine façade: discovery, registration, lifecycle and dispatch.
//!
//! The [`Engine`] composes the registry, the sandbox runtime, the
//! host-function bridge and the event bus behind one API: `load`, `start`,
//! `register_plugin`, `register_host_anchor`, `call_hook`,
//! `get_hooks_for_anchor`, `get_plugins`.
//!
//! ## Load pipeline
//!
//! `load` walks a directory for `.tar.gz`/`.zip` archives, expands each
//! into the extraction directory, parses every extracted `*.yaml` manifest,
//! pairs it with the sibling `*.wasm` module and registers the plugin.
//! Per-plugin failures are logged and never abort the batch — one broken
//! plugin must not keep the rest from loading.
//!
//! ## Locking
//!
//! All registry mutations happen under the write lock; reads take the read
//! lock. Host-anchor callbacks and event-bus dispatch run strictly after
//! the lock is released, and guest invocation never happens under it.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use extism::Function;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::archive::extract_archive;
use crate::archive::find_files_with_extensions;
use crate::archive::plugin_name_from_archive;
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::events::EventBus;
use crate::events::PLUGIN_INSTANTIATED;
use crate::events::PLUGIN_REGISTERED;
use crate::events::PLUGIN_RESOLVED;
use crate::host::engine_host_functions;
use crate::manifest::Anchor;
use crate::manifest::Hook;
use crate::manifest::PluginManifest;
use crate::manifest::parse_manifest;
use crate::registry::HostAnchorCallback;
use crate::registry::PluginKey;
use crate::registry::PluginSnapshot;
use crate::registry::PluginState;
use crate::registry::Registry;
use crate::registry::ResolveOutcome;
use crate::runtime::Instance;
use crate::runtime::Runtime;
use crate::version::is_valid_semver;

/// Minimum severity of engine diagnostics about guest traffic.
///
/// `Debug` additionally logs every bridge call (hook ids, payload sizes,
/// requested paths).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Engine construction options.
pub struct EngineOptions {
    /// Additional host functions offered to guests alongside the engine's
    /// `extism:host/pluginengine` table.
    pub host_functions: Vec<Function>,
    /// Directory plugin archives are expanded into. Created (mode `0755`)
    /// if absent.
    pub extraction_dir: PathBuf,
    pub log_level: LogLevel,
    /// Wall-clock budget for a single guest call. `None` disables the
    /// limit.
    pub call_timeout: Option<Duration>,
    /// Parent cancellation token. The engine derives a child token from it,
    /// so cancelling the parent aborts every in-flight guest call while the
    /// registry and live instances stay intact.
    pub cancellation: Option<CancellationToken>,
}

impl EngineOptions {
    /// Options with the default log level and a 30 second guest-call budget.
    pub fn new(extraction_dir: impl Into<PathBuf>) -> Self {
        Self {
            host_functions: Vec::new(),
            extraction_dir: extraction_dir.into(),
            log_level: LogLevel::default(),
            call_timeout: Some(Duration::from_secs(30)),
            cancellation: None,
        }
    }

    pub fn with_host_functions(mut self, functions: Vec<Function>) -> Self {
        self.host_functions = functions;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Shared engine internals. The host-function bridge reaches these through
/// a `Weak`, so the engine's own compiled-module cache cannot keep it
/// alive.
pub(crate) struct EngineInner {
    pub(crate) registry: RwLock<Registry>,
    pub(crate) runtime: Runtime,
    pub(crate) events: EventBus,
    /// User-provided host functions plus the engine bridge table.
    host_functions: Vec<Function>,
    extraction_dir: PathBuf,
    pub(crate) log_level: LogLevel,
    cancel: CancellationToken,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        // Wakes the cancellation watcher so it exits with the engine.
        self.cancel.cancel();
    }
}

/// The plugin engine.
///
/// Cloneable handle: all clones share the same registry, runtime and event
/// bus. Construct with [`Engine::new`] inside a tokio runtime (the
/// cancellation watcher is spawned there), then `load` and `start`.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build an engine.
    ///
    /// Creates the extraction directory if absent and spawns the
    /// cancellation watcher task. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `Config` when the extraction directory cannot be created.
    pub fn new(options: EngineOptions) -> Result<Engine, EngineError> {
        let extraction_dir = options.extraction_dir;
        std::fs::create_dir_all(&extraction_dir).map_err(|source| EngineError::Config {
            path: extraction_dir.clone(),
            source,
        })?;
        set_dir_mode(&extraction_dir).map_err(|source| EngineError::Config {
            path: extraction_dir.clone(),
            source,
        })?;

        let cancel = match &options.cancellation {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| {
            let mut host_functions = options.host_functions;
            host_functions.extend(engine_host_functions(weak.clone()));
            EngineInner {
                registry: RwLock::new(Registry::new()),
                runtime: Runtime::new(cancel.clone(), options.call_timeout),
                events: EventBus::new(),
                host_functions,
                extraction_dir,
                log_level: options.log_level,
                cancel: cancel.clone(),
            }
        });

        // Abort in-flight guest calls when the token fires. Holding a Weak
        // lets the watcher outlive nothing: it exits when the engine drops.
        let watcher = Arc::downgrade(&inner);
        tokio::spawn(async move {
            cancel.cancelled().await;
            if let Some(inner) = watcher.upgrade() {
                inner.runtime.cancel_inflight();
            }
        });

        info!(extraction_dir = %inner.extraction_dir.display(), "plugin engine ready");
        Ok(Engine { inner })
    }

    /// Discover and register every plugin bundle under `path`.
    ///
    /// `path` should be an absolute filesystem path; `http(s)` URLs are
    /// recognized but deferred — they log a warning and load nothing.
    /// Archives that fail to extract and manifests that fail to parse are
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// `Archive` when `path` itself cannot be walked.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let path = path.as_ref().to_path_buf();
        if path.to_string_lossy().to_ascii_lowercase().starts_with("http") {
            warn!(url = %path.display(), "URL plugin sources are not supported yet; nothing loaded");
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.load_from_path(&path))
            .await
            .map_err(|e| EngineError::Panicked(e.to_string()))?
    }

    /// Instantiate every plugin registered with `loadOnStart`. Failures are
    /// logged per plugin and never abort the sweep.
    pub async fn start(&self) -> Result<(), EngineError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.start_all())
            .await
            .map_err(|e| EngineError::Panicked(e.to_string()))
    }

    /// Register a plugin manifest paired with the path to its `.wasm`
    /// module, replacing any prior plugin at the same `(id, version)`.
    ///
    /// # Errors
    ///
    /// `Manifest` when the id is empty or the version is not `x.y.z`.
    pub fn register_plugin(
        &self,
        manifest: PluginManifest,
        module_path: impl Into<PathBuf>,
    ) -> Result<(), EngineError> {
        self.inner.register_plugin(manifest, module_path.into())
    }

    /// Register a host-provided anchor. `callback` is invoked — outside the
    /// registry lock — with the anchor's full bound-hook list whenever new
    /// hooks bind to it.
    ///
    /// # Errors
    ///
    /// `Manifest` when `id` or `name` is empty.
    pub fn register_host_anchor(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        callback: impl Fn(&[Hook]) -> Result<(), EngineError> + Send + Sync + 'static,
    ) -> Result<(), EngineError> {
        let anchor = Anchor::new(id, name, description, Vec::new()).ok_or_else(|| EngineError::Manifest {
            origin: "host anchor".to_string(),
            message: "anchor id and name must be non-empty".to_string(),
        })?;
        let callback: HostAnchorCallback = Arc::new(callback);
        let outcome = self.inner.registry.write().register_host_anchor(anchor, callback);
        self.inner.after_resolve(outcome);
        Ok(())
    }

    /// Dispatch `data` to the guest function behind `hook_id`, instantiating
    /// the owning plugin first if needed, and return the guest's response
    /// bytes.
    ///
    /// # Errors
    ///
    /// `UnknownHook` when no callable, bound hook has that id;
    /// `Instantiation`/`Dispatch` when the sandbox fails; `Cancelled` when
    /// the engine token fires mid-call.
    pub async fn call_hook(&self, hook_id: &str, data: &[u8]) -> Result<Vec<u8>, EngineError> {
        if self.inner.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let inner = Arc::clone(&self.inner);
        let hook_id = hook_id.to_string();
        let data = data.to_vec();
        let task = tokio::task::spawn_blocking(move || inner.dispatch_hook(&hook_id, &data));
        tokio::select! {
            () = self.inner.cancel.cancelled() => Err(EngineError::Cancelled),
            result = task => result.map_err(|e| EngineError::Panicked(e.to_string()))?,
        }
    }

    /// The hook for `hook_id`, iff it is bound to an anchor.
    pub fn get_hook(&self, hook_id: &str) -> Option<Hook> {
        self.inner.registry.read().get_hook(hook_id)
    }

    /// All bound hooks across every anchor declaration sharing `anchor_id`,
    /// in deterministic registration order. Empty when nothing is bound.
    pub fn get_hooks_for_anchor(&self, anchor_id: &str) -> Vec<Hook> {
        self.inner.registry.read().get_hooks_for_anchor(anchor_id)
    }

    /// Read-only view of the registry keyed by `(id, version)`.
    pub fn get_plugins(&self) -> std::collections::BTreeMap<PluginKey, PluginSnapshot> {
        self.inner.registry.read().snapshot()
    }

    /// Lifecycle event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Cancel in-flight guest calls, drop every sandbox instance, clear the
    /// compilation cache and tear down the callable index. The registry's
    /// plugin records survive for inspection; dispatch is over.
    pub fn shutdown(&self) {
        info!("plugin engine shutting down");
        self.inner.cancel.cancel();
        self.inner.runtime.reset();
        self.inner.registry.write().teardown();
    }
}

impl EngineInner {
    fn register_plugin(&self, manifest: PluginManifest, module_path: PathBuf) -> Result<(), EngineError> {
        if manifest.id.is_empty() {
            return Err(EngineError::Manifest {
                origin: module_path.display().to_string(),
                message: "plugin id must be non-empty".to_string(),
            });
        }
        if !is_valid_semver(&manifest.version) {
            return Err(EngineError::Manifest {
                origin: module_path.display().to_string(),
                message: format!("plugin version {:?} is not a valid x.y.z version", manifest.version),
            });
        }

        let key = PluginKey::new(manifest.id.clone(), manifest.version.clone());
        let outcome = self.registry.write().register_plugin(manifest, module_path);
        // A replaced plugin's old instance must not serve the new module.
        self.runtime.remove(&key);
        self.events.emit(&EngineEvent::new(PLUGIN_REGISTERED, key.to_string()));
        self.after_resolve(outcome);
        Ok(())
    }

    /// Post-lock follow-up for a resolve pass: lifecycle events and
    /// host-anchor callbacks.
    fn after_resolve(&self, outcome: ResolveOutcome) {
        for key in outcome.newly_resolved {
            self.events.emit(&EngineEvent::new(PLUGIN_RESOLVED, key.to_string()));
        }
        for dispatch in outcome.host_dispatches {
            if let Err(e) = (dispatch.callback)(&dispatch.hooks) {
                warn!(anchor = %dispatch.anchor_id, error = %e, "host anchor callback failed");
            }
        }
    }

    /// Walk `path` for plugin archives and register everything extractable.
    fn load_from_path(&self, path: &Path) -> Result<(), EngineError> {
        let archives =
            find_files_with_extensions(path, &[".tar.gz", ".zip"]).map_err(|e| EngineError::Archive {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        if archives.is_empty() {
            debug!(path = %path.display(), "no plugin archives found");
            return Ok(());
        }
        info!(path = %path.display(), archives = archives.len(), "loading plugin archives");

        for archive in archives {
            let Some(name) = plugin_name_from_archive(&archive) else {
                warn!(archive = %archive.display(), "skipping file without a plugin archive name");
                continue;
            };
            let output_dir = self.extraction_dir.join(&name);
            if let Err(e) = extract_archive(&archive, &output_dir) {
                warn!(archive = %archive.display(), error = %e, "failed to extract plugin archive, skipping");
                continue;
            }

            let manifests = match find_files_with_extensions(&output_dir, &[".yaml"]) {
                Ok(manifests) => manifests,
                Err(e) => {
                    warn!(dir = %output_dir.display(), error = %e, "failed to scan extracted plugin, skipping");
                    continue;
                }
            };
            for manifest_path in manifests {
                if let Err(e) = self.load_manifest(&manifest_path) {
                    warn!(manifest = %manifest_path.display(), error = %e, "failed to load plugin manifest, skipping");
                }
            }
        }
        Ok(())
    }

    /// Parse one extracted manifest, pair it with its sibling `.wasm`
    /// module and register the plugin.
    fn load_manifest(&self, manifest_path: &Path) -> Result<(), EngineError> {
        let origin = manifest_path.display().to_string();
        let bytes = std::fs::read(manifest_path).map_err(|e| EngineError::Manifest {
            origin: origin.clone(),
            message: e.to_string(),
        })?;
        let manifest = parse_manifest(&bytes).map_err(|e| EngineError::Manifest {
            origin: origin.clone(),
            message: e.to_string(),
        })?;

        let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));
        let modules = find_files_with_extensions(base, &[".wasm"]).map_err(|e| EngineError::Manifest {
            origin: origin.clone(),
            message: e.to_string(),
        })?;
        let Some(module_path) = modules.first() else {
            return Err(EngineError::Manifest {
                origin,
                message: "no sibling .wasm module next to manifest".to_string(),
            });
        };

        self.register_plugin(manifest, module_path.clone())
    }

    /// Eagerly instantiate every `loadOnStart` plugin.
    fn start_all(&self) {
        let eager = self.registry.read().eager_plugins();
        for (key, module_path) in eager {
            match self.ensure_instance(&key, &module_path) {
                Ok(_) => debug!(plugin = %key, "eager plugin ready"),
                Err(e) => warn!(plugin = %key, error = %e, "failed to instantiate plugin on start"),
            }
        }
    }

    /// Synchronous dispatch core, shared by the async façade and the
    /// `CallHook` host function (which already runs on a blocking thread).
    ///
    /// Takes the registry lock only to resolve the callable, releases it,
    /// then instantiates and invokes the guest — so a guest handling this
    /// call may itself re-enter `CallHook`.
    pub(crate) fn dispatch_hook(&self, hook_id: &str, data: &[u8]) -> Result<Vec<u8>, EngineError> {
        let target = {
            // Recursive read: this path runs inside guest calls that may nest.
            let registry = self.registry.read_recursive();
            registry.dispatch_target(hook_id)
        };
        let Some(target) = target else {
            return Err(EngineError::UnknownHook(hook_id.to_string()));
        };

        let instance = self.ensure_instance(&target.plugin, &target.module_path)?;
        let mut guard = instance.lock();
        guard
            .call::<&[u8], Vec<u8>>(&target.func, data)
            .map_err(|e| EngineError::Dispatch {
                func: target.func.clone(),
                message: e.to_string(),
            })
    }

    /// Bridge read path for `GetHooksForAnchor`.
    pub(crate) fn hooks_for_anchor(&self, anchor_id: &str) -> Vec<Hook> {
        self.registry.read_recursive().get_hooks_for_anchor(anchor_id)
    }

    /// The live instance for `key`, instantiating lazily. Updates the
    /// plugin's registry state and publishes the instantiation event.
    fn ensure_instance(&self, key: &PluginKey, module_path: &Path) -> Result<Instance, EngineError> {
        match self.runtime.instantiate(key, module_path, &self.host_functions) {
            Ok((instance, created)) => {
                if created {
                    self.registry.write().set_state(key, PluginState::Instantiated);
                    self.events.emit(&EngineEvent::new(PLUGIN_INSTANTIATED, key.to_string()));
                }
                Ok(instance)
            }
            Err(e) => {
                // Sticky marker; the absence of an instance means the next
                // dispatch still retries.
                self.registry.write().set_state(key, PluginState::Failed);
                Err(e)
            }
        }
    }
}

#[cfg(unix)]
fn set_dir_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
