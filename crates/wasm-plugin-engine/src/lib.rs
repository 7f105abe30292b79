//! WASM plugin engine with anchor/hook extension points.
//!
//! Plugins are Extism-compatible WASM modules shipped as `.tar.gz`/`.zip`
//! bundles containing a YAML manifest and the module itself. A plugin
//! declares **anchors** — named extension points with call/response
//! schemas — and **hooks** — guest functions that attach to anchors
//! declared by other plugins (or by the host application).
//!
//! ## Lifecycle
//!
//! 1. [`Engine::load`] walks a directory, extracts plugin bundles and
//!    registers each manifest with its `.wasm` module
//! 2. The resolver binds hooks to anchors as plugins arrive, in any order
//! 3. [`Engine::start`] eagerly instantiates `loadOnStart` plugins; every
//!    other plugin is instantiated on its first dispatch
//! 4. [`Engine::call_hook`] routes payloads to the guest function behind a
//!    hook id; guests can do the same through the `CallHook` host function
//!
//! ## Host Functions
//!
//! Guests import `CallHook`, `GetHooksForAnchor` and `LoadFile` from the
//! `extism:host/pluginengine` namespace; the host application can extend
//! the table through [`EngineOptions`]. See the `host` module for the
//! memory and locking discipline across the boundary.

pub mod archive;
mod engine;
mod error;
pub mod events;
mod host;
mod manifest;
mod registry;
mod runtime;
pub mod version;

pub use engine::Engine;
pub use engine::EngineOptions;
pub use engine::LogLevel;
pub use error::EngineError;
pub use events::EngineEvent;
pub use events::EventBus;
pub use host::HOST_NAMESPACE;
pub use manifest::Anchor;
pub use manifest::Dependency;
pub use manifest::Hook;
pub use manifest::PluginManifest;
pub use manifest::Schema;
pub use manifest::parse_manifest;
pub use registry::HostAnchorCallback;
pub use registry::PluginKey;
pub use registry::PluginSnapshot;
pub use registry::PluginState;
