//! Plugin registry and hook↔anchor resolver.
//!
//! The registry owns every plugin, anchor and hook record. Anchors and the
//! hook indexes never hold references into plugin records — they hold
//! [`HookRef`] handles (plugin key + record epoch + declaration index), so
//! the mutual plugin↔anchor↔hook references are id lookups and cannot form
//! ownership cycles. The epoch makes handles minted before a
//! re-registration detectably stale.
//!
//! ## Resolution
//!
//! Hooks enter an unresolved queue at registration. Every registration (of
//! a plugin or a host anchor) runs an incremental, idempotent resolve pass:
//! each queued hook binds to all anchor declarations sharing its target id,
//! or is carried over to wait for an anchor that has not arrived yet. A
//! plugin is promoted to resolved once every hook it declared is bound and
//! every dependency it declared is present at an acceptable version.
//!
//! The registry itself is lock-free; the engine guards it with a
//! reader-writer lock and invokes host-anchor callbacks returned from
//! mutations only after releasing it.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::EngineError;
use crate::manifest::Anchor;
use crate::manifest::Dependency;
use crate::manifest::Hook;
use crate::manifest::PluginManifest;
use crate::version::version_in_range;

/// Composite primary key for plugins: `(id, version)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PluginKey {
    pub id: String,
    pub version: String,
}

impl PluginKey {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Runtime state of a registered plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PluginState {
    /// Registered, no sandbox instance yet.
    #[default]
    Unloaded,
    /// Sandbox live; the guest `start` export has been called.
    Instantiated,
    /// The last instantiation attempt failed. Sticky until re-registration,
    /// but dispatches still retry.
    Failed,
}

/// Read-only view of one registered plugin.
#[derive(Debug, Clone)]
pub struct PluginSnapshot {
    pub name: String,
    pub description: String,
    pub load_on_start: bool,
    pub module_path: PathBuf,
    /// Every declared hook bound and every dependency satisfied.
    pub resolved: bool,
    pub state: PluginState,
}

/// Native callback carried by a host-provided anchor.
///
/// Invoked with the anchor's current bound-hook list whenever a resolve
/// pass binds new hooks to it. Always called outside the registry lock.
pub type HostAnchorCallback = Arc<dyn Fn(&[Hook]) -> Result<(), EngineError> + Send + Sync>;

/// Stable handle to one hook declaration inside one plugin record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HookRef {
    plugin: PluginKey,
    /// Epoch of the plugin record the handle was minted against.
    epoch: u64,
    /// Index into the record's declared hook list.
    index: usize,
}

/// One registered plugin.
struct PluginRecord {
    manifest: PluginManifest,
    module_path: PathBuf,
    epoch: u64,
    resolved: bool,
    state: PluginState,
    /// Per-declared-hook bound flags, parallel to `manifest.hooks`.
    hook_bound: Vec<bool>,
}

/// One anchor declaration. Multiple plugins may declare anchors sharing an
/// id; the declarations coexist in the id's entry list.
struct AnchorEntry {
    anchor: Anchor,
    /// Declaring plugin, or `None` for host-provided anchors.
    owner: Option<PluginKey>,
    /// Native callback for host-provided anchors.
    callback: Option<HostAnchorCallback>,
    /// Hooks bound to this declaration, in binding order.
    hooks: Vec<HookRef>,
}

/// A host-anchor callback due to be invoked after a resolve pass, paired
/// with the anchor's bound-hook list at the time of the pass.
pub(crate) struct HostDispatch {
    pub(crate) anchor_id: String,
    pub(crate) callback: HostAnchorCallback,
    pub(crate) hooks: Vec<Hook>,
}

/// What a mutation did, for the engine to act on after releasing the lock.
#[derive(Default)]
pub(crate) struct ResolveOutcome {
    /// Host-anchor callbacks that gained hooks during the pass.
    pub(crate) host_dispatches: Vec<HostDispatch>,
    /// Plugins promoted to resolved during the pass.
    pub(crate) newly_resolved: Vec<PluginKey>,
}

/// Everything the bridge needs to dispatch one hook call.
#[derive(Debug, Clone)]
pub(crate) struct DispatchTarget {
    pub(crate) plugin: PluginKey,
    pub(crate) func: String,
    pub(crate) module_path: PathBuf,
}

/// Catalog of plugins keyed by `(id, version)` with anchor and hook indexes.
#[derive(Default)]
pub(crate) struct Registry {
    plugins: BTreeMap<PluginKey, PluginRecord>,
    /// Anchor declarations by anchor id, in registration order.
    anchors: HashMap<String, Vec<AnchorEntry>>,
    /// Resolved hooks by hook id. First registration wins.
    resolved: HashMap<String, HookRef>,
    /// Callable index: hook id → owning plugin's hook handle. One-to-one,
    /// first registration wins. Lives for the engine's lifetime.
    callable: HashMap<String, HookRef>,
    /// Hooks awaiting an anchor, in insertion order.
    unresolved: Vec<HookRef>,
    next_epoch: u64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a plugin manifest together with the path to its sandbox
    /// module, replacing any prior plugin at the same `(id, version)`.
    ///
    /// Invalid anchor/hook declarations are dropped with a warning. Each
    /// surviving hook is queued unresolved and, if no live hook already
    /// claims its id, recorded in the callable index. A resolve pass runs
    /// before returning.
    pub(crate) fn register_plugin(
        &mut self,
        mut manifest: PluginManifest,
        module_path: PathBuf,
    ) -> ResolveOutcome {
        let key = PluginKey::new(manifest.id.clone(), manifest.version.clone());

        // Normalize: drop declarations missing required fields.
        manifest.anchors.retain(|anchor| {
            let valid = anchor.is_valid();
            if !valid {
                warn!(
                    plugin = %key,
                    anchor = %anchor.id,
                    "dropping anchor declaration with missing required fields"
                );
            }
            valid
        });
        manifest.hooks.retain(|hook| {
            let valid = hook.is_valid();
            if !valid {
                warn!(
                    plugin = %key,
                    hook = %hook.id,
                    "dropping hook declaration with missing required fields"
                );
            }
            valid
        });

        // Re-registration wholly replaces the prior record: scrub its hooks
        // from every index and anchor hook list first.
        if self.plugins.remove(&key).is_some() {
            info!(plugin = %key, "replacing previously registered plugin");
            self.purge_plugin(&key);
        }

        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let hook_count = manifest.hooks.len();
        let record = PluginRecord {
            module_path,
            epoch,
            resolved: false,
            state: PluginState::Unloaded,
            hook_bound: vec![false; hook_count],
            manifest,
        };

        for (index, hook) in record.manifest.hooks.iter().enumerate() {
            let href = HookRef {
                plugin: key.clone(),
                epoch,
                index,
            };
            match self.callable.get(&hook.id) {
                Some(existing) => {
                    warn!(
                        hook = %hook.id,
                        plugin = %key,
                        first_owner = %existing.plugin,
                        "duplicate hook id; first registration keeps the callable slot"
                    );
                }
                None => {
                    self.callable.insert(hook.id.clone(), href.clone());
                }
            }
            self.unresolved.push(href);
        }

        for anchor in &record.manifest.anchors {
            self.anchors.entry(anchor.id.clone()).or_default().push(AnchorEntry {
                anchor: anchor.clone(),
                owner: Some(key.clone()),
                callback: None,
                hooks: Vec::new(),
            });
        }

        debug!(
            plugin = %key,
            anchors = record.manifest.anchors.len(),
            hooks = record.manifest.hooks.len(),
            "plugin registered"
        );
        self.plugins.insert(key, record);

        self.resolve()
    }

    /// Register a host-provided anchor with a native callback, then resolve.
    pub(crate) fn register_host_anchor(
        &mut self,
        anchor: Anchor,
        callback: HostAnchorCallback,
    ) -> ResolveOutcome {
        info!(anchor = %anchor.id, "host anchor registered");
        self.anchors.entry(anchor.id.clone()).or_default().push(AnchorEntry {
            anchor,
            owner: None,
            callback: Some(callback),
            hooks: Vec::new(),
        });
        self.resolve()
    }

    /// Bind queued hooks to present anchors and promote plugins whose hooks
    /// and dependencies are all satisfied. Incremental and idempotent:
    /// hooks whose anchors have not arrived are carried to the next pass.
    fn resolve(&mut self) -> ResolveOutcome {
        let pending = std::mem::take(&mut self.unresolved);
        let mut leftover = Vec::new();
        // (anchor id, entry index) pairs of host anchors that gained hooks.
        let mut touched_hosts: Vec<(String, usize)> = Vec::new();

        for href in pending {
            let Some(hook) = self.hook_decl(&href).cloned() else {
                // Owner was replaced since the hook was queued.
                continue;
            };
            if self.is_bound(&href) {
                continue;
            }

            let mut bound = false;
            if let Some(entries) = self.anchors.get_mut(&hook.anchor_id)
                && !entries.is_empty()
            {
                for (entry_index, entry) in entries.iter_mut().enumerate() {
                    if !entry.hooks.contains(&href) {
                        entry.hooks.push(href.clone());
                        if entry.callback.is_some()
                            && !touched_hosts.contains(&(hook.anchor_id.clone(), entry_index))
                        {
                            touched_hosts.push((hook.anchor_id.clone(), entry_index));
                        }
                    }
                }
                bound = true;
            }

            if bound {
                if let Some(record) = self.plugins.get_mut(&href.plugin)
                    && let Some(flag) = record.hook_bound.get_mut(href.index)
                {
                    *flag = true;
                }
                // First registration wins, matching the callable index.
                self.resolved.entry(hook.id.clone()).or_insert_with(|| href.clone());
                debug!(hook = %hook.id, anchor = %hook.anchor_id, "hook bound to anchor");
            } else {
                leftover.push(href);
            }
        }

        self.unresolved = leftover;

        // Promote (or, after a re-registration, demote) plugins.
        let mut transitions = Vec::new();
        for (key, record) in &self.plugins {
            let hooks_ok = record.hook_bound.iter().all(|bound| *bound);
            let deps_ok = record
                .manifest
                .anchors
                .iter()
                .flat_map(|anchor| &anchor.dependencies)
                .chain(record.manifest.hooks.iter().flat_map(|hook| &hook.dependencies))
                .all(|dep| self.dependency_present(dep));
            let resolved = hooks_ok && deps_ok;
            if resolved != record.resolved {
                transitions.push((key.clone(), resolved));
            }
        }

        let mut outcome = ResolveOutcome::default();
        for (key, resolved) in transitions {
            if let Some(record) = self.plugins.get_mut(&key) {
                record.resolved = resolved;
                if resolved {
                    info!(plugin = %key, "plugin resolved");
                    outcome.newly_resolved.push(key);
                }
            }
        }

        for (anchor_id, entry_index) in touched_hosts {
            let Some(entry) = self.anchors.get(&anchor_id).and_then(|entries| entries.get(entry_index))
            else {
                continue;
            };
            let Some(callback) = entry.callback.clone() else {
                continue;
            };
            let hooks = entry.hooks.iter().filter_map(|href| self.hook_decl(href)).cloned().collect();
            outcome.host_dispatches.push(HostDispatch {
                anchor_id: entry.anchor.id.clone(),
                callback,
                hooks,
            });
        }

        outcome
    }

    /// Remove every trace of a replaced plugin record: callable and resolved
    /// index entries, queued hooks, its own bound hooks in anchor hook
    /// lists, and its anchor declarations.
    ///
    /// Hooks from other plugins are left alone: binding is terminal, and a
    /// hook becomes unbound only when its own declaring plugin is
    /// re-registered — never through an unrelated plugin's replacement,
    /// even one that owned an anchor declaration the hook was bound to.
    fn purge_plugin(&mut self, key: &PluginKey) {
        self.callable.retain(|_, href| &href.plugin != key);
        self.resolved.retain(|_, href| &href.plugin != key);
        self.unresolved.retain(|href| &href.plugin != key);

        for entries in self.anchors.values_mut() {
            for entry in entries.iter_mut() {
                entry.hooks.retain(|href| &href.plugin != key);
            }
            entries.retain(|entry| entry.owner.as_ref() != Some(key));
        }
        self.anchors.retain(|_, entries| !entries.is_empty());
    }

    /// Look up a hook declaration through a handle, rejecting stale epochs.
    fn hook_decl(&self, href: &HookRef) -> Option<&Hook> {
        let record = self.plugins.get(&href.plugin)?;
        if record.epoch != href.epoch {
            return None;
        }
        record.manifest.hooks.get(href.index)
    }

    fn is_bound(&self, href: &HookRef) -> bool {
        self.plugins
            .get(&href.plugin)
            .filter(|record| record.epoch == href.epoch)
            .and_then(|record| record.hook_bound.get(href.index))
            .copied()
            .unwrap_or(false)
    }

    fn dependency_present(&self, dep: &Dependency) -> bool {
        self.plugins
            .keys()
            .any(|key| key.id == dep.plugin_id && version_in_range(&key.version, &dep.min_version, &dep.max_version))
    }

    /// The hook for `hook_id`, iff it has been bound to an anchor.
    pub(crate) fn get_hook(&self, hook_id: &str) -> Option<Hook> {
        let href = self.resolved.get(hook_id)?;
        self.hook_decl(href).cloned()
    }

    /// All bound hooks across every anchor declaration sharing `anchor_id`,
    /// concatenated in registration-then-binding order. Empty when nothing
    /// is bound — absence is not an error.
    pub(crate) fn get_hooks_for_anchor(&self, anchor_id: &str) -> Vec<Hook> {
        let Some(entries) = self.anchors.get(anchor_id) else {
            return Vec::new();
        };
        entries
            .iter()
            .flat_map(|entry| &entry.hooks)
            .filter_map(|href| self.hook_decl(href))
            .cloned()
            .collect()
    }

    /// Resolve a hook id to its dispatch target. Only hooks that hold the
    /// callable slot *and* are bound to an anchor can be dispatched.
    pub(crate) fn dispatch_target(&self, hook_id: &str) -> Option<DispatchTarget> {
        let href = self.callable.get(hook_id)?;
        if !self.is_bound(href) {
            return None;
        }
        let func = self.hook_decl(href)?.func.clone();
        let record = self.plugins.get(&href.plugin)?;
        Some(DispatchTarget {
            plugin: href.plugin.clone(),
            func,
            module_path: record.module_path.clone(),
        })
    }

    /// Read-only view of the registry keyed by `(id, version)`.
    pub(crate) fn snapshot(&self) -> BTreeMap<PluginKey, PluginSnapshot> {
        self.plugins
            .iter()
            .map(|(key, record)| {
                (key.clone(), PluginSnapshot {
                    name: record.manifest.name.clone(),
                    description: record.manifest.description.clone(),
                    load_on_start: record.manifest.load_on_start,
                    module_path: record.module_path.clone(),
                    resolved: record.resolved,
                    state: record.state,
                })
            })
            .collect()
    }

    /// Plugins flagged for eager instantiation, with their module paths.
    pub(crate) fn eager_plugins(&self) -> Vec<(PluginKey, PathBuf)> {
        self.plugins
            .iter()
            .filter(|(_, record)| record.manifest.load_on_start)
            .map(|(key, record)| (key.clone(), record.module_path.clone()))
            .collect()
    }

    pub(crate) fn set_state(&mut self, key: &PluginKey, state: PluginState) {
        if let Some(record) = self.plugins.get_mut(key) {
            record.state = state;
        }
    }

    /// Drop the callable index. Called once at engine shutdown; dispatch is
    /// impossible afterwards.
    pub(crate) fn teardown(&mut self) {
        self.callable.clear();
    }
}
