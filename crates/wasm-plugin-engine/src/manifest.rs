//! Plugin manifest model.
//!
//! Pure data: [`PluginManifest`], [`Anchor`], [`Hook`] and [`Dependency`]
//! mirror the on-disk YAML shape (camelCase keys, opaque schema maps). The
//! only behavior here is constructors and validity predicates that enforce
//! the non-empty required fields; invalid declarations produce `None` and
//! are dropped during registry normalization.

use serde::Deserialize;
use serde::Serialize;

/// Opaque key→value schema passed through to guests untouched.
pub type Schema = serde_json::Map<String, serde_json::Value>;

/// A required presence of another plugin at a version within bounds.
///
/// Bounds are inclusive; an empty bound is unbounded on that side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    /// Id of the plugin that must be present.
    #[serde(default)]
    pub plugin_id: String,
    /// Lowest acceptable version, inclusive. Empty means unbounded.
    #[serde(default)]
    pub min_version: String,
    /// Highest acceptable version, inclusive. Empty means unbounded.
    #[serde(default)]
    pub max_version: String,
}

/// A named extension point declared by a plugin (or by the host).
///
/// Hooks from other plugins attach to an anchor by naming its id. The
/// schemas describe the payload an anchor sends when it calls its hooks and
/// the response it expects back; the engine passes them through without
/// interpretation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anchor {
    /// Unique namespaced identifier, matched by `Hook::anchor_id`.
    #[serde(default)]
    pub id: String,
    /// Display name, not to be confused with the id.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Payload schema the anchor sends to attached hooks.
    #[serde(default)]
    pub call_schema: Schema,
    /// Response schema the anchor expects back from a hook.
    #[serde(default)]
    pub response_schema: Schema,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl Anchor {
    /// Build an anchor, enforcing non-empty `id` and `name`.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        dependencies: Vec<Dependency>,
    ) -> Option<Anchor> {
        let anchor = Anchor {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            dependencies,
            ..Anchor::default()
        };
        anchor.is_valid().then_some(anchor)
    }

    /// Required fields present: non-empty `id` and `name`.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.name.is_empty()
    }
}

/// A contribution from one plugin that binds to an anchor.
///
/// `func` names the guest function the engine invokes when the anchor
/// dispatches. `metadata` carries static data an anchor can consume without
/// calling the hook (menu entries, help text, and the like).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    /// Unique identifier across all loaded plugins.
    #[serde(default)]
    pub id: String,
    /// Id of the anchor this hook attaches to.
    #[serde(default)]
    pub anchor_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Exported guest function symbol invoked on dispatch.
    #[serde(default)]
    pub func: String,
    #[serde(default)]
    pub metadata: Schema,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl Hook {
    /// Build a hook, enforcing non-empty `id`, `name`, `anchor_id` and `func`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        anchor_id: impl Into<String>,
        description: impl Into<String>,
        func: impl Into<String>,
        metadata: Schema,
        dependencies: Vec<Dependency>,
    ) -> Option<Hook> {
        let hook = Hook {
            id: id.into(),
            anchor_id: anchor_id.into(),
            name: name.into(),
            description: description.into(),
            func: func.into(),
            metadata,
            dependencies,
        };
        hook.is_valid().then_some(hook)
    }

    /// Required fields present: non-empty `id`, `name`, `anchor_id`, `func`.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.name.is_empty() && !self.anchor_id.is_empty() && !self.func.is_empty()
    }
}

/// The manifest a plugin ships next to its `.wasm` module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Unique plugin id; anchors declared by the plugin usually extend it.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Plugin version in `x.y.z` form.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Instantiate eagerly during `start` instead of on first dispatch.
    #[serde(default)]
    pub load_on_start: bool,
    /// Extension points this plugin offers to others.
    #[serde(default)]
    pub anchors: Vec<Anchor>,
    /// Contributions this plugin attaches to other plugins' anchors.
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

/// Parse a plugin manifest from raw bytes.
///
/// The on-disk format is YAML; since YAML is a superset of JSON this also
/// accepts JSON manifests.
pub fn parse_manifest(bytes: &[u8]) -> Result<PluginManifest, serde_yaml::Error> {
    serde_yaml::from_slice(bytes)
}
