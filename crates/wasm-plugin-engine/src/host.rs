//! Host-function bridge between guest plugins and the engine.
//!
//! Exposes three host functions under the `extism:host/pluginengine`
//! namespace, each taking and returning i64 offsets into the guest's
//! linear memory:
//!
//! - `LoadFile(pathOffset) → dataOffset` — read a host file into guest
//!   memory; I/O errors produce an empty byte range.
//! - `CallHook(hookIdOffset, dataOffset) → responseOffset` — dispatch a
//!   payload to the guest function behind a hook id, instantiating the
//!   owning plugin lazily; an unknown hook id yields offset 0.
//! - `GetHooksForAnchor(anchorIdOffset) → jsonOffset` — JSON-serialize the
//!   bound hooks of an anchor into guest memory; no hooks yields offset 0.
//!
//! ## Memory and locking discipline
//!
//! Incoming offsets are read-only snapshots: the bridge copies them out of
//! guest memory up front and never retains a guest reference past the call.
//! Outbound payloads are allocated through the calling guest's allocator
//! (`memory_new`) and reclaimed by the guest. The registry lock is held
//! only for lookup/serialization — never across a guest invocation — so a
//! guest reached through `CallHook` may itself call `CallHook` into yet
//! another plugin.
//!
//! The bridge holds a `Weak` reference to the engine internals: compiled
//! modules bake the function table in, so a strong reference would keep the
//! engine alive through its own cache.

use std::sync::Weak;

use extism::CurrentPlugin;
use extism::Error;
use extism::Function;
use extism::PTR;
use extism::UserData;
use extism::Val;
use tracing::debug;
use tracing::warn;

use crate::engine::EngineInner;
use crate::engine::LogLevel;
use crate::error::EngineError;

/// Import namespace guests link the engine host functions from.
pub const HOST_NAMESPACE: &str = "extism:host/pluginengine";

/// Shared state behind each host function.
pub(crate) struct BridgeContext {
    engine: Weak<EngineInner>,
}

/// Build the engine's host function table against a not-yet-finished
/// engine allocation (`Arc::new_cyclic`).
pub(crate) fn engine_host_functions(engine: Weak<EngineInner>) -> Vec<Function> {
    vec![
        host_function("CallHook", 2, engine.clone(), call_hook),
        host_function("LoadFile", 1, engine.clone(), load_file),
        host_function("GetHooksForAnchor", 1, engine, get_hooks_for_anchor),
    ]
}

fn host_function(
    name: &str,
    inputs: usize,
    engine: Weak<EngineInner>,
    callback: fn(&mut CurrentPlugin, &[Val], &mut [Val], UserData<BridgeContext>) -> Result<(), Error>,
) -> Function {
    Function::new(
        name,
        vec![PTR; inputs],
        [PTR],
        UserData::new(BridgeContext { engine }),
        callback,
    )
    .with_namespace(HOST_NAMESPACE)
}

/// Upgrade the bridge's engine reference. `None` after the engine is gone.
fn engine_ref(user_data: &UserData<BridgeContext>) -> Result<Option<std::sync::Arc<EngineInner>>, Error> {
    let context = user_data.get()?;
    let context = context.lock().map_err(|_| anyhow::anyhow!("bridge context poisoned"))?;
    Ok(context.engine.upgrade())
}

/// Write `bytes` into the calling guest's memory and point the output at it.
fn write_response(plugin: &mut CurrentPlugin, outputs: &mut [Val], bytes: &[u8]) -> Result<(), Error> {
    let handle = plugin.memory_new(bytes)?;
    outputs[0] = plugin.memory_to_val(handle);
    Ok(())
}

/// `LoadFile`: read the file named by the guest string into guest memory.
fn load_file(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<BridgeContext>,
) -> Result<(), Error> {
    let path: String = plugin.memory_get_val(&inputs[0])?;

    if let Some(engine) = engine_ref(&user_data)?
        && engine.log_level <= LogLevel::Debug
    {
        debug!(path = %path, "guest requested LoadFile");
    }

    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) => {
            // An unreadable file yields an empty byte range, not a trap.
            warn!(path = %path, error = %e, "LoadFile could not read file");
            Vec::new()
        }
    };
    write_response(plugin, outputs, &data)
}

/// `CallHook`: dispatch a payload to the plugin owning a hook id.
fn call_hook(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<BridgeContext>,
) -> Result<(), Error> {
    let hook_id: String = plugin.memory_get_val(&inputs[0])?;
    let data: Vec<u8> = plugin.memory_get_val(&inputs[1])?;

    let Some(engine) = engine_ref(&user_data)? else {
        outputs[0] = Val::I64(0);
        return Ok(());
    };
    if engine.log_level <= LogLevel::Debug {
        debug!(hook = %hook_id, payload_len = data.len(), "guest requested CallHook");
    }

    match engine.dispatch_hook(&hook_id, &data) {
        Ok(response) => write_response(plugin, outputs, &response),
        Err(EngineError::UnknownHook(id)) => {
            // Swallowed at the host-function boundary: the guest gets an
            // empty response rather than a trap.
            warn!(hook = %id, "CallHook targeted an unknown hook id");
            outputs[0] = Val::I64(0);
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e)),
    }
}

/// `GetHooksForAnchor`: serialize an anchor's bound hooks into guest memory.
fn get_hooks_for_anchor(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<BridgeContext>,
) -> Result<(), Error> {
    let anchor_id: String = plugin.memory_get_val(&inputs[0])?;

    let Some(engine) = engine_ref(&user_data)? else {
        outputs[0] = Val::I64(0);
        return Ok(());
    };
    if engine.log_level <= LogLevel::Debug {
        debug!(anchor = %anchor_id, "guest requested GetHooksForAnchor");
    }

    let hooks = engine.hooks_for_anchor(&anchor_id);
    if hooks.is_empty() {
        outputs[0] = Val::I64(0);
        return Ok(());
    }
    let json = serde_json::to_vec(&hooks)?;
    write_response(plugin, outputs, &json)
}
