//! An in-memory key-value binding (§6.2, §9): the one illustrative binding
//! this crate ships to prove the host-function + factory contract end to
//! end. Every other binding kind named in §6.3's setup-function order
//! (object store, queues, relational, durable objects, service invocation,
//! assets, cache) is an external collaborator the engine never depends on.

use std::sync::Arc;

use dashmap::DashMap;
use worker_js_runtime::HostFunction;

use crate::error::Result;
use crate::instance::{Instance, ProtoInstance};

/// The backing store for one KV binding. Cloning shares the same map — every
/// pooled instance built from the same `ProtoInstance` sees the same data,
/// matching a real KV namespace's lifetime (bound to the binding, not to any
/// one instance).
#[derive(Clone, Default)]
pub struct KvStore {
    entries: Arc<DashMap<String, String>>,
}

impl KvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Register the `kv` module's host functions on `proto` (setup category 24,
/// §6.3). Call [`install_factory`] on the resulting [`Instance`] to install
/// the JS-side `env` proxy that calls through to them.
pub fn install(proto: &mut ProtoInstance, store: KvStore) {
    let get_store = store.entries.clone();
    proto.register(
        "kv",
        "get",
        HostFunction::new_serde(move |key: String| -> anyhow::Result<Option<String>> {
            Ok(get_store.get(&key).map(|v| v.clone()))
        }),
    );

    let put_store = store.entries.clone();
    proto.register(
        "kv",
        "put",
        HostFunction::new_serde(move |key: String, value: String| -> anyhow::Result<()> {
            put_store.insert(key, value);
            Ok(())
        }),
    );

    let delete_store = store.entries.clone();
    proto.register(
        "kv",
        "delete",
        HostFunction::new_serde(move |key: String| -> anyhow::Result<()> {
            delete_store.remove(&key);
            Ok(())
        }),
    );

    let list_store = store.entries.clone();
    proto.register(
        "kv",
        "list",
        HostFunction::new_serde(move |prefix: String| -> anyhow::Result<Vec<String>> {
            let mut keys: Vec<String> = list_store
                .iter()
                .map(|entry| entry.key().clone())
                .filter(|k| k.starts_with(&prefix))
                .collect();
            keys.sort();
            Ok(keys)
        }),
    );
}

/// Evaluate the `env`-facing factory function (§6.2's `__make*` convention)
/// against `instance`, before any handler is compiled in. `EnvSpec::build_script`
/// later calls `globalThis.__makeKv(bindingName)` once per declared KV binding.
pub fn install_factory(instance: &mut Instance) -> Result<()> {
    instance.evaluate_setup(FACTORY_SCRIPT)
}

const FACTORY_SCRIPT: &str = r#"
globalThis.__makeKv = function (bindingName) {
    const kv = require("kv");
    return {
        get(key) {
            return Promise.resolve(kv.get(key));
        },
        put(key, value) {
            return Promise.resolve(kv.put(key, String(value)));
        },
        delete(key) {
            return Promise.resolve(kv.delete(key));
        },
        list(options) {
            const prefix = (options && options.prefix) || "";
            const keys = kv.list(prefix);
            return Promise.resolve({ keys: keys.map((name) => ({ name })) });
        },
    };
};
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_is_shared_across_clones() {
        let store = KvStore::new();
        let other = store.clone();
        store.entries.insert("a".to_string(), "1".to_string());
        assert_eq!(other.entries.get("a").map(|v| v.clone()), Some("1".to_string()));
    }
}
