//! Binding adapters that prove the env/factory contract (§6.2, §6.3) end to
//! end. Real bindings (object store, queues, relational, durable objects,
//! service invocation, assets, cache) are external collaborators; `kv` is
//! the one illustrative implementation this crate ships.

/// An in-memory key-value binding proving the factory/host-function contract.
pub mod kv;
