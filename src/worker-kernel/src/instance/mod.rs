//! The per-tenant execution instance lifecycle: `ProtoInstance` (host
//! functions registered, no JS heap) → `Instance` (JS heap + bindings
//! installed, handlers accumulated) → `LoadedInstance` (handlers compiled
//! in, ready to dispatch events). See §4.3.

mod instance;
pub(crate) mod metrics;
mod proto_instance;

mod loaded_instance;

pub use instance::Instance;
pub use loaded_instance::LoadedInstance;
pub use proto_instance::{InstanceBuilder, ProtoInstance};
