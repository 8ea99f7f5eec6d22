//! The host-side execution kernel for sandboxed JavaScript worker modules:
//! per-tenant instance pools, a cooperative per-instance event loop, a
//! process-wide request-state registry, and the engine that drives one
//! invocation through them (§2).
#![deny(dead_code, missing_docs, unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
#![cfg_attr(any(test, debug_assertions), allow(clippy::disallowed_macros))]

/// Illustrative binding adapters (KV) proving the env/factory contract.
pub mod bindings;
/// Kernel configuration (§6.6).
pub mod config;
/// The invocation orchestrator (§4.5).
pub mod engine;
/// Error types shared across the pool, engine, and instance lifecycle.
pub mod error;
/// The single-threaded cooperative event loop (§4.2).
pub mod event_loop;
/// The per-tenant instance lifecycle: `ProtoInstance` -> `Instance` -> `LoadedInstance` (§4.3).
pub mod instance;
/// Execution monitors (wall-clock, CPU time) and the shared monitor runtime.
pub mod monitor;
/// The per-tenant pool of pre-warmed instances (§3, §4.3, §4.6).
pub mod pool;
/// The process-wide per-request state registry (§3, §4.4).
pub mod request_state;
/// The WebSocket frame-pumping bridge (§6.5).
pub mod ws_bridge;

mod resolver;
mod script;

/// `ProtoInstance`, `Instance`, and `LoadedInstance` — the three stages of
/// the per-tenant execution instance lifecycle.
pub use instance::{Instance, InstanceBuilder, LoadedInstance, ProtoInstance};
/// Types for working with JS worker source.
pub use script::Script;
/// The kernel's error type.
pub use error::KernelError;
/// The result type used throughout the kernel crate.
pub use error::Result;
/// Module resolution and loading functionality, for workers whose source
/// imports other modules.
pub use resolver::{FileMetadata, FileSystem, FileSystemEmbedded, ResolveError};
/// A handle to interrupt guest code execution at the next bytecode boundary.
pub use worker_js_runtime::InterruptHandle;
/// CPU time based execution monitor.
#[cfg(feature = "monitor-cpu-time")]
pub use monitor::CpuTimeMonitor;
/// Trait for implementing execution monitors that can terminate handler execution.
pub use monitor::ExecutionMonitor;
/// Sealed trait for monitor composition — automatically derived for all
/// `ExecutionMonitor` impls and for tuples of up to 5 monitors.
pub use monitor::MonitorSet;
/// Wall-clock based execution monitor.
#[cfg(feature = "monitor-wall-clock")]
pub use monitor::WallClockMonitor;
