//! Shared Tokio runtime for execution monitor orchestration.
//!
//! Lazily-initialized, shared across every pool, used to spawn monitor
//! futures so the engine doesn't spin up new OS threads per invocation.
//!
//! # Configuration
//!
//! Thread count is configurable via `WORKER_KERNEL_MONITOR_THREADS`
//! (default 2), and must be set before the first monitor is used.

use std::sync::LazyLock;

use tokio::runtime::Runtime;

/// Environment variable to configure the number of monitor runtime worker threads.
pub(crate) const ENV_MONITOR_THREADS: &str = "WORKER_KERNEL_MONITOR_THREADS";

/// Default number of worker threads for the monitor runtime. Two threads
/// allows for concurrent wall-clock and CPU time monitoring.
const DEFAULT_MONITOR_RUNTIME_WORKERS: usize = 2;

/// Shared Tokio runtime for all execution monitors.
///
/// Lazily initialized on first access. If runtime creation fails, `None` is
/// cached permanently — no retry, to avoid retry storms.
static MONITOR_RUNTIME: LazyLock<Option<Runtime>> = LazyLock::new(|| {
    let workers = std::env::var(ENV_MONITOR_THREADS)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_MONITOR_RUNTIME_WORKERS);

    match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("wk-exec-monitor")
        .enable_time()
        .build()
    {
        Ok(rt) => {
            tracing::debug!(workers, "Initialized monitor runtime");
            Some(rt)
        }
        Err(e) => {
            tracing::error!("Failed to create execution monitor runtime: {e}. Monitors will be unavailable.");
            None
        }
    }
});

/// Get the shared monitor runtime. Returns `None` if runtime creation failed.
pub(crate) fn get_monitor_runtime() -> Option<&'static Runtime> {
    MONITOR_RUNTIME.as_ref()
}
