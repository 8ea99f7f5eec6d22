//! Kernel configuration (§6.6).

use std::time::Duration;

/// Parameters the execution kernel is parameterized by (§6.6).
///
/// Constructible programmatically — the library-first style the teacher
/// used for `SandboxBuilder` — or loaded from environment variables via
/// [`KernelConfig::from_env`], generalizing the teacher's single-env-var
/// pattern (`HYPERLIGHT_MONITOR_THREADS`) to the kernel's own `WORKER_KERNEL_*`
/// family.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Number of pre-warmed instances held per `(tenant, deployment)` pool.
    pub pool_size: usize,
    /// Per-instance JS heap memory ceiling, in bytes.
    pub instance_memory_limit_bytes: u64,
    /// Wall-clock execution-time budget for a single invocation.
    pub execution_time_budget: Duration,
    /// Maximum number of outbound `fetch()` calls permitted per invocation.
    pub max_fetch_requests: u32,
    /// Per-fetch timeout.
    pub fetch_timeout: Duration,
    /// Maximum response body size accepted from an outbound fetch or
    /// produced by a handler, in bytes.
    pub max_response_body_bytes: u64,
    /// Maximum accepted worker script source size, in bytes.
    pub max_script_source_bytes: u64,
}

const ENV_POOL_SIZE: &str = "WORKER_KERNEL_POOL_SIZE";
const ENV_INSTANCE_MEMORY_LIMIT_BYTES: &str = "WORKER_KERNEL_INSTANCE_MEMORY_LIMIT_BYTES";
const ENV_EXECUTION_TIME_BUDGET_MS: &str = "WORKER_KERNEL_EXECUTION_TIME_BUDGET_MS";
const ENV_MAX_FETCH_REQUESTS: &str = "WORKER_KERNEL_MAX_FETCH_REQUESTS";
const ENV_FETCH_TIMEOUT_SECS: &str = "WORKER_KERNEL_FETCH_TIMEOUT_SECS";
const ENV_MAX_RESPONSE_BODY_BYTES: &str = "WORKER_KERNEL_MAX_RESPONSE_BODY_BYTES";
const ENV_MAX_SCRIPT_SOURCE_BYTES: &str = "WORKER_KERNEL_MAX_SCRIPT_SOURCE_BYTES";

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            instance_memory_limit_bytes: 128 * 1024 * 1024,
            execution_time_budget: Duration::from_millis(30_000),
            max_fetch_requests: 50,
            fetch_timeout: Duration::from_secs(30),
            max_response_body_bytes: 25 * 1024 * 1024,
            max_script_source_bytes: 10 * 1024 * 1024,
        }
    }
}

impl KernelConfig {
    /// Defaults, with any `WORKER_KERNEL_*` environment variable present
    /// overriding the corresponding field. Unset or unparsable variables
    /// fall back to the default silently, matching the monitor runtime's
    /// `WORKER_KERNEL_MONITOR_THREADS` handling.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pool_size: env_usize(ENV_POOL_SIZE).unwrap_or(defaults.pool_size),
            instance_memory_limit_bytes: env_u64(ENV_INSTANCE_MEMORY_LIMIT_BYTES)
                .unwrap_or(defaults.instance_memory_limit_bytes),
            execution_time_budget: env_u64(ENV_EXECUTION_TIME_BUDGET_MS)
                .map(Duration::from_millis)
                .unwrap_or(defaults.execution_time_budget),
            max_fetch_requests: env_usize(ENV_MAX_FETCH_REQUESTS)
                .map(|n| n as u32)
                .unwrap_or(defaults.max_fetch_requests),
            fetch_timeout: env_u64(ENV_FETCH_TIMEOUT_SECS)
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            max_response_body_bytes: env_u64(ENV_MAX_RESPONSE_BODY_BYTES)
                .unwrap_or(defaults.max_response_body_bytes),
            max_script_source_bytes: env_u64(ENV_MAX_SCRIPT_SOURCE_BYTES)
                .unwrap_or(defaults.max_script_source_bytes),
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = KernelConfig::default();
        assert!(config.pool_size > 0);
        assert!(config.execution_time_budget > Duration::ZERO);
    }

    #[test]
    fn from_env_falls_back_to_defaults_when_unset() {
        std::env::remove_var(ENV_POOL_SIZE);
        let config = KernelConfig::from_env();
        assert_eq!(config.pool_size, KernelConfig::default().pool_size);
    }
}
