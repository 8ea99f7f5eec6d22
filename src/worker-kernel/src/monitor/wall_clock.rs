//! Wall-clock time based execution monitor.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};

use super::ExecutionMonitor;

/// Monitors handler execution using wall-clock time.
///
/// Terminates execution if the handler runs longer than the configured
/// timeout. This measures real elapsed time, including time spent blocked or
/// waiting — the complement to [`CpuTimeMonitor`](super::CpuTimeMonitor),
/// which only sees compute-bound abuse. The engine arms both as a tuple
/// (§4.5 step 4).
#[derive(Debug, Clone)]
pub struct WallClockMonitor {
    timeout: Duration,
}

impl WallClockMonitor {
    /// Create a new wall-clock monitor with the specified timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if `timeout` is zero.
    pub fn new(timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(anyhow!("timeout must be non-zero"));
        }
        Ok(Self { timeout })
    }
}

impl ExecutionMonitor for WallClockMonitor {
    fn get_monitor(&self) -> Result<impl Future<Output = ()> + Send + 'static> {
        let timeout = self.timeout;
        Ok(async move {
            super::sleep(timeout).await;
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Wall-clock timeout exceeded, terminating execution"
            );
        })
    }

    fn name(&self) -> &'static str {
        "wall-clock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_duration_rejected() {
        let result = WallClockMonitor::new(Duration::ZERO);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("non-zero"));
    }

    #[test]
    fn valid_duration_accepted() {
        assert!(WallClockMonitor::new(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn get_monitor_returns_future() {
        let monitor = WallClockMonitor::new(Duration::from_secs(1)).unwrap();
        assert!(monitor.get_monitor().is_ok());
    }

    #[test]
    fn get_monitor_reuse() {
        let monitor = WallClockMonitor::new(Duration::from_secs(1)).unwrap();
        assert!(monitor.get_monitor().is_ok());
        assert!(monitor.get_monitor().is_ok());
    }
}
