//! Execution monitoring for worker handler invocations.
//!
//! Provides the [`ExecutionMonitor`] trait and built-in implementations used
//! by the engine's watchdog step (§4.5 step 4) to enforce the execution-time
//! budget and optional CPU-time limit.
//!
//! # Architecture — Why two traits?
//!
//! 1. **Users** want a simple trait to implement: `get_monitor()` + `name()`.
//! 2. **The engine** needs to race multiple monitors, identifying which one
//!    fired (by name) for metrics and logging.
//! 3. **Tuples** of monitors (e.g. `(WallClockMonitor, CpuTimeMonitor)`) are a
//!    **composition** of monitors, not a single monitor — they shouldn't
//!    pretend to be one by implementing `ExecutionMonitor`.
//!
//! The solution: separate concerns into two traits.
//!
//! - [`ExecutionMonitor`] — user-facing. Only two methods: `get_monitor()` and
//!   `name()`.
//! - [`MonitorSet`] — internal (sealed). One method, [`to_race()`](MonitorSet::to_race),
//!   producing a single racing future. Automatically derived for every
//!   `ExecutionMonitor` via a blanket impl, and for tuples of up to 5 monitors
//!   via `tokio::select!` in a macro.
//!
//! # Fail-Closed Semantics
//!
//! If any monitor fails to initialize (`get_monitor()` returns `Err`), the
//! handler is **never executed**.
//!
//! # Using Wall-Clock and CPU Monitors Together
//!
//! - **`CpuTimeMonitor`** catches compute-bound abuse (crypto mining, tight loops).
//! - **`WallClockMonitor`** catches resource exhaustion where the instance
//!   holds host resources without burning CPU (e.g. blocking on a host call).
//!
//! Neither alone is sufficient. The engine always arms both (see §4.5 step 4).
//!
//! # Runtime Configuration
//!
//! The shared async runtime thread count can be configured via
//! `WORKER_KERNEL_MONITOR_THREADS` (default 2).

use std::future::Future;
use std::pin::Pin;

use anyhow::Result;

use crate::instance::metrics::{METRIC_MONITOR_TERMINATIONS, METRIC_MONITOR_TYPE_LABEL};

/// Record that a monitor triggered execution termination.
fn record_monitor_triggered(triggered_by: &'static str) {
    metrics::counter!(
        METRIC_MONITOR_TERMINATIONS,
        METRIC_MONITOR_TYPE_LABEL => triggered_by
    )
    .increment(1);

    tracing::warn!("Monitor '{triggered_by}' fired — requesting execution termination");
}

/// A monitor that enforces execution limits on handler invocations.
///
/// This is the only trait users need to implement. The sealed [`MonitorSet`]
/// trait is automatically derived via a blanket impl.
///
/// # Contract
///
/// - **Method body** (sync): runs on the calling thread. Capture thread-local
///   state here. Return `Err` to fail closed (handler never runs).
/// - **Returned future** (async): spawned on the monitor runtime. Stays
///   pending while within limits; completes when execution should terminate.
pub trait ExecutionMonitor: Send + Sync {
    /// Prepare and return a monitoring future for a single handler invocation.
    ///
    /// # Errors
    ///
    /// Return `Err` if the monitor cannot initialize (e.g. OS API failure).
    fn get_monitor(&self) -> Result<impl Future<Output = ()> + Send + 'static>;

    /// Human-readable name for logging and metrics.
    fn name(&self) -> &'static str;
}

mod private {
    pub trait Sealed {}
}

/// A composable set of monitors that produces a single racing future.
///
/// Sealed — automatically derived for any [`ExecutionMonitor`] and for
/// tuples of up to 5 monitors.
pub trait MonitorSet: private::Sealed + Send + Sync {
    /// Produce a single future that races all monitors in this set.
    fn to_race(&self) -> Result<Pin<Box<dyn Future<Output = ()> + Send>>>;
}

impl<M: ExecutionMonitor> private::Sealed for M {}

impl<M: ExecutionMonitor> MonitorSet for M {
    fn to_race(&self) -> Result<Pin<Box<dyn Future<Output = ()> + Send>>> {
        let future = self.get_monitor()?;
        let name = self.name();
        Ok(Box::pin(async move {
            future.await;
            record_monitor_triggered(name);
        }))
    }
}

macro_rules! impl_monitor_set_tuple {
    (($($p:ident: $P:ident),+)) => {
        impl<$($P: ExecutionMonitor),+> private::Sealed for ($($P,)+) {}

        impl<$($P: ExecutionMonitor),+> MonitorSet for ($($P,)+) {
            fn to_race(&self) -> Result<Pin<Box<dyn Future<Output = ()> + Send>>> {
                let ($($p,)+) = &self;
                $(let $p = ($p.get_monitor()?, $p.name());)+

                Ok(Box::pin(async move {
                    let winner = tokio::select! {
                        $(_ = $p.0 => $p.1,)+
                    };
                    record_monitor_triggered(winner);
                }))
            }
        }
    };
}

impl_monitor_set_tuple!((m0: M0));
impl_monitor_set_tuple!((m0: M0, m1: M1));
impl_monitor_set_tuple!((m0: M0, m1: M1, m2: M2));
impl_monitor_set_tuple!((m0: M0, m1: M1, m2: M2, m3: M3));
impl_monitor_set_tuple!((m0: M0, m1: M1, m2: M2, m3: M3, m4: M4));

#[cfg(feature = "monitor-wall-clock")]
mod wall_clock;
#[cfg(feature = "monitor-wall-clock")]
pub use wall_clock::WallClockMonitor;

#[cfg(feature = "monitor-cpu-time")]
mod cpu_time;
#[cfg(feature = "monitor-cpu-time")]
pub use cpu_time::CpuTimeMonitor;

pub(crate) mod runtime;

/// Async sleep function used by monitors. Re-exported so custom monitor
/// implementations don't couple directly to `tokio`.
pub use tokio::time::sleep;
