//! Stage 3 of the instance lifecycle: handlers are compiled into the
//! runtime and the instance is ready to dispatch events.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{instrument, Level};
use worker_js_runtime::{InterruptHandle, JsRuntime, QuickJsRuntime};

use crate::error::{KernelError, Result};
use crate::event_loop::EventLoop;
#[cfg(feature = "function_call_metrics")]
use crate::instance::metrics::HandlerCallMetricGuard;
use crate::instance::metrics::InstanceMetricsGuard;
use crate::monitor::runtime::get_monitor_runtime;
use crate::monitor::MonitorSet;

/// RAII guard that aborts a spawned monitor task on drop.
struct MonitorTask(tokio::task::JoinHandle<()>);

impl Drop for MonitorTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// An instance with its worker handlers compiled in and ready to dispatch
/// events.
pub struct LoadedInstance {
    runtime: QuickJsRuntime,
    event_loop: Arc<Mutex<EventLoop>>,
    _metric_guard: InstanceMetricsGuard<LoadedInstance>,
}

impl LoadedInstance {
    pub(super) fn new(runtime: QuickJsRuntime, event_loop: Arc<Mutex<EventLoop>>) -> Self {
        Self {
            runtime,
            event_loop,
            _metric_guard: InstanceMetricsGuard::new(),
        }
    }

    /// Invoke `func_name` with a JSON event payload. Dispatches the call and
    /// arms the runtime's await machinery, but does not itself block until
    /// the handler's returned value settles — callers poll the
    /// `AWAITED_STATE` global while draining the event loop (§4.5 steps
    /// 9-10, §9).
    #[instrument(err(Debug), skip(self, event, gc), level = Level::INFO)]
    pub fn handle_event<F>(&mut self, func_name: F, event: String, gc: Option<bool>) -> Result<()>
    where
        F: Into<String> + Debug,
    {
        let _json_val: serde_json::Value =
            serde_json::from_str(&event).map_err(KernelError::InvalidEvent)?;

        let should_gc = gc.unwrap_or(true);
        let func_name = func_name.into();
        if func_name.is_empty() {
            return Err(KernelError::EmptyHandlerName);
        }

        #[cfg(feature = "function_call_metrics")]
        let _metric_guard = HandlerCallMetricGuard::new(&func_name, should_gc);

        Ok(self.runtime.run_handler(&func_name, &event, should_gc)?)
    }

    /// Handle an event with execution monitoring armed (§4.5 step 4).
    ///
    /// # Fail-Closed Semantics
    ///
    /// If the monitor fails to initialize, the handler is **never executed**.
    ///
    /// # Tuple Monitors (OR semantics)
    ///
    /// Pass a tuple of monitors to enforce multiple limits; the first to
    /// fire wins and its name is logged and counted.
    #[instrument(err(Debug), skip(self, event, monitor, gc), level = Level::INFO)]
    pub fn handle_event_with_monitor<F, M>(
        &mut self,
        func_name: F,
        event: String,
        monitor: &M,
        gc: Option<bool>,
    ) -> Result<()>
    where
        F: Into<String> + Debug,
        M: MonitorSet,
    {
        let func_name = func_name.into();
        if func_name.is_empty() {
            return Err(KernelError::EmptyHandlerName);
        }
        self.with_monitor(monitor, |this| this.handle_event(&func_name, event, gc))
    }

    /// Arm `monitor` around an arbitrary sequence of calls into this
    /// instance's runtime — the engine's whole invocation (marshal, invoke,
    /// drain, extract) runs as one watchdog-covered unit (§4.5 step 4),
    /// not just the single `run_handler` call `handle_event_with_monitor`
    /// covers.
    ///
    /// Same fail-closed contract as [`handle_event_with_monitor`](Self::handle_event_with_monitor):
    /// if the monitor fails to initialize, `f` never runs.
    pub fn with_monitor<M, T>(&mut self, monitor: &M, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T>
    where
        M: MonitorSet,
    {
        let interrupt_handle = self.interrupt_handle();

        // Phase 1: build the racing future on the calling thread, where
        // monitors can capture thread-local state (e.g. CPU clock handles).
        let racing_future = monitor.to_race().map_err(|e| {
            tracing::error!("Failed to initialize execution monitor: {}", e);
            KernelError::MonitorFailed(e.to_string())
        })?;

        // Phase 2: spawn the racing future on the shared monitor runtime.
        let runtime = get_monitor_runtime()
            .ok_or_else(|| KernelError::MonitorFailed("monitor runtime is unavailable".to_string()))?;

        let _monitor_task = MonitorTask(runtime.spawn(async move {
            racing_future.await;
            interrupt_handle.kill();
        }));

        // Phase 3: run the covered work (blocking). When this returns,
        // _monitor_task drops and aborts the spawned monitor task.
        f(self)
    }

    /// Drive the event loop — firing due timers and pumping microtasks —
    /// until `is_settled` reports the handler's returned promise resolved or
    /// `deadline` passes. Used by the engine after the initial handler call
    /// returns a still-pending result (§4.5 step 3's "drain event loop").
    pub fn drain_event_loop(
        &mut self,
        deadline: Instant,
        mut is_settled: impl FnMut() -> bool,
    ) {
        let runtime = &mut self.runtime;
        let event_loop = self.event_loop.clone();
        crate::event_loop::lock(&event_loop).drain_until(
            deadline,
            |id| {
                runtime.evaluate(&format!("__fireTimer({id})"))?;
                Ok(())
            },
            || runtime.pump_microtasks(),
            &mut is_settled,
        );
    }

    /// Get a handle capable of interrupting whatever is currently executing.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.runtime.interrupt_handle()
    }

    /// Assign `value` to a global, for the engine's per-invocation
    /// `env`/`ctx`/request-id plumbing (§4.5 steps 6-7).
    pub fn set_global(&mut self, name: &str, value: worker_js_runtime::GlobalValue) -> Result<()> {
        Ok(self.runtime.set_global(name, value)?)
    }

    /// Evaluate `source` for side effects only.
    pub fn evaluate(&mut self, source: &str) -> Result<()> {
        Ok(self.runtime.evaluate(source)?)
    }

    /// Evaluate `source` and coerce the result to a string.
    pub fn evaluate_to_string(&mut self, source: &str) -> Result<String> {
        Ok(self.runtime.evaluate_to_string(source)?)
    }

    /// Evaluate `source` and coerce the result to a bool.
    pub fn evaluate_to_bool(&mut self, source: &str) -> Result<bool> {
        Ok(self.runtime.evaluate_to_bool(source)?)
    }

    /// `Some` when the runtime supports the binary fast path.
    pub fn binary_transfer_mode(&self) -> Option<worker_js_common::BinaryTransferMode> {
        self.runtime.binary_transfer_mode()
    }

    /// Read a `Uint8Array` global as raw bytes (binary-transfer fast path, §6.4).
    pub fn read_binary(&mut self, global_name: &str) -> Result<Vec<u8>> {
        Ok(self.runtime.read_binary(global_name)?)
    }

    /// Write raw bytes into a `Uint8Array` global (binary-transfer fast path, §6.4).
    pub fn write_binary(&mut self, global_name: &str, bytes: &[u8]) -> Result<()> {
        Ok(self.runtime.write_binary(global_name, bytes)?)
    }

    /// Run the fixed JS cleanup script that deletes whitelisted per-request
    /// globals and reset the event loop — the pool's "release" step (§4.3).
    /// Does not destroy the instance; the caller decides whether to return
    /// it to its pool or discard it (e.g. after a timeout or WebSocket
    /// upgrade).
    #[instrument(err(Debug), skip(self), level = Level::DEBUG)]
    pub fn release(&mut self) -> Result<()> {
        self.runtime.evaluate(&cleanup_script())?;
        crate::event_loop::lock(&self.event_loop).reset();
        Ok(())
    }
}

/// Deletes every per-request global the engine installs before a handler
/// call (the request id, `env`, `ctx`, and the await/wait-until bookkeeping
/// globals under [`worker_js_common::globals`]) and anything under the two
/// reserved prefixes bindings use for request-scoped state, so a reused
/// instance never leaks state between tenants' requests (§4.3).
fn cleanup_script() -> String {
    use worker_js_common::globals::{
        AWAITED_RESULT, AWAITED_STATE, BINARY_PREFIX, CALL_RESULT, REQUEST_ID, TEMP_PREFIX,
        WAIT_UNTIL_DONE, WAIT_UNTIL_PROMISES,
    };
    format!(
        r#"(function () {{
    const reserved = [
        "{request_id}", "env", "ctx",
        "{call_result}", "{awaited_state}", "{awaited_result}",
        "{wait_until_done}", "{wait_until_promises}",
    ];
    for (const name of reserved) {{
        delete globalThis[name];
    }}
    for (const name of Object.getOwnPropertyNames(globalThis)) {{
        if (name.startsWith("{temp_prefix}") || name.startsWith("{binary_prefix}")) {{
            delete globalThis[name];
        }}
    }}
}})();"#,
        request_id = REQUEST_ID,
        call_result = CALL_RESULT,
        awaited_state = AWAITED_STATE,
        awaited_result = AWAITED_RESULT,
        wait_until_done = WAIT_UNTIL_DONE,
        wait_until_promises = WAIT_UNTIL_PROMISES,
        temp_prefix = TEMP_PREFIX,
        binary_prefix = BINARY_PREFIX,
    )
}

impl Debug for LoadedInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedInstance").finish()
    }
}
