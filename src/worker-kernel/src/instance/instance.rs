//! Stage 2 of the instance lifecycle: a JS heap with the runtime adapter and
//! the baseline binding shims installed, accumulating handler scripts that
//! aren't compiled into the runtime until [`Instance::into_loaded`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{instrument, Level};
use worker_js_runtime::host::Host;
use worker_js_runtime::{HostFunction, JsRuntime, QuickJsRuntime};

use crate::error::{KernelError, Result};
use crate::event_loop::EventLoop;
use crate::instance::loaded_instance::LoadedInstance;
use crate::instance::metrics::InstanceMetricsGuard;
use crate::script::Script;

/// A JS heap with the runtime adapter and binding shims installed, but no
/// worker handlers compiled in yet.
pub struct Instance {
    runtime: QuickJsRuntime,
    event_loop: Arc<Mutex<EventLoop>>,
    handlers: HashMap<String, Script>,
    _metric_guard: InstanceMetricsGuard<Instance>,
}

impl Instance {
    #[instrument(err(Debug), skip_all, level = Level::INFO)]
    pub(super) fn new(
        host: Box<dyn Host>,
        host_functions: Vec<(String, String, HostFunction)>,
    ) -> Result<Self> {
        let mut runtime = QuickJsRuntime::new(host)?;

        for (module, name, func) in host_functions {
            runtime.register_host_function(&module, &name, func)?;
        }

        let event_loop = Arc::new(Mutex::new(EventLoop::new()));
        install_timers_module(&mut runtime, event_loop.clone())?;

        Ok(Self {
            runtime,
            event_loop,
            handlers: HashMap::new(),
            _metric_guard: InstanceMetricsGuard::new(),
        })
    }

    /// Accumulate a handler script under `name`. Not compiled into the
    /// runtime until [`into_loaded`](Self::into_loaded) — mirrors the
    /// deferred-registration shape of the rest of the lifecycle, where
    /// construction either succeeds entirely or nothing is committed.
    #[instrument(err(Debug), skip(self, script), level = Level::DEBUG)]
    pub fn add_handler(
        &mut self,
        name: impl Into<String> + std::fmt::Debug,
        script: impl Into<Script>,
    ) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(KernelError::EmptyHandlerName);
        }
        self.handlers.insert(name, script.into());
        Ok(())
    }

    /// Remove a previously accumulated handler.
    pub fn remove_handler(&mut self, name: &str) {
        self.handlers.remove(name);
    }

    /// Run a setup script against this instance's JS heap, before any
    /// handler is compiled in — the fixed-order setup-function step of
    /// instance construction (§6.3). Used by binding factories (e.g.
    /// `bindings::kv`) to install their env-object factory function.
    pub fn evaluate_setup(&mut self, source: &str) -> Result<()> {
        Ok(self.runtime.evaluate(source)?)
    }

    /// Discard every accumulated handler.
    pub fn clear_handlers(&mut self) {
        self.handlers.clear();
    }

    /// Compile every accumulated handler into the runtime and return a
    /// [`LoadedInstance`]. Fails if no handler was registered — an instance
    /// with nothing to dispatch to can't serve any event.
    #[instrument(err(Debug), skip(self), level = Level::INFO)]
    pub fn into_loaded(mut self) -> Result<LoadedInstance> {
        if self.handlers.is_empty() {
            return Err(KernelError::NoHandlers);
        }

        for (name, script) in &self.handlers {
            let base_path = script
                .base_path()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|| ".".to_string());
            self.runtime.register_handler(name, script.content(), &base_path)?;
        }

        Ok(LoadedInstance::new(self.runtime, self.event_loop))
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Register the `timers` host module backing `setTimeout`/`clearTimeout`
/// (see `worker-js-runtime`'s `globals::timers`), wiring JS-side timer ids
/// straight into this instance's event loop.
fn install_timers_module(
    runtime: &mut QuickJsRuntime,
    event_loop: Arc<Mutex<EventLoop>>,
) -> Result<()> {
    let schedule_loop = event_loop.clone();
    runtime.register_host_function(
        "timers",
        "schedule",
        HostFunction::new_serde(move |id: u64, delay_ms: u64| -> anyhow::Result<()> {
            crate::event_loop::lock(&schedule_loop).schedule_timer(id, delay_ms);
            Ok(())
        }),
    )?;

    let cancel_loop = event_loop;
    runtime.register_host_function(
        "timers",
        "cancel",
        HostFunction::new_serde(move |id: u64| -> anyhow::Result<()> {
            crate::event_loop::lock(&cancel_loop).cancel_timer(id);
            Ok(())
        }),
    )?;

    Ok(())
}
