//! The invocation orchestrator (§4.5): leases an instance, marshals
//! arguments, dispatches the handler, drains the event loop to completion,
//! extracts the response, and either returns the instance to its pool or
//! destroys it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{instrument, Level};
use worker_js_runtime::GlobalValue;

use crate::error::{KernelError, Result};
use crate::instance::{Instance, LoadedInstance};
use crate::monitor::WallClockMonitor;
use crate::pool::{Pool, PoolKey, PoolRegistry};
use crate::request_state::{LogEntry, RequestId, RequestStateRegistry};

/// A host-side HTTP request, synthesized into a JS `Request` for a `fetch`
/// invocation (§4.5 step 7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRequest {
    /// HTTP method, e.g. `"GET"`.
    pub method: String,
    /// The request URL.
    pub url: String,
    /// Lower-cased header names, as the spec's marshal step requires.
    pub headers: Vec<(String, String)>,
    /// Request body bytes, if any.
    pub body: Option<Vec<u8>>,
}

/// A scheduled (cron) invocation's event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEvent {
    /// Epoch milliseconds the schedule fired at.
    pub time_ms: u64,
    /// The cron expression that triggered this invocation.
    pub cron: String,
}

/// What kind of handler this invocation targets, and its arguments (§6.1).
#[derive(Debug, Clone)]
pub enum InvocationKind {
    /// An HTTP request dispatched to the worker's `fetch` handler.
    Fetch(HostRequest),
    /// A cron trigger dispatched to the worker's `scheduled` handler.
    Scheduled(ScheduledEvent),
    /// A batch of log events dispatched to the worker's `tail` handler.
    Tail(Vec<serde_json::Value>),
    /// An arbitrary exported function invoked by name (§6.1).
    Named {
        /// The exported function's name.
        name: String,
        /// JSON-encodable arguments, passed positionally.
        args: Vec<serde_json::Value>,
    },
}

impl InvocationKind {
    /// The handler name this kind compiles to and dispatches through.
    fn handler_name(&self) -> &str {
        match self {
            InvocationKind::Fetch(_) => "fetch",
            InvocationKind::Scheduled(_) => "scheduled",
            InvocationKind::Tail(_) => "tail",
            InvocationKind::Named { name, .. } => name,
        }
    }

    /// The JSON event payload passed as `run_handler`'s single argument.
    fn event_json(&self) -> Result<String> {
        let value = match self {
            InvocationKind::Fetch(req) => serde_json::to_value(req),
            InvocationKind::Scheduled(ev) => serde_json::to_value(ev),
            InvocationKind::Tail(events) => serde_json::to_value(events),
            InvocationKind::Named { args, .. } => serde_json::to_value(args),
        };
        Ok(value.map_err(KernelError::InvalidEvent)?.to_string())
    }
}

/// One binding's JS-side proxy, built by invoking a well-known factory
/// function (§6.2). The binding implementation itself — what the factory
/// actually returns — is an external collaborator; the engine only knows the
/// factory's name and the binding name it's parameterized with.
#[derive(Debug, Clone)]
pub struct BindingSpec {
    /// The property name this binding is exposed under on `env`.
    pub name: String,
    /// The global factory function's name (e.g. `"__makeKv"`).
    pub factory: String,
}

/// The tenant's environment: plain vars, plain secrets, and bindings (§6.2).
#[derive(Debug, Clone, Default)]
pub struct EnvSpec {
    /// Plain string variables, copied onto `env` verbatim.
    pub vars: HashMap<String, String>,
    /// Plain string secrets, copied onto `env` verbatim (no redaction —
    /// that's a concern of whatever loads them, not the engine).
    pub secrets: HashMap<String, String>,
    /// Bindings, each built by invoking its factory function.
    pub bindings: Vec<BindingSpec>,
}

impl EnvSpec {
    /// Build the JS snippet that assembles `globalThis.env` from this spec's
    /// vars, secrets, and binding factories, in that order — matches §6.3's
    /// "plain vars/secrets first, binding factories last" ordering.
    fn build_script(&self) -> String {
        let mut script = String::from("globalThis.env = {};\n");
        for (key, value) in &self.vars {
            script.push_str(&format!(
                "globalThis.env[{}] = {};\n",
                json_string(key),
                json_string(value)
            ));
        }
        for (key, value) in &self.secrets {
            script.push_str(&format!(
                "globalThis.env[{}] = {};\n",
                json_string(key),
                json_string(value)
            ));
        }
        for binding in &self.bindings {
            script.push_str(&format!(
                "globalThis.env[{}] = globalThis[{}]({});\n",
                json_string(&binding.name),
                json_string(&binding.factory),
                json_string(&binding.name)
            ));
        }
        script
    }
}

fn json_string(s: &str) -> String {
    serde_json::to_string(s).expect("string serialization cannot fail")
}

/// Everything needed to drive one invocation through the engine.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Opaque tenant identifier.
    pub tenant: String,
    /// Opaque deployment identifier.
    pub deployment: String,
    /// Vars, secrets, and bindings to assemble into `env` for this call.
    pub env: EnvSpec,
    /// Which handler to dispatch to and its marshaled arguments.
    pub kind: InvocationKind,
    /// Overrides the pool's configured execution-time budget, if set.
    pub deadline: Option<Duration>,
}

/// A `Response` body, as extracted by the response-conversion step (§4.5
/// step 11, §6.4).
#[derive(Debug, Clone)]
pub enum ResponseBody {
    /// A UTF-8 text body.
    Text(String),
    /// An arbitrary byte body (decoded from the extraction script's base64).
    Bytes(Vec<u8>),
}

/// A host-side HTTP response, extracted from the handler's returned JS
/// `Response` (§4.5 step 11).
#[derive(Debug, Clone)]
pub struct HostResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, in insertion order.
    pub headers: Vec<(String, String)>,
    /// The response body.
    pub body: ResponseBody,
}

/// A response's JSON envelope, as produced by the extraction snippet. The
/// body itself isn't carried here — it travels separately over the binary
/// fast path (`worker_js_common::globals::RESPONSE_BODY_BYTES`) when
/// `has_body` is set, since a `Response`'s body is resolved asynchronously
/// and read back as raw bytes rather than round-tripped through JSON.
#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    status: u16,
    headers: Vec<(String, String)>,
    websocket: bool,
    has_body: bool,
}

/// Held by the caller once a fetch handler requests a WebSocket upgrade
/// (§4.5 step 13, §6.5). The instance is kept out of its pool until
/// `complete` runs; the full frame-pumping bridge lives in `ws_bridge`.
pub struct WebSocketHandle {
    /// The request id this upgraded invocation was assigned.
    pub request_id: RequestId,
    instance: Option<LoadedInstance>,
    pool: Arc<Pool>,
    request_states: Arc<RequestStateRegistry>,
}

impl WebSocketHandle {
    /// Dispatch a `message` event carrying `payload` to the worker's
    /// server-side peer socket, then pump microtasks and give the event
    /// loop a brief slice to run any resulting handlers — the per-frame
    /// step `ws_bridge::bridge` drives between reads (§6.5).
    pub fn dispatch_message(&mut self, payload_json: &str) -> Result<()> {
        let instance = self.instance_mut()?;
        instance.evaluate(&format!(
            "globalThis.__wsPeer && globalThis.__wsPeer.dispatchEvent(new MessageEvent('message', {{ data: {payload_json} }}));"
        ))?;
        instance.drain_event_loop(std::time::Instant::now() + Duration::from_millis(5), || false);
        Ok(())
    }

    /// Dispatch a `close` event to the worker's peer socket. Called once,
    /// right before `complete`, regardless of which side closed first.
    pub fn dispatch_close(&mut self) -> Result<()> {
        let instance = self.instance_mut()?;
        instance.evaluate("globalThis.__wsPeer && globalThis.__wsPeer.dispatchEvent(new CloseEvent('close'));")?;
        instance.drain_event_loop(std::time::Instant::now() + Duration::from_millis(5), || false);
        Ok(())
    }

    fn instance_mut(&mut self) -> Result<&mut LoadedInstance> {
        self.instance
            .as_mut()
            .ok_or_else(|| crate::new_error!("websocket handle's instance was already completed"))
    }

    /// Run when the bridge finishes (HTTP-side close, cancel, or timeout):
    /// clears the request state and returns the instance to its pool (§9
    /// open question — this is the only place that instance's state is
    /// scrubbed after however long the WebSocket session ran).
    #[instrument(skip(self), level = Level::INFO)]
    pub fn complete(mut self) {
        self.request_states.clear_request_state(self.request_id);
        if let Some(mut instance) = self.instance.take() {
            if instance.release().is_ok() {
                self.pool.release(instance);
            }
        }
    }
}

/// The outcome of one invocation (§4.5 steps 9-14, §7).
#[derive(Default)]
pub struct InvocationResult {
    /// The response, if the handler completed successfully and didn't
    /// request a WebSocket upgrade.
    pub response: Option<HostResponse>,
    /// Set when the invocation failed: a handler exception, rejection, or
    /// timeout.
    pub error: Option<String>,
    /// Whether the invocation was terminated by the wall-clock monitor.
    pub timed_out: bool,
    /// Captured `console.*` output, in emission order.
    pub logs: Vec<LogEntry>,
    /// Total wall-clock time the invocation took.
    pub duration: Duration,
    /// `Some` only when a fetch handler requested a WebSocket upgrade
    /// (§4.5 step 13) — the caller hands this to `ws_bridge` to pump frames.
    pub websocket: Option<WebSocketHandle>,
}

impl std::fmt::Debug for InvocationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationResult")
            .field("response", &self.response)
            .field("error", &self.error)
            .field("timed_out", &self.timed_out)
            .field("duration", &self.duration)
            .field("has_websocket", &self.websocket.is_some())
            .finish()
    }
}

/// Produces a freshly built, handler-compiled [`Instance`] from cached
/// worker source. Binding registration (KV, object storage, etc.) and the
/// setup-function order (§6.3) are the factory's responsibility — they're
/// external collaborators per §2's scope cut.
pub trait InstanceFactory: Send + Sync {
    /// Build an `Instance` with every binding/setup step from §6.3 applied,
    /// but no handler compiled in yet.
    fn build_instance(&self, source: &str) -> Result<Instance>;
}

/// Fetches and caches worker source for a `(tenant, deployment)` key. The
/// source loader itself is external (§1 Non-goals); the engine only memoizes
/// what it returns.
pub trait SourceLoader: Send + Sync {
    /// Load the worker module's source text for `(tenant, deployment)`.
    fn load_source(&self, tenant: &str, deployment: &str) -> Result<Arc<str>>;
}

/// The capability threaded onto `env` for service-to-service invocation
/// (§9): a narrow interface the engine implements on itself so a
/// service-binding adapter can call back into `Execute` without the env
/// object owning a reference cycle back to the engine.
pub trait Dispatcher: Send + Sync {
    /// Invoke `(tenant, deployment)`'s `fetch` handler with `request` and
    /// return its response.
    fn dispatch(&self, tenant: &str, deployment: &str, request: HostRequest) -> Result<HostResponse>;
}

/// Wraps the three canonical handler kinds (fetch/scheduled/tail) plus any
/// declared named handlers into the wrapper scripts `Instance::add_handler`
/// compiles. Each wrapper textually appends a `handler(event)` adapter to
/// the worker source and its own `export { handler };` — the worker's own
/// top-level `export function fetch(...)`/`scheduled`/`tail`/named
/// declarations remain in scope for it to call directly, so no module
/// system is needed just to wire this up (§4.5 step 7, §6.1).
fn compile_handlers(instance: &mut Instance, source: &str, named_handlers: &[String]) -> Result<()> {
    instance.add_handler(
        "fetch",
        format!(
            "{source}\nfunction handler(event) {{\n  const req = new Request(event.url, {{ method: event.method, headers: event.headers, body: event.body ?? undefined }});\n  return fetch(req, globalThis.env, globalThis.ctx);\n}}\nexport {{ handler }};\n"
        ),
    )?;
    instance.add_handler(
        "scheduled",
        format!(
            "{source}\nfunction handler(event) {{\n  return scheduled({{ scheduledTime: event.time_ms, cron: event.cron }}, globalThis.env, globalThis.ctx);\n}}\nexport {{ handler }};\n"
        ),
    )?;
    instance.add_handler(
        "tail",
        format!("{source}\nfunction handler(event) {{\n  return tail(event, globalThis.env, globalThis.ctx);\n}}\nexport {{ handler }};\n"),
    )?;
    for name in named_handlers {
        instance.add_handler(
            name.clone(),
            format!(
                "{source}\nfunction handler(event) {{\n  return {name}(globalThis.env, ...event);\n}}\nexport {{ handler }};\n"
            ),
        )?;
    }
    Ok(())
}

/// The invocation orchestrator (§4.5).
pub struct Engine {
    config: crate::config::KernelConfig,
    pools: PoolRegistry,
    request_states: Arc<RequestStateRegistry>,
    sources: DashMap<PoolKey, Arc<str>>,
    source_loader: Arc<dyn SourceLoader>,
    instance_factory: Arc<dyn InstanceFactory>,
    named_handlers: DashMap<PoolKey, Vec<String>>,
}

impl Engine {
    /// Build an engine around a source loader and instance factory. Pools
    /// and request state start out empty and are built lazily per tenant.
    pub fn new(
        config: crate::config::KernelConfig,
        source_loader: Arc<dyn SourceLoader>,
        instance_factory: Arc<dyn InstanceFactory>,
    ) -> Self {
        Self {
            config,
            pools: PoolRegistry::new(),
            request_states: Arc::new(RequestStateRegistry::new()),
            sources: DashMap::new(),
            source_loader,
            instance_factory,
            named_handlers: DashMap::new(),
        }
    }

    /// Declare the set of named (non-fetch/scheduled/tail) handlers a
    /// deployment's worker module exports, so pool construction can compile
    /// wrappers for them up front (instances are pre-warmed before any
    /// specific invocation is known).
    pub fn declare_named_handlers(&self, tenant: &str, deployment: &str, names: Vec<String>) {
        self.named_handlers.insert(PoolKey::new(tenant, deployment), names);
    }

    /// Mark every pool invalid; in-flight invocations finish normally but
    /// their release discards rather than re-enqueues (§5 Shutdown).
    pub fn shutdown(&self) {
        self.pools.shutdown();
    }

    /// Drive one invocation through the 14-step sequence in §4.5.
    #[instrument(err(Debug), skip(self, invocation), fields(tenant = %invocation.tenant, deployment = %invocation.deployment), level = Level::INFO)]
    pub async fn execute(&self, invocation: Invocation) -> Result<InvocationResult> {
        let start = Instant::now();

        // Step 1: validate.
        if invocation.tenant.is_empty() || invocation.deployment.is_empty() {
            return Err(crate::new_error!("tenant id and deployment id must not be empty"));
        }

        let key = PoolKey::new(invocation.tenant.clone(), invocation.deployment.clone());

        // Step 2: ensure source is loaded and memoized.
        let source = self.ensure_source(&key)?;

        // Step 3: lease an instance, (re)building the pool if necessary.
        let pool = self.ensure_pool(&key, &source)?;
        let mut instance = pool.lease().await?;

        let deadline_duration = invocation.deadline.unwrap_or(self.config.execution_time_budget);
        let deadline = start + deadline_duration;
        let timed_out = Arc::new(AtomicBool::new(false));

        let outcome = self.run_invocation(&mut instance, &invocation, deadline, &timed_out);

        // Step 5 (deferred cleanup): classify, decide the instance's fate.
        let timed_out = timed_out.load(Ordering::SeqCst);
        let mut result = InvocationResult {
            duration: start.elapsed(),
            timed_out,
            ..Default::default()
        };

        match outcome {
            Ok(Outcome::Response(response, request_id)) => {
                result.response = Some(response);
                result.logs = self.clear_and_take_logs(request_id);
                if instance.release().is_ok() {
                    pool.release(instance);
                } else {
                    pool.invalidate();
                }
            }
            Ok(Outcome::WebSocketUpgrade(request_id)) => {
                // Instance ownership moves to the caller via the handle;
                // it's neither released nor destroyed here (§4.5 step 13).
                tracing::debug!(%request_id, "handed off to websocket bridge");
                result.websocket = Some(WebSocketHandle {
                    request_id,
                    instance: Some(instance),
                    pool: pool.clone(),
                    request_states: self.request_states.clone(),
                });
            }
            Ok(Outcome::Other(request_id)) => {
                result.logs = self.clear_and_take_logs(request_id);
                if instance.release().is_ok() {
                    pool.release(instance);
                } else {
                    pool.invalidate();
                }
            }
            Err((err, request_id)) => {
                if let Some(id) = request_id {
                    result.logs = self.clear_and_take_logs(id);
                }
                result.error = Some(if timed_out {
                    format!("handler execution timed out after {}ms", deadline_duration.as_millis())
                } else {
                    err.to_string()
                });
                result.timed_out = timed_out;
                // Timeouts and panics invalidate the pool (§7); an ordinary
                // handler error or rejection preserves the instance.
                if timed_out {
                    pool.invalidate();
                    drop(instance);
                } else if instance.release().is_ok() {
                    pool.release(instance);
                } else {
                    pool.invalidate();
                }
            }
        }

        Ok(result)
    }

    fn ensure_source(&self, key: &PoolKey) -> Result<Arc<str>> {
        if let Some(source) = self.sources.get(key) {
            return Ok(source.clone());
        }
        let source = self.source_loader.load_source(&key.tenant, &key.deployment)?;
        self.sources.insert(key.clone(), source.clone());
        Ok(source)
    }

    fn ensure_pool(&self, key: &PoolKey, source: &Arc<str>) -> Result<Arc<Pool>> {
        if let Some(pool) = self.pools.get(key) {
            return Ok(pool);
        }
        let pool_size = self.config.pool_size;
        let factory = self.instance_factory.clone();
        let source = source.clone();
        let named = self
            .named_handlers
            .get(key)
            .map(|n| n.clone())
            .unwrap_or_default();
        let pool = Pool::build(pool_size, || {
            let mut instance = factory.build_instance(&source)?;
            compile_handlers(&mut instance, &source, &named)?;
            Ok(instance.into_loaded()?)
        })?;
        Ok(self.pools.insert(key.clone(), pool))
    }

    fn clear_and_take_logs(&self, request_id: RequestId) -> Vec<LogEntry> {
        self.request_states
            .clear_request_state(request_id)
            .map(|cleared| cleared.logs)
            .unwrap_or_default()
    }

    /// Steps 4, 6-13: arm the watchdog and drive one invocation's JS-side
    /// lifecycle. Returns the request id via every variant so the caller can
    /// always clear its state regardless of which path was taken.
    fn run_invocation(
        &self,
        instance: &mut LoadedInstance,
        invocation: &Invocation,
        deadline: Instant,
        timed_out: &Arc<AtomicBool>,
    ) -> std::result::Result<Outcome, (KernelError, Option<RequestId>)> {
        // Step 6: allocate and install the request-state record.
        let request_id = self.request_states.new_request_state(self.config.max_fetch_requests);
        let wrap_err = |e: KernelError| (e, Some(request_id));

        let timeout_flag = timed_out.clone();
        let remaining = deadline.saturating_duration_since(Instant::now());
        let monitor = WallClockMonitor::new(remaining.max(Duration::from_millis(1)))
            .map_err(|e| wrap_err(KernelError::MonitorFailed(e.to_string())))?;

        instance
            .with_monitor(&monitor, |instance| {
                let outcome = self.drive(instance, invocation, deadline, request_id);
                if outcome.is_err() && Instant::now() >= deadline {
                    timeout_flag.store(true, Ordering::SeqCst);
                }
                outcome
            })
            .map_err(wrap_err)
    }

    fn drive(
        &self,
        instance: &mut LoadedInstance,
        invocation: &Invocation,
        deadline: Instant,
        request_id: RequestId,
    ) -> Result<Outcome> {
        // Step 6 (cont'd): request id as a string global.
        instance.set_global(
            worker_js_common::globals::REQUEST_ID,
            GlobalValue::String(request_id.to_string()),
        )?;

        // Step 7: build `env` and `ctx`.
        instance.evaluate(&invocation.env.build_script())?;
        instance.evaluate(CTX_SCRIPT)?;

        // Step 8: invoke the handler. This only dispatches the call and arms
        // its await machinery — it does not block until the returned value
        // settles (§9's coroutine-style awaiting).
        let handler_name = invocation.kind.handler_name();
        let event_json = invocation.kind.event_json()?;
        instance.handle_event(handler_name, event_json, Some(true))?;

        // Steps 9-10: drain the event loop — firing due timers and pumping
        // microtasks — until the handler's returned promise settles or the
        // deadline passes, then surface a rejection as an error.
        self.await_call_result(instance, deadline)?;

        match handler_name {
            "fetch" => {
                // Step 11: extract the Response.
                let envelope = self.extract_response(instance)?;
                // Step 12: drain ctx.waitUntil before returning.
                self.drain_wait_until(instance, deadline)?;
                if envelope.websocket {
                    // Step 13: hand off to a WebSocket bridge. The caller
                    // (`execute`) attaches the instance and pool, since this
                    // method only borrows the instance mutably.
                    return Ok(Outcome::WebSocketUpgrade(request_id));
                }
                let body = if envelope.has_body {
                    let bytes = instance.read_binary(worker_js_common::globals::RESPONSE_BODY_BYTES)?;
                    match String::from_utf8(bytes) {
                        Ok(text) => ResponseBody::Text(text),
                        Err(err) => ResponseBody::Bytes(err.into_bytes()),
                    }
                } else {
                    ResponseBody::Text(String::new())
                };
                Ok(Outcome::Response(
                    HostResponse {
                        status: envelope.status,
                        headers: envelope.headers,
                        body,
                    },
                    request_id,
                ))
            }
            _ => {
                self.drain_wait_until(instance, deadline)?;
                Ok(Outcome::Other(request_id))
            }
        }
    }

    /// Poll `AWAITED_STATE` while draining the event loop — firing due
    /// timers and pumping microtasks — until the handler's returned promise
    /// settles or `deadline` passes (§4.5 steps 9-10, §9). `run_handler`
    /// already pumped microtasks once, so a synchronously-returned value is
    /// typically already settled on the first check; a promise depending on
    /// a `setTimeout` needs this loop to actually fire that timer, which
    /// `run_handler`'s own promise resolution could never see.
    fn await_call_result(&self, instance: &mut LoadedInstance, deadline: Instant) -> Result<()> {
        use worker_js_common::globals::{AWAITED_RESULT, AWAITED_STATE};
        loop {
            let state = instance.evaluate_to_string(&format!("globalThis[\"{AWAITED_STATE}\"] || \"\""))?;
            match state.as_str() {
                "fulfilled" => return Ok(()),
                "rejected" => {
                    let message =
                        instance.evaluate_to_string(&format!("String(globalThis[\"{AWAITED_RESULT}\"] ?? \"\")"))?;
                    return Err(crate::new_error!("handler rejected: {message}"));
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(crate::new_error!("handler's returned promise did not settle before the deadline"));
            }
            instance.drain_event_loop(
                (Instant::now() + Duration::from_millis(1)).min(deadline),
                || false,
            );
        }
    }

    fn extract_response(&self, instance: &mut LoadedInstance) -> Result<ResponseEnvelope> {
        let json = instance.evaluate_to_string(&extract_response_script())?;
        serde_json::from_str(&json).map_err(KernelError::InvalidEvent)
    }

    fn drain_wait_until(&self, instance: &mut LoadedInstance, deadline: Instant) -> Result<()> {
        instance.evaluate(DRAIN_WAIT_UNTIL_SCRIPT)?;
        loop {
            if instance.evaluate_to_bool("globalThis.__wait_until_done === true")? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            instance.drain_event_loop(
                (Instant::now() + Duration::from_millis(1)).min(deadline),
                || false,
            );
            std::thread::sleep(Duration::from_millis(1));
        }
    }

}

impl Dispatcher for Engine {
    /// A minimal, working `Dispatcher`: re-enters `execute` for the target
    /// `(tenant, deployment)` on the shared monitor runtime. Real
    /// service-binding adapters (out of scope, §1) would thread a richer env
    /// (vars/secrets/bindings) through; this capability only proves the
    /// call-back-into-the-engine shape §9 describes.
    fn dispatch(&self, tenant: &str, deployment: &str, request: HostRequest) -> Result<HostResponse> {
        let invocation = Invocation {
            tenant: tenant.to_string(),
            deployment: deployment.to_string(),
            env: EnvSpec::default(),
            kind: InvocationKind::Fetch(request),
            deadline: None,
        };
        let runtime = crate::monitor::runtime::get_monitor_runtime()
            .ok_or_else(|| crate::new_error!("monitor runtime unavailable for dispatcher"))?;
        let result = runtime.block_on(self.execute(invocation))?;
        result
            .response
            .ok_or_else(|| crate::new_error!("dispatched invocation returned no response"))
    }
}

enum Outcome {
    Response(HostResponse, RequestId),
    WebSocketUpgrade(RequestId),
    Other(RequestId),
}

const CTX_SCRIPT: &str = r#"
(function () {
    globalThis.__wait_until_promises = [];
    globalThis.ctx = {
        waitUntil(promise) { globalThis.__wait_until_promises.push(promise); },
        passThroughOnException() {},
    };
})();
"#;

/// Extracts status/headers/websocket-flag from the handler's settled return
/// value (`CALL_RESULT`) — a real `Response` once `run_handler`'s await
/// dispatch has settled it. The body itself isn't read here: it was already
/// resolved asynchronously (since `Response.arrayBuffer()` is itself a
/// promise) and stashed as raw bytes under `RESPONSE_BODY_BYTES` before the
/// await state flipped to `"fulfilled"`; this script only reports whether
/// that binary global was populated, so the caller knows to read it.
fn extract_response_script() -> String {
    use worker_js_common::globals::{CALL_RESULT, RESPONSE_BODY_BYTES};
    format!(
        r#"(function () {{
    const response = globalThis["{call_result}"];
    const headers = [];
    if (response && response.headers) {{
        for (const [k, v] of response.headers.entries()) headers.push([k, v]);
    }}
    const websocket = !!(response && response.webSocket);
    const status = response ? response.status : 200;
    const hasBody = typeof globalThis["{body_bytes}"] !== "undefined";
    return JSON.stringify({{ status, headers, websocket, has_body: hasBody }});
}})();"#,
        call_result = CALL_RESULT,
        body_bytes = RESPONSE_BODY_BYTES,
    )
}

const DRAIN_WAIT_UNTIL_SCRIPT: &str = r#"
(function () {
    globalThis.__wait_until_done = false;
    Promise.allSettled(globalThis.__wait_until_promises || []).then(() => {
        globalThis.__wait_until_done = true;
    });
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceBuilder;

    struct FixedSource(Arc<str>);

    impl SourceLoader for FixedSource {
        fn load_source(&self, _tenant: &str, _deployment: &str) -> Result<Arc<str>> {
            Ok(self.0.clone())
        }
    }

    struct PlainFactory;

    impl InstanceFactory for PlainFactory {
        fn build_instance(&self, _source: &str) -> Result<Instance> {
            InstanceBuilder::new().build()?.load_runtime()
        }
    }

    fn build_engine(source: &str) -> Engine {
        Engine::new(
            crate::config::KernelConfig::default(),
            Arc::new(FixedSource(Arc::from(source))),
            Arc::new(PlainFactory),
        )
    }

    fn request() -> HostRequest {
        HostRequest {
            method: "GET".to_string(),
            url: "http://example.invalid/".to_string(),
            headers: vec![],
            body: None,
        }
    }

    #[test]
    fn env_spec_build_script_orders_vars_then_secrets_then_bindings() {
        let mut env = EnvSpec::default();
        env.vars.insert("A".to_string(), "1".to_string());
        env.secrets.insert("B".to_string(), "2".to_string());
        env.bindings.push(BindingSpec {
            name: "store".to_string(),
            factory: "__makeKv".to_string(),
        });

        let script = env.build_script();
        let vars_at = script.find("env[\"A\"]").unwrap();
        let secrets_at = script.find("env[\"B\"]").unwrap();
        let bindings_at = script.find("env[\"store\"]").unwrap();
        assert!(vars_at < secrets_at);
        assert!(secrets_at < bindings_at);
        assert!(script.contains("globalThis[\"__makeKv\"](\"store\")"));
    }

    #[test]
    fn invocation_kind_handler_name_and_event_json() {
        let fetch = InvocationKind::Fetch(request());
        assert_eq!(fetch.handler_name(), "fetch");

        let named = InvocationKind::Named {
            name: "greet".to_string(),
            args: vec![serde_json::json!("Ada")],
        };
        assert_eq!(named.handler_name(), "greet");
        assert_eq!(named.event_json().unwrap(), "[\"Ada\"]");
    }

    #[test]
    fn drive_extracts_text_response_and_headers() {
        let engine = build_engine("");
        let source = r#"
            function fetch(req, env, ctx) {
                return new Response("created", {
                    status: 201,
                    headers: new Headers({ "x-greeting": "hello " + env.GREETING }),
                });
            }
        "#;
        let mut instance = InstanceBuilder::new().build().unwrap().load_runtime().unwrap();
        compile_handlers(&mut instance, source, &[]).unwrap();
        let mut loaded = instance.into_loaded().unwrap();

        let mut env = EnvSpec::default();
        env.vars.insert("GREETING".to_string(), "world".to_string());
        let invocation = Invocation {
            tenant: "t1".to_string(),
            deployment: "d1".to_string(),
            env,
            kind: InvocationKind::Fetch(request()),
            deadline: None,
        };
        let request_id = engine.request_states.new_request_state(10);
        let deadline = Instant::now() + Duration::from_secs(5);

        match engine.drive(&mut loaded, &invocation, deadline, request_id).unwrap() {
            Outcome::Response(response, _) => {
                assert_eq!(response.status, 201);
                assert_eq!(response.headers, vec![("x-greeting".to_string(), "hello world".to_string())]);
                match response.body {
                    ResponseBody::Text(text) => assert_eq!(text, "created"),
                    ResponseBody::Bytes(_) => panic!("expected a text body"),
                }
            }
            Outcome::WebSocketUpgrade(_) => panic!("expected Outcome::Response, got a websocket upgrade"),
            Outcome::Other(_) => panic!("expected Outcome::Response, got Outcome::Other"),
        }
    }

    #[test]
    fn drive_detects_websocket_upgrade() {
        let engine = build_engine("");
        let source = r#"
            function fetch(req, env, ctx) {
                return new Response(null, { status: 101, webSocket: {} });
            }
        "#;
        let mut instance = InstanceBuilder::new().build().unwrap().load_runtime().unwrap();
        compile_handlers(&mut instance, source, &[]).unwrap();
        let mut loaded = instance.into_loaded().unwrap();

        let invocation = Invocation {
            tenant: "t1".to_string(),
            deployment: "d1".to_string(),
            env: EnvSpec::default(),
            kind: InvocationKind::Fetch(request()),
            deadline: None,
        };
        let request_id = engine.request_states.new_request_state(10);
        let deadline = Instant::now() + Duration::from_secs(5);

        let outcome = engine.drive(&mut loaded, &invocation, deadline, request_id).unwrap();
        assert!(matches!(outcome, Outcome::WebSocketUpgrade(_)));
    }

    #[test]
    fn drive_dispatches_named_handler() {
        let engine = build_engine("");
        let source = r#"
            function greet(env, name) { return { greeting: "hi " + name }; }
        "#;
        let mut instance = InstanceBuilder::new().build().unwrap().load_runtime().unwrap();
        compile_handlers(&mut instance, source, &["greet".to_string()]).unwrap();
        let mut loaded = instance.into_loaded().unwrap();

        let invocation = Invocation {
            tenant: "t1".to_string(),
            deployment: "d1".to_string(),
            env: EnvSpec::default(),
            kind: InvocationKind::Named {
                name: "greet".to_string(),
                args: vec![serde_json::json!("Ada")],
            },
            deadline: None,
        };
        let request_id = engine.request_states.new_request_state(10);
        let deadline = Instant::now() + Duration::from_secs(5);

        let outcome = engine.drive(&mut loaded, &invocation, deadline, request_id).unwrap();
        assert!(matches!(outcome, Outcome::Other(_)));
    }

    #[test]
    fn run_invocation_enforces_wall_clock_timeout() {
        let engine = build_engine("");
        let source = "function spin(env) { while (true) {} }";
        let mut instance = InstanceBuilder::new().build().unwrap().load_runtime().unwrap();
        compile_handlers(&mut instance, source, &["spin".to_string()]).unwrap();
        let mut loaded = instance.into_loaded().unwrap();

        let invocation = Invocation {
            tenant: "t1".to_string(),
            deployment: "d1".to_string(),
            env: EnvSpec::default(),
            kind: InvocationKind::Named {
                name: "spin".to_string(),
                args: vec![],
            },
            deadline: Some(Duration::from_millis(50)),
        };
        let deadline = Instant::now() + Duration::from_millis(50);
        let timed_out = Arc::new(AtomicBool::new(false));

        let result = engine.run_invocation(&mut loaded, &invocation, deadline, &timed_out);
        assert!(result.is_err(), "spinning handler should be killed by the wall-clock monitor");
    }

    #[test]
    fn dispatcher_dispatch_calls_back_into_engine() {
        let source = r#"
            function fetch(req, env, ctx) {
                return new Response("pong");
            }
        "#;
        let engine = build_engine(source);

        let response = engine.dispatch("t1", "d1", request()).unwrap();
        assert_eq!(response.status, 200);
        match response.body {
            ResponseBody::Text(text) => assert_eq!(text, "pong"),
            ResponseBody::Bytes(_) => panic!("expected a text body"),
        }
    }
}
