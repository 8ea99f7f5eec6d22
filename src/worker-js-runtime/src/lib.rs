//! Embeds QuickJS (via `rquickjs`) and exposes it to `worker-kernel` behind
//! the [`JsRuntime`] trait, so the pool/engine layer never touches rquickjs
//! types directly.

mod globals;
pub mod host;
mod host_fn;
mod modules;
pub(crate) mod utils;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use rquickjs::loader::{Loader, Resolver};
use rquickjs::{CatchResultExt, Context, Ctx, Function, Module, Persistent, Runtime, Value};
use tracing::instrument;

use crate::host::Host;
pub use crate::host_fn::{HostFunction, HostModule};
use crate::host_fn::HostModuleLoader;
use crate::modules::NativeModuleLoader;
pub use worker_js_common::BinaryTransferMode;

/// Handle used to abort a running handler at the next QuickJS bytecode
/// boundary. Cloneable and cheap — many copies may outlive the instance that
/// created them, but `kill()` is a no-op once the runtime they belonged to is
/// gone.
#[derive(Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    /// Request termination of whatever script is currently executing.
    /// QuickJS polls the interrupt flag at every bytecode boundary, so this
    /// takes effect quickly but not instantly — a single native-call-heavy
    /// bytecode op won't be pre-empted mid-op.
    pub fn kill(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// A value assignable to a JS global via [`JsRuntime::set_global`]. Scalars
/// pass through directly; `Json` round-trips through `JSON.parse` for
/// anything structured (request objects, env bindings, fetch results).
pub enum GlobalValue {
    String(String),
    Number(f64),
    Bool(bool),
    Json(String),
}

/// The contract `worker-kernel` programs against. Everything above this line
/// is QuickJS-specific; everything below is swappable for a second JS engine
/// without touching the pool, engine, or request-state modules.
pub trait JsRuntime: Send {
    /// Evaluate `source` for side effects only.
    fn evaluate(&mut self, source: &str) -> anyhow::Result<()>;
    /// Evaluate `source` and coerce the result to a string.
    fn evaluate_to_string(&mut self, source: &str) -> anyhow::Result<String>;
    /// Evaluate `source` and coerce the result to a bool.
    fn evaluate_to_bool(&mut self, source: &str) -> anyhow::Result<bool>;
    /// Evaluate `source` and coerce the result to an integer.
    fn evaluate_to_int(&mut self, source: &str) -> anyhow::Result<i64>;
    /// Register a function importable from JS as `require("<module>").<name>`.
    fn register_host_function(
        &mut self,
        module: &str,
        name: &str,
        func: HostFunction,
    ) -> anyhow::Result<()>;
    /// Assign `value` to a property of the global object.
    fn set_global(&mut self, name: &str, value: GlobalValue) -> anyhow::Result<()>;
    /// Drain any microtasks (resolved promise continuations) without
    /// blocking. Called by the event loop after every timer fire / fetch
    /// resolution so `.then()` chains make progress.
    fn pump_microtasks(&mut self);
    /// `Some` when the runtime supports the binary fast path (`read_binary`/
    /// `write_binary`); bindings fall back to chunked base64 when `None`.
    fn binary_transfer_mode(&self) -> Option<BinaryTransferMode>;
    /// Read a `Uint8Array` global as raw bytes.
    fn read_binary(&mut self, global_name: &str) -> anyhow::Result<Vec<u8>>;
    /// Write raw bytes into a `Uint8Array` global.
    fn write_binary(&mut self, global_name: &str, bytes: &[u8]) -> anyhow::Result<()>;
    /// A handle capable of aborting whatever is currently executing.
    fn interrupt_handle(&self) -> InterruptHandle;

    /// Declare and evaluate a worker module exporting `handler`, installing
    /// it under `function_name` for later invocation via [`run_handler`](Self::run_handler).
    fn register_handler(
        &mut self,
        function_name: &str,
        handler_script: &str,
        handler_pwd: &str,
    ) -> anyhow::Result<()>;
    /// Invoke a previously registered handler with a JSON-encoded event.
    ///
    /// This does not block until the handler's returned value settles: it
    /// dispatches the call and arms a `.then()` that writes the result onto
    /// the well-known globals in [`worker_js_common::globals`]
    /// (`AWAITED_STATE`/`AWAITED_RESULT`/`CALL_RESULT`), pumping microtasks
    /// once so a synchronously-returned value is already settled by the time
    /// this returns. A promise that depends on a host-side timer stays
    /// pending — the caller polls `AWAITED_STATE` while draining its event
    /// loop (§9's coroutine-style awaiting).
    fn run_handler(&mut self, function_name: &str, event: &str, run_gc: bool) -> anyhow::Result<()>;
}

/// A handler is a JS function registered against the static `Context`.
#[derive(Clone)]
struct Handler<'a> {
    func: Persistent<Function<'a>>,
}

/// QuickJS-backed implementation of [`JsRuntime`]. Owns one JS heap.
pub struct QuickJsRuntime {
    runtime: Runtime,
    context: Context,
    handlers: HashMap<String, Handler<'static>>,
    interrupt_flag: Arc<AtomicBool>,
}

// SAFETY: `rquickjs::Context` isn't `Send` only because it holds a raw
// pointer, which the compiler treats conservatively. Every public method here
// takes `&mut self`, so there is never concurrent access to the underlying
// QuickJS heap — only exclusive handoff between threads, which is sound.
unsafe impl Send for QuickJsRuntime {}

impl QuickJsRuntime {
    #[instrument(skip_all, level = "info")]
    pub fn new<H: Host + 'static>(host: H) -> anyhow::Result<Self> {
        let runtime = Runtime::new().context("initializing QuickJS runtime")?;
        let context = Context::full(&runtime).context("creating QuickJS context")?;

        let interrupt_flag = Arc::new(AtomicBool::new(false));
        let flag = interrupt_flag.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || flag.load(Ordering::SeqCst))));

        let host_loader = HostModuleLoader::default();
        let native_loader = NativeModuleLoader;
        let module_loader = ModuleLoader::new(host);

        let loader = (host_loader.clone(), native_loader, module_loader);
        runtime.set_loader(loader.clone(), loader);

        context.with(|ctx| -> anyhow::Result<()> {
            host_loader.install(&ctx)?;
            globals::setup(&ctx).catch(&ctx)
        })?;

        Ok(Self {
            runtime,
            context,
            handlers: HashMap::new(),
            interrupt_flag,
        })
    }

}

impl JsRuntime for QuickJsRuntime {
    fn evaluate(&mut self, source: &str) -> anyhow::Result<()> {
        self.context.with(|ctx| ctx.eval::<(), _>(source).catch(&ctx))
    }

    fn evaluate_to_string(&mut self, source: &str) -> anyhow::Result<String> {
        self.context.with(|ctx| -> anyhow::Result<String> {
            let value: rquickjs::Coerced<String> = ctx.eval(source).catch(&ctx)?;
            Ok(value.0)
        })
    }

    fn evaluate_to_bool(&mut self, source: &str) -> anyhow::Result<bool> {
        self.context.with(|ctx| ctx.eval(source).catch(&ctx))
    }

    fn evaluate_to_int(&mut self, source: &str) -> anyhow::Result<i64> {
        self.context.with(|ctx| ctx.eval(source).catch(&ctx))
    }

    fn set_global(&mut self, name: &str, value: GlobalValue) -> anyhow::Result<()> {
        self.context.with(|ctx| -> anyhow::Result<()> {
            match value {
                GlobalValue::String(s) => ctx.globals().set(name, s).catch(&ctx)?,
                GlobalValue::Number(n) => ctx.globals().set(name, n).catch(&ctx)?,
                GlobalValue::Bool(b) => ctx.globals().set(name, b).catch(&ctx)?,
                GlobalValue::Json(json) => {
                    let value = ctx.json_parse(json).catch(&ctx)?;
                    ctx.globals().set(name, value).catch(&ctx)?;
                }
            }
            Ok(())
        })
    }

    fn binary_transfer_mode(&self) -> Option<BinaryTransferMode> {
        Some(BinaryTransferMode::Ordinary)
    }

    fn read_binary(&mut self, global_name: &str) -> anyhow::Result<Vec<u8>> {
        self.context.with(|ctx| -> anyhow::Result<Vec<u8>> {
            let value: Value = ctx.globals().get(global_name).catch(&ctx)?;
            utils::as_bytes(value).catch(&ctx)
        })
    }

    fn write_binary(&mut self, global_name: &str, bytes: &[u8]) -> anyhow::Result<()> {
        self.context.with(|ctx| -> anyhow::Result<()> {
            let array = rquickjs::TypedArray::<u8>::new_copy(ctx.clone(), bytes).catch(&ctx)?;
            ctx.globals().set(global_name, array).catch(&ctx)?;
            Ok(())
        })
    }

    fn register_host_function(
        &mut self,
        module: &str,
        name: &str,
        func: HostFunction,
    ) -> anyhow::Result<()> {
        self.context.with(|ctx| {
            ctx.userdata::<HostModuleLoader>()
                .context("HostModuleLoader not found in context")?
                .borrow_mut()
                .entry(module.to_string())
                .or_default()
                .add_function(name.to_string(), func);
            Ok(())
        })
    }

    fn register_handler(
        &mut self,
        function_name: &str,
        handler_script: &str,
        handler_pwd: &str,
    ) -> anyhow::Result<()> {
        let handler_script = if !handler_script.contains("export") {
            format!("{}\nexport {{ handler }};", handler_script)
        } else {
            handler_script.to_string()
        };

        let handler_path = make_handler_path(function_name, handler_pwd);

        let func = self.context.with(|ctx| -> anyhow::Result<_> {
            let module =
                Module::declare(ctx.clone(), handler_path.as_str(), handler_script).catch(&ctx)?;
            let (module, promise) = module.eval().catch(&ctx)?;
            promise.finish::<()>().catch(&ctx)?;

            let handler_func: Function = module.get("handler").catch(&ctx)?;
            Ok(Persistent::save(&ctx, handler_func))
        })?;

        self.handlers
            .insert(function_name.to_string(), Handler { func });
        Ok(())
    }

    fn run_handler(&mut self, function_name: &str, event: &str, run_gc: bool) -> anyhow::Result<()> {
        let handler = self
            .handlers
            .get(function_name)
            .with_context(|| format!("no handler registered for function {function_name}"))?
            .clone();

        let _flush = FlushGuard;

        self.context.with(|ctx| -> anyhow::Result<()> {
            let _gc_guard = MaybeRunGcGuard::new(run_gc, &ctx);

            let func = handler.func.clone().restore(&ctx).catch(&ctx)?;
            let arg = ctx.json_parse(event).catch(&ctx)?;
            let value: Value = func.call((arg,)).catch(&ctx)?;

            let dispatch: Function = ctx.eval(await_dispatch_script()).catch(&ctx)?;
            dispatch.call::<_, ()>((value,)).catch(&ctx)?;
            Ok(())
        })?;

        // The dispatch's `.then()` is queued as a microtask; draining it now
        // means a handler that returned a plain, non-promise value is
        // already settled by the time this call returns. A promise that
        // depends on a host-side timer stays pending here.
        self.pump_microtasks();

        Ok(())
    }

    fn pump_microtasks(&mut self) {
        while self.runtime.execute_pending_job() {}
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            flag: self.interrupt_flag.clone(),
        }
    }
}

impl Drop for QuickJsRuntime {
    fn drop(&mut self) {
        modules::io::io::flush();
        // Clear handlers to drop their `Persistent` references before the
        // `Context` drops — otherwise QuickJS aborts on what it sees as a
        // leaked reference.
        self.handlers.clear();
    }
}

/// Module loader that calls out to the kernel's [`Host`] to resolve and load
/// worker module source.
#[derive(Clone)]
struct ModuleLoader {
    host: std::rc::Rc<dyn Host>,
}

impl ModuleLoader {
    fn new(host: impl Host + 'static) -> Self {
        Self {
            host: std::rc::Rc::new(host),
        }
    }
}

impl Resolver for ModuleLoader {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        // QuickJS uses the module path as `base`, but oxc_resolver expects a directory.
        let (dir, _) = base.rsplit_once('/').unwrap_or((".", ""));

        let path = self
            .host
            .resolve_module(dir.to_string(), name.to_string())
            .map_err(|_err| rquickjs::Error::new_resolving(base, name))?;

        Ok(path.replace('\\', "/"))
    }
}

impl Loader for ModuleLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js>> {
        let source = self
            .host
            .load_module(name.to_string())
            .map_err(|_err| rquickjs::Error::new_loading(name))?;

        Module::declare(ctx.clone(), name, source)
    }
}

/// Builds the coroutine-style await dispatcher (§4.5 step 10, §9): called
/// with the handler's raw return value, it wraps it in `Promise.resolve` (a
/// no-op for an already-plain value) and settles the well-known globals once
/// it resolves or rejects. When the resolved value looks like a `Response`
/// (has an `arrayBuffer` method), its body is resolved too and stashed as raw
/// bytes under [`worker_js_common::globals::RESPONSE_BODY_BYTES`] before the
/// state flips to `"fulfilled"`, so the caller never observes a settled
/// state with an unread body (§4.5 step 11).
fn await_dispatch_script() -> String {
    use worker_js_common::globals::{AWAITED_RESULT, AWAITED_STATE, CALL_RESULT, RESPONSE_BODY_BYTES};
    format!(
        r#"(function (value) {{
    globalThis["{call_result}"] = undefined;
    globalThis["{awaited_state}"] = undefined;
    globalThis["{awaited_result}"] = undefined;
    globalThis["{body_bytes}"] = undefined;

    function fail(e) {{
        globalThis["{awaited_state}"] = "rejected";
        globalThis["{awaited_result}"] = (e && e.message) ? e.message : String(e);
    }}
    function settle(v) {{
        globalThis["{call_result}"] = v;
        globalThis["{awaited_state}"] = "fulfilled";
    }}

    Promise.resolve(value).then(function (v) {{
        if (v && typeof v.arrayBuffer === "function") {{
            v.arrayBuffer().then(function (buf) {{
                globalThis["{body_bytes}"] = new Uint8Array(buf);
                settle(v);
            }}, fail);
        }} else {{
            settle(v);
        }}
    }}, fail);
}})"#,
        call_result = CALL_RESULT,
        awaited_state = AWAITED_STATE,
        awaited_result = AWAITED_RESULT,
        body_bytes = RESPONSE_BODY_BYTES,
    )
}

fn make_handler_path(function_name: &str, handler_dir: &str) -> String {
    let handler_dir = if handler_dir.is_empty() { "." } else { handler_dir };
    let function_name = if function_name.is_empty() { "handler" } else { function_name };

    let function_name = function_name.replace('\\', "/");
    let mut handler_path = handler_dir.replace('\\', "/");
    if !handler_path.ends_with('/') {
        handler_path.push('/');
    }
    handler_path.push_str(&function_name);

    if !handler_path.ends_with(".js") && !handler_path.ends_with(".mjs") {
        handler_path.push_str(".js");
    }
    handler_path
}

struct FlushGuard;

impl Drop for FlushGuard {
    fn drop(&mut self) {
        modules::io::io::flush();
    }
}

trait CatchJsErrorExt {
    type Ok;
    fn catch(self, ctx: &Ctx<'_>) -> anyhow::Result<Self::Ok>;
}

impl<T> CatchJsErrorExt for rquickjs::Result<T> {
    type Ok = T;
    fn catch(self, ctx: &Ctx<'_>) -> anyhow::Result<T> {
        match CatchResultExt::catch(self, ctx) {
            Ok(v) => Ok(v),
            Err(e) => Err(anyhow!("runtime error: {e:#?}")),
        }
    }
}

struct MaybeRunGcGuard<'a> {
    run_gc: bool,
    ctx: Ctx<'a>,
}

impl<'a> MaybeRunGcGuard<'a> {
    fn new(run_gc: bool, ctx: &Ctx<'a>) -> Self {
        Self {
            run_gc,
            ctx: ctx.clone(),
        }
    }
}

impl Drop for MaybeRunGcGuard<'_> {
    fn drop(&mut self) {
        if self.run_gc {
            self.ctx.run_gc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoModules;
    impl Host for NoModules {
        fn resolve_module(&self, _base: String, name: String) -> anyhow::Result<String> {
            Ok(name)
        }
        fn load_module(&self, name: String) -> anyhow::Result<String> {
            anyhow::bail!("no modules available: {name}")
        }
    }

    fn awaited_state(rt: &mut QuickJsRuntime) -> String {
        rt.evaluate_to_string(&format!(
            "globalThis[\"{}\"] || \"\"",
            worker_js_common::globals::AWAITED_STATE
        ))
        .unwrap()
    }

    fn call_result_json(rt: &mut QuickJsRuntime) -> serde_json::Value {
        let json = rt
            .evaluate_to_string(&format!(
                "JSON.stringify(globalThis[\"{}\"])",
                worker_js_common::globals::CALL_RESULT
            ))
            .unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn register_and_run_handler() {
        let mut rt = QuickJsRuntime::new(NoModules).unwrap();
        rt.register_handler(
            "handler",
            "function handler(event) { return { doubled: event.n * 2 }; }",
            "",
        )
        .unwrap();

        rt.run_handler("handler", r#"{"n": 21}"#, true).unwrap();

        assert_eq!(awaited_state(&mut rt), "fulfilled");
        assert_eq!(call_result_json(&mut rt)["doubled"], 42);
    }

    #[test]
    fn run_handler_settles_an_actual_promise_synchronously() {
        let mut rt = QuickJsRuntime::new(NoModules).unwrap();
        rt.register_handler(
            "handler",
            "function handler(event) { return Promise.resolve({ doubled: event.n * 2 }); }",
            "",
        )
        .unwrap();

        rt.run_handler("handler", r#"{"n": 10}"#, true).unwrap();

        assert_eq!(awaited_state(&mut rt), "fulfilled");
        assert_eq!(call_result_json(&mut rt)["doubled"], 20);
    }

    #[test]
    fn run_handler_surfaces_a_rejection() {
        let mut rt = QuickJsRuntime::new(NoModules).unwrap();
        rt.register_handler(
            "handler",
            "function handler(event) { return Promise.reject(new Error('boom')); }",
            "",
        )
        .unwrap();

        rt.run_handler("handler", "{}", true).unwrap();

        assert_eq!(awaited_state(&mut rt), "rejected");
        let message = rt
            .evaluate_to_string(&format!(
                "String(globalThis[\"{}\"] ?? \"\")",
                worker_js_common::globals::AWAITED_RESULT
            ))
            .unwrap();
        assert_eq!(message, "boom");
    }

    #[test]
    fn interrupt_handle_aborts_running_script() {
        let mut rt = QuickJsRuntime::new(NoModules).unwrap();
        rt.register_handler("spin", "function handler(event) { while (true) {} }", "")
            .unwrap();

        let handle = rt.interrupt_handle();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            handle.kill();
        });

        let result = rt.run_handler("spin", "{}", false);
        thread.join().unwrap();
        assert!(result.is_err());
    }
}
