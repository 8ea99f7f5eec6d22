use rquickjs::Ctx;

/// Installs `setTimeout`/`clearTimeout` in terms of the `timers` host module
/// (`schedule`/`cancel`), which the kernel registers on every instance before
/// a worker module is evaluated. The actual deadline bookkeeping lives in the
/// instance's event loop on the host side; this is just the JS-facing shape
/// callers expect.
const SOURCE: &str = r#"
(function () {
    let nextTimerId = 1;
    const callbacks = new Map();

    globalThis.setTimeout = function (fn, delayMs) {
        const id = nextTimerId++;
        callbacks.set(id, fn);
        const timers = require('timers');
        timers.schedule(id, delayMs || 0);
        return id;
    };

    globalThis.clearTimeout = function (id) {
        callbacks.delete(id);
        const timers = require('timers');
        timers.cancel(id);
    };

    globalThis.__fireTimer = function (id) {
        const fn = callbacks.get(id);
        callbacks.delete(id);
        if (fn) fn();
    };
})();
"#;

pub fn setup(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    ctx.eval::<(), _>(SOURCE)
}
