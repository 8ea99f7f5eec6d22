use std::collections::HashMap;
use std::sync::LazyLock;

use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::ModuleDef;
use rquickjs::{Ctx, Module, Result};

pub mod console;
pub mod io;
pub mod require;

/// A loader for the native Rust modules baked into every instance
/// (`console`, `io`, `require`) — distinct from [`crate::host_fn::HostModuleLoader`],
/// which loads modules registered at runtime by the kernel for a specific binding.
#[derive(Clone)]
pub struct NativeModuleLoader;

type ModuleDeclarationFn = for<'js> fn(Ctx<'js>, &str) -> Result<Module<'js>>;

/// Doing `declaration::<M>()(ctx, "some_name")` is the same as calling
/// `Module::declare_def::<M>(ctx, "some_name")` directly, but avoids a
/// lifetime conflict that shows up when taking a function pointer straight
/// off `Module::declare_def::<M>`.
fn declaration<M: ModuleDef>() -> ModuleDeclarationFn {
    fn declare<'js, M: ModuleDef>(ctx: Ctx<'js>, name: &str) -> Result<Module<'js>> {
        Module::declare_def::<M, _>(ctx, name)
    }
    declare::<M>
}

static NATIVE_MODULES: LazyLock<HashMap<&str, ModuleDeclarationFn>> = LazyLock::new(|| {
    HashMap::from([
        ("io", declaration::<io::js_io>()),
        ("console", declaration::<console::js_console>()),
        ("require", declaration::<require::js_require>()),
    ])
});

impl Resolver for NativeModuleLoader {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> Result<String> {
        if NATIVE_MODULES.contains_key(name) {
            Ok(name.to_string())
        } else {
            Err(rquickjs::Error::new_resolving(base, name))
        }
    }
}

impl Loader for NativeModuleLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> Result<Module<'js>> {
        if let Some(declaration) = NATIVE_MODULES.get(name) {
            declaration(ctx.clone(), name)
        } else {
            Err(rquickjs::Error::new_loading(name))
        }
    }
}
