use rquickjs::{Ctx, Module, Object, Result};

#[rquickjs::module(rename_vars = "camelCase", rename_types = "camelCase")]
#[allow(clippy::module_inception)]
pub mod require {
    use super::*;

    /// A thin wrapper around dynamic `import()` that returns the module
    /// exports, or — for modules with top-level await — the still-pending
    /// promise.
    #[rquickjs::function]
    pub fn require<'js>(ctx: Ctx<'js>, name: String) -> Result<Object<'js>> {
        let promise = Module::import(&ctx, name)?;
        match promise.finish::<Object<'js>>() {
            Ok(result) => Ok(result),
            Err(_) => {
                // finish() can only fail with WouldBlock here, meaning the
                // promise isn't settled yet; hand it back as-is.
                Ok(promise.into_inner())
            }
        }
    }

    // Used for `import require from 'require'` as opposed to the named
    // `import { require } from 'require'`.
    #[rquickjs::function]
    pub fn default<'js>(ctx: Ctx<'js>, name: String) -> Result<Object<'js>> {
        require(ctx, name)
    }
}
