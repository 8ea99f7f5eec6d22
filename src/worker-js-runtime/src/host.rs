use anyhow::Result;

/// The per-instance collaborator that resolves and loads ES module source.
/// The kernel implements this once per tenant/deployment module set.
pub trait Host: Send + Sync {
    /// Resolve a module name to a module specifier (usually a path).
    /// The base is the specifier of the module that is importing the module.
    fn resolve_module(&self, base: String, name: String) -> Result<String>;

    /// Obtain the module source code for a given module specifier.
    fn load_module(&self, name: String) -> Result<String>;
}

impl Host for Box<dyn Host> {
    fn resolve_module(&self, base: String, name: String) -> Result<String> {
        (**self).resolve_module(base, name)
    }

    fn load_module(&self, name: String) -> Result<String> {
        (**self).load_module(name)
    }
}
