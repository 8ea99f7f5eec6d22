//! Stage 1 of the instance lifecycle: accumulate host function registrations
//! and module-resolution configuration before the JS heap is created.

use std::fmt::Debug;
use std::path::PathBuf;

use oxc_resolver::{ResolveOptions, ResolverGeneric};
use tracing::{instrument, Level};
use worker_js_runtime::host::Host;
use worker_js_runtime::HostFunction;

use crate::error::Result;
use crate::instance::instance::Instance;
use crate::instance::metrics::InstanceMetricsGuard;
use crate::resolver::FileSystem;

/// Resolves and loads modules from a host [`FileSystem`] via `oxc_resolver`.
struct FsHost<Fs: FileSystem + Clone> {
    resolver: ResolverGeneric<Fs>,
    file_system: Fs,
}

impl<Fs> Host for FsHost<Fs>
where
    Fs: FileSystem + Clone + Send + Sync + 'static,
{
    fn resolve_module(&self, base: String, name: String) -> anyhow::Result<String> {
        let resolved = self.resolver.resolve(&base, &name).map_err(|e| {
            anyhow::anyhow!("failed to resolve module '{name}' from '{base}': {e:?}")
        })?;
        Ok(resolved.path().to_string_lossy().to_string())
    }

    fn load_module(&self, name: String) -> anyhow::Result<String> {
        let path = PathBuf::from(&name);
        self.file_system
            .read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read module '{name}': {e}"))
    }
}

/// Default module resolution: an instance with no file system backing can't
/// import anything, which is the right default for a worker whose source is
/// handed in as a single inline script.
#[derive(Clone, Copy, Default)]
struct NoModules;

impl Host for NoModules {
    fn resolve_module(&self, base: String, name: String) -> anyhow::Result<String> {
        Err(anyhow::anyhow!(
            "module imports are not supported: '{name}' imported from '{base}'"
        ))
    }

    fn load_module(&self, name: String) -> anyhow::Result<String> {
        Err(anyhow::anyhow!("module imports are not supported: '{name}'"))
    }
}

/// A worker instance with no JS heap loaded. Used to register host functions
/// and module resolution prior to [`ProtoInstance::load_runtime`].
pub struct ProtoInstance {
    host: Box<dyn Host>,
    host_functions: Vec<(String, String, HostFunction)>,
    _metric_guard: InstanceMetricsGuard<ProtoInstance>,
}

impl ProtoInstance {
    pub(crate) fn new() -> Self {
        Self {
            host: Box::new(NoModules),
            host_functions: Vec::new(),
            _metric_guard: InstanceMetricsGuard::new(),
        }
    }

    /// Install a file system for module resolution and loading, enabling
    /// worker source to `import` other modules.
    #[instrument(skip_all, level = Level::INFO)]
    pub fn set_module_loader<Fs>(mut self, file_system: Fs) -> Self
    where
        Fs: FileSystem + Clone + Send + Sync + 'static,
    {
        let resolver = ResolverGeneric::new_with_file_system(
            file_system.clone(),
            ResolveOptions {
                extensions: vec![".js".into(), ".mjs".into()],
                condition_names: vec!["import".into(), "module".into()],
                ..Default::default()
            },
        );
        self.host = Box::new(FsHost { resolver, file_system });
        self
    }

    /// Register a host function importable from JS as `require("<module>").<name>`.
    ///
    /// Calling this multiple times with the same `(module, name)` overwrites
    /// the previous registration. Must be called before [`load_runtime`](Self::load_runtime) —
    /// after that, the set of host functions is fixed for the resulting [`Instance`].
    #[instrument(skip(self, func), level = Level::INFO)]
    pub fn register(
        &mut self,
        module: impl Into<String> + Debug,
        name: impl Into<String> + Debug,
        func: HostFunction,
    ) -> &mut Self {
        self.host_functions.push((module.into(), name.into(), func));
        self
    }

    /// Create the JS heap, instantiate the runtime adapter around it, and
    /// replay every registered host function — the start of §4.3's
    /// instance-construction sequence.
    #[instrument(err(Debug), skip(self), level = Level::INFO)]
    pub fn load_runtime(self) -> Result<Instance> {
        Instance::new(self.host, self.host_functions)
    }
}

impl Debug for ProtoInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtoInstance").finish()
    }
}

impl Default for ProtoInstance {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a new [`ProtoInstance`]. Exists purely to mirror the
/// construction ergonomics of the rest of the kernel's builder types — a
/// `ProtoInstance` has no configuration of its own beyond what `register`/
/// `set_module_loader` provide after construction.
#[derive(Default)]
pub struct InstanceBuilder;

impl InstanceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self
    }

    /// Build the `ProtoInstance`.
    pub fn build(self) -> Result<ProtoInstance> {
        Ok(ProtoInstance::new())
    }
}
