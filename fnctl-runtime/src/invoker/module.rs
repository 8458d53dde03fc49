use {
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::{Arc, Mutex, RwLock, PoisonError},
        time::{Duration, SystemTime},
    },
    futures::future::BoxFuture,
    tokio::time::timeout,
    tracing::info,
    fnctl_core::{GuestPayload, InvocationResult},
    crate::{
        error::InvokeError,
        invoker::{Invocation, Invoker},
        store::FunctionKind,
    },
};

/// Loaded, ready to call unit of user code.
pub trait Handler: Send + Sync {
    fn call(&self, payload: &GuestPayload) -> Result<InvocationResult, InvokeError>;
}

/// Turns a module source file into a [`Handler`] for the given exported symbol.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, source: &Path, symbol: &str) -> Result<Arc<dyn Handler>, InvokeError>;
}

/// Runs `module` functions in-process, reloading them when their source file changes.
pub struct ModuleInvoker {
    inner: Arc<HandlerCache>,
    timeout: Duration,
}

struct HandlerCache {
    loader: Box<dyn ModuleLoader>,
    // one slot per function. Slot lock is held only while checking and reloading, never while
    // the handler runs.
    slots: RwLock<HashMap<String, Arc<Mutex<Option<LoadedHandler>>>>>,
}

struct LoadedHandler {
    source: PathBuf,
    symbol: String,
    modified: SystemTime,
    handler: Arc<dyn Handler>,
}

impl ModuleInvoker {
    pub fn new<T: ModuleLoader + 'static>(loader: T, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(HandlerCache {
                loader: Box::new(loader),
                slots: RwLock::new(HashMap::new()),
            }),
            timeout,
        }
    }
}

impl Invoker for ModuleInvoker {
    fn invoke(&self, invocation: Invocation) -> BoxFuture<'_, Result<InvocationResult, InvokeError>> {
        Box::pin(async move {
            let entrypoint = match &invocation.record.kind {
                FunctionKind::Module { entrypoint } => entrypoint.clone(),
                FunctionKind::Exec { .. } => return Err(InvokeError::Load {
                    reason: format!("function {:?} is not a module", invocation.record.name),
                }),
            };
            let name = invocation.record.name.clone();
            let source = entrypoint.source_path(&invocation.function_dir);
            let payload = invocation.into_payload();

            let cache = self.inner.clone();
            let task = tokio::task::spawn_blocking(move || {
                let handler = cache.resolve(&name, &source, &entrypoint.symbol)?;
                handler.call(&payload)
            });

            match timeout(self.timeout, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => Err(InvokeError::Handler { reason: format!("handler task failed: {err}") }),
                Err(_) => Err(InvokeError::Handler {
                    reason: format!("deadline exceeded after {}ms", self.timeout.as_millis()),
                }),
            }
        })
    }

    fn evict(&self, name: &str) {
        self.inner.evict(name);
    }
}

impl HandlerCache {
    fn slot(&self, name: &str) -> Arc<Mutex<Option<LoadedHandler>>> {
        if let Some(slot) = self.slots.read().unwrap_or_else(PoisonError::into_inner).get(name) {
            return slot.clone();
        }

        self.slots.write().unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    fn evict(&self, name: &str) {
        let cached = self.slots.read().unwrap_or_else(PoisonError::into_inner).contains_key(name);
        if cached && self.slots.write().unwrap_or_else(PoisonError::into_inner).remove(name).is_some() {
            info!("unloaded module for function {name:?}");
        }
    }

    /// Returns the cached handler if its source is unchanged, otherwise loads it again.
    /// A failed load leaves the slot empty, so the next call retries.
    fn resolve(&self, name: &str, source: &Path, symbol: &str) -> Result<Arc<dyn Handler>, InvokeError> {
        let slot = self.slot(name);
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);

        let modified = match std::fs::metadata(source).and_then(|metadata| metadata.modified()) {
            Ok(v) => v,
            Err(err) => {
                *slot = None;
                drop(slot);
                if err.kind() == std::io::ErrorKind::NotFound {
                    self.evict(name);
                }
                return Err(InvokeError::Load { reason: format!("cannot read module source {source:?}: {err}") });
            }
        };

        if let Some(loaded) = slot.as_ref() {
            if loaded.modified == modified && loaded.source == source && loaded.symbol == symbol {
                return Ok(loaded.handler.clone());
            }
        }

        *slot = None;
        info!("loading module for function {name:?} from {source:?}");
        let handler = self.loader.load(source, symbol)?;
        *slot = Some(LoadedHandler {
            source: source.to_path_buf(),
            symbol: symbol.to_owned(),
            modified,
            handler: handler.clone(),
        });

        Ok(handler)
    }
}
