use {
    std::path::PathBuf,
    futures::future::BoxFuture,
    fnctl_core::{Context, Event, GuestPayload, InvocationResult},
    crate::{error::InvokeError, store::FunctionRecord},
};

pub mod exec;
pub mod module;
pub mod wasm;

/// Execution strategy for one function kind.
pub trait Invoker: Send + Sync {
    fn invoke(&self, invocation: Invocation) -> BoxFuture<'_, Result<InvocationResult, InvokeError>>;

    /// Releases anything kept for a function that no longer exists.
    fn evict(&self, _name: &str) {}
}

/// Everything an invoker needs to run a function once.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub record: FunctionRecord,
    pub function_dir: PathBuf,
    pub event: Event,
    pub context: Context,
}

impl Invocation {
    pub fn new(record: FunctionRecord, function_dir: PathBuf, event: Event, context: Context) -> Self {
        Self {
            record,
            function_dir,
            event,
            context,
        }
    }

    pub(crate) fn into_payload(self) -> GuestPayload {
        GuestPayload {
            event: self.event,
            context: self.context,
        }
    }
}
