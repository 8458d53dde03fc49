// you don't want your function gateway to randomly crash
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub use crate::{
    config::ServerConfig,
    error::{StoreError, InvokeError, LogError, ConfigLoadError},
    store::{FunctionStore, FunctionRecord, FunctionKind, Entrypoint},
    invoker::{
        Invoker,
        module::{ModuleInvoker, ModuleLoader, Handler},
        wasm::WasmLoader,
        exec::ExecInvoker,
    },
    logs::{InvocationLogger, InvocationLogEntry},
    server::Gateway,
};

pub mod config;
pub mod error;
pub mod invoker;
pub mod logs;
pub mod server;
pub mod store;
