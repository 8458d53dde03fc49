use {
    std::{path::Path, sync::Arc},
    wasmtime::{Config, Engine, ExternType, FuncType, InstancePre, Linker, Module, Store, Trap},
    fnctl_core::{
        GuestOutput,
        GuestPayload,
        InvocationResult,
        abi::{EXPORT_ALLOC, EXPORT_MEMORY},
        unpack_ptr_len,
    },
    crate::{error::InvokeError, invoker::module::{Handler, ModuleLoader}},
};

/// Compiles `.wasm` (or `.wat`) module sources with wasmtime.
///
/// Every call runs in a fresh instance, so guest state never leaks between invocations.
pub struct WasmLoader {
    engine: Engine,
    fuel: Option<u64>,
}

struct WasmHandler {
    instance_pre: InstancePre<()>,
    symbol: String,
    fuel: Option<u64>,
}

impl WasmLoader {
    /// `fuel` limits the instructions a single call may execute. Zero disables metering.
    pub fn new(fuel: u64) -> Result<Self, InvokeError> {
        let fuel = Some(fuel).filter(|v| *v > 0);
        let mut config = Config::new();
        config.consume_fuel(fuel.is_some());

        let engine = Engine::new(&config)
            .map_err(|err| InvokeError::Load { reason: format!("failed to create wasm engine: {err:#}") })?;

        Ok(Self { engine, fuel })
    }
}

impl ModuleLoader for WasmLoader {
    fn load(&self, source: &Path, symbol: &str) -> Result<Arc<dyn Handler>, InvokeError> {
        let module = Module::from_file(&self.engine, source)
            .map_err(|err| InvokeError::Load { reason: format!("failed to compile {source:?}: {err:#}") })?;

        match module.get_export(EXPORT_MEMORY) {
            Some(ExternType::Memory(_)) => {},
            _ => return Err(InvokeError::Load { reason: format!("module does not export {EXPORT_MEMORY:?}") }),
        }
        expect_func(&module, EXPORT_ALLOC, &[Kind::I32], Kind::I32)?;
        expect_func(&module, symbol, &[Kind::I32, Kind::I32], Kind::I64)?;

        // guests are self-contained, nothing is provided by the host
        let linker = Linker::<()>::new(&self.engine);
        let instance_pre = linker.instantiate_pre(&module)
            .map_err(|err| InvokeError::Load { reason: format!("module cannot be instantiated: {err:#}") })?;

        Ok(Arc::new(WasmHandler {
            instance_pre,
            symbol: symbol.to_owned(),
            fuel: self.fuel,
        }))
    }
}

impl Handler for WasmHandler {
    fn call(&self, payload: &GuestPayload) -> Result<InvocationResult, InvokeError> {
        let input = serde_json::to_vec(payload)
            .map_err(|err| InvokeError::Handler { reason: format!("failed to serialize payload: {err}") })?;
        let input_len = i32::try_from(input.len())
            .map_err(|_| InvokeError::Handler { reason: "payload is too large".to_owned() })?;

        let mut store = Store::new(self.instance_pre.module().engine(), ());
        if let Some(fuel) = self.fuel {
            store.set_fuel(fuel).map_err(handler_error)?;
        }

        let instance = self.instance_pre.instantiate(&mut store).map_err(handler_error)?;
        let memory = instance.get_memory(&mut store, EXPORT_MEMORY)
            .ok_or_else(|| InvokeError::Handler { reason: format!("module does not export {EXPORT_MEMORY:?}") })?;
        let alloc = instance.get_typed_func::<i32, i32>(&mut store, EXPORT_ALLOC).map_err(handler_error)?;
        let handler = instance.get_typed_func::<(i32, i32), i64>(&mut store, &self.symbol).map_err(handler_error)?;

        let input_ptr = alloc.call(&mut store, input_len).map_err(handler_error)?;
        memory.write(&mut store, input_ptr as u32 as usize, &input)
            .map_err(|err| InvokeError::Handler { reason: format!("failed to write payload to guest memory: {err}") })?;

        let packed = handler.call(&mut store, (input_ptr, input_len)).map_err(handler_error)?;
        let (output_ptr, output_len) = unpack_ptr_len(packed);

        // borrowed straight from guest memory, the reported length is never trusted for an allocation
        let start = output_ptr as usize;
        let output = start.checked_add(output_len as usize)
            .and_then(|end| memory.data(&store).get(start..end))
            .ok_or_else(|| InvokeError::Handler {
                reason: format!("handler returned out of bounds output ({output_ptr}, {output_len})"),
            })?;

        let output: GuestOutput = serde_json::from_slice(output)
            .map_err(|err| InvokeError::Handler { reason: format!("handler returned malformed output: {err}") })?;
        match output {
            GuestOutput::Ok(value) => InvocationResult::from_value(value)
                .map_err(|err| InvokeError::Handler { reason: err.to_string() }),
            GuestOutput::Err(reason) => Err(InvokeError::Handler { reason }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    I32,
    I64,
}

fn expect_func(module: &Module, name: &str, params: &[Kind], result: Kind) -> Result<(), InvokeError> {
    let func = match module.get_export(name) {
        Some(ExternType::Func(v)) => v,
        Some(_) => return Err(InvokeError::Load { reason: format!("export {name:?} is not a function") }),
        None => return Err(InvokeError::Load { reason: format!("module does not export {name:?}") }),
    };

    if !signature_matches(&func, params, result) {
        return Err(InvokeError::Load {
            reason: format!("export {name:?} has signature {func:?}, expected params {params:?} and result {result:?}"),
        });
    }

    Ok(())
}

fn signature_matches(func: &FuncType, params: &[Kind], result: Kind) -> bool {
    let kind_matches = |ty: wasmtime::ValType, kind: &Kind| match kind {
        Kind::I32 => ty.is_i32(),
        Kind::I64 => ty.is_i64(),
    };

    func.params().len() == params.len()
        && func.params().zip(params).all(|(ty, kind)| kind_matches(ty, kind))
        && func.results().len() == 1
        && func.results().all(|ty| kind_matches(ty, &result))
}

fn handler_error(err: wasmtime::Error) -> InvokeError {
    let reason = match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => "fuel exhausted".to_owned(),
        Some(trap) => format!("wasm trap: {trap}"),
        None => format!("{err:#}"),
    };
    InvokeError::Handler { reason }
}
