//! The bundled interpreter.
//!
//! A tree-walking engine for a Wren-shaped class language that sits behind
//! the [`NativeModule`] / [`NativeVm`] boundary exactly like an external
//! engine would: raw `i32` codes, `CStr` text, and every host interaction
//! routed through [`HostCallbacks`] by VM id.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::{
    ConstantTable, StartupError,
    native::{HostCallbacks, NativeModule, NativeVm, VmId},
};

mod ast;
mod builtins;
mod interp;
mod lexer;
mod parser;
mod value;

pub use interp::WrenVm;
pub use parser::{CompileError, parse};

/// Free native stack below which parsing and evaluation continue on a
/// freshly allocated segment.
const STACK_RED_ZONE: usize = 256 * 1024;
const STACK_SEGMENT: usize = 4 * 1024 * 1024;

/// Runs a recursive step of the parser or evaluator, growing the native
/// stack first if it is nearly exhausted.
fn with_stack<R>(step: impl FnOnce() -> R) -> R {
    stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT, step)
}

/// Raw codes the engine hands across the boundary.
pub mod codes {
    pub const RESULT_SUCCESS: i32 = 0;
    pub const RESULT_COMPILE_ERROR: i32 = 1;
    pub const RESULT_RUNTIME_ERROR: i32 = 2;

    pub const TYPE_BOOL: i32 = 0;
    pub const TYPE_NUM: i32 = 1;
    pub const TYPE_FOREIGN: i32 = 2;
    pub const TYPE_LIST: i32 = 3;
    /// Maps are not modelled; the code is reserved so the table lines up.
    pub const TYPE_MAP: i32 = 4;
    pub const TYPE_NULL: i32 = 5;
    pub const TYPE_STRING: i32 = 6;
    pub const TYPE_UNKNOWN: i32 = 7;

    pub const ERROR_COMPILE: i32 = 0;
    pub const ERROR_RUNTIME: i32 = 1;
    pub const ERROR_STACK_TRACE: i32 = 2;
}

pub const CONSTANTS: ConstantTable = ConstantTable {
    result_success: codes::RESULT_SUCCESS,
    result_compile_error: codes::RESULT_COMPILE_ERROR,
    result_runtime_error: codes::RESULT_RUNTIME_ERROR,
    type_bool: codes::TYPE_BOOL,
    type_num: codes::TYPE_NUM,
    type_foreign: codes::TYPE_FOREIGN,
    type_list: codes::TYPE_LIST,
    type_null: codes::TYPE_NULL,
    type_string: codes::TYPE_STRING,
    type_unknown: codes::TYPE_UNKNOWN,
    error_compile: codes::ERROR_COMPILE,
    error_runtime: codes::ERROR_RUNTIME,
    error_stack_trace: codes::ERROR_STACK_TRACE,
};

#[derive(Debug, Clone)]
pub struct EngineCreateInfo {
    /// Frames a fiber may hold, the module body included, before a call
    /// fails with "Stack overflow.".
    pub max_call_depth: usize,
}

impl Default for EngineCreateInfo {
    fn default() -> Self {
        Self {
            max_call_depth: 1024,
        }
    }
}

pub struct Engine {
    info: EngineCreateInfo,
    prelude: OnceLock<Arc<ast::Program>>,
}

impl Engine {
    pub fn new(info: EngineCreateInfo) -> Self {
        Self {
            info,
            prelude: OnceLock::new(),
        }
    }
}

#[async_trait]
impl NativeModule for Engine {
    async fn load(&self) -> Result<(), StartupError> {
        if self.prelude.get().is_some() {
            return Ok(());
        }
        let program = parse(builtins::PRELUDE).map_err(|err| StartupError::Prelude {
            line: err.line,
            message: err.message,
        })?;
        let _ = self.prelude.set(Arc::new(program));
        log::debug!("engine prelude compiled");
        Ok(())
    }

    fn constants(&self) -> ConstantTable {
        CONSTANTS
    }

    fn new_vm(&self, id: VmId, host: Arc<dyn HostCallbacks>) -> Box<dyn NativeVm> {
        let mut vm = WrenVm::new(id, host, self.info.clone());
        match self.prelude.get() {
            Some(prelude) => {
                if let Err(err) = vm.load_prelude(prelude) {
                    log::error!("vm {id}: prelude failed: {:?}", err.value);
                }
            }
            None => log::warn!("vm {id} created before the engine loaded its prelude"),
        }
        Box::new(vm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_table_decodes_its_own_codes() {
        use crate::{ErrorKind, InterpretResult, SlotType};

        assert_eq!(CONSTANTS.interpret_result(codes::RESULT_RUNTIME_ERROR), Some(InterpretResult::RuntimeError));
        assert_eq!(CONSTANTS.slot_type(codes::TYPE_FOREIGN), SlotType::Foreign);
        // maps are reported as unknown
        assert_eq!(CONSTANTS.slot_type(codes::TYPE_MAP), SlotType::Unknown);
        assert_eq!(CONSTANTS.error_kind(codes::ERROR_STACK_TRACE), Some(ErrorKind::StackTrace));
    }

    #[tokio::test]
    async fn prelude_compiles() {
        let engine = Engine::new(EngineCreateInfo::default());
        engine.load().await.unwrap();
        assert!(engine.prelude.get().is_some());
    }
}
