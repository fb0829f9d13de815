//! Code backends: turn an [`IrFunction`] into something executable.

pub mod cranelift;
pub mod interp;

use std::sync::Arc;
use std::time::Duration;

use crate::JitError;
use crate::context::JitContext;
use crate::ir::IrFunction;
use crate::subroutine::Tier;

pub use self::cranelift::CraneliftBackend;
pub use self::interp::InterpreterBackend;

/// Executable artifact for one subroutine.
pub trait CompiledCode: Send + Sync {
    /// Run with the given argument slots and return the next guest address.
    fn invoke(&self, ctx: &mut JitContext<'_>, args: &[u64]) -> u64;
}

/// Result of compiling one function.
pub struct CompileOutput {
    /// The executable artifact.
    pub code: Arc<dyn CompiledCode>,
    /// Time the backend itself spent producing host code.
    pub backend_time: Duration,
}

/// A code generator for [`IrFunction`]s.
pub trait CodeBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Compile `function` at the optimization level suited to `tier`.
    fn compile(&self, function: &IrFunction, tier: Tier) -> Result<CompileOutput, JitError>;
}
