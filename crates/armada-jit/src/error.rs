//! Errors produced while decoding, building and compiling subroutines.

use armada_guest::RegisterError;
use cranelift_module::ModuleError;

/// Errors produced by the translation pipeline.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum JitError {
    /// Cranelift module-level error.
    #[error("cranelift module error: {0}")]
    Module(Box<ModuleError>),

    /// Failed to create the JIT builder or target ISA.
    #[error("jit builder initialization failed: {0}")]
    Builder(String),

    /// The decoder could not produce a block at `address`.
    #[error("decode failed at {address:#x}: {reason}")]
    Decode { address: u64, reason: String },

    /// An emitter produced IR that a backend cannot accept.
    #[error("invalid IR in {function}: {reason}")]
    InvalidIr { function: String, reason: String },

    /// Allocator output names a register the builder cannot pass as a parameter.
    #[error(transparent)]
    UnsupportedRegister(#[from] RegisterError),
}

impl From<ModuleError> for JitError {
    fn from(value: ModuleError) -> Self {
        Self::Module(Box::new(value))
    }
}
