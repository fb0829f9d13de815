//! Runtime helpers called from Cranelift-generated code.
//!
//! Guest memory accesses and linked calls cannot be inlined because they go
//! through the [`Memory`](armada_guest::Memory) collaborator and the
//! translation cache. Generated code calls these `extern "C"` helpers through
//! Cranelift's import mechanism instead.
//!
//! # ABI
//!
//! Every helper takes the opaque context pointer (a `*mut JitContext`) first,
//! followed by i64 operands, and returns i64.

use cranelift_codegen::ir::{self, AbiParam, types};
use cranelift_codegen::isa::CallConv;
use cranelift_jit::JITBuilder;
use cranelift_module::{FuncId, Linkage, Module};

use crate::JitError;
use crate::context::JitContext;
use crate::ir::MemWidth;

/// Identifies a runtime helper function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HelperKind {
    /// `(ctx, address) -> u8`
    ReadU8 = 0,
    /// `(ctx, address) -> u16`
    ReadU16 = 1,
    /// `(ctx, address) -> u32`
    ReadU32 = 2,
    /// `(ctx, address) -> u64`
    ReadU64 = 3,
    /// `(ctx, address, value) -> 0`
    WriteU8 = 4,
    /// `(ctx, address, value) -> 0`
    WriteU16 = 5,
    /// `(ctx, address, value) -> 0`
    WriteU32 = 6,
    /// `(ctx, address, value) -> 0`
    WriteU64 = 7,
    /// `(ctx, address, out_ptr) -> 0`, writes 16 bytes to `out_ptr`
    ReadV128 = 8,
    /// `(ctx, address, lo, hi) -> 0`
    WriteV128 = 9,
    /// `(ctx, address, expected, desired) -> swapped`
    CompareAndSwap32 = 10,
    /// `(ctx, target) -> next_address`
    CallSubroutine = 11,
}

/// Total number of helper kinds.
pub const HELPER_COUNT: usize = 12;

impl HelperKind {
    /// Every helper, indexed by discriminant.
    pub const ALL: [HelperKind; HELPER_COUNT] = [
        Self::ReadU8,
        Self::ReadU16,
        Self::ReadU32,
        Self::ReadU64,
        Self::WriteU8,
        Self::WriteU16,
        Self::WriteU32,
        Self::WriteU64,
        Self::ReadV128,
        Self::WriteV128,
        Self::CompareAndSwap32,
        Self::CallSubroutine,
    ];

    /// Load helper for `width`.
    pub fn read(width: MemWidth) -> Self {
        match width {
            MemWidth::B8 => Self::ReadU8,
            MemWidth::B16 => Self::ReadU16,
            MemWidth::B32 => Self::ReadU32,
            MemWidth::B64 => Self::ReadU64,
        }
    }

    /// Store helper for `width`.
    pub fn write(width: MemWidth) -> Self {
        match width {
            MemWidth::B8 => Self::WriteU8,
            MemWidth::B16 => Self::WriteU16,
            MemWidth::B32 => Self::WriteU32,
            MemWidth::B64 => Self::WriteU64,
        }
    }

    /// Symbol name used for Cranelift import resolution.
    pub fn symbol_name(self) -> &'static str {
        match self {
            Self::ReadU8 => "armada_rt_read_u8",
            Self::ReadU16 => "armada_rt_read_u16",
            Self::ReadU32 => "armada_rt_read_u32",
            Self::ReadU64 => "armada_rt_read_u64",
            Self::WriteU8 => "armada_rt_write_u8",
            Self::WriteU16 => "armada_rt_write_u16",
            Self::WriteU32 => "armada_rt_write_u32",
            Self::WriteU64 => "armada_rt_write_u64",
            Self::ReadV128 => "armada_rt_read_v128",
            Self::WriteV128 => "armada_rt_write_v128",
            Self::CompareAndSwap32 => "armada_rt_cas_u32",
            Self::CallSubroutine => "armada_rt_call_subroutine",
        }
    }

    /// Number of parameters (INCLUDING the ctx pointer).
    pub fn param_count(self) -> usize {
        match self {
            Self::ReadU8 | Self::ReadU16 | Self::ReadU32 | Self::ReadU64 => 2,
            Self::CallSubroutine => 2,
            Self::WriteU8 | Self::WriteU16 | Self::WriteU32 | Self::WriteU64 => 3,
            Self::ReadV128 => 3,
            Self::WriteV128 | Self::CompareAndSwap32 => 4,
        }
    }

    /// Build the Cranelift IR signature for this helper.
    pub fn make_signature(self, call_conv: CallConv) -> ir::Signature {
        let mut sig = ir::Signature::new(call_conv);
        for _ in 0..self.param_count() {
            sig.params.push(AbiParam::new(types::I64));
        }
        sig.returns.push(AbiParam::new(types::I64));
        sig
    }

    fn address(self) -> *const u8 {
        match self {
            Self::ReadU8 => armada_rt_read_u8 as *const u8,
            Self::ReadU16 => armada_rt_read_u16 as *const u8,
            Self::ReadU32 => armada_rt_read_u32 as *const u8,
            Self::ReadU64 => armada_rt_read_u64 as *const u8,
            Self::WriteU8 => armada_rt_write_u8 as *const u8,
            Self::WriteU16 => armada_rt_write_u16 as *const u8,
            Self::WriteU32 => armada_rt_write_u32 as *const u8,
            Self::WriteU64 => armada_rt_write_u64 as *const u8,
            Self::ReadV128 => armada_rt_read_v128 as *const u8,
            Self::WriteV128 => armada_rt_write_v128 as *const u8,
            Self::CompareAndSwap32 => armada_rt_cas_u32 as *const u8,
            Self::CallSubroutine => armada_rt_call_subroutine as *const u8,
        }
    }
}

/// Register every helper as a symbol on the JIT builder.
pub fn register_symbols(builder: &mut JITBuilder) {
    for kind in HelperKind::ALL {
        builder.symbol(kind.symbol_name(), kind.address());
    }
}

/// Module-level function IDs for declared helper imports.
/// Created once per [`crate::backend::cranelift::JitCompiler`].
pub(crate) struct HelperFuncIds {
    ids: [FuncId; HELPER_COUNT],
}

impl HelperFuncIds {
    /// Declare all helpers as imported functions on the module.
    pub fn declare<M: Module>(module: &mut M) -> Result<Self, JitError> {
        let call_conv = module.isa().default_call_conv();
        let mut ids = Vec::with_capacity(HELPER_COUNT);
        for kind in HelperKind::ALL {
            let sig = kind.make_signature(call_conv);
            ids.push(module.declare_function(kind.symbol_name(), Linkage::Import, &sig)?);
        }
        let ids = ids
            .try_into()
            .map_err(|_| JitError::Builder("helper table size mismatch".to_string()))?;
        Ok(Self { ids })
    }
}

/// Per-compiled-function helper references.
pub(crate) struct HelperRefs {
    refs: [ir::FuncRef; HELPER_COUNT],
}

impl HelperRefs {
    /// Declare all helpers into a function's IR.
    pub fn declare<M: Module>(func_ids: &HelperFuncIds, module: &mut M, func: &mut ir::Function) -> Self {
        Self {
            refs: func_ids
                .ids
                .map(|func_id| module.declare_func_in_func(func_id, func)),
        }
    }

    /// Callee reference for `kind`.
    pub fn get(&self, kind: HelperKind) -> ir::FuncRef {
        self.refs[kind as usize]
    }
}

// ---------------------------------------------------------------------------
// Helper implementations
// ---------------------------------------------------------------------------

macro_rules! read_helper {
    ($name:ident, $method:ident) => {
        unsafe extern "C" fn $name(ctx: *mut u8, address: u64) -> u64 {
            // SAFETY: generated code passes the context it was invoked with.
            let ctx = unsafe { JitContext::from_raw(ctx) };
            ctx.memory().$method(address) as u64
        }
    };
}

macro_rules! write_helper {
    ($name:ident, $method:ident, $ty:ty) => {
        unsafe extern "C" fn $name(ctx: *mut u8, address: u64, value: u64) -> u64 {
            // SAFETY: generated code passes the context it was invoked with.
            let ctx = unsafe { JitContext::from_raw(ctx) };
            ctx.memory().$method(address, value as $ty);
            0
        }
    };
}

read_helper!(armada_rt_read_u8, read_u8);
read_helper!(armada_rt_read_u16, read_u16);
read_helper!(armada_rt_read_u32, read_u32);
read_helper!(armada_rt_read_u64, read_u64);
write_helper!(armada_rt_write_u8, write_u8, u8);
write_helper!(armada_rt_write_u16, write_u16, u16);
write_helper!(armada_rt_write_u32, write_u32, u32);
write_helper!(armada_rt_write_u64, write_u64, u64);

unsafe extern "C" fn armada_rt_read_v128(ctx: *mut u8, address: u64, out: u64) -> u64 {
    // SAFETY: generated code passes the context it was invoked with.
    let ctx = unsafe { JitContext::from_raw(ctx) };
    let bytes = ctx.memory().read_vector128(address).0.to_le_bytes();
    // SAFETY: `out` is the address of a 16-byte stack slot in the caller.
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), out as *mut u8, bytes.len()) };
    0
}

unsafe extern "C" fn armada_rt_write_v128(ctx: *mut u8, address: u64, lo: u64, hi: u64) -> u64 {
    // SAFETY: generated code passes the context it was invoked with.
    let ctx = unsafe { JitContext::from_raw(ctx) };
    ctx.memory()
        .write_vector128(address, armada_guest::V128::from_parts(lo, hi));
    0
}

unsafe extern "C" fn armada_rt_cas_u32(ctx: *mut u8, address: u64, expected: u64, desired: u64) -> u64 {
    // SAFETY: generated code passes the context it was invoked with.
    let ctx = unsafe { JitContext::from_raw(ctx) };
    ctx.memory()
        .compare_and_swap_u32(address, expected as u32, desired as u32) as u64
}

unsafe extern "C" fn armada_rt_call_subroutine(ctx: *mut u8, target: u64) -> u64 {
    // SAFETY: generated code passes the context it was invoked with.
    let ctx = unsafe { JitContext::from_raw(ctx) };
    ctx.call_linked(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_table_is_indexed_by_discriminant() {
        for (index, kind) in HelperKind::ALL.iter().enumerate() {
            assert_eq!(*kind as usize, index);
            assert!(kind.symbol_name().starts_with("armada_rt_"));
            assert_eq!(
                kind.make_signature(CallConv::SystemV).params.len(),
                kind.param_count()
            );
        }
    }

    #[test]
    fn width_selection() {
        assert_eq!(HelperKind::read(MemWidth::B16), HelperKind::ReadU16);
        assert_eq!(HelperKind::write(MemWidth::B64), HelperKind::WriteU64);
    }
}
