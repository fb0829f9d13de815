//! Reference interpreter for the IR.
//!
//! Used when Cranelift cannot target the host, and as the oracle the native
//! backend is tested against.

use std::sync::Arc;
use std::time::Instant;

use super::{CodeBackend, CompileOutput, CompiledCode};
use crate::JitError;
use crate::context::JitContext;
use crate::ir::{IrFunction, LocalKind, MemWidth, Op};
use crate::subroutine::Tier;

/// Backend that executes IR directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterpreterBackend;

impl InterpreterBackend {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }
}

impl CodeBackend for InterpreterBackend {
    fn name(&self) -> &'static str {
        "interpreter"
    }

    fn compile(&self, function: &IrFunction, _tier: Tier) -> Result<CompileOutput, JitError> {
        let start = Instant::now();
        function.validate()?;
        let mut labels = vec![0; function.labels as usize];
        for (index, op) in function.ops.iter().enumerate() {
            if let Op::Label(label) = op {
                labels[label.0 as usize] = index;
            }
        }
        let code = InterpretedCode {
            function: function.clone(),
            labels,
        };
        Ok(CompileOutput {
            code: Arc::new(code),
            backend_time: start.elapsed(),
        })
    }
}

struct InterpretedCode {
    function: IrFunction,
    labels: Vec<usize>,
}

impl CompiledCode for InterpretedCode {
    fn invoke(&self, ctx: &mut JitContext<'_>, args: &[u64]) -> u64 {
        let function = &self.function;
        let mut locals = vec![0u128; function.locals.len()];
        let arg = |slot: u32| args.get(slot as usize).copied().unwrap_or(0);
        let mut pc = 0;

        while let Some(op) = function.ops.get(pc) {
            pc += 1;
            match *op {
                Op::LoadArg { dst, slot } => {
                    locals[dst.index()] = match function.kind(dst) {
                        LocalKind::I64 => arg(slot) as u128,
                        LocalKind::V128 => arg(slot) as u128 | (arg(slot + 1) as u128) << 64,
                    };
                }
                Op::Const { dst, value } => locals[dst.index()] = value as u128,
                Op::Move { dst, src } => locals[dst.index()] = locals[src.index()],
                Op::Unary { op, dst, src } => {
                    locals[dst.index()] = op.apply(locals[src.index()] as u64) as u128;
                }
                Op::Binary { op, dst, lhs, rhs } => {
                    locals[dst.index()] =
                        op.apply(locals[lhs.index()] as u64, locals[rhs.index()] as u64) as u128;
                }
                Op::BinaryImm { op, dst, lhs, imm } => {
                    locals[dst.index()] = op.apply(locals[lhs.index()] as u64, imm) as u128;
                }
                Op::Compare { cond, dst, lhs, rhs } => {
                    locals[dst.index()] =
                        cond.holds(locals[lhs.index()] as u64, locals[rhs.index()] as u64) as u128;
                }
                Op::Select { dst, cond, if_true, if_false } => {
                    let pick = if locals[cond.index()] as u64 != 0 {
                        if_true
                    } else {
                        if_false
                    };
                    locals[dst.index()] = locals[pick.index()] as u64 as u128;
                }
                Op::Vector { op, dst, lhs, rhs } => {
                    locals[dst.index()] = op.apply(locals[lhs.index()], locals[rhs.index()]);
                }
                Op::VectorPack { dst, lo, hi } => {
                    locals[dst.index()] =
                        (locals[lo.index()] as u64 as u128) | (locals[hi.index()] as u64 as u128) << 64;
                }
                Op::VectorExtract { dst, src, high } => {
                    let value = locals[src.index()];
                    locals[dst.index()] = if high { value >> 64 } else { value as u64 as u128 };
                }
                Op::LoadRegister { dst, reg } => locals[dst.index()] = ctx.regs().read_bits(reg),
                Op::StoreRegister { reg, src } => {
                    ctx.regs_mut().write_bits(reg, locals[src.index()]);
                }
                Op::Load { width, dst, address } => {
                    let address = locals[address.index()] as u64;
                    let memory = ctx.memory();
                    locals[dst.index()] = match width {
                        MemWidth::B8 => memory.read_u8(address) as u128,
                        MemWidth::B16 => memory.read_u16(address) as u128,
                        MemWidth::B32 => memory.read_u32(address) as u128,
                        MemWidth::B64 => memory.read_u64(address) as u128,
                    };
                }
                Op::Store { width, address, src } => {
                    let address = locals[address.index()] as u64;
                    let value = locals[src.index()] as u64;
                    let memory = ctx.memory();
                    match width {
                        MemWidth::B8 => memory.write_u8(address, value as u8),
                        MemWidth::B16 => memory.write_u16(address, value as u16),
                        MemWidth::B32 => memory.write_u32(address, value as u32),
                        MemWidth::B64 => memory.write_u64(address, value),
                    }
                }
                Op::LoadVector { dst, address } => {
                    locals[dst.index()] = ctx.memory().read_vector128(locals[address.index()] as u64).0;
                }
                Op::StoreVector { address, src } => {
                    ctx.memory().write_vector128(
                        locals[address.index()] as u64,
                        armada_guest::V128(locals[src.index()]),
                    );
                }
                Op::AtomicCas32 { dst, address, expected, desired } => {
                    locals[dst.index()] = ctx.memory().compare_and_swap_u32(
                        locals[address.index()] as u64,
                        locals[expected.index()] as u32,
                        locals[desired.index()] as u32,
                    ) as u128;
                }
                Op::Label(_) => {}
                Op::Jump(label) => pc = self.labels[label.0 as usize],
                Op::BranchIf { cond, target } => {
                    if locals[cond.index()] as u64 != 0 {
                        pc = self.labels[target.0 as usize];
                    }
                }
                Op::CallSubroutine { dst, target } => {
                    locals[dst.index()] = ctx.call_linked(target) as u128;
                }
                Op::Return { next } => return locals[next.index()] as u64,
                // rejected by validate()
                Op::Preload | Op::Spill | Op::Reload => {}
            }
        }
        0
    }
}
