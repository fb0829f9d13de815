//! Cranelift-backed native code generation.
//!
//! Every subroutine is compiled to
//! `extern "C" fn(ctx: *mut u8, args: *const u64) -> u64`: `ctx` points at a
//! [`JitContext`] whose first field is the register file pointer, `args` holds
//! the parameter slots. Locals live in explicit stack slots; 128-bit locals are
//! handled as two 64-bit halves.

use std::sync::Arc;
use std::time::{Duration, Instant};

use armada_guest::{RegisterClass, RegisterFile};
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{
    AbiParam, Block, InstBuilder, MemFlags, StackSlot, StackSlotData, StackSlotKind, UserFuncName,
    Value, types,
};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module, default_libcall_names};
use parking_lot::Mutex;

use super::{CodeBackend, CompileOutput, CompiledCode};
use crate::JitError;
use crate::context::JitContext;
use crate::ir::{BinaryOp, Cond, IrFunction, Local, LocalKind, MemWidth, Op, UnaryOp, VectorOp};
use crate::runtime_helpers::{self, HelperFuncIds, HelperKind, HelperRefs};
use crate::subroutine::Tier;

/// Cranelift JIT module plus reusable compilation contexts.
pub struct JitCompiler {
    module: JITModule,
    function_builder_ctx: FunctionBuilderContext,
    context: cranelift_codegen::Context,
    next_function_id: u64,
    helper_func_ids: HelperFuncIds,
}

impl JitCompiler {
    /// Create a compiler for the host ISA at the given Cranelift `opt_level`
    /// (`"none"`, `"speed"` or `"speed_and_size"`).
    pub fn new(opt_level: &str) -> Result<Self, JitError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", opt_level)
            .map_err(|e| JitError::Builder(e.to_string()))?;
        flag_builder
            .set("use_colocated_libcalls", "false")
            .map_err(|e| JitError::Builder(e.to_string()))?;
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| JitError::Builder(e.to_string()))?;
        let isa = cranelift_native::builder()
            .map_err(|e| JitError::Builder(e.to_string()))?
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| JitError::Builder(e.to_string()))?;

        let mut builder = JITBuilder::with_isa(isa, default_libcall_names());
        runtime_helpers::register_symbols(&mut builder);
        let mut module = JITModule::new(builder);
        let helper_func_ids = HelperFuncIds::declare(&mut module)?;
        Ok(Self {
            module,
            function_builder_ctx: FunctionBuilderContext::new(),
            context: cranelift_codegen::Context::new(),
            next_function_id: 0,
            helper_func_ids,
        })
    }

    /// Compile `function`, returning its entry pointer and the time spent in
    /// Cranelift code generation and finalization.
    pub fn compile(&mut self, function: &IrFunction) -> Result<(*const u8, Duration), JitError> {
        function.validate()?;
        let result = self.compile_validated(function);
        if result.is_err() {
            self.module.clear_context(&mut self.context);
        }
        result
    }

    fn compile_validated(&mut self, function: &IrFunction) -> Result<(*const u8, Duration), JitError> {
        let mut signature = self.module.make_signature();
        // Signature: (ctx: I64, args_ptr: I64) -> I64
        signature.params.push(AbiParam::new(types::I64));
        signature.params.push(AbiParam::new(types::I64));
        signature.returns.push(AbiParam::new(types::I64));

        let name = format!("{}_{}", function.name, self.next_function_id);
        self.next_function_id = self.next_function_id.saturating_add(1);

        let func_id = self
            .module
            .declare_function(&name, Linkage::Local, &signature)?;
        self.context.func = cranelift_codegen::ir::Function::with_name_signature(
            UserFuncName::user(0, func_id.as_u32()),
            signature,
        );
        let helpers = HelperRefs::declare(&self.helper_func_ids, &mut self.module, &mut self.context.func);

        {
            let mut builder = FunctionBuilder::new(&mut self.context.func, &mut self.function_builder_ctx);
            translate_function(&mut builder, function, &helpers);
            builder.finalize();
        }

        let start = Instant::now();
        self.module.define_function(func_id, &mut self.context)?;
        self.module.clear_context(&mut self.context);
        self.module.finalize_definitions()?;
        let backend_time = start.elapsed();

        Ok((self.module.get_finalized_function(func_id), backend_time))
    }
}

/// Native code for one subroutine.
struct NativeCode {
    code_ptr: *const u8,
    // finalized code lives as long as its module
    _owner: Arc<Mutex<JitCompiler>>,
}

// SAFETY: the code pointer refers to immutable, finalized machine code.
unsafe impl Send for NativeCode {}
unsafe impl Sync for NativeCode {}

impl CompiledCode for NativeCode {
    fn invoke(&self, ctx: &mut JitContext<'_>, args: &[u64]) -> u64 {
        let func: extern "C" fn(*mut u8, *const u64) -> u64 = unsafe {
            // SAFETY: `code_ptr` was produced by `JitCompiler::compile` with
            // signature `(*mut u8, *const u64) -> u64`.
            std::mem::transmute(self.code_ptr)
        };
        func(ctx.as_raw(), args.as_ptr())
    }
}

/// Backend with one Cranelift module per tier: Tier0 skips optimization,
/// Tier1 optimizes for speed.
pub struct CraneliftBackend {
    tier0: Arc<Mutex<JitCompiler>>,
    tier1: Arc<Mutex<JitCompiler>>,
}

impl CraneliftBackend {
    /// Create modules for the host ISA. Fails when Cranelift does not support it.
    pub fn new() -> Result<Self, JitError> {
        Ok(Self {
            tier0: Arc::new(Mutex::new(JitCompiler::new("none")?)),
            tier1: Arc::new(Mutex::new(JitCompiler::new("speed")?)),
        })
    }
}

impl CodeBackend for CraneliftBackend {
    fn name(&self) -> &'static str {
        "cranelift"
    }

    fn compile(&self, function: &IrFunction, tier: Tier) -> Result<CompileOutput, JitError> {
        let owner = match tier {
            Tier::Tier0 => &self.tier0,
            Tier::Tier1 => &self.tier1,
        };
        let (code_ptr, backend_time) = owner.lock().compile(function)?;
        Ok(CompileOutput {
            code: Arc::new(NativeCode {
                code_ptr,
                _owner: Arc::clone(owner),
            }),
            backend_time,
        })
    }
}

// ---------------------------------------------------------------------------
// IR lowering
// ---------------------------------------------------------------------------

struct Lowering<'f, 'b> {
    builder: &'b mut FunctionBuilder<'f>,
    function: &'b IrFunction,
    helpers: &'b HelperRefs,
    slots: Vec<StackSlot>,
    labels: Vec<Block>,
    ctx: Value,
    regs: Value,
    args: Value,
    terminated: bool,
}

fn translate_function(builder: &mut FunctionBuilder<'_>, function: &IrFunction, helpers: &HelperRefs) {
    let slots = function
        .locals
        .iter()
        .map(|kind| {
            let (size, align_shift) = match kind {
                LocalKind::I64 => (8, 3),
                LocalKind::V128 => (16, 4),
            };
            builder.create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, size, align_shift))
        })
        .collect();
    let labels = (0..function.labels).map(|_| builder.create_block()).collect();

    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    let params = builder.block_params(entry);
    let (ctx, args) = (params[0], params[1]);
    let regs = builder.ins().load(types::I64, MemFlags::trusted(), ctx, 0);

    let mut lowering = Lowering {
        builder,
        function,
        helpers,
        slots,
        labels,
        ctx,
        regs,
        args,
        terminated: false,
    };
    for op in &function.ops {
        lowering.lower(op);
    }
    if !lowering.terminated {
        let zero = lowering.builder.ins().iconst(types::I64, 0);
        lowering.builder.ins().return_(&[zero]);
    }
    lowering.builder.seal_all_blocks();
}

impl Lowering<'_, '_> {
    fn get(&mut self, local: Local) -> Value {
        self.builder
            .ins()
            .stack_load(types::I64, self.slots[local.index()], 0)
    }

    fn set(&mut self, local: Local, value: Value) {
        self.builder
            .ins()
            .stack_store(value, self.slots[local.index()], 0);
    }

    fn get_half(&mut self, local: Local, high: bool) -> Value {
        let offset = if high { 8 } else { 0 };
        self.builder
            .ins()
            .stack_load(types::I64, self.slots[local.index()], offset)
    }

    fn set_halves(&mut self, local: Local, lo: Value, hi: Value) {
        let slot = self.slots[local.index()];
        self.builder.ins().stack_store(lo, slot, 0);
        self.builder.ins().stack_store(hi, slot, 8);
    }

    fn call(&mut self, kind: HelperKind, operands: &[Value]) -> Value {
        let mut call_args = Vec::with_capacity(operands.len() + 1);
        call_args.push(self.ctx);
        call_args.extend_from_slice(operands);
        let call = self.builder.ins().call(self.helpers.get(kind), &call_args);
        self.builder.inst_results(call)[0]
    }

    fn bool_to_i64(&mut self, flag: Value) -> Value {
        self.builder.ins().uextend(types::I64, flag)
    }

    fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Value {
        let ins = self.builder.ins();
        match op {
            BinaryOp::Add => ins.iadd(lhs, rhs),
            BinaryOp::Sub => ins.isub(lhs, rhs),
            BinaryOp::Mul => ins.imul(lhs, rhs),
            BinaryOp::And => ins.band(lhs, rhs),
            BinaryOp::Or => ins.bor(lhs, rhs),
            BinaryOp::Xor => ins.bxor(lhs, rhs),
            BinaryOp::Shl => ins.ishl(lhs, rhs),
            BinaryOp::LShr => ins.ushr(lhs, rhs),
            BinaryOp::AShr => ins.sshr(lhs, rhs),
        }
    }

    fn vector(&mut self, op: VectorOp, lhs: Value, rhs: Value) -> Value {
        let ins = self.builder.ins();
        match op {
            VectorOp::And => ins.band(lhs, rhs),
            VectorOp::Or => ins.bor(lhs, rhs),
            VectorOp::Xor => ins.bxor(lhs, rhs),
        }
    }

    /// Continue in a fresh block after a terminator so trailing ops have a home.
    fn ensure_open_block(&mut self) {
        if self.terminated {
            let block = self.builder.create_block();
            self.builder.switch_to_block(block);
            self.terminated = false;
        }
    }

    fn lower(&mut self, op: &Op) {
        if let Op::Label(label) = op {
            let block = self.labels[label.0 as usize];
            if !self.terminated {
                self.builder.ins().jump(block, &[]);
            }
            self.builder.switch_to_block(block);
            self.terminated = false;
            return;
        }
        self.ensure_open_block();

        match *op {
            Op::LoadArg { dst, slot } => {
                let offset = (slot * 8) as i32;
                let lo = self.builder.ins().load(types::I64, MemFlags::trusted(), self.args, offset);
                match self.function.kind(dst) {
                    LocalKind::I64 => self.set(dst, lo),
                    LocalKind::V128 => {
                        let hi = self
                            .builder
                            .ins()
                            .load(types::I64, MemFlags::trusted(), self.args, offset + 8);
                        self.set_halves(dst, lo, hi);
                    }
                }
            }
            Op::Const { dst, value } => {
                let value = self.builder.ins().iconst(types::I64, value as i64);
                self.set(dst, value);
            }
            Op::Move { dst, src } => match self.function.kind(dst) {
                LocalKind::I64 => {
                    let value = self.get(src);
                    self.set(dst, value);
                }
                LocalKind::V128 => {
                    let lo = self.get_half(src, false);
                    let hi = self.get_half(src, true);
                    self.set_halves(dst, lo, hi);
                }
            },
            Op::Unary { op, dst, src } => {
                let value = self.get(src);
                let result = match op {
                    UnaryOp::Not => self.builder.ins().bnot(value),
                    UnaryOp::Neg => self.builder.ins().ineg(value),
                };
                self.set(dst, result);
            }
            Op::Binary { op, dst, lhs, rhs } => {
                let (lhs, rhs) = (self.get(lhs), self.get(rhs));
                let result = self.binary(op, lhs, rhs);
                self.set(dst, result);
            }
            Op::BinaryImm { op, dst, lhs, imm } => {
                let lhs = self.get(lhs);
                let rhs = self.builder.ins().iconst(types::I64, imm as i64);
                let result = self.binary(op, lhs, rhs);
                self.set(dst, result);
            }
            Op::Compare { cond, dst, lhs, rhs } => {
                let (lhs, rhs) = (self.get(lhs), self.get(rhs));
                let flag = self.builder.ins().icmp(int_cc(cond), lhs, rhs);
                let result = self.bool_to_i64(flag);
                self.set(dst, result);
            }
            Op::Select { dst, cond, if_true, if_false } => {
                let cond = self.get(cond);
                let (a, b) = (self.get(if_true), self.get(if_false));
                let result = self.builder.ins().select(cond, a, b);
                self.set(dst, result);
            }
            Op::Vector { op, dst, lhs, rhs } => {
                let (l_lo, l_hi) = (self.get_half(lhs, false), self.get_half(lhs, true));
                let (r_lo, r_hi) = (self.get_half(rhs, false), self.get_half(rhs, true));
                let lo = self.vector(op, l_lo, r_lo);
                let hi = self.vector(op, l_hi, r_hi);
                self.set_halves(dst, lo, hi);
            }
            Op::VectorPack { dst, lo, hi } => {
                let (lo, hi) = (self.get(lo), self.get(hi));
                self.set_halves(dst, lo, hi);
            }
            Op::VectorExtract { dst, src, high } => {
                let value = self.get_half(src, high);
                self.set(dst, value);
            }
            Op::LoadRegister { dst, reg } => {
                let offset = RegisterFile::offset_of(reg) as i32;
                let flags = MemFlags::trusted();
                match reg.class() {
                    RegisterClass::Integer => {
                        let value = self.builder.ins().load(types::I64, flags, self.regs, offset);
                        self.set(dst, value);
                    }
                    RegisterClass::Flag => {
                        let value = self.builder.ins().uload8(types::I64, flags, self.regs, offset);
                        self.set(dst, value);
                    }
                    RegisterClass::Vector => {
                        let lo = self.builder.ins().load(types::I64, flags, self.regs, offset);
                        let hi = self.builder.ins().load(types::I64, flags, self.regs, offset + 8);
                        self.set_halves(dst, lo, hi);
                    }
                }
            }
            Op::StoreRegister { reg, src } => {
                let offset = RegisterFile::offset_of(reg) as i32;
                let flags = MemFlags::trusted();
                match reg.class() {
                    RegisterClass::Integer => {
                        let value = self.get(src);
                        self.builder.ins().store(flags, value, self.regs, offset);
                    }
                    RegisterClass::Flag => {
                        let value = self.get(src);
                        let bit = self.builder.ins().band_imm(value, 1i64);
                        self.builder.ins().istore8(flags, bit, self.regs, offset);
                    }
                    RegisterClass::Vector => {
                        let lo = self.get_half(src, false);
                        let hi = self.get_half(src, true);
                        self.builder.ins().store(flags, lo, self.regs, offset);
                        self.builder.ins().store(flags, hi, self.regs, offset + 8);
                    }
                }
            }
            Op::Load { width, dst, address } => {
                let address = self.get(address);
                let value = self.call(HelperKind::read(width), &[address]);
                self.set(dst, value);
            }
            Op::Store { width, address, src } => {
                let address = self.get(address);
                let value = self.get(src);
                let value = match width {
                    MemWidth::B64 => value,
                    narrow => self
                        .builder
                        .ins()
                        .band_imm(value, ((1u128 << (narrow.bytes() * 8)) - 1) as i64),
                };
                self.call(HelperKind::write(width), &[address, value]);
            }
            Op::LoadVector { dst, address } => {
                let address = self.get(address);
                let out = self
                    .builder
                    .ins()
                    .stack_addr(types::I64, self.slots[dst.index()], 0);
                self.call(HelperKind::ReadV128, &[address, out]);
            }
            Op::StoreVector { address, src } => {
                let address = self.get(address);
                let lo = self.get_half(src, false);
                let hi = self.get_half(src, true);
                self.call(HelperKind::WriteV128, &[address, lo, hi]);
            }
            Op::AtomicCas32 { dst, address, expected, desired } => {
                let operands = [self.get(address), self.get(expected), self.get(desired)];
                let swapped = self.call(HelperKind::CompareAndSwap32, &operands);
                self.set(dst, swapped);
            }
            Op::Jump(label) => {
                self.builder.ins().jump(self.labels[label.0 as usize], &[]);
                self.terminated = true;
            }
            Op::BranchIf { cond, target } => {
                let cond = self.get(cond);
                let taken = self.labels[target.0 as usize];
                let fallthrough = self.builder.create_block();
                self.builder.ins().brif(cond, taken, &[], fallthrough, &[]);
                self.builder.switch_to_block(fallthrough);
            }
            Op::CallSubroutine { dst, target } => {
                let target = self.builder.ins().iconst(types::I64, target as i64);
                let next = self.call(HelperKind::CallSubroutine, &[target]);
                self.set(dst, next);
            }
            Op::Return { next } => {
                let next = self.get(next);
                self.builder.ins().return_(&[next]);
                self.terminated = true;
            }
            // rejected by IrFunction::validate
            Op::Label(_) | Op::Preload | Op::Spill | Op::Reload => {}
        }
    }
}

fn int_cc(cond: Cond) -> IntCC {
    match cond {
        Cond::Eq => IntCC::Equal,
        Cond::Ne => IntCC::NotEqual,
        Cond::ULt => IntCC::UnsignedLessThan,
        Cond::ULe => IntCC::UnsignedLessThanOrEqual,
        Cond::UGt => IntCC::UnsignedGreaterThan,
        Cond::UGe => IntCC::UnsignedGreaterThanOrEqual,
        Cond::SLt => IntCC::SignedLessThan,
        Cond::SLe => IntCC::SignedLessThanOrEqual,
        Cond::SGt => IntCC::SignedGreaterThan,
        Cond::SGe => IntCC::SignedGreaterThanOrEqual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InterpreterBackend;
    use crate::cache::TranslationCache;
    use crate::ir::Label;
    use armada_guest::{FlatMemory, Memory, Register};

    fn sample() -> IrFunction {
        // x2 = (arg0 + x1) << 1; flag0 = x2 > 16; mem[0x80] = x2; return x2 > 16 ? 0x44 : 0x88
        IrFunction {
            name: "Sample".to_string(),
            params: vec![Register::int(0)],
            arg_slots: 1,
            locals: vec![LocalKind::I64; 6],
            labels: 1,
            ops: vec![
                Op::LoadArg { dst: Local(0), slot: 0 },
                Op::LoadRegister { dst: Local(1), reg: Register::int(1) },
                Op::Binary { op: BinaryOp::Add, dst: Local(2), lhs: Local(0), rhs: Local(1) },
                Op::BinaryImm { op: BinaryOp::Shl, dst: Local(2), lhs: Local(2), imm: 1 },
                Op::StoreRegister { reg: Register::int(2), src: Local(2) },
                Op::Const { dst: Local(3), value: 16 },
                Op::Compare { cond: Cond::UGt, dst: Local(4), lhs: Local(2), rhs: Local(3) },
                Op::StoreRegister { reg: Register::flag(0), src: Local(4) },
                Op::Const { dst: Local(5), value: 0x80 },
                Op::Store { width: MemWidth::B32, address: Local(5), src: Local(2) },
                Op::BranchIf { cond: Local(4), target: Label(0) },
                Op::Const { dst: Local(5), value: 0x88 },
                Op::Return { next: Local(5) },
                Op::Label(Label(0)),
                Op::Const { dst: Local(5), value: 0x44 },
                Op::Return { next: Local(5) },
            ],
        }
    }

    #[test]
    fn native_code_matches_interpreter() {
        let Ok(backend) = CraneliftBackend::new() else {
            // host ISA not supported by cranelift-native
            return;
        };
        let function = sample();
        for x1 in [1u64, 20] {
            let mut results = Vec::new();
            for code in [
                backend.compile(&function, Tier::Tier0).unwrap().code,
                backend.compile(&function, Tier::Tier1).unwrap().code,
                InterpreterBackend.compile(&function, Tier::Tier0).unwrap().code,
            ] {
                let memory = FlatMemory::with_identity_map(0x1000);
                let cache = TranslationCache::new();
                let mut regs = RegisterFile::default();
                regs.x[1] = x1;
                let mut ctx = JitContext::new(&mut regs, &memory, &cache);
                let next = code.invoke(&mut ctx, &[3]);
                results.push((next, regs.x[2], regs.flags[0], memory.read_u32(0x80)));
            }
            assert_eq!(results[0], results[2]);
            assert_eq!(results[1], results[2]);
        }
    }

    #[test]
    fn invalid_ir_is_rejected_before_codegen() {
        let Ok(backend) = CraneliftBackend::new() else {
            return;
        };
        let mut function = sample();
        function.ops.push(Op::Spill);
        assert!(matches!(
            backend.compile(&function, Tier::Tier0),
            Err(JitError::InvalidIr { .. })
        ));
    }
}
