//! Scripted collaborators for tests.
//!
//! [`ScriptedDecoder`] serves a fixed table of synthetic instructions keyed by
//! address; [`ops`] has constructors for a small ARM64-flavoured instruction
//! set whose emitters are just enough to write loops, calls and memory
//! traffic.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use armada_guest::{ExecutionMode, LiveInSets, Memory};

use crate::JitError;
use crate::decoder::{Block, BlockGraph, DecodedOp, Decoder, Flow, KnownTargets, RegisterAllocator};

/// Decoder over a fixed instruction table.
#[derive(Debug, Default)]
pub struct ScriptedDecoder {
    program: BTreeMap<u64, DecodedOp>,
    block_decodes: AtomicUsize,
    subroutine_decodes: AtomicUsize,
}

impl ScriptedDecoder {
    /// Decoder serving `ops`.
    pub fn new(ops: impl IntoIterator<Item = DecodedOp>) -> Self {
        Self {
            program: ops.into_iter().map(|op| (op.address, op)).collect(),
            ..Self::default()
        }
    }

    /// Number of `decode_basic_block` calls served.
    pub fn block_decodes(&self) -> usize {
        self.block_decodes.load(Ordering::Relaxed)
    }

    /// Number of `decode_subroutine` calls served.
    pub fn subroutine_decodes(&self) -> usize {
        self.subroutine_decodes.load(Ordering::Relaxed)
    }

    fn block_at(&self, address: u64) -> Result<Block, JitError> {
        let mut ops = Vec::new();
        let mut cursor = address;
        while let Some(op) = self.program.get(&cursor) {
            ops.push(op.clone());
            if op.kind.flow.ends_block() {
                break;
            }
            cursor = op.next_address();
        }
        if ops.is_empty() {
            return Err(JitError::Decode {
                address,
                reason: "no instruction scripted".to_string(),
            });
        }
        Ok(Block { address, ops })
    }
}

impl Decoder for ScriptedDecoder {
    fn decode_basic_block(
        &self,
        _memory: &dyn Memory,
        address: u64,
        _mode: ExecutionMode,
    ) -> Result<Block, JitError> {
        self.block_decodes.fetch_add(1, Ordering::Relaxed);
        self.block_at(address)
    }

    fn decode_subroutine(
        &self,
        known: &dyn KnownTargets,
        _memory: &dyn Memory,
        address: u64,
        _mode: ExecutionMode,
    ) -> Result<BlockGraph, JitError> {
        self.subroutine_decodes.fetch_add(1, Ordering::Relaxed);
        let mut blocks = Vec::new();
        let mut seen = BTreeSet::from([address]);
        let mut work = VecDeque::from([address]);
        while let Some(start) = work.pop_front() {
            let block = self.block_at(start)?;
            let successors = match block.ops.last() {
                Some(last) => match last.kind.flow {
                    Flow::Branch => last.target.into_iter().collect(),
                    Flow::ConditionalBranch => {
                        last.target.into_iter().chain([last.next_address()]).collect()
                    }
                    Flow::Call => vec![last.next_address()],
                    Flow::IndirectBranch | Flow::Sequential => Vec::new(),
                },
                None => Vec::new(),
            };
            blocks.push(block);
            for next in successors {
                if self.program.contains_key(&next) && !known.is_known(next) && seen.insert(next) {
                    work.push_back(next);
                }
            }
        }
        Ok(BlockGraph { blocks })
    }
}

/// Allocator returning the same live-in sets for every graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedAllocator(pub LiveInSets);

impl RegisterAllocator for FixedAllocator {
    fn live_in(&self, _graph: &BlockGraph) -> LiveInSets {
        self.0
    }
}

/// Synthetic instruction set.
///
/// Flags: Z is flag 1.
pub mod ops {
    use armada_guest::Register;

    use crate::JitError;
    use crate::decoder::{DecodedOp, Flow, OpKind};
    use crate::emitter::EmitContext;
    use crate::ir::{BinaryOp, Cond, LocalKind, MemWidth, Op, VectorOp};

    /// Zero flag.
    pub const Z: Register = Register::flag(1);

    fn x(op: &DecodedOp, index: usize) -> Register {
        Register::int(op.operand(index) as u8)
    }

    fn v(op: &DecodedOp, index: usize) -> Register {
        Register::vector(op.operand(index) as u8)
    }

    fn target(op: &DecodedOp) -> Result<u64, JitError> {
        op.target.ok_or_else(|| JitError::Decode {
            address: op.address,
            reason: format!("{} without target", op.kind.form),
        })
    }

    fn make(kind: &'static OpKind, address: u64, operands: &[u64], target: Option<u64>) -> DecodedOp {
        DecodedOp {
            address,
            size: 4,
            kind,
            operands: operands.iter().copied().collect(),
            target,
        }
    }

    macro_rules! kind {
        ($name:ident, $emitter:literal, $form:literal, $flow:ident, $emit:ident) => {
            #[doc = concat!("`", $form, "`")]
            pub static $name: OpKind = OpKind {
                emitter: $emitter,
                form: $form,
                flow: Flow::$flow,
                emit: $emit,
            };
        };
    }

    kind!(MOVZ, "emit_mov", "movz", Sequential, emit_movz);
    kind!(ADD, "emit_alu", "add", Sequential, emit_add);
    kind!(ADDI, "emit_alu_imm", "add_imm", Sequential, emit_addi);
    kind!(SUB, "emit_alu", "sub", Sequential, emit_sub);
    kind!(SUBI, "emit_alu_imm", "sub_imm", Sequential, emit_subi);
    kind!(CMPI, "emit_cmp", "cmp_imm", Sequential, emit_cmpi);
    kind!(B, "emit_b", "b", Branch, emit_b);
    kind!(B_EQ, "emit_b_cond", "b.eq", ConditionalBranch, emit_b_eq);
    kind!(CBNZ, "emit_cb", "cbnz", ConditionalBranch, emit_cbnz);
    kind!(BL, "emit_bl", "bl", Call, emit_bl);
    kind!(RET, "emit_ret", "ret", IndirectBranch, emit_ret);
    kind!(LDR, "emit_mem", "ldr", Sequential, emit_ldr);
    kind!(STR, "emit_mem", "str", Sequential, emit_str);
    kind!(CAS, "emit_atomic", "cas", Sequential, emit_cas);
    kind!(NOP, "emit_nop", "nop", Sequential, emit_nop);
    kind!(VPACK, "emit_simd", "ins_pair", Sequential, emit_vpack);
    kind!(VXOR, "emit_simd", "eor_v", Sequential, emit_vxor);
    kind!(VLO, "emit_simd", "umov_lo", Sequential, emit_vlo);
    kind!(BLOAT, "emit_bloat", "bloat", Sequential, emit_bloat);

    /// `xd = imm`
    pub fn movz(address: u64, rd: u8, imm: u64) -> DecodedOp {
        make(&MOVZ, address, &[rd as u64, imm], None)
    }

    /// `xd = xn + xm`
    pub fn add(address: u64, rd: u8, rn: u8, rm: u8) -> DecodedOp {
        make(&ADD, address, &[rd as u64, rn as u64, rm as u64], None)
    }

    /// `xd = xn + imm`
    pub fn addi(address: u64, rd: u8, rn: u8, imm: u64) -> DecodedOp {
        make(&ADDI, address, &[rd as u64, rn as u64, imm], None)
    }

    /// `xd = xn - xm`
    pub fn sub(address: u64, rd: u8, rn: u8, rm: u8) -> DecodedOp {
        make(&SUB, address, &[rd as u64, rn as u64, rm as u64], None)
    }

    /// `xd = xn - imm`
    pub fn subi(address: u64, rd: u8, rn: u8, imm: u64) -> DecodedOp {
        make(&SUBI, address, &[rd as u64, rn as u64, imm], None)
    }

    /// `Z = xn == imm`
    pub fn cmpi(address: u64, rn: u8, imm: u64) -> DecodedOp {
        make(&CMPI, address, &[rn as u64, imm], None)
    }

    /// Unconditional branch.
    pub fn b(address: u64, target: u64) -> DecodedOp {
        make(&B, address, &[], Some(target))
    }

    /// Branch if Z.
    pub fn b_eq(address: u64, target: u64) -> DecodedOp {
        make(&B_EQ, address, &[], Some(target))
    }

    /// Branch if `xt != 0`.
    pub fn cbnz(address: u64, rt: u8, target: u64) -> DecodedOp {
        make(&CBNZ, address, &[rt as u64], Some(target))
    }

    /// Branch with link.
    pub fn bl(address: u64, target: u64) -> DecodedOp {
        make(&BL, address, &[], Some(target))
    }

    /// Return through x30.
    pub fn ret(address: u64) -> DecodedOp {
        make(&RET, address, &[], None)
    }

    /// `xt = mem64[xn]`
    pub fn ldr(address: u64, rt: u8, rn: u8) -> DecodedOp {
        make(&LDR, address, &[rt as u64, rn as u64], None)
    }

    /// `mem64[xn] = xt`
    pub fn str(address: u64, rt: u8, rn: u8) -> DecodedOp {
        make(&STR, address, &[rt as u64, rn as u64], None)
    }

    /// `xd = cas32(mem[xn], xe, xw)` (1 when swapped)
    pub fn cas(address: u64, rd: u8, rn: u8, re: u8, rw: u8) -> DecodedOp {
        make(&CAS, address, &[rd as u64, rn as u64, re as u64, rw as u64], None)
    }

    /// No operation.
    pub fn nop(address: u64) -> DecodedOp {
        make(&NOP, address, &[], None)
    }

    /// `vd = (lo: xn, hi: xm)`
    pub fn vpack(address: u64, vd: u8, rn: u8, rm: u8) -> DecodedOp {
        make(&VPACK, address, &[vd as u64, rn as u64, rm as u64], None)
    }

    /// `vd = vn ^ vm`
    pub fn vxor(address: u64, vd: u8, vn: u8, vm: u8) -> DecodedOp {
        make(&VXOR, address, &[vd as u64, vn as u64, vm as u64], None)
    }

    /// `xd = vn.lo`
    pub fn vlo(address: u64, rd: u8, vn: u8) -> DecodedOp {
        make(&VLO, address, &[rd as u64, vn as u64], None)
    }

    /// Emits `count` register moves; for code-size diagnostics.
    pub fn bloat(address: u64, count: u64) -> DecodedOp {
        make(&BLOAT, address, &[count], None)
    }

    fn emit_movz(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        let dst = ctx.register(x(op, 0));
        ctx.emit(Op::Const { dst, value: op.operand(1) });
        Ok(())
    }

    fn emit_binary(ctx: &mut EmitContext<'_>, op: &DecodedOp, kind: BinaryOp) -> Result<(), JitError> {
        let lhs = ctx.register(x(op, 1));
        let rhs = ctx.register(x(op, 2));
        let dst = ctx.register(x(op, 0));
        ctx.emit(Op::Binary { op: kind, dst, lhs, rhs });
        Ok(())
    }

    fn emit_binary_imm(ctx: &mut EmitContext<'_>, op: &DecodedOp, kind: BinaryOp) -> Result<(), JitError> {
        let lhs = ctx.register(x(op, 1));
        let dst = ctx.register(x(op, 0));
        ctx.emit(Op::BinaryImm { op: kind, dst, lhs, imm: op.operand(2) });
        Ok(())
    }

    fn emit_add(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        emit_binary(ctx, op, BinaryOp::Add)
    }

    fn emit_sub(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        emit_binary(ctx, op, BinaryOp::Sub)
    }

    fn emit_addi(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        emit_binary_imm(ctx, op, BinaryOp::Add)
    }

    fn emit_subi(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        emit_binary_imm(ctx, op, BinaryOp::Sub)
    }

    fn emit_cmpi(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        let lhs = ctx.register(x(op, 0));
        let rhs = ctx.constant(op.operand(1));
        let dst = ctx.register(Z);
        ctx.emit(Op::Compare { cond: Cond::Eq, dst, lhs, rhs });
        Ok(())
    }

    fn emit_b(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        ctx.emit_branch(target(op)?);
        Ok(())
    }

    fn emit_b_eq(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        let z = ctx.register(Z);
        ctx.emit_branch_if(z, target(op)?);
        Ok(())
    }

    fn emit_cbnz(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        let value = ctx.register(x(op, 0));
        ctx.emit_branch_if(value, target(op)?);
        Ok(())
    }

    fn emit_bl(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        let link = ctx.register(Register::int(armada_guest::LINK_REGISTER));
        ctx.emit(Op::Const {
            dst: link,
            value: op.next_address(),
        });
        ctx.emit_call(target(op)?, op.next_address());
        Ok(())
    }

    fn emit_ret(ctx: &mut EmitContext<'_>, _op: &DecodedOp) -> Result<(), JitError> {
        ctx.emit_return_via_link();
        Ok(())
    }

    fn emit_ldr(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        let address = ctx.register(x(op, 1));
        let dst = ctx.register(x(op, 0));
        ctx.emit(Op::Load { width: MemWidth::B64, dst, address });
        Ok(())
    }

    fn emit_str(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        let address = ctx.register(x(op, 1));
        let src = ctx.register(x(op, 0));
        ctx.emit(Op::Store { width: MemWidth::B64, address, src });
        Ok(())
    }

    fn emit_cas(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        let address = ctx.register(x(op, 1));
        let expected = ctx.register(x(op, 2));
        let desired = ctx.register(x(op, 3));
        let dst = ctx.register(x(op, 0));
        ctx.emit(Op::AtomicCas32 { dst, address, expected, desired });
        Ok(())
    }

    fn emit_nop(_ctx: &mut EmitContext<'_>, _op: &DecodedOp) -> Result<(), JitError> {
        Ok(())
    }

    fn emit_vpack(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        let lo = ctx.register(x(op, 1));
        let hi = ctx.register(x(op, 2));
        let dst = ctx.register(v(op, 0));
        ctx.emit(Op::VectorPack { dst, lo, hi });
        Ok(())
    }

    fn emit_vxor(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        let lhs = ctx.register(v(op, 1));
        let rhs = ctx.register(v(op, 2));
        let dst = ctx.register(v(op, 0));
        ctx.emit(Op::Vector { op: VectorOp::Xor, dst, lhs, rhs });
        Ok(())
    }

    fn emit_vlo(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        let src = ctx.register(v(op, 1));
        let scratch = ctx.temp(LocalKind::I64);
        ctx.emit(Op::VectorExtract { dst: scratch, src, high: false });
        let dst = ctx.register(x(op, 0));
        ctx.emit(Op::Move { dst, src: scratch });
        Ok(())
    }

    fn emit_bloat(ctx: &mut EmitContext<'_>, op: &DecodedOp) -> Result<(), JitError> {
        let reg = ctx.register(Register::int(0));
        for _ in 0..op.operand(0) {
            ctx.emit(Op::Move { dst: reg, src: reg });
        }
        Ok(())
    }
}
