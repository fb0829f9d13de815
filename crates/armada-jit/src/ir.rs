//! Low-level IR produced by the emitter and consumed by the code backends.
//!
//! A subroutine body is a flat list of [`Op`]s over numbered locals. The list
//! doubles as the code-generation trace: instruction spans are index ranges
//! into it, so the number of generated operations for a guest instruction is
//! simply `end - start`.

use std::fmt;

use armada_guest::Register;

use crate::JitError;

/// A function-local value slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Local(pub u32);

impl Local {
    /// Slot index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Storage class of a [`Local`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalKind {
    /// 64-bit integer.
    I64,
    /// 128-bit vector.
    V128,
}

impl LocalKind {
    /// Kind used to hold a guest register of `class`.
    pub fn for_register(reg: Register) -> Self {
        match reg.class() {
            armada_guest::RegisterClass::Vector => Self::V128,
            _ => Self::I64,
        }
    }

    /// Number of 64-bit argument slots a value of this kind occupies.
    pub fn arg_slots(self) -> u32 {
        match self {
            Self::I64 => 1,
            Self::V128 => 2,
        }
    }
}

/// A branch target inside one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// Width of an integer memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemWidth {
    /// 8 bits.
    B8,
    /// 16 bits.
    B16,
    /// 32 bits.
    B32,
    /// 64 bits.
    B64,
}

impl MemWidth {
    /// Access size in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            Self::B8 => 1,
            Self::B16 => 2,
            Self::B32 => 4,
            Self::B64 => 8,
        }
    }
}

/// Two-operand integer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

impl BinaryOp {
    /// Evaluate on 64-bit operands. Shift amounts are taken modulo 64.
    pub fn apply(self, lhs: u64, rhs: u64) -> u64 {
        match self {
            Self::Add => lhs.wrapping_add(rhs),
            Self::Sub => lhs.wrapping_sub(rhs),
            Self::Mul => lhs.wrapping_mul(rhs),
            Self::And => lhs & rhs,
            Self::Or => lhs | rhs,
            Self::Xor => lhs ^ rhs,
            Self::Shl => lhs.wrapping_shl(rhs as u32),
            Self::LShr => lhs.wrapping_shr(rhs as u32),
            Self::AShr => (lhs as i64).wrapping_shr(rhs as u32) as u64,
        }
    }
}

/// One-operand integer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl UnaryOp {
    /// Evaluate on a 64-bit operand.
    pub fn apply(self, value: u64) -> u64 {
        match self {
            Self::Not => !value,
            Self::Neg => value.wrapping_neg(),
        }
    }
}

/// Integer comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Cond {
    Eq,
    Ne,
    ULt,
    ULe,
    UGt,
    UGe,
    SLt,
    SLe,
    SGt,
    SGe,
}

impl Cond {
    /// Evaluate on 64-bit operands.
    pub fn holds(self, lhs: u64, rhs: u64) -> bool {
        let (sl, sr) = (lhs as i64, rhs as i64);
        match self {
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::ULt => lhs < rhs,
            Self::ULe => lhs <= rhs,
            Self::UGt => lhs > rhs,
            Self::UGe => lhs >= rhs,
            Self::SLt => sl < sr,
            Self::SLe => sl <= sr,
            Self::SGt => sl > sr,
            Self::SGe => sl >= sr,
        }
    }
}

/// Lane-agnostic bitwise vector operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum VectorOp {
    And,
    Or,
    Xor,
}

impl VectorOp {
    /// Evaluate on 128-bit operands.
    pub fn apply(self, lhs: u128, rhs: u128) -> u128 {
        match self {
            Self::And => lhs & rhs,
            Self::Or => lhs | rhs,
            Self::Xor => lhs ^ rhs,
        }
    }
}

/// One IR operation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Op {
    /// Copy incoming argument slot(s) starting at `slot` into `dst`.
    LoadArg { dst: Local, slot: u32 },
    Const { dst: Local, value: u64 },
    Move { dst: Local, src: Local },
    Unary { op: UnaryOp, dst: Local, src: Local },
    Binary { op: BinaryOp, dst: Local, lhs: Local, rhs: Local },
    BinaryImm { op: BinaryOp, dst: Local, lhs: Local, imm: u64 },
    /// `dst = (lhs cond rhs) as u64`
    Compare { cond: Cond, dst: Local, lhs: Local, rhs: Local },
    /// `dst = if cond != 0 { if_true } else { if_false }` (64-bit locals only)
    Select { dst: Local, cond: Local, if_true: Local, if_false: Local },
    Vector { op: VectorOp, dst: Local, lhs: Local, rhs: Local },
    VectorPack { dst: Local, lo: Local, hi: Local },
    VectorExtract { dst: Local, src: Local, high: bool },
    /// Read a guest register from the thread's register file.
    LoadRegister { dst: Local, reg: Register },
    /// Write a guest register back to the thread's register file.
    StoreRegister { reg: Register, src: Local },
    /// Zero-extending guest memory load.
    Load { width: MemWidth, dst: Local, address: Local },
    /// Truncating guest memory store.
    Store { width: MemWidth, address: Local, src: Local },
    LoadVector { dst: Local, address: Local },
    StoreVector { address: Local, src: Local },
    /// `dst = compare_and_swap_u32(address, expected, desired) as u64`
    AtomicCas32 { dst: Local, address: Local, expected: Local, desired: Local },
    Label(Label),
    Jump(Label),
    /// Branch when `cond != 0`, fall through otherwise.
    BranchIf { cond: Local, target: Label },
    /// Run the cached subroutine at `target`; `dst` receives its next address.
    CallSubroutine { dst: Local, target: u64 },
    /// Leave the subroutine, handing `next` to the dispatcher.
    Return { next: Local },

    /// Placeholder: load every non-parameter register local from the register file.
    Preload,
    /// Placeholder: store every register local to the register file.
    Spill,
    /// Placeholder: reload every register local from the register file.
    Reload,
}

impl Op {
    /// Whether control never falls through this op.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Self::Jump(_) | Self::Return { .. })
    }

    fn is_placeholder(&self) -> bool {
        matches!(self, Self::Preload | Self::Spill | Self::Reload)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadArg { dst, slot } => write!(f, "l{} = arg[{slot}]", dst.0),
            Self::Const { dst, value } => write!(f, "l{} = {value:#x}", dst.0),
            Self::Move { dst, src } => write!(f, "l{} = l{}", dst.0, src.0),
            Self::Unary { op, dst, src } => write!(f, "l{} = {op:?} l{}", dst.0, src.0),
            Self::Binary { op, dst, lhs, rhs } => {
                write!(f, "l{} = {op:?} l{}, l{}", dst.0, lhs.0, rhs.0)
            }
            Self::BinaryImm { op, dst, lhs, imm } => {
                write!(f, "l{} = {op:?} l{}, {imm:#x}", dst.0, lhs.0)
            }
            Self::Compare { cond, dst, lhs, rhs } => {
                write!(f, "l{} = cmp.{cond:?} l{}, l{}", dst.0, lhs.0, rhs.0)
            }
            Self::Select { dst, cond, if_true, if_false } => write!(
                f,
                "l{} = select l{}, l{}, l{}",
                dst.0, cond.0, if_true.0, if_false.0
            ),
            Self::Vector { op, dst, lhs, rhs } => {
                write!(f, "l{} = v{op:?} l{}, l{}", dst.0, lhs.0, rhs.0)
            }
            Self::VectorPack { dst, lo, hi } => {
                write!(f, "l{} = vpack l{}, l{}", dst.0, lo.0, hi.0)
            }
            Self::VectorExtract { dst, src, high } => {
                let half = if *high { "hi" } else { "lo" };
                write!(f, "l{} = vextract.{half} l{}", dst.0, src.0)
            }
            Self::LoadRegister { dst, reg } => write!(f, "l{} = {reg}", dst.0),
            Self::StoreRegister { reg, src } => write!(f, "{reg} = l{}", src.0),
            Self::Load { width, dst, address } => {
                write!(f, "l{} = load{} [l{}]", dst.0, width.bytes() * 8, address.0)
            }
            Self::Store { width, address, src } => {
                write!(f, "store{} [l{}], l{}", width.bytes() * 8, address.0, src.0)
            }
            Self::LoadVector { dst, address } => write!(f, "l{} = load128 [l{}]", dst.0, address.0),
            Self::StoreVector { address, src } => write!(f, "store128 [l{}], l{}", address.0, src.0),
            Self::AtomicCas32 { dst, address, expected, desired } => write!(
                f,
                "l{} = cas32 [l{}], l{}, l{}",
                dst.0, address.0, expected.0, desired.0
            ),
            Self::Label(label) => write!(f, "L{}:", label.0),
            Self::Jump(label) => write!(f, "jump L{}", label.0),
            Self::BranchIf { cond, target } => write!(f, "brif l{}, L{}", cond.0, target.0),
            Self::CallSubroutine { dst, target } => write!(f, "l{} = call {target:#x}", dst.0),
            Self::Return { next } => write!(f, "return l{}", next.0),
            Self::Preload => f.write_str("<preload>"),
            Self::Spill => f.write_str("<spill>"),
            Self::Reload => f.write_str("<reload>"),
        }
    }
}

/// A complete subroutine body ready for a backend.
#[derive(Debug, Clone)]
pub struct IrFunction {
    /// Symbolic name, e.g. `Sub0000000000001000`.
    pub name: String,
    /// Formal register parameters in argument order.
    pub params: Vec<Register>,
    /// Total number of 64-bit argument slots the parameters occupy.
    pub arg_slots: u32,
    /// Kind of every local, indexed by [`Local`].
    pub locals: Vec<LocalKind>,
    /// Number of labels allocated.
    pub labels: u32,
    /// Operation list.
    pub ops: Vec<Op>,
}

impl IrFunction {
    /// Kind of `local`.
    pub fn kind(&self, local: Local) -> LocalKind {
        self.locals[local.index()]
    }

    /// Check the structural invariants the backends rely on: every local and
    /// label reference is in range, every label is placed exactly once, no
    /// placeholder survived expansion and the last op is a terminator.
    pub fn validate(&self) -> Result<(), JitError> {
        let invalid = |reason: String| JitError::InvalidIr {
            function: self.name.clone(),
            reason,
        };
        let mut placed = vec![false; self.labels as usize];
        let locals = self.locals.len();
        let check_local = |local: Local| {
            if local.index() < locals {
                Ok(())
            } else {
                Err(invalid(format!("local l{} out of range", local.0)))
            }
        };

        for op in &self.ops {
            if op.is_placeholder() {
                return Err(invalid(format!("unexpanded placeholder {op}")));
            }
            for local in op.locals() {
                check_local(local)?;
            }
            match op {
                Op::Label(label) => {
                    let slot = placed
                        .get_mut(label.0 as usize)
                        .ok_or_else(|| invalid(format!("label L{} out of range", label.0)))?;
                    if *slot {
                        return Err(invalid(format!("label L{} placed twice", label.0)));
                    }
                    *slot = true;
                }
                Op::Jump(label) | Op::BranchIf { target: label, .. }
                    if label.0 >= self.labels =>
                {
                    return Err(invalid(format!("label L{} out of range", label.0)));
                }
                _ => {}
            }
        }
        if let Some(missing) = placed.iter().position(|placed| !placed) {
            return Err(invalid(format!("label L{missing} never placed")));
        }
        match self.ops.last() {
            Some(op) if op.is_terminator() => Ok(()),
            _ => Err(invalid("function does not end in a terminator".to_string())),
        }
    }
}

impl Op {
    /// Locals referenced by this op.
    pub fn locals(&self) -> Vec<Local> {
        match *self {
            Self::LoadArg { dst, .. } | Self::Const { dst, .. } => vec![dst],
            Self::Move { dst, src } | Self::Unary { dst, src, .. } => vec![dst, src],
            Self::Binary { dst, lhs, rhs, .. }
            | Self::Compare { dst, lhs, rhs, .. }
            | Self::Vector { dst, lhs, rhs, .. } => vec![dst, lhs, rhs],
            Self::BinaryImm { dst, lhs, .. } => vec![dst, lhs],
            Self::Select { dst, cond, if_true, if_false } => vec![dst, cond, if_true, if_false],
            Self::VectorPack { dst, lo, hi } => vec![dst, lo, hi],
            Self::VectorExtract { dst, src, .. } => vec![dst, src],
            Self::LoadRegister { dst, .. } => vec![dst],
            Self::StoreRegister { src, .. } => vec![src],
            Self::Load { dst, address, .. } | Self::LoadVector { dst, address } => {
                vec![dst, address]
            }
            Self::Store { address, src, .. } | Self::StoreVector { address, src } => {
                vec![address, src]
            }
            Self::AtomicCas32 { dst, address, expected, desired } => {
                vec![dst, address, expected, desired]
            }
            Self::BranchIf { cond, .. } => vec![cond],
            Self::CallSubroutine { dst, .. } => vec![dst],
            Self::Return { next } => vec![next],
            Self::Label(_) | Self::Jump(_) | Self::Preload | Self::Spill | Self::Reload => {
                Vec::new()
            }
        }
    }
}

/// Replace placeholder ops with concrete register traffic.
///
/// `registers` lists every register local in allocation order together with
/// whether it is a formal parameter. Returns the expanded list and a map from
/// each old op index (plus one past the end) to its new index.
pub fn expand_placeholders(ops: Vec<Op>, registers: &[(Register, Local, bool)]) -> (Vec<Op>, Vec<usize>) {
    let mut out = Vec::with_capacity(ops.len());
    let mut index_map = Vec::with_capacity(ops.len() + 1);
    for op in ops {
        index_map.push(out.len());
        match op {
            Op::Preload => out.extend(
                registers
                    .iter()
                    .filter(|(_, _, is_param)| !is_param)
                    .map(|&(reg, dst, _)| Op::LoadRegister { dst, reg }),
            ),
            Op::Spill => out.extend(
                registers
                    .iter()
                    .map(|&(reg, src, _)| Op::StoreRegister { reg, src }),
            ),
            Op::Reload => out.extend(
                registers
                    .iter()
                    .map(|&(reg, dst, _)| Op::LoadRegister { dst, reg }),
            ),
            op => out.push(op),
        }
    }
    index_map.push(out.len());
    (out, index_map)
}
