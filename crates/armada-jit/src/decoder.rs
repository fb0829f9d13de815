//! Decoded guest code model and the decoder / allocator collaborator seams.
//!
//! The instruction decoder is an external collaborator: it hands the engine
//! [`DecodedOp`]s that already know which emitter routine generates code for
//! them. Everything the builder needs to know about an instruction is in
//! [`OpKind`].

use std::fmt;

use armada_guest::{ExecutionMode, LiveInSets, Memory};
use armada_profiler::OpcodeKey;
use smallvec::SmallVec;

use crate::JitError;
use crate::emitter::EmitContext;

/// Emitter routine for one kind of guest instruction.
pub type EmitFn = fn(&mut EmitContext<'_>, &DecodedOp) -> Result<(), JitError>;

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Falls through to the next instruction.
    Sequential,
    /// Unconditional branch to `target`.
    Branch,
    /// Branch to `target` or fall through.
    ConditionalBranch,
    /// Branch with link; execution resumes after the call on return.
    Call,
    /// Branch to a register value (`ret`, `br`, `blr`).
    IndirectBranch,
}

impl Flow {
    /// Whether the instruction ends a basic block.
    pub fn ends_block(self) -> bool {
        !matches!(self, Self::Sequential)
    }
}

/// Static description of an instruction kind.
pub struct OpKind {
    /// Emitter routine name, part of the opcode identity.
    pub emitter: &'static str,
    /// Instruction form, part of the opcode identity.
    pub form: &'static str,
    /// Control-flow class.
    pub flow: Flow,
    /// Code generator.
    pub emit: EmitFn,
}

impl OpKind {
    /// Profiling identity of this kind.
    pub fn key(&self) -> OpcodeKey {
        OpcodeKey::new(self.emitter, self.form)
    }
}

impl fmt::Debug for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpKind")
            .field("emitter", &self.emitter)
            .field("form", &self.form)
            .field("flow", &self.flow)
            .finish_non_exhaustive()
    }
}

/// One decoded guest instruction.
#[derive(Debug, Clone)]
pub struct DecodedOp {
    /// Guest address of the instruction.
    pub address: u64,
    /// Encoded size in bytes.
    pub size: u32,
    /// Instruction kind.
    pub kind: &'static OpKind,
    /// Decoded operand fields; meaning is defined by the emitter.
    pub operands: SmallVec<[u64; 4]>,
    /// Static branch target, for direct branches and calls.
    pub target: Option<u64>,
}

impl DecodedOp {
    /// Address of the following instruction.
    pub fn next_address(&self) -> u64 {
        self.address.wrapping_add(self.size as u64)
    }

    /// Operand `index`, or 0 when absent.
    pub fn operand(&self, index: usize) -> u64 {
        self.operands.get(index).copied().unwrap_or(0)
    }
}

/// Straight-line instruction sequence ending at a control transfer.
#[derive(Debug, Clone)]
pub struct Block {
    /// Address of the first instruction.
    pub address: u64,
    /// Instructions in program order.
    pub ops: Vec<DecodedOp>,
}

impl Block {
    /// Address just past the last instruction.
    pub fn end_address(&self) -> u64 {
        self.ops
            .last()
            .map(DecodedOp::next_address)
            .unwrap_or(self.address)
    }
}

/// Blocks reachable from an entry point, entry block first.
#[derive(Debug, Clone)]
pub struct BlockGraph {
    /// Blocks in emission order.
    pub blocks: Vec<Block>,
}

impl BlockGraph {
    /// Graph holding a single block.
    pub fn single(block: Block) -> Self {
        Self {
            blocks: vec![block],
        }
    }

    /// Entry block address, if any.
    pub fn entry(&self) -> Option<u64> {
        self.blocks.first().map(|block| block.address)
    }

    /// Whether a block starts at `address`.
    pub fn contains(&self, address: u64) -> bool {
        self.blocks.iter().any(|block| block.address == address)
    }

    /// Total number of decoded instructions.
    pub fn op_count(&self) -> usize {
        self.blocks.iter().map(|block| block.ops.len()).sum()
    }
}

/// Addresses that already have translated code.
pub trait KnownTargets {
    /// Whether `address` already has an entry.
    fn is_known(&self, address: u64) -> bool;
}

/// Instruction decoder collaborator.
pub trait Decoder: Send + Sync {
    /// Decode one basic block starting at `address`.
    fn decode_basic_block(
        &self,
        memory: &dyn Memory,
        address: u64,
        mode: ExecutionMode,
    ) -> Result<Block, JitError>;

    /// Decode the statically reachable block graph from `address`, not
    /// expanding targets that `known` already covers.
    fn decode_subroutine(
        &self,
        known: &dyn KnownTargets,
        memory: &dyn Memory,
        address: u64,
        mode: ExecutionMode,
    ) -> Result<BlockGraph, JitError>;
}

/// Register allocator collaborator.
pub trait RegisterAllocator: Send + Sync {
    /// Live-in register sets of the entry block of `graph`.
    fn live_in(&self, graph: &BlockGraph) -> LiveInSets;
}

/// Allocator that treats every integer register, flag and vector register
/// as live on entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConservativeAllocator;

impl RegisterAllocator for ConservativeAllocator {
    fn live_in(&self, _graph: &BlockGraph) -> LiveInSets {
        LiveInSets::all()
    }
}
