//! Per-build emission state shared by all instruction emitters.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use armada_guest::{LINK_REGISTER, Register};
use armada_profiler::OpcodeKey;

use crate::cache::TranslationCache;
use crate::decoder::{BlockGraph, DecodedOp};
use crate::ir::{self, Cond, IrFunction, Label, Local, LocalKind, Op};
use crate::subroutine::Tier;

/// Generated-code span of one guest instruction within a single build.
#[derive(Debug, Clone)]
pub struct InstructionSpan {
    /// Opcode identity.
    pub key: OpcodeKey,
    /// Guest address of the instruction.
    pub address: u64,
    /// First op index.
    pub start: usize,
    /// One past the last op index.
    pub end: usize,
    /// Time spent in the emitter.
    pub emit_time: Duration,
}

impl InstructionSpan {
    /// Number of ops generated for the instruction.
    pub fn generated_ops(&self) -> usize {
        self.end - self.start
    }
}

/// What [`EmitContext::finish`] hands back to the builder.
#[derive(Debug)]
pub struct Emitted {
    /// Finished function with placeholders expanded.
    pub function: IrFunction,
    /// One span per emitted guest instruction, in emission order.
    pub spans: Vec<InstructionSpan>,
    /// Direct call targets, ascending.
    pub callees: Vec<u64>,
    /// Call targets whose Tier1 code is invoked in place, ascending.
    pub linked: Vec<u64>,
}

struct OpenSpan {
    key: OpcodeKey,
    address: u64,
    start: usize,
    started: Instant,
}

/// Emission state for one subroutine build.
///
/// Guest registers are cached in locals allocated on first use. Parameters are
/// bound in the prologue; any other register used by the body is loaded from
/// the register file on entry, and every register local is written back
/// before the subroutine exits or makes a linked call.
pub struct EmitContext<'a> {
    tier: Tier,
    cache: &'a TranslationCache,
    name: String,
    params: Vec<Register>,
    arg_slots: u32,
    ops: Vec<Op>,
    locals: Vec<LocalKind>,
    registers: Vec<(Register, Local, bool)>,
    register_index: HashMap<Register, usize>,
    block_labels: HashMap<u64, Label>,
    labels: u32,
    callees: BTreeSet<u64>,
    linked: BTreeSet<u64>,
    spans: Vec<InstructionSpan>,
    open: Option<OpenSpan>,
}

impl<'a> EmitContext<'a> {
    /// Start a build: allocate block labels, bind `params` and emit the prologue.
    pub fn new(
        name: String,
        tier: Tier,
        graph: &'a BlockGraph,
        cache: &'a TranslationCache,
        params: &[Register],
    ) -> Self {
        let mut ctx = Self {
            tier,
            cache,
            name,
            params: params.to_vec(),
            arg_slots: 0,
            ops: Vec::new(),
            locals: Vec::new(),
            registers: Vec::new(),
            register_index: HashMap::new(),
            block_labels: HashMap::new(),
            labels: 0,
            callees: BTreeSet::new(),
            linked: BTreeSet::new(),
            spans: Vec::new(),
            open: None,
        };
        for block in &graph.blocks {
            let label = ctx.label();
            ctx.block_labels.insert(block.address, label);
        }
        for &reg in params {
            let dst = ctx.allocate_register(reg, true);
            let slot = ctx.arg_slots;
            ctx.arg_slots += LocalKind::for_register(reg).arg_slots();
            ctx.emit(Op::LoadArg { dst, slot });
        }
        ctx.emit(Op::Preload);
        ctx
    }

    /// Tier being built.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    fn allocate_register(&mut self, reg: Register, is_param: bool) -> Local {
        if let Some(&index) = self.register_index.get(&reg) {
            return self.registers[index].1;
        }
        let local = self.temp(LocalKind::for_register(reg));
        self.register_index.insert(reg, self.registers.len());
        self.registers.push((reg, local, is_param));
        local
    }

    /// Local holding guest register `reg`, allocated on first use.
    pub fn register(&mut self, reg: Register) -> Local {
        self.allocate_register(reg, false)
    }

    /// Fresh scratch local.
    pub fn temp(&mut self, kind: LocalKind) -> Local {
        let local = Local(self.locals.len() as u32);
        self.locals.push(kind);
        local
    }

    /// Fresh 64-bit local holding `value`.
    pub fn constant(&mut self, value: u64) -> Local {
        let dst = self.temp(LocalKind::I64);
        self.emit(Op::Const { dst, value });
        dst
    }

    /// Append one op.
    pub fn emit(&mut self, op: Op) {
        self.ops.push(op);
    }

    /// Fresh label; place it with [`EmitContext::place`].
    pub fn label(&mut self) -> Label {
        let label = Label(self.labels);
        self.labels += 1;
        label
    }

    /// Place `label` at the current position.
    pub fn place(&mut self, label: Label) {
        self.emit(Op::Label(label));
    }

    /// Label of the block starting at `address`, if it is part of this build.
    pub fn block_label(&self, address: u64) -> Option<Label> {
        self.block_labels.get(&address).copied()
    }

    /// Whether the last op never falls through.
    pub fn is_terminated(&self) -> bool {
        self.ops.last().is_some_and(Op::is_terminator)
    }

    /// Leave the subroutine with `next` as the next guest address.
    pub fn emit_return(&mut self, next: Local) {
        self.emit(Op::Spill);
        self.emit(Op::Return { next });
    }

    /// In-build jump target for guest `target`. Tier0 code always returns to
    /// the dispatcher so that every execution covers one basic block.
    fn jump_target(&self, target: u64) -> Option<Label> {
        match self.tier {
            Tier::Tier0 => None,
            Tier::Tier1 => self.block_label(target),
        }
    }

    /// Continue at guest `target`: a jump when it is in this build, an exit
    /// to the dispatcher otherwise.
    pub fn emit_branch(&mut self, target: u64) {
        match self.jump_target(target) {
            Some(label) => self.emit(Op::Jump(label)),
            None => {
                let next = self.constant(target);
                self.emit_return(next);
            }
        }
    }

    /// Continue at guest `target` when `cond != 0`, fall through otherwise.
    pub fn emit_branch_if(&mut self, cond: Local, target: u64) {
        match self.jump_target(target) {
            Some(label) => self.emit(Op::BranchIf { cond, target: label }),
            None => {
                let zero = self.constant(0);
                let not_taken = self.temp(LocalKind::I64);
                self.emit(Op::Compare {
                    cond: Cond::Eq,
                    dst: not_taken,
                    lhs: cond,
                    rhs: zero,
                });
                let skip = self.label();
                self.emit(Op::BranchIf {
                    cond: not_taken,
                    target: skip,
                });
                let next = self.constant(target);
                self.emit_return(next);
                self.place(skip);
            }
        }
    }

    /// Direct call to guest `target` that returns to `return_address`.
    ///
    /// The link register must already hold `return_address`. In a Tier1
    /// build whose callee is already Tier1 code, the call is linked: register
    /// locals are written back, the callee runs in place, and execution
    /// continues here if it came back to `return_address`. Otherwise control
    /// passes to `target` through the dispatcher.
    pub fn emit_call(&mut self, target: u64, return_address: u64) {
        self.callees.insert(target);
        let linkable = self.tier == Tier::Tier1
            && self
                .cache
                .try_get(target)
                .is_some_and(|callee| callee.tier() == Tier::Tier1);
        if !linkable {
            self.emit_branch(target);
            return;
        }

        self.linked.insert(target);
        let next = self.temp(LocalKind::I64);
        self.emit(Op::Spill);
        self.emit(Op::CallSubroutine { dst: next, target });
        self.emit(Op::Reload);
        let expected = self.constant(return_address);
        let returned = self.temp(LocalKind::I64);
        self.emit(Op::Compare {
            cond: Cond::Eq,
            dst: returned,
            lhs: next,
            rhs: expected,
        });
        let resume = self.label();
        self.emit(Op::BranchIf {
            cond: returned,
            target: resume,
        });
        self.emit_return(next);
        self.place(resume);
        self.emit_branch(return_address);
    }

    /// Return through the link register.
    pub fn emit_return_via_link(&mut self) {
        let next = self.register(Register::int(LINK_REGISTER));
        self.emit_return(next);
    }

    /// Start the span of `op`.
    pub fn begin_instruction(&mut self, op: &DecodedOp) {
        self.open = Some(OpenSpan {
            key: op.kind.key(),
            address: op.address,
            start: self.ops.len(),
            started: Instant::now(),
        });
    }

    /// Close the span opened by [`EmitContext::begin_instruction`].
    pub fn end_instruction(&mut self) {
        if let Some(open) = self.open.take() {
            self.spans.push(InstructionSpan {
                key: open.key,
                address: open.address,
                start: open.start,
                end: self.ops.len(),
                emit_time: open.started.elapsed(),
            });
        }
    }

    /// Expand placeholders and hand over the function, spans and callees.
    pub fn finish(self) -> Emitted {
        let (ops, index_map) = ir::expand_placeholders(self.ops, &self.registers);
        let spans = self
            .spans
            .into_iter()
            .map(|span| InstructionSpan {
                start: index_map[span.start],
                end: index_map[span.end],
                ..span
            })
            .collect();
        Emitted {
            function: IrFunction {
                name: self.name,
                params: self.params,
                arg_slots: self.arg_slots,
                locals: self.locals,
                labels: self.labels,
                ops,
            },
            spans,
            callees: self.callees.into_iter().collect(),
            linked: self.linked.into_iter().collect(),
        }
    }
}
