//! Translated subroutines and their promotion state machine.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use armada_guest::{Memory, Register, RegisterClass, ThreadState};

use crate::backend::CompiledCode;
use crate::cache::TranslationCache;
use crate::context::JitContext;

/// Compilation tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    /// One basic block, built for low latency.
    Tier0,
    /// The full statically reachable graph, with linked calls.
    Tier1,
}

/// Promotion state of one cache entry.
///
/// ```text
/// Tier0 --(threshold reached)--> PendingPromotion --(Tier1 published)--> Tier1
///                                       ^                                  |
///                                       +-------(caller notification)------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PromotionState {
    /// Baseline code, counting dispatches.
    Tier0 = 0,
    /// A Tier1 rebuild is wanted.
    PendingPromotion = 1,
    /// Optimized code, no further promotion wanted.
    Tier1 = 2,
}

impl PromotionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Tier0,
            1 => Self::PendingPromotion,
            _ => Self::Tier1,
        }
    }
}

/// A compiled unit for one guest entry address.
pub struct TranslatedSubroutine {
    entry: u64,
    name: String,
    tier: Tier,
    params: Vec<Register>,
    code: Arc<dyn CompiledCode>,
    callees: Vec<u64>,
    linked: Vec<u64>,
    generated_ops: usize,
    dispatches: AtomicU64,
    state: AtomicU8,
    tier1_threshold: u32,
    rejittable: bool,
}

impl fmt::Debug for TranslatedSubroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslatedSubroutine")
            .field("entry", &format_args!("{:#x}", self.entry))
            .field("name", &self.name)
            .field("tier", &self.tier)
            .field("state", &self.state())
            .field("params", &self.params)
            .field("callees", &self.callees)
            .finish_non_exhaustive()
    }
}

impl TranslatedSubroutine {
    /// Wrap compiled guest code.
    ///
    /// `callees` are the direct call targets recorded while emitting it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entry: u64,
        name: String,
        tier: Tier,
        params: Vec<Register>,
        code: Arc<dyn CompiledCode>,
        callees: Vec<u64>,
        generated_ops: usize,
        tier1_threshold: u32,
    ) -> Self {
        let state = match tier {
            Tier::Tier0 => PromotionState::Tier0,
            Tier::Tier1 => PromotionState::Tier1,
        };
        Self {
            entry,
            name,
            tier,
            params,
            code,
            callees,
            linked: Vec::new(),
            generated_ops,
            dispatches: AtomicU64::new(0),
            state: AtomicU8::new(state as u8),
            tier1_threshold,
            rejittable: true,
        }
    }

    /// Wrap host code that must never be rebuilt from guest instructions.
    pub fn host(entry: u64, name: String, params: Vec<Register>, code: Arc<dyn CompiledCode>) -> Self {
        Self {
            rejittable: false,
            ..Self::new(entry, name, Tier::Tier1, params, code, Vec::new(), 0, u32::MAX)
        }
    }

    /// Record the callees whose Tier1 code this subroutine invokes in place.
    pub fn with_linked(mut self, linked: Vec<u64>) -> Self {
        self.linked = linked;
        self
    }

    /// Guest entry address.
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// Symbolic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tier the code was built at.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Formal register parameters, in argument order.
    pub fn params(&self) -> &[Register] {
        &self.params
    }

    /// Direct call targets.
    pub fn callees(&self) -> &[u64] {
        &self.callees
    }

    /// Whether calls to `callee` were linked when this code was built.
    pub fn links_to(&self, callee: u64) -> bool {
        self.linked.contains(&callee)
    }

    /// Number of IR operations generated.
    pub fn generated_ops(&self) -> usize {
        self.generated_ops
    }

    /// Number of promotion checks made by the dispatcher.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    /// Whether this entry wraps host code.
    pub fn is_host(&self) -> bool {
        !self.rejittable
    }

    /// Current promotion state.
    pub fn state(&self) -> PromotionState {
        PromotionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the dispatcher should rebuild this entry at Tier1 now.
    ///
    /// A Tier0 entry counts every call; once it has been dispatched
    /// `tier1_threshold` times the next call moves it to
    /// [`PromotionState::PendingPromotion`] and answers `true`.
    pub fn should_rejit(&self) -> bool {
        match self.state() {
            PromotionState::PendingPromotion => true,
            PromotionState::Tier1 => false,
            PromotionState::Tier0 => {
                let seen = self.dispatches.fetch_add(1, Ordering::Relaxed);
                if seen < self.tier1_threshold as u64 {
                    return false;
                }
                let _ = self.state.compare_exchange(
                    PromotionState::Tier0 as u8,
                    PromotionState::PendingPromotion as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                self.state() == PromotionState::PendingPromotion
            }
        }
    }

    /// Ask for a Tier1 rebuild on the next dispatch. Host code ignores this.
    pub fn mark_for_rejit(&self) {
        if self.rejittable {
            self.state
                .store(PromotionState::PendingPromotion as u8, Ordering::Release);
        }
    }

    /// Run against a thread's registers; returns the next guest address
    /// (0 hands control back to the host).
    pub fn execute(&self, state: &mut ThreadState, memory: &dyn Memory, cache: &TranslationCache) -> u64 {
        let mut ctx = JitContext::new(&mut state.regs, memory, cache);
        self.invoke_in(&mut ctx)
    }

    /// Run inside an existing context, reading parameters from its registers.
    pub fn invoke_in(&self, ctx: &mut JitContext<'_>) -> u64 {
        let mut args = Vec::with_capacity(self.params.len() * 2);
        let regs = ctx.regs();
        for &reg in &self.params {
            let bits = regs.read_bits(reg);
            args.push(bits as u64);
            if reg.class() == RegisterClass::Vector {
                args.push((bits >> 64) as u64);
            }
        }
        self.code.invoke(ctx, &args)
    }
}
