//! Subroutine builder: decoded block graph in, executable subroutine out.

use std::sync::Arc;
use std::time::Duration;

use armada_profiler::Introspection;

use crate::JitError;
use crate::backend::CodeBackend;
use crate::cache::TranslationCache;
use crate::decoder::{BlockGraph, RegisterAllocator};
use crate::emitter::{EmitContext, InstructionSpan};
use crate::ir::IrFunction;
use crate::subroutine::{Tier, TranslatedSubroutine};

/// Generated ops per guest instruction above which the span is dumped.
pub const DEFAULT_CODE_SIZE_WARNING: usize = 400;

/// Default number of Tier0 dispatches before promotion.
pub const DEFAULT_TIER1_THRESHOLD: u32 = 250;

/// Name given to the subroutine at `address`.
pub fn subroutine_name(address: u64) -> String {
    format!("Sub{address:016x}")
}

/// What one build produced.
#[derive(Debug)]
pub struct BuildOutput {
    /// The finished subroutine, not yet published.
    pub subroutine: Arc<TranslatedSubroutine>,
    /// Total IR operations generated.
    pub generated_ops: usize,
    /// Time the code backend spent producing host code.
    pub backend_time: Duration,
}

/// Drives allocation, emission, backend compilation and instrumentation for
/// one subroutine at a time. Shared by all guest threads.
pub struct SubroutineBuilder {
    allocator: Arc<dyn RegisterAllocator>,
    backend: Arc<dyn CodeBackend>,
    introspection: Option<Arc<Introspection>>,
    code_size_warning: usize,
    tier1_threshold: u32,
}

impl SubroutineBuilder {
    /// Builder with default thresholds and no introspection.
    pub fn new(allocator: Arc<dyn RegisterAllocator>, backend: Arc<dyn CodeBackend>) -> Self {
        Self {
            allocator,
            backend,
            introspection: None,
            code_size_warning: DEFAULT_CODE_SIZE_WARNING,
            tier1_threshold: DEFAULT_TIER1_THRESHOLD,
        }
    }

    /// Feed opcode statistics into `introspection`.
    pub fn with_introspection(mut self, introspection: Option<Arc<Introspection>>) -> Self {
        self.introspection = introspection;
        self
    }

    /// Dump spans generating more than `ops` operations.
    pub fn with_code_size_warning(mut self, ops: usize) -> Self {
        self.code_size_warning = ops;
        self
    }

    /// Promotion threshold given to Tier0 subroutines.
    pub fn with_tier1_threshold(mut self, threshold: u32) -> Self {
        self.tier1_threshold = threshold;
        self
    }

    /// Backend in use.
    pub fn backend(&self) -> &Arc<dyn CodeBackend> {
        &self.backend
    }

    /// Build `graph` (entry block first) into a subroutine for `address`.
    ///
    /// Fails when the allocator reports a live-in register that cannot be
    /// passed as a parameter, when an emitter fails, or when the backend
    /// rejects the generated code.
    pub fn build(
        &self,
        cache: &TranslationCache,
        address: u64,
        graph: &BlockGraph,
        tier: Tier,
        name: String,
    ) -> Result<BuildOutput, JitError> {
        let params = self.allocator.live_in(graph).registers()?;

        let mut ctx = EmitContext::new(name.clone(), tier, graph, cache, &params);
        for block in &graph.blocks {
            if let Some(label) = ctx.block_label(block.address) {
                ctx.place(label);
            }
            for op in &block.ops {
                ctx.begin_instruction(op);
                (op.kind.emit)(&mut ctx, op)?;
                ctx.end_instruction();
            }
            if !ctx.is_terminated() {
                ctx.emit_branch(block.end_address());
            }
        }
        let emitted = ctx.finish();

        let output = self.backend.compile(&emitted.function, tier)?;
        let generated_ops = emitted.function.ops.len();
        self.instrument(&emitted.function, emitted.spans);

        tracing::debug!(
            address,
            ?tier,
            name = %name,
            blocks = graph.blocks.len(),
            params = params.len(),
            generated_ops,
            backend = self.backend.name(),
            "built subroutine"
        );

        let subroutine = TranslatedSubroutine::new(
            address,
            name,
            tier,
            params,
            output.code,
            emitted.callees,
            generated_ops,
            self.tier1_threshold,
        )
        .with_linked(emitted.linked);
        Ok(BuildOutput {
            subroutine: Arc::new(subroutine),
            generated_ops,
            backend_time: output.backend_time,
        })
    }

    /// Post-build pass over the instruction spans: dump oversized spans and
    /// feed per-opcode stats. Consumes the spans.
    fn instrument(&self, function: &IrFunction, spans: Vec<InstructionSpan>) {
        for span in spans {
            let generated = span.generated_ops();
            if generated > self.code_size_warning {
                tracing::warn!(
                    function = %function.name,
                    address = span.address,
                    opcode = %span.key,
                    generated,
                    threshold = self.code_size_warning,
                    "instruction generated an unusually large amount of code"
                );
                for (index, op) in function.ops[span.start..span.end].iter().enumerate() {
                    tracing::debug!(index = span.start + index, "  {op}");
                }
            }
            if let Some(introspection) = &self.introspection {
                introspection.track_opcode(span.key, span.emit_time, generated);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InterpreterBackend;
    use crate::testing::{FixedAllocator, ScriptedDecoder, ops};
    use crate::decoder::Decoder;
    use armada_guest::{ExecutionMode, FlatMemory, LiveInSets, Register, ThreadState};

    fn builder(live_in: LiveInSets) -> SubroutineBuilder {
        SubroutineBuilder::new(
            Arc::new(FixedAllocator(live_in)),
            Arc::new(InterpreterBackend),
        )
    }

    #[test]
    fn params_follow_live_in_bit_order() {
        let decoder = ScriptedDecoder::new([ops::ret(0x1000)]);
        let memory = FlatMemory::new(0);
        let cache = TranslationCache::new();
        let block = decoder
            .decode_basic_block(&memory, 0x1000, ExecutionMode::Aarch64)
            .unwrap();
        let live_in: LiveInSets = [
            Register::vector(0),
            Register::int(30),
            Register::flag(1),
            Register::int(2),
        ]
        .into_iter()
        .collect();

        let output = builder(live_in)
            .build(&cache, 0x1000, &BlockGraph::single(block), Tier::Tier0, subroutine_name(0x1000))
            .unwrap();

        assert_eq!(
            output.subroutine.params(),
            &[
                Register::int(2),
                Register::int(30),
                Register::flag(1),
                Register::vector(0)
            ]
        );
        assert_eq!(output.subroutine.name(), "Sub0000000000001000");
        assert_eq!(output.subroutine.tier(), Tier::Tier0);
    }

    #[test]
    fn unsupported_vector_bit_fails_fast() {
        let decoder = ScriptedDecoder::new([ops::ret(0x1000)]);
        let memory = FlatMemory::new(0);
        let cache = TranslationCache::new();
        let block = decoder
            .decode_basic_block(&memory, 0x1000, ExecutionMode::Aarch64)
            .unwrap();
        let live_in = LiveInSets {
            integer: 0,
            vector: 1 << 40,
        };

        let result = builder(live_in).build(
            &cache,
            0x1000,
            &BlockGraph::single(block),
            Tier::Tier0,
            subroutine_name(0x1000),
        );
        assert!(matches!(result, Err(JitError::UnsupportedRegister(_))));
    }

    #[test]
    fn oversized_spans_are_diagnostic_only() {
        let decoder = ScriptedDecoder::new([ops::bloat(0x1000, 500), ops::ret(0x1004)]);
        let memory = FlatMemory::new(0);
        let cache = TranslationCache::new();
        let introspection = Arc::new(Introspection::new());
        let block = decoder
            .decode_basic_block(&memory, 0x1000, ExecutionMode::Aarch64)
            .unwrap();

        let output = builder(LiveInSets::default())
            .with_introspection(Some(Arc::clone(&introspection)))
            .build(&cache, 0x1000, &BlockGraph::single(block), Tier::Tier0, subroutine_name(0x1000))
            .unwrap();

        let profile = introspection.opcode(&ops::BLOAT.key()).unwrap();
        assert_eq!(profile.occurrences(), 1);
        assert!(profile.max_size() >= 500);
        assert!(introspection.opcode(&ops::RET.key()).is_some());

        let mut state = ThreadState::new();
        state.set_x(30, 0x5550);
        assert_eq!(output.subroutine.execute(&mut state, &memory, &cache), 0x5550);
    }

    #[test]
    fn fallthrough_blocks_exit_to_their_end_address() {
        let decoder = ScriptedDecoder::new([ops::movz(0x3000, 1, 7), ops::nop(0x3004)]);
        let memory = FlatMemory::new(0);
        let cache = TranslationCache::new();
        let block = decoder
            .decode_basic_block(&memory, 0x3000, ExecutionMode::Aarch64)
            .unwrap();

        let output = builder(LiveInSets::default())
            .build(&cache, 0x3000, &BlockGraph::single(block), Tier::Tier0, subroutine_name(0x3000))
            .unwrap();

        let mut state = ThreadState::new();
        assert_eq!(output.subroutine.execute(&mut state, &memory, &cache), 0x3008);
        assert_eq!(state.x(1), 7);
    }
}
