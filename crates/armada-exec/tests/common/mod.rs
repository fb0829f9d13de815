//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use armada_exec::{BackendKind, JitConfig, Translator};
use armada_guest::{FlatMemory, LiveInSets};
use armada_jit::DecodedOp;
use armada_jit::testing::{FixedAllocator, ScriptedDecoder};
use tracing_subscriber::filter::EnvFilter;

pub struct Fixture {
    pub translator: Translator,
    pub decoder: Arc<ScriptedDecoder>,
    pub memory: Arc<FlatMemory>,
}

pub fn config(tier1_threshold: u32) -> JitConfig {
    JitConfig {
        tier1_threshold,
        backend: BackendKind::Interpreter,
        ..JitConfig::default()
    }
}

pub fn fixture(program: impl IntoIterator<Item = DecodedOp>, config: JitConfig) -> Fixture {
    fixture_with_live_in(program, config, LiveInSets::default())
}

pub fn fixture_with_live_in(
    program: impl IntoIterator<Item = DecodedOp>,
    config: JitConfig,
    live_in: LiveInSets,
) -> Fixture {
    init_tracing();
    let decoder = Arc::new(ScriptedDecoder::new(program));
    let memory = Arc::new(FlatMemory::with_identity_map(0x1_0000));
    let translator = Translator::new(
        config,
        memory.clone(),
        decoder.clone(),
        Arc::new(FixedAllocator(live_in)),
    );
    Fixture {
        translator,
        decoder,
        memory,
    }
}

/// Routes engine logs to the test output; filter with `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
