//! Dispatch loop and tier promotion
//!
//! Guest programs are tables of synthetic instructions served by the scripted
//! decoder; every run starts with the link register at 0 so the final `ret`
//! hands control back to the host.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use armada_exec::{ExecError, JitConfig, TraceError, Translator, TranslatorStats};
use armada_guest::{ExecutionMode, FlatMemory, LiveInSets, Memory, ThreadState};
use armada_jit::testing::{FixedAllocator, ScriptedDecoder, ops};
use armada_jit::{Block, BlockGraph, Decoder, JitError, KnownTargets, PromotionState, Tier};
use common::{config, fixture, fixture_with_live_in};

#[test]
fn test_single_return_block_runs_once() {
    let fx = fixture(
        [ops::ret(0x1000)],
        JitConfig {
            cpu_trace: true,
            ..config(250)
        },
    );
    let iterations = Arc::new(AtomicUsize::new(0));
    let seen = iterations.clone();
    fx.translator.subscribe(Arc::new(move |_address: u64| -> Result<(), TraceError> {
        seen.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }));

    let mut state = ThreadState::new();
    assert_eq!(fx.translator.execute(&mut state, 0x1000).unwrap(), 0);

    assert_eq!(iterations.load(Ordering::Relaxed), 1);
    assert!(fx.translator.cache().has_entry(0x1000));
    assert_eq!(fx.translator.cache().try_get(0x1000).unwrap().tier(), Tier::Tier0);
    assert_eq!(
        fx.translator.stats(),
        TranslatorStats {
            tier0_compiles: 1,
            executions: 1,
            ..TranslatorStats::default()
        }
    );
}

#[test]
fn test_redispatch_reuses_cached_subroutine() {
    let fx = fixture([ops::movz(0x1100, 3, 9), ops::ret(0x1104)], config(250));
    let mut state = ThreadState::new();

    fx.translator.execute(&mut state, 0x1100).unwrap();
    let first = fx.translator.cache().try_get(0x1100).unwrap();
    fx.translator.execute(&mut state, 0x1100).unwrap();
    let second = fx.translator.cache().try_get(0x1100).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(fx.decoder.block_decodes(), 1);
    assert_eq!(fx.translator.stats().cache_hits, 1);
    assert_eq!(state.x(3), 9);
}

#[test]
fn test_threshold_promotes_on_next_dispatch() {
    let fx = fixture([ops::movz(0x2000, 0, 1), ops::ret(0x2004)], config(3));
    let mut state = ThreadState::new();

    for _ in 0..3 {
        fx.translator.execute(&mut state, 0x2000).unwrap();
        let entry = fx.translator.cache().try_get(0x2000).unwrap();
        assert_eq!(entry.tier(), Tier::Tier0);
    }
    assert_eq!(fx.decoder.subroutine_decodes(), 0);

    fx.translator.execute(&mut state, 0x2000).unwrap();
    let entry = fx.translator.cache().try_get(0x2000).unwrap();
    assert_eq!(entry.tier(), Tier::Tier1);
    assert_eq!(entry.state(), PromotionState::Tier1);
    assert_eq!(fx.decoder.subroutine_decodes(), 1);

    let stats = fx.translator.stats();
    assert_eq!(stats.tier0_compiles, 1);
    assert_eq!(stats.tier1_compiles, 1);
    assert_eq!(stats.executions, 4);
}

fn counting_loop() -> Vec<armada_jit::DecodedOp> {
    vec![
        ops::movz(0x3000, 1, 0),
        ops::addi(0x3004, 1, 1, 3),
        ops::subi(0x3008, 0, 0, 1),
        ops::cbnz(0x300c, 0, 0x3004),
        ops::ret(0x3010),
    ]
}

#[test]
fn test_loop_results_survive_promotion() {
    let fx = fixture(counting_loop(), config(1));
    let mut state = ThreadState::new();

    for _ in 0..4 {
        state.set_x(0, 5);
        state.set_x(30, 0);
        assert_eq!(fx.translator.execute(&mut state, 0x3000).unwrap(), 0);
        assert_eq!(state.x(1), 15);
        assert_eq!(state.x(0), 0);
    }
    assert_eq!(fx.translator.cache().try_get(0x3000).unwrap().tier(), Tier::Tier1);
    assert_eq!(fx.translator.cache().try_get(0x3004).unwrap().tier(), Tier::Tier1);
}

#[test]
fn test_native_backend_matches_interpreter() {
    let native = fixture(
        counting_loop(),
        JitConfig {
            tier1_threshold: 2,
            ..JitConfig::default()
        },
    );
    let interp = fixture(counting_loop(), config(2));

    for n in [1u64, 4, 9] {
        let mut a = ThreadState::new();
        let mut b = ThreadState::new();
        a.set_x(0, n);
        b.set_x(0, n);
        native.translator.execute(&mut a, 0x3000).unwrap();
        interp.translator.execute(&mut b, 0x3000).unwrap();
        assert_eq!(a.regs, b.regs, "n = {n}");
        assert_eq!(a.x(1), 3 * n);
    }
}

#[test]
fn test_promotion_marks_callers_and_relinks() {
    let program = [
        ops::bl(0x4000, 0x5000),
        ops::movz(0x4004, 30, 0),
        ops::ret(0x4008),
        ops::addi(0x5000, 2, 2, 1),
        ops::ret(0x5004),
    ];
    let fx = fixture(program, config(2));
    let mut state = ThreadState::new();
    let cache = fx.translator.cache();

    for _ in 0..2 {
        fx.translator.execute(&mut state, 0x4000).unwrap();
    }
    assert_eq!(cache.callers_of(0x5000), vec![0x4000]);

    // third run promotes 0x4000 first, then 0x5000, which marks 0x4000
    fx.translator.execute(&mut state, 0x4000).unwrap();
    assert_eq!(cache.try_get(0x5000).unwrap().tier(), Tier::Tier1);
    let caller = cache.try_get(0x4000).unwrap();
    assert_eq!(caller.tier(), Tier::Tier1);
    assert_eq!(caller.state(), PromotionState::PendingPromotion);
    assert!(!caller.links_to(0x5000));
    assert_eq!(fx.translator.stats().caller_notifications, 1);

    let executions = fx.translator.stats().executions;
    fx.translator.execute(&mut state, 0x4000).unwrap();
    let caller = cache.try_get(0x4000).unwrap();
    assert_eq!(caller.state(), PromotionState::Tier1);
    assert!(caller.links_to(0x5000));
    // 0x5000 now runs inside 0x4000
    assert_eq!(fx.translator.stats().executions - executions, 2);
    assert_eq!(state.x(2), 4);
}

#[test]
fn test_memory_traffic() {
    let program = [
        ops::ldr(0x6000, 2, 1),
        ops::addi(0x6004, 2, 2, 5),
        ops::str(0x6008, 2, 1),
        ops::movz(0x600c, 3, 0x7),
        ops::movz(0x6010, 4, 0x9),
        ops::cas(0x6014, 5, 1, 3, 4),
        ops::ret(0x6018),
    ];
    let fx = fixture(program, config(250));
    fx.memory.write_u64(0x800, 0x7 - 5);
    let mut state = ThreadState::new();
    state.set_x(1, 0x800);

    fx.translator.execute(&mut state, 0x6000).unwrap();
    assert_eq!(state.x(5), 1);
    assert_eq!(fx.memory.read_u32(0x800), 0x9);
    assert_eq!(fx.memory.read_u32(0x804), 0);
}

#[test]
fn test_vector_registers_round_trip() {
    let program = [
        ops::movz(0x6100, 0, 0xff),
        ops::movz(0x6104, 1, 0xf0),
        ops::vpack(0x6108, 2, 0, 1),
        ops::vxor(0x610c, 3, 2, 3),
        ops::vlo(0x6110, 4, 3),
        ops::ret(0x6114),
    ];
    let fx = fixture(program, config(250));
    let mut state = ThreadState::new();
    state.regs.v[3] = armada_guest::V128::from_parts(0x0f, 0x0f);

    fx.translator.execute(&mut state, 0x6100).unwrap();
    assert_eq!(state.regs.v[3], armada_guest::V128::from_parts(0xf0, 0xff));
    assert_eq!(state.x(4), 0xf0);
}

#[test]
fn test_unsupported_live_in_register_fails_translation() {
    let live_in = LiveInSets {
        integer: 0,
        vector: 1 << 33,
    };
    let fx = fixture_with_live_in([ops::ret(0x1000)], config(250), live_in);
    let mut state = ThreadState::new();

    let error = fx.translator.execute(&mut state, 0x1000).unwrap_err();
    assert!(matches!(
        error,
        ExecError::Translate {
            address: 0x1000,
            source: JitError::UnsupportedRegister(_)
        }
    ));
    assert!(!fx.translator.cache().has_entry(0x1000));
}

#[test]
fn test_params_from_conservative_live_in() {
    let fx = fixture_with_live_in(
        [ops::add(0x1200, 0, 0, 1), ops::ret(0x1204)],
        config(1),
        LiveInSets::all(),
    );
    let mut state = ThreadState::new();
    for round in 0..3u64 {
        state.set_x(0, 10);
        state.set_x(1, round);
        fx.translator.execute(&mut state, 0x1200).unwrap();
        assert_eq!(state.x(0), 10 + round);
    }
    assert_eq!(fx.translator.cache().try_get(0x1200).unwrap().params().len(), 96);
}

#[test]
fn test_decode_failure_is_reported() {
    let fx = fixture([ops::b(0x1000, 0x1f00)], config(250));
    let mut state = ThreadState::new();
    let error = fx.translator.execute(&mut state, 0x1000).unwrap_err();
    assert!(matches!(
        error,
        ExecError::Translate {
            address: 0x1f00,
            source: JitError::Decode { .. }
        }
    ));
}

/// Decoder whose first basic-block decode parks until the test releases it.
struct StalledDecoder {
    inner: ScriptedDecoder,
    stalled: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl Decoder for StalledDecoder {
    fn decode_basic_block(
        &self,
        memory: &dyn Memory,
        address: u64,
        mode: ExecutionMode,
    ) -> Result<Block, JitError> {
        if !self.stalled.swap(true, Ordering::AcqRel) {
            self.entered.wait();
            self.release.wait();
        }
        self.inner.decode_basic_block(memory, address, mode)
    }

    fn decode_subroutine(
        &self,
        known: &dyn KnownTargets,
        memory: &dyn Memory,
        address: u64,
        mode: ExecutionMode,
    ) -> Result<BlockGraph, JitError> {
        self.inner.decode_subroutine(known, memory, address, mode)
    }
}

#[test]
fn test_late_tier0_build_does_not_displace_tier1() {
    let decoder = Arc::new(StalledDecoder {
        inner: ScriptedDecoder::new([ops::movz(0x2000, 0, 1), ops::ret(0x2004)]),
        stalled: AtomicBool::new(false),
        entered: Barrier::new(2),
        release: Barrier::new(2),
    });
    let translator = Translator::new(
        config(1),
        Arc::new(FlatMemory::new(0)),
        decoder.clone(),
        Arc::new(FixedAllocator(LiveInSets::default())),
    );
    let translator = &translator;

    thread::scope(|scope| {
        let slow = scope.spawn(move || {
            let mut state = ThreadState::new();
            let next = translator.execute(&mut state, 0x2000).map_err(|e| e.to_string());
            (next, state.x(0))
        });

        decoder.entered.wait();
        let mut state = ThreadState::new();
        for _ in 0..2 {
            translator.execute(&mut state, 0x2000).unwrap();
        }
        assert_eq!(translator.cache().try_get(0x2000).unwrap().tier(), Tier::Tier1);

        decoder.release.wait();
        assert_eq!(slow.join().unwrap(), (Ok(0), 1));
    });

    let entry = translator.cache().try_get(0x2000).unwrap();
    assert_eq!(entry.tier(), Tier::Tier1);
    assert_eq!(entry.state(), PromotionState::Tier1);
    let stats = translator.stats();
    assert_eq!(stats.tier0_compiles, 1);
    assert_eq!(stats.tier1_compiles, 1);
    assert_eq!(stats.executions, 3);
}
