//! Threads, cancellation, tracing, host calls and profiling

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use armada_exec::{ExecError, GuestFunction, JitConfig, TraceError};
use armada_guest::ThreadState;
use armada_jit::testing::ops;
use common::{config, fixture};

#[test]
fn test_concurrent_first_dispatch_leaves_one_entry() {
    const THREADS: usize = 8;
    let fx = fixture([ops::addi(0x6000, 1, 1, 1), ops::ret(0x6004)], config(250));
    let barrier = &Barrier::new(THREADS);
    let translator = &fx.translator;

    thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(move || {
                    let mut state = ThreadState::new();
                    barrier.wait();
                    let next = translator.execute(&mut state, 0x6000);
                    (next.map_err(|e| e.to_string()), state.x(1))
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), (Ok(0), 1));
        }
    });

    assert_eq!(fx.translator.cache().len(), 1);
    assert!(fx.translator.cache().has_entry(0x6000));
    let stats = fx.translator.stats();
    assert!(stats.tier0_compiles >= 1);
    assert_eq!(stats.executions, THREADS as u64);
}

#[test]
fn test_cancel_stops_between_executions() {
    let fx = fixture(
        [ops::addi(0x7000, 1, 1, 1), ops::b(0x7004, 0x7000)],
        JitConfig {
            cpu_trace: true,
            ..config(250)
        },
    );
    let mut state = ThreadState::new();
    let cancel = state.cancel_handle();
    let dispatches = Arc::new(AtomicUsize::new(0));
    let seen = dispatches.clone();
    fx.translator.subscribe(Arc::new(move |_address: u64| -> Result<(), TraceError> {
        if seen.fetch_add(1, Ordering::Relaxed) + 1 == 5 {
            cancel.cancel();
        }
        Ok(())
    }));

    assert_eq!(fx.translator.execute(&mut state, 0x7000).unwrap(), 0x7000);
    assert_eq!(state.x(1), 5);
    assert!(!state.is_running());

    state.resume();
    state.set_x(1, 0);
    let cancel = state.cancel_handle();
    let seen = dispatches.clone();
    fx.translator.subscribe(Arc::new(move |_address: u64| -> Result<(), TraceError> {
        if seen.load(Ordering::Relaxed) >= 8 {
            cancel.cancel();
        }
        Ok(())
    }));
    fx.translator.execute(&mut state, 0x7000).unwrap();
    assert_eq!(state.x(1), 3);
}

#[test]
fn test_trace_subscriber_failure_aborts() {
    let fx = fixture(
        [ops::b(0x7100, 0x7200), ops::ret(0x7200)],
        JitConfig {
            cpu_trace: true,
            ..config(250)
        },
    );
    fx.translator.subscribe(Arc::new(|address: u64| -> Result<(), TraceError> {
        if address == 0x7200 {
            return Err("observer gave up".into());
        }
        Ok(())
    }));

    let mut state = ThreadState::new();
    let error = fx.translator.execute(&mut state, 0x7100).unwrap_err();
    assert!(matches!(error, ExecError::Trace { address: 0x7200, .. }));
    assert!(!fx.translator.cache().has_entry(0x7200));
}

#[test]
fn test_trace_events_are_off_by_default() {
    let fx = fixture([ops::ret(0x7100)], config(250));
    fx.translator.subscribe(Arc::new(|_address: u64| -> Result<(), TraceError> {
        Err("should not fire".into())
    }));
    let mut state = ThreadState::new();
    assert_eq!(fx.translator.execute(&mut state, 0x7100).unwrap(), 0);
}

#[test]
fn test_guest_calls_host_function() {
    let program = [
        ops::movz(0x7100, 0, 20),
        ops::movz(0x7104, 1, 22),
        ops::bl(0x7108, 0x8000),
        ops::movz(0x710c, 30, 0),
        ops::ret(0x7110),
    ];
    let fx = fixture(program, config(1));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    fx.translator
        .register_host_function(0x8000, "sum", move |a: u64, b: u64| {
            counter.fetch_add(1, Ordering::Relaxed);
            a + b
        })
        .unwrap();

    for round in 1..=3 {
        let mut state = ThreadState::new();
        assert_eq!(fx.translator.execute(&mut state, 0x7100).unwrap(), 0);
        assert_eq!(state.x(0), 42);
        assert_eq!(calls.load(Ordering::Relaxed), round);
    }
    let host = fx.translator.cache().try_get(0x8000).unwrap();
    assert!(host.is_host());
    // the promoted caller invokes the thunk in place
    assert!(fx.translator.cache().try_get(0x7100).unwrap().links_to(0x8000));
}

#[test]
fn test_host_calls_guest_function() {
    let fx = fixture([ops::add(0x7200, 0, 0, 1), ops::ret(0x7204)], config(250));
    let add = GuestFunction::<(u64, u64), u64>::new(0x7200).unwrap();
    let mut state = ThreadState::new();

    assert_eq!(add.call(&fx.translator, &mut state, (40, 2)).unwrap(), 42);

    let add_signed = GuestFunction::<(i32, i32), i32>::new(0x7200).unwrap();
    assert_eq!(add_signed.call(&fx.translator, &mut state, (-50, 8)).unwrap(), -42);
}

#[test]
fn test_guest_function_uses_both_register_banks() {
    let fx = fixture([ops::vlo(0x7300, 0, 0), ops::ret(0x7304)], config(250));
    let low_bits = GuestFunction::<(u64, f64), u64>::new(0x7300).unwrap();
    let mut state = ThreadState::new();

    let bits = low_bits.call(&fx.translator, &mut state, (7, 2.5)).unwrap();
    assert_eq!(bits, 2.5f64.to_bits());

    type Wide = (u64, u64, u64, u64, u64, u64, u64, u64);
    assert!(GuestFunction::<Wide, u64>::new(0x7300).is_ok());
}

#[test]
fn test_introspection_records_compiles_and_executions() {
    let fx = fixture([ops::movz(0x1000, 0, 1), ops::ret(0x1004)], config(2));
    let mut state = ThreadState::new();
    for _ in 0..3 {
        fx.translator.execute(&mut state, 0x1000).unwrap();
    }

    let introspection = fx.translator.introspection().unwrap();
    let times = introspection.subroutine(0x1000).unwrap();
    assert_eq!(times.execution_count, 3);
    assert!(times.tier0_jit_time.is_some());
    assert!(times.tier1_jit_time.is_some());
    assert!(times.underlying_jit_time.is_some());
    assert!(times.execution_time.is_some());

    let ret = introspection.opcode(&ops::RET.key()).unwrap();
    assert_eq!(ret.occurrences(), 2);

    let report = introspection.report().to_string();
    assert!(report.contains("=== Opcodes by encounter count ==="));
    assert!(report.contains("ret (emit_ret)"));
}

#[test]
fn test_introspection_can_be_disabled() {
    let fx = fixture(
        [ops::ret(0x1000)],
        JitConfig {
            introspection: false,
            ..config(250)
        },
    );
    let mut state = ThreadState::new();
    fx.translator.execute(&mut state, 0x1000).unwrap();
    assert!(fx.translator.introspection().is_none());
    assert!(fx.translator.cache().has_entry(0x1000));
}
