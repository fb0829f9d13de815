//! Per-thread dispatch loop.
//!
//! ```text
//! Dispatch -> [Translate Tier0] -> [Promote to Tier1] -> Execute -> Dispatch | Halted
//! ```
//!
//! One [`Translator`] is shared by every guest thread; each thread calls
//! [`Translator::execute`] with its own [`ThreadState`]. Threads racing to
//! translate the same address both build and publish; the later publish wins,
//! except that a late Tier0 build never displaces Tier1 code.

use std::sync::Arc;
use std::time::{Duration, Instant};

use armada_guest::{ExecutionMode, Memory, ThreadState};
use armada_jit::{
    BlockGraph, CodeBackend, CraneliftBackend, Decoder, InterpreterBackend, RegisterAllocator,
    SubroutineBuilder, Tier, TranslatedSubroutine, TranslationCache, marshal, subroutine_name,
};
use armada_profiler::{Introspection, SubroutineExecutionTime};
use parking_lot::RwLock;

use crate::config::{BackendKind, JitConfig};
use crate::error::{ExecError, TraceError};
use crate::stats::{Counters, TranslatorStats};

/// Callback fired with the guest address before every dispatch while CPU
/// tracing is enabled. An `Err` stops the dispatch loop.
pub type TraceSubscriber = Arc<dyn Fn(u64) -> Result<(), TraceError> + Send + Sync>;

/// Compile timings gathered while resolving one dispatch.
#[derive(Default)]
struct CompileTimes {
    tier0: Option<Duration>,
    tier1: Option<Duration>,
    backend: Option<Duration>,
}

/// Tiered translation engine.
pub struct Translator {
    config: JitConfig,
    memory: Arc<dyn Memory>,
    decoder: Arc<dyn Decoder>,
    builder: SubroutineBuilder,
    cache: TranslationCache,
    introspection: Option<Arc<Introspection>>,
    subscribers: RwLock<Vec<TraceSubscriber>>,
    counters: Counters,
}

impl Translator {
    /// Engine with the backend named by `config`.
    ///
    /// When Cranelift cannot target the host the interpreter is used instead.
    pub fn new(
        config: JitConfig,
        memory: Arc<dyn Memory>,
        decoder: Arc<dyn Decoder>,
        allocator: Arc<dyn RegisterAllocator>,
    ) -> Self {
        let backend: Arc<dyn CodeBackend> = match config.backend {
            BackendKind::Interpreter => Arc::new(InterpreterBackend::new()),
            BackendKind::Cranelift => match CraneliftBackend::new() {
                Ok(backend) => Arc::new(backend),
                Err(error) => {
                    tracing::warn!(%error, "cranelift backend unavailable, using the interpreter");
                    Arc::new(InterpreterBackend::new())
                }
            },
        };
        Self::with_backend(config, memory, decoder, allocator, backend)
    }

    /// Engine with an explicit backend.
    pub fn with_backend(
        config: JitConfig,
        memory: Arc<dyn Memory>,
        decoder: Arc<dyn Decoder>,
        allocator: Arc<dyn RegisterAllocator>,
        backend: Arc<dyn CodeBackend>,
    ) -> Self {
        let config = config.normalized();
        let introspection = config.introspection.then(|| Arc::new(Introspection::new()));
        let builder = SubroutineBuilder::new(allocator, backend)
            .with_introspection(introspection.clone())
            .with_code_size_warning(config.code_size_warning_threshold)
            .with_tier1_threshold(config.tier1_threshold);
        tracing::debug!(
            backend = builder.backend().name(),
            tier1_threshold = config.tier1_threshold,
            introspection = config.introspection,
            cpu_trace = config.cpu_trace,
            "translator ready"
        );
        Self {
            config,
            memory,
            decoder,
            builder,
            cache: TranslationCache::new(),
            introspection,
            subscribers: RwLock::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Shared translation cache.
    pub fn cache(&self) -> &TranslationCache {
        &self.cache
    }

    /// Guest memory.
    pub fn memory(&self) -> &Arc<dyn Memory> {
        &self.memory
    }

    /// Profiling tables, when enabled.
    pub fn introspection(&self) -> Option<&Arc<Introspection>> {
        self.introspection.as_ref()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TranslatorStats {
        self.counters.snapshot()
    }

    /// Add a trace subscriber. Subscribers only fire when `cpu_trace` is on.
    pub fn subscribe(&self, subscriber: TraceSubscriber) {
        self.subscribers.write().push(subscriber);
    }

    /// Publish `function` as host code at guest `address`; guest calls there
    /// run it with AAPCS64 argument passing.
    pub fn register_host_function<Args, F>(
        &self,
        address: u64,
        name: impl Into<String>,
        function: F,
    ) -> Result<(), ExecError>
    where
        Args: marshal::ArgList,
        F: marshal::HostFunction<Args>,
    {
        let thunk = armada_jit::marshal_thunk(address, name, function)?;
        self.cache.publish(address, Arc::new(thunk), 0);
        Ok(())
    }

    /// Run guest code from `address` until it hands control back to the host
    /// (next address 0) or the thread is stopped.
    ///
    /// The first subroutine always runs; the running flag is polled after
    /// each execution. Returns the address execution would resume at, 0 when
    /// the guest returned to the host.
    pub fn execute(&self, state: &mut ThreadState, address: u64) -> Result<u64, ExecError> {
        let mut address = address;
        loop {
            if self.config.cpu_trace {
                self.notify(address)?;
            }
            let mut times = CompileTimes::default();
            let subroutine = self.resolve(state.mode, address, &mut times)?;

            let started = Instant::now();
            let next = subroutine.execute(state, self.memory.as_ref(), &self.cache);
            let elapsed = started.elapsed();
            self.counters.execution();

            if let Some(introspection) = &self.introspection {
                introspection.track_subroutine(
                    address,
                    SubroutineExecutionTime::observation(
                        times.tier0,
                        times.tier1,
                        times.backend,
                        Some(elapsed),
                    ),
                );
            }

            tracing::trace!(address, next, tier = ?subroutine.tier(), "executed");
            address = next;
            if address == 0 || !state.is_running() {
                return Ok(address);
            }
        }
    }

    fn notify(&self, address: u64) -> Result<(), ExecError> {
        let subscribers = self.subscribers.read();
        for subscriber in subscribers.iter() {
            subscriber(address).map_err(|source| ExecError::Trace { address, source })?;
        }
        Ok(())
    }

    /// Cache lookup, Tier0 translation on miss, Tier1 promotion when due.
    fn resolve(
        &self,
        mode: ExecutionMode,
        address: u64,
        times: &mut CompileTimes,
    ) -> Result<Arc<TranslatedSubroutine>, ExecError> {
        let mut subroutine = match self.cache.try_get(address) {
            Some(subroutine) => {
                self.counters.cache_hit();
                subroutine
            }
            None => self.compile_tier0(mode, address, times)?,
        };
        if subroutine.should_rejit() {
            subroutine = self.compile_tier1(mode, address, times)?;
        }
        Ok(subroutine)
    }

    fn compile_tier0(
        &self,
        mode: ExecutionMode,
        address: u64,
        times: &mut CompileTimes,
    ) -> Result<Arc<TranslatedSubroutine>, ExecError> {
        let started = Instant::now();
        let block = self
            .decoder
            .decode_basic_block(self.memory.as_ref(), address, mode)
            .map_err(ExecError::translate(address))?;
        let graph = BlockGraph::single(block);
        let size_hint = graph.op_count();
        let output = self
            .builder
            .build(&self.cache, address, &graph, Tier::Tier0, subroutine_name(address))
            .map_err(ExecError::translate(address))?;
        let resident = self
            .cache
            .publish_tier0(address, Arc::clone(&output.subroutine), size_hint);
        if !Arc::ptr_eq(&resident, &output.subroutine) {
            // another thread promoted the address while this build ran
            return Ok(resident);
        }
        self.counters.tier0_compile();

        let elapsed = started.elapsed();
        times.tier0 = Some(elapsed);
        times.backend = Some(output.backend_time);
        tracing::debug!(address, ops = size_hint, elapsed_us = elapsed.as_micros() as u64, "tier0 compiled");
        Ok(resident)
    }

    fn compile_tier1(
        &self,
        mode: ExecutionMode,
        address: u64,
        times: &mut CompileTimes,
    ) -> Result<Arc<TranslatedSubroutine>, ExecError> {
        let started = Instant::now();
        let graph = self
            .decoder
            .decode_subroutine(&self.cache, self.memory.as_ref(), address, mode)
            .map_err(ExecError::translate(address))?;
        let output = self
            .builder
            .build(&self.cache, address, &graph, Tier::Tier1, subroutine_name(address))
            .map_err(ExecError::translate(address))?;
        self.cache
            .publish(address, Arc::clone(&output.subroutine), output.generated_ops);
        self.counters.tier1_compile();

        let marked = self.cache.mark_callers_for_rejit(address);
        self.counters.caller_notifications(marked);

        let elapsed = started.elapsed();
        times.tier1 = Some(elapsed);
        times.backend.get_or_insert(output.backend_time);
        tracing::debug!(
            address,
            blocks = graph.blocks.len(),
            generated_ops = output.generated_ops,
            callers_marked = marked,
            elapsed_us = elapsed.as_micros() as u64,
            "tier1 compiled"
        );
        Ok(output.subroutine)
    }
}
