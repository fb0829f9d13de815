//! Execution context handed to translated code.

use std::marker::PhantomData;

use armada_guest::{Memory, RegisterFile};

use crate::cache::TranslationCache;

/// Nesting limit for linked subroutine calls. Deeper calls fall back to the
/// dispatcher.
pub const MAX_LINK_DEPTH: u32 = 64;

/// Per-execution context: register file, memory and the cache used to resolve
/// linked calls.
///
/// Generated code receives a pointer to this struct as its first argument and
/// reads the register file pointer at offset 0.
#[repr(C)]
pub struct JitContext<'a> {
    regs: *mut RegisterFile,
    memory: &'a dyn Memory,
    cache: &'a TranslationCache,
    depth: u32,
    _regs: PhantomData<&'a mut RegisterFile>,
}

impl<'a> JitContext<'a> {
    /// Context over `regs` for one top-level execution.
    pub fn new(
        regs: &'a mut RegisterFile,
        memory: &'a dyn Memory,
        cache: &'a TranslationCache,
    ) -> Self {
        Self {
            regs,
            memory,
            cache,
            depth: 0,
            _regs: PhantomData,
        }
    }

    /// Register file.
    pub fn regs(&self) -> &RegisterFile {
        // SAFETY: `regs` comes from the `&'a mut RegisterFile` given to `new`
        // and is only reached through this context.
        unsafe { &*self.regs }
    }

    /// Mutable register file.
    pub fn regs_mut(&mut self) -> &mut RegisterFile {
        // SAFETY: see `regs`.
        unsafe { &mut *self.regs }
    }

    /// Guest memory.
    pub fn memory(&self) -> &'a dyn Memory {
        self.memory
    }

    /// Translation cache.
    pub fn cache(&self) -> &'a TranslationCache {
        self.cache
    }

    /// Current linked-call nesting depth.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Opaque pointer passed to generated code.
    pub(crate) fn as_raw(&mut self) -> *mut u8 {
        (self as *mut Self).cast()
    }

    /// Recover the context from the pointer generated code was given.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`JitContext::as_raw`] on a context that is still
    /// alive and not otherwise borrowed for `'b`.
    pub(crate) unsafe fn from_raw<'b>(ptr: *mut u8) -> &'b mut JitContext<'b> {
        // SAFETY: guaranteed by the caller.
        unsafe { &mut *ptr.cast::<JitContext<'b>>() }
    }

    /// Run the cached subroutine at `target` in this context.
    ///
    /// Returns the callee's next address, or `target` itself when it has no
    /// cache entry or the nesting limit is reached, so the dispatcher picks
    /// up from there.
    pub fn call_linked(&mut self, target: u64) -> u64 {
        if self.depth >= MAX_LINK_DEPTH {
            tracing::trace!(target, depth = self.depth, "link depth exhausted");
            return target;
        }
        let Some(callee) = self.cache.try_get(target) else {
            return target;
        };
        self.depth += 1;
        let next = callee.invoke_in(self);
        self.depth -= 1;
        next
    }
}
