//! # Armada JIT
//!
//! Tiered translation of guest ARM64 code into host code:
//! - [`SubroutineBuilder`] turns a decoded block graph into a [`TranslatedSubroutine`]
//! - [`TranslationCache`] holds the current subroutine per guest address and the
//!   caller graph used for re-JIT notification
//! - [`backend`] lowers the builder's IR with Cranelift, or interprets it
//! - [`marshal`] wraps host functions so guest code can call them

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod backend;
pub mod builder;
pub mod cache;
pub mod context;
pub mod decoder;
pub mod emitter;
pub mod error;
pub mod ir;
pub mod marshal;
pub mod runtime_helpers;
pub mod subroutine;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{CodeBackend, CompiledCode, CraneliftBackend, InterpreterBackend};
pub use builder::{BuildOutput, DEFAULT_CODE_SIZE_WARNING, DEFAULT_TIER1_THRESHOLD, SubroutineBuilder, subroutine_name};
pub use cache::TranslationCache;
pub use context::{JitContext, MAX_LINK_DEPTH};
pub use decoder::{Block, BlockGraph, ConservativeAllocator, DecodedOp, Decoder, Flow, KnownTargets, OpKind, RegisterAllocator};
pub use emitter::EmitContext;
pub use error::JitError;
pub use marshal::{ArgLayout, MarshalError, marshal_thunk};
pub use subroutine::{PromotionState, Tier, TranslatedSubroutine};
