//! # Armada Exec
//!
//! The translator engine: a per-thread dispatch loop over the shared
//! translation cache that compiles guest code at Tier0 on first touch,
//! promotes hot subroutines to Tier1 and notifies their callers.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod guest_call;
mod stats;
pub mod translator;

pub use config::{BackendKind, JitConfig};
pub use error::{ExecError, TraceError};
pub use guest_call::GuestFunction;
pub use stats::TranslatorStats;
pub use translator::{TraceSubscriber, Translator};
