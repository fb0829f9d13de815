//! # Armada Profiler
//!
//! Side-channel statistics for the translator. Nothing in here is consulted
//! by translation or execution; an engine built without an [`Introspection`]
//! instance behaves identically.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod introspection;
pub mod opcode;
pub mod subroutine;

pub use introspection::{Introspection, OpcodeRow, Report, SubroutineRow};
pub use opcode::{OpcodeKey, OpcodeProfile};
pub use subroutine::SubroutineExecutionTime;
