//! # Armada Guest
//!
//! Guest-side CPU model shared by the translator crates:
//! - architectural register references and live-in bitsets
//! - per-thread register file, execution mode and cooperative run flag
//! - the memory collaborator contract and a flat reference implementation

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod memory;
pub mod register;
pub mod state;

pub use memory::{FlatMemory, Memory, MemoryError, PAGE_SIZE};
pub use register::{LINK_REGISTER, LiveInSets, Register, RegisterClass, RegisterError};
pub use state::{CancelHandle, ExecutionMode, RegisterFile, ThreadState, V128};
