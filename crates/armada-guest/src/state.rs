//! Per-thread guest CPU state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::register::{Register, RegisterClass};

/// A 128-bit SIMD register value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct V128(pub u128);

impl V128 {
    /// Build from low and high 64-bit halves.
    pub const fn from_parts(lo: u64, hi: u64) -> Self {
        Self((hi as u128) << 64 | lo as u128)
    }

    /// Low 64 bits.
    pub const fn lo(self) -> u64 {
        self.0 as u64
    }

    /// High 64 bits.
    pub const fn hi(self) -> u64 {
        (self.0 >> 64) as u64
    }
}

impl From<u128> for V128 {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

/// Instruction set the guest thread is currently executing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// A64.
    #[default]
    Aarch64,
    /// A32 (ARM state).
    Aarch32Arm,
    /// T32 (Thumb state).
    Aarch32Thumb,
}

/// Architectural register storage.
///
/// `repr(C)` so that generated code can address registers by byte offset
/// from the start of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct RegisterFile {
    /// General purpose registers X0..X31.
    pub x: [u64; Register::COUNT],
    /// SIMD registers V0..V31.
    pub v: [V128; Register::COUNT],
    /// Condition flags, one byte each (0 or 1).
    pub flags: [u8; Register::COUNT],
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            x: [0; Register::COUNT],
            v: [V128::default(); Register::COUNT],
            flags: [0; Register::COUNT],
        }
    }
}

impl RegisterFile {
    /// Byte offset of `reg` inside the file.
    pub const fn offset_of(reg: Register) -> usize {
        match reg.class() {
            RegisterClass::Integer => std::mem::offset_of!(RegisterFile, x) + reg.index() * 8,
            RegisterClass::Vector => std::mem::offset_of!(RegisterFile, v) + reg.index() * 16,
            RegisterClass::Flag => std::mem::offset_of!(RegisterFile, flags) + reg.index(),
        }
    }

    /// Raw value of `reg`, zero-extended to 128 bits.
    pub fn read_bits(&self, reg: Register) -> u128 {
        match reg.class() {
            RegisterClass::Integer => self.x[reg.index()] as u128,
            RegisterClass::Vector => self.v[reg.index()].0,
            RegisterClass::Flag => (self.flags[reg.index()] & 1) as u128,
        }
    }

    /// Store `bits` into `reg`, truncating to the register width.
    pub fn write_bits(&mut self, reg: Register, bits: u128) {
        match reg.class() {
            RegisterClass::Integer => self.x[reg.index()] = bits as u64,
            RegisterClass::Vector => self.v[reg.index()] = V128(bits),
            RegisterClass::Flag => self.flags[reg.index()] = (bits & 1) as u8,
        }
    }
}

/// Handle that can stop a running guest thread from another host thread.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Ask the thread to stop at the next subroutine boundary.
    pub fn cancel(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-thread guest CPU state. Owned by exactly one host thread.
#[derive(Debug)]
pub struct ThreadState {
    /// Architectural registers.
    pub regs: RegisterFile,
    /// Current instruction set.
    pub mode: ExecutionMode,
    running: Arc<AtomicBool>,
}

impl Default for ThreadState {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadState {
    /// Zeroed registers, A64 mode, running.
    pub fn new() -> Self {
        Self {
            regs: RegisterFile::default(),
            mode: ExecutionMode::Aarch64,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether the thread should keep dispatching.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clear the running flag.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Set the running flag again after a stop.
    pub fn resume(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Handle for stopping this thread from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.running))
    }

    /// Shorthand for `regs.x[index]`.
    pub fn x(&self, index: usize) -> u64 {
        self.regs.x[index]
    }

    /// Shorthand for `regs.x[index] = value`.
    pub fn set_x(&mut self, index: usize, value: u64) {
        self.regs.x[index] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_follow_repr_c_layout() {
        assert_eq!(RegisterFile::offset_of(Register::int(0)), 0);
        assert_eq!(RegisterFile::offset_of(Register::int(3)), 24);
        assert_eq!(RegisterFile::offset_of(Register::vector(0)), 256);
        assert_eq!(RegisterFile::offset_of(Register::vector(1)), 272);
        assert_eq!(RegisterFile::offset_of(Register::flag(2)), 256 + 512 + 2);
    }

    #[test]
    fn write_bits_truncates_to_register_width() {
        let mut regs = RegisterFile::default();
        regs.write_bits(Register::int(1), u128::MAX);
        regs.write_bits(Register::flag(0), 0b10);
        regs.write_bits(Register::vector(4), u128::MAX);

        assert_eq!(regs.x[1], u64::MAX);
        assert_eq!(regs.flags[0], 0);
        assert_eq!(regs.read_bits(Register::vector(4)), u128::MAX);
    }

    #[test]
    fn v128_halves() {
        let v = V128::from_parts(1, 2);
        assert_eq!(v.lo(), 1);
        assert_eq!(v.hi(), 2);
    }

    #[test]
    fn cancel_handle_stops_thread() {
        let state = ThreadState::new();
        let handle = state.cancel_handle();
        assert!(state.is_running());
        handle.cancel();
        assert!(!state.is_running());
        state.resume();
        assert!(state.is_running());
    }
}
