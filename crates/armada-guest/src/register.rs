//! Architectural register references and live-in register bitsets.
//!
//! The allocator collaborator reports live-in registers as two 64-bit masks:
//!
//! ```text
//! integer mask: bit 0..=31  -> X0..X31
//!               bit 32..=63 -> flag 0..=31
//! vector mask:  bit 0..=31  -> V0..V31
//!               bit 32..=63 -> (no register; contract violation)
//! ```

use std::fmt;

/// Index of the link register (X30) written by `BL` and read by `RET`.
pub const LINK_REGISTER: u8 = 30;

/// Register file a [`Register`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterClass {
    /// 64-bit general purpose register.
    Integer,
    /// 128-bit SIMD/FP register.
    Vector,
    /// Single condition flag (N, Z, C, V, ...).
    Flag,
}

/// Errors produced while interpreting register masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    /// A live-in bit does not name any register of the requested class.
    #[error("live-in bit {bit} has no {class:?} register")]
    UnsupportedRegister {
        /// Bit index inside the offending mask.
        bit: u32,
        /// Mask the bit was taken from.
        class: RegisterClass,
    },
}

/// An architectural register reference: index `0..32` plus class.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register {
    class: RegisterClass,
    index: u8,
}

impl Register {
    /// Number of registers in each class.
    pub const COUNT: usize = 32;

    /// Build a register reference. `index` is reduced modulo 32.
    pub const fn new(index: u8, class: RegisterClass) -> Self {
        Self {
            class,
            index: index & 0x1f,
        }
    }

    /// General purpose register `Xn`.
    pub const fn int(index: u8) -> Self {
        Self::new(index, RegisterClass::Integer)
    }

    /// SIMD register `Vn`.
    pub const fn vector(index: u8) -> Self {
        Self::new(index, RegisterClass::Vector)
    }

    /// Condition flag `n`.
    pub const fn flag(index: u8) -> Self {
        Self::new(index, RegisterClass::Flag)
    }

    /// Register index inside its class.
    pub const fn index(self) -> usize {
        self.index as usize
    }

    /// Register class.
    pub const fn class(self) -> RegisterClass {
        self.class
    }

    /// Decode a live-in mask bit taken from the mask of `base` class.
    pub fn from_live_in_bit(bit: u32, base: RegisterClass) -> Result<Self, RegisterError> {
        match (bit, base) {
            (0..=31, RegisterClass::Integer | RegisterClass::Vector) => {
                Ok(Self::new(bit as u8, base))
            }
            (32..=63, RegisterClass::Integer) => Ok(Self::flag((bit & 0x1f) as u8)),
            _ => Err(RegisterError::UnsupportedRegister { bit, class: base }),
        }
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            RegisterClass::Integer => write!(f, "x{}", self.index),
            RegisterClass::Vector => write!(f, "v{}", self.index),
            RegisterClass::Flag => write!(f, "flag{}", self.index),
        }
    }
}

/// Live-in register masks for an entry block, as produced by the allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveInSets {
    /// Integer registers in bits 0..32, flags in bits 32..64.
    pub integer: u64,
    /// Vector registers in bits 0..32.
    pub vector: u64,
}

impl LiveInSets {
    /// Masks with every register of every class live.
    pub const fn all() -> Self {
        Self {
            integer: u64::MAX,
            vector: u32::MAX as u64,
        }
    }

    /// Mark `reg` as live-in.
    pub fn insert(&mut self, reg: Register) {
        match reg.class() {
            RegisterClass::Integer => self.integer |= 1 << reg.index(),
            RegisterClass::Flag => self.integer |= 1 << (32 + reg.index()),
            RegisterClass::Vector => self.vector |= 1 << reg.index(),
        }
    }

    /// Whether `reg` is live-in.
    pub fn contains(&self, reg: Register) -> bool {
        match reg.class() {
            RegisterClass::Integer => self.integer & (1 << reg.index()) != 0,
            RegisterClass::Flag => self.integer & (1 << (32 + reg.index())) != 0,
            RegisterClass::Vector => self.vector & (1 << reg.index()) != 0,
        }
    }

    /// Live-in registers in ascending bit order, integer/flag mask first.
    ///
    /// Fails on a vector bit above 31.
    pub fn registers(&self) -> Result<Vec<Register>, RegisterError> {
        let mut out = Vec::with_capacity(
            (self.integer.count_ones() + self.vector.count_ones()) as usize,
        );
        for (mask, class) in [
            (self.integer, RegisterClass::Integer),
            (self.vector, RegisterClass::Vector),
        ] {
            for bit in 0..64 {
                if mask & (1 << bit) != 0 {
                    out.push(Register::from_live_in_bit(bit, class)?);
                }
            }
        }
        Ok(out)
    }
}

impl FromIterator<Register> for LiveInSets {
    fn from_iter<I: IntoIterator<Item = Register>>(iter: I) -> Self {
        let mut sets = Self::default();
        for reg in iter {
            sets.insert(reg);
        }
        sets
    }
}
