//! Per-subroutine timing observations

use std::time::Duration;

/// Timing facts about one guest subroutine address.
///
/// Each duration is write-once: the first observation that carries it wins.
/// `execution_count` grows with every merged observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubroutineExecutionTime {
    /// Time spent building the Tier0 version.
    pub tier0_jit_time: Option<Duration>,
    /// Time spent building the Tier1 version.
    pub tier1_jit_time: Option<Duration>,
    /// Time the code backend spent finalizing host code.
    pub underlying_jit_time: Option<Duration>,
    /// Duration of one execution.
    pub execution_time: Option<Duration>,
    /// Number of merged observations.
    pub execution_count: u64,
}

impl SubroutineExecutionTime {
    /// A single observation. `execution_count` starts at 1.
    pub fn observation(
        tier0_jit_time: Option<Duration>,
        tier1_jit_time: Option<Duration>,
        underlying_jit_time: Option<Duration>,
        execution_time: Option<Duration>,
    ) -> Self {
        Self {
            tier0_jit_time,
            tier1_jit_time,
            underlying_jit_time,
            execution_time,
            execution_count: 1,
        }
    }

    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: &Self) {
        self.tier0_jit_time = self.tier0_jit_time.or(other.tier0_jit_time);
        self.tier1_jit_time = self.tier1_jit_time.or(other.tier1_jit_time);
        self.underlying_jit_time = self.underlying_jit_time.or(other.underlying_jit_time);
        self.execution_time = self.execution_time.or(other.execution_time);
        self.execution_count += 1;
    }
}
