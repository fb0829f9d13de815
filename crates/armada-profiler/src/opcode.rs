//! Per-opcode emission statistics

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Identity of a kind of guest instruction: mnemonic plus the emitter routine
/// that generated code for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OpcodeKey {
    /// Emitter routine name.
    pub emitter: &'static str,
    /// Instruction form (mnemonic and operand shape).
    pub form: &'static str,
}

impl OpcodeKey {
    /// Create a key.
    pub const fn new(emitter: &'static str, form: &'static str) -> Self {
        Self { emitter, form }
    }
}

impl fmt::Display for OpcodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.form, self.emitter)
    }
}

/// Aggregated emission stats for one [`OpcodeKey`].
#[derive(Debug, Clone, Default)]
pub struct OpcodeProfile {
    emit_times: VecDeque<Duration>,
    occurrences: u64,
    sizes: BTreeSet<usize>,
}

impl OpcodeProfile {
    /// Maximum number of emission latencies retained.
    pub const ROLLING_WINDOW: usize = 512;

    /// Empty profile.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one emission.
    pub fn record(&mut self, emit_time: Duration, generated_ops: usize) {
        if self.emit_times.len() == Self::ROLLING_WINDOW {
            self.emit_times.pop_front();
        }
        self.emit_times.push_back(emit_time);
        self.occurrences += 1;
        self.sizes.insert(generated_ops);
    }

    /// Retained emission latencies, oldest first.
    pub fn emit_times(&self) -> impl ExactSizeIterator<Item = Duration> + '_ {
        self.emit_times.iter().copied()
    }

    /// Total number of emissions ever recorded.
    pub fn occurrences(&self) -> u64 {
        self.occurrences
    }

    /// Distinct generated-operation counts, ascending.
    pub fn sizes(&self) -> &BTreeSet<usize> {
        &self.sizes
    }

    /// Largest generated-operation count observed.
    pub fn max_size(&self) -> usize {
        self.sizes.last().copied().unwrap_or(0)
    }

    /// Mean of the retained emission latencies.
    pub fn average_emit_time(&self) -> Duration {
        if self.emit_times.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.emit_times.iter().sum();
        total / self.emit_times.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_drops_oldest_first() {
        let mut profile = OpcodeProfile::new();
        for i in 0..513u64 {
            profile.record(Duration::from_nanos(i), 1);
        }

        let kept: Vec<_> = profile.emit_times().collect();
        assert_eq!(kept.len(), OpcodeProfile::ROLLING_WINDOW);
        assert_eq!(kept[0], Duration::from_nanos(1));
        assert_eq!(kept[511], Duration::from_nanos(512));
        assert_eq!(profile.occurrences(), 513);
    }

    #[test]
    fn sizes_are_distinct() {
        let mut profile = OpcodeProfile::new();
        profile.record(Duration::from_micros(2), 3);
        profile.record(Duration::from_micros(4), 3);
        profile.record(Duration::from_micros(6), 7);

        assert_eq!(profile.sizes().iter().copied().collect::<Vec<_>>(), vec![3, 7]);
        assert_eq!(profile.max_size(), 7);
        assert_eq!(profile.average_emit_time(), Duration::from_micros(4));
    }
}
