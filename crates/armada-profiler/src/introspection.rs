//! Introspection service and ranked reports

use std::cmp::Reverse;
use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::opcode::{OpcodeKey, OpcodeProfile};
use crate::subroutine::SubroutineExecutionTime;

/// Concurrent statistics tables fed by the builder and the translator.
///
/// Construct one per engine (or per test) and share it behind an `Arc`.
pub struct Introspection {
    opcodes: DashMap<OpcodeKey, OpcodeProfile>,
    subroutines: DashMap<u64, SubroutineExecutionTime>,
    start_time: Mutex<Instant>,
}

impl Introspection {
    /// Fresh, empty tables. The application clock starts now.
    pub fn new() -> Self {
        Self {
            opcodes: DashMap::new(),
            subroutines: DashMap::new(),
            start_time: Mutex::new(Instant::now()),
        }
    }

    /// Record one emission of `key`.
    pub fn track_opcode(&self, key: OpcodeKey, emit_time: Duration, generated_ops: usize) {
        self.opcodes
            .entry(key)
            .or_default()
            .record(emit_time, generated_ops);
    }

    /// Merge an observation for the subroutine at `address`.
    pub fn track_subroutine(&self, address: u64, observation: SubroutineExecutionTime) {
        self.subroutines
            .entry(address)
            .and_modify(|times| times.merge(&observation))
            .or_insert(SubroutineExecutionTime {
                execution_count: 1,
                ..observation
            });
    }

    /// Copy of the profile for `key`.
    pub fn opcode(&self, key: &OpcodeKey) -> Option<OpcodeProfile> {
        self.opcodes.get(key).map(|profile| profile.clone())
    }

    /// Copy of the timings for `address`.
    pub fn subroutine(&self, address: u64) -> Option<SubroutineExecutionTime> {
        self.subroutines.get(&address).map(|times| *times)
    }

    /// Number of distinct opcode keys seen.
    pub fn opcode_count(&self) -> usize {
        self.opcodes.len()
    }

    /// Number of distinct subroutine addresses seen.
    pub fn subroutine_count(&self) -> usize {
        self.subroutines.len()
    }

    /// Drop all statistics and restart the application clock.
    pub fn reset(&self) {
        self.opcodes.clear();
        self.subroutines.clear();
        *self.start_time.lock() = Instant::now();
    }

    /// Ranked summary of everything recorded so far.
    pub fn report(&self) -> Report {
        let mut opcodes: Vec<OpcodeRow> = self
            .opcodes
            .iter()
            .map(|entry| OpcodeRow {
                opcode: entry.key().to_string(),
                occurrences: entry.occurrences(),
                max_generated_ops: entry.max_size(),
                average_emit_time_ns: entry.average_emit_time().as_nanos() as u64,
            })
            .collect();
        // stable base order so ties rank deterministically
        opcodes.sort_by(|a, b| a.opcode.cmp(&b.opcode));

        let mut by_frequency = opcodes.clone();
        by_frequency.sort_by_key(|row| Reverse(row.occurrences));
        let mut by_size = opcodes.clone();
        by_size.sort_by_key(|row| Reverse(row.max_generated_ops));
        let mut by_emit_time = opcodes;
        by_emit_time.sort_by_key(|row| Reverse(row.average_emit_time_ns));

        let mut by_jit_time: Vec<SubroutineRow> = self
            .subroutines
            .iter()
            .map(|entry| SubroutineRow::new(*entry.key(), entry.value()))
            .collect();
        by_jit_time.sort_by_key(|row| (Reverse(row.underlying_jit_time_us), row.address));

        Report {
            run_time_ms: self.start_time.lock().elapsed().as_millis() as u64,
            by_frequency,
            by_size,
            by_emit_time,
            by_jit_time,
        }
    }

    /// Export the current report as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.report()).unwrap_or(serde_json::Value::Null)
    }
}

impl Default for Introspection {
    fn default() -> Self {
        Self::new()
    }
}

/// One opcode line in a [`Report`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpcodeRow {
    /// Opcode identity.
    pub opcode: String,
    /// Times encountered.
    pub occurrences: u64,
    /// Largest generated-operation count.
    pub max_generated_ops: usize,
    /// Mean emission latency over the rolling window (nanoseconds).
    pub average_emit_time_ns: u64,
}

/// One subroutine line in a [`Report`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubroutineRow {
    /// Guest entry address.
    pub address: u64,
    /// Tier0 build time (microseconds), if observed.
    pub tier0_jit_time_us: Option<u64>,
    /// Tier1 build time (microseconds), if observed.
    pub tier1_jit_time_us: Option<u64>,
    /// Backend finalization time (microseconds), 0 if never observed.
    pub underlying_jit_time_us: u64,
    /// Execution time (microseconds), if observed.
    pub execution_time_us: Option<u64>,
    /// Observation count.
    pub execution_count: u64,
}

impl SubroutineRow {
    fn new(address: u64, times: &SubroutineExecutionTime) -> Self {
        let us = |d: Option<Duration>| d.map(|d| d.as_micros() as u64);
        Self {
            address,
            tier0_jit_time_us: us(times.tier0_jit_time),
            tier1_jit_time_us: us(times.tier1_jit_time),
            underlying_jit_time_us: us(times.underlying_jit_time).unwrap_or(0),
            execution_time_us: us(times.execution_time),
            execution_count: times.execution_count,
        }
    }
}

/// Ranked statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Milliseconds since the service was created or reset.
    pub run_time_ms: u64,
    /// Opcodes, most frequent first.
    pub by_frequency: Vec<OpcodeRow>,
    /// Opcodes, largest generated code first.
    pub by_size: Vec<OpcodeRow>,
    /// Opcodes, slowest average emission first.
    pub by_emit_time: Vec<OpcodeRow>,
    /// Subroutines, slowest backend finalization first.
    pub by_jit_time: Vec<SubroutineRow>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Opcodes by encounter count ===")?;
        for row in &self.by_frequency {
            writeln!(f, "{:>10}  {}", row.occurrences, row.opcode)?;
        }
        writeln!(f, "=== Opcodes by generated size ===")?;
        for row in &self.by_size {
            writeln!(f, "{:>10}  {}", row.max_generated_ops, row.opcode)?;
        }
        writeln!(f, "=== Opcodes by average emit time (ns) ===")?;
        for row in &self.by_emit_time {
            writeln!(f, "{:>10}  {}", row.average_emit_time_ns, row.opcode)?;
        }
        writeln!(f, "=== Subroutines by backend JIT time (us) ===")?;
        for row in &self.by_jit_time {
            writeln!(
                f,
                "{:>10}  {:#018x}  x{}",
                row.underlying_jit_time_us, row.address, row.execution_count
            )?;
        }
        write!(f, "Application run time: {} ms", self.run_time_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADD: OpcodeKey = OpcodeKey::new("emit_alu", "add");
    const LDR: OpcodeKey = OpcodeKey::new("emit_mem", "ldr");

    #[test]
    fn merge_per_address() {
        let stats = Introspection::new();
        let ms = Duration::from_millis;
        stats.track_subroutine(
            0x4000,
            SubroutineExecutionTime::observation(Some(ms(5)), None, None, None),
        );
        stats.track_subroutine(
            0x4000,
            SubroutineExecutionTime::observation(None, Some(ms(3)), None, None),
        );

        let times = stats.subroutine(0x4000).unwrap();
        assert_eq!(times.tier0_jit_time, Some(ms(5)));
        assert_eq!(times.tier1_jit_time, Some(ms(3)));
        assert_eq!(times.underlying_jit_time, None);
        assert_eq!(times.execution_time, None);
        assert_eq!(times.execution_count, 2);
    }

    #[test]
    fn opcode_window_through_service() {
        let stats = Introspection::new();
        for i in 0..513u64 {
            stats.track_opcode(ADD, Duration::from_nanos(i), 4);
        }
        let profile = stats.opcode(&ADD).unwrap();
        let kept: Vec<_> = profile.emit_times().collect();
        assert_eq!(kept.len(), 512);
        assert_eq!(kept.first(), Some(&Duration::from_nanos(1)));
        assert_eq!(kept.last(), Some(&Duration::from_nanos(512)));
    }

    #[test]
    fn report_ranking() {
        let stats = Introspection::new();
        stats.track_opcode(ADD, Duration::from_nanos(10), 2);
        stats.track_opcode(ADD, Duration::from_nanos(10), 2);
        stats.track_opcode(LDR, Duration::from_nanos(50), 9);
        stats.track_subroutine(
            0x10,
            SubroutineExecutionTime::observation(None, None, Some(Duration::from_micros(7)), None),
        );
        stats.track_subroutine(
            0x20,
            SubroutineExecutionTime::observation(None, None, Some(Duration::from_micros(70)), None),
        );

        let report = stats.report();
        assert_eq!(report.by_frequency[0].opcode, ADD.to_string());
        assert_eq!(report.by_size[0].opcode, LDR.to_string());
        assert_eq!(report.by_emit_time[0].average_emit_time_ns, 50);
        assert_eq!(report.by_jit_time[0].address, 0x20);

        let text = report.to_string();
        assert!(text.contains("=== Opcodes by encounter count ==="));
        assert!(text.contains("Application run time"));

        let json = stats.to_json();
        assert_eq!(json["by_jit_time"][1]["address"], 0x10);
    }

    #[test]
    fn reset_isolates() {
        let stats = Introspection::new();
        stats.track_opcode(ADD, Duration::from_nanos(1), 1);
        stats.track_subroutine(0x10, SubroutineExecutionTime::default());
        stats.reset();
        assert_eq!(stats.opcode_count(), 0);
        assert_eq!(stats.subroutine_count(), 0);
    }
}
