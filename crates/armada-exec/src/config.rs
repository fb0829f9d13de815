//! Engine configuration.

use serde::Deserialize;

use armada_jit::{DEFAULT_CODE_SIZE_WARNING, DEFAULT_TIER1_THRESHOLD};

/// Code backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Native code through Cranelift, falling back to the interpreter when the
    /// host is unsupported.
    #[default]
    Cranelift,
    /// IR interpreter.
    Interpreter,
}

impl BackendKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cranelift" | "native" => Some(Self::Cranelift),
            "interpreter" | "interp" => Some(Self::Interpreter),
            _ => None,
        }
    }
}

/// Translator settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Tier0 dispatches before a subroutine is rebuilt at Tier1.
    pub tier1_threshold: u32,
    /// Generated IR ops per guest instruction above which the span is dumped.
    pub code_size_warning_threshold: usize,
    /// Code backend.
    pub backend: BackendKind,
    /// Feed the introspection tables.
    pub introspection: bool,
    /// Fire trace events before every dispatch.
    pub cpu_trace: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            tier1_threshold: DEFAULT_TIER1_THRESHOLD,
            code_size_warning_threshold: DEFAULT_CODE_SIZE_WARNING,
            backend: BackendKind::default(),
            introspection: true,
            cpu_trace: false,
        }
    }
}

fn parse_env_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0")
        && !value.trim().eq_ignore_ascii_case("false")
        && !value.trim().eq_ignore_ascii_case("off")
        && !value.trim().eq_ignore_ascii_case("no")
}

fn parse_env_u32(value: &str) -> Option<u32> {
    value.trim().parse::<u32>().ok()
}

impl JitConfig {
    /// Defaults overridden by `ARMADA_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup` (an environment-like source).
    ///
    /// - `ARMADA_JIT_TIER1_THRESHOLD=<u32>` (zero is ignored)
    /// - `ARMADA_JIT_CODE_SIZE_WARNING=<u32>` (zero is ignored)
    /// - `ARMADA_JIT_BACKEND=cranelift|interpreter`
    /// - `ARMADA_JIT_INTROSPECTION=<bool>`
    /// - `ARMADA_CPU_TRACE=<bool>`
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(threshold) = lookup("ARMADA_JIT_TIER1_THRESHOLD")
            .and_then(|v| parse_env_u32(&v))
            .filter(|threshold| *threshold > 0)
        {
            self.tier1_threshold = threshold;
        }
        if let Some(threshold) = lookup("ARMADA_JIT_CODE_SIZE_WARNING")
            .and_then(|v| parse_env_u32(&v))
            .filter(|threshold| *threshold > 0)
        {
            self.code_size_warning_threshold = threshold as usize;
        }
        if let Some(value) = lookup("ARMADA_JIT_BACKEND") {
            match BackendKind::parse(&value) {
                Some(backend) => self.backend = backend,
                None => tracing::warn!(value = %value, "unknown ARMADA_JIT_BACKEND, keeping {:?}", self.backend),
            }
        }
        if let Some(value) = lookup("ARMADA_JIT_INTROSPECTION") {
            self.introspection = parse_env_truthy(&value);
        }
        if let Some(value) = lookup("ARMADA_CPU_TRACE") {
            self.cpu_trace = parse_env_truthy(&value);
        }
        self
    }

    /// Replace zero thresholds (e.g. from a deserialized file) with defaults.
    pub fn normalized(mut self) -> Self {
        if self.tier1_threshold == 0 {
            self.tier1_threshold = DEFAULT_TIER1_THRESHOLD;
        }
        if self.code_size_warning_threshold == 0 {
            self.code_size_warning_threshold = DEFAULT_CODE_SIZE_WARNING;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn truthy_values() {
        for value in ["1", "true", "yes", "on", " TRUE "] {
            assert!(parse_env_truthy(value), "{value}");
        }
        for value in ["", "0", "false", "OFF", "no", "  "] {
            assert!(!parse_env_truthy(value), "{value:?}");
        }
    }

    #[test]
    fn overrides() {
        let config = JitConfig::default().with_overrides(env(&[
            ("ARMADA_JIT_TIER1_THRESHOLD", "16"),
            ("ARMADA_JIT_BACKEND", "interpreter"),
            ("ARMADA_JIT_INTROSPECTION", "off"),
            ("ARMADA_CPU_TRACE", "1"),
        ]));
        assert_eq!(config.tier1_threshold, 16);
        assert_eq!(config.code_size_warning_threshold, DEFAULT_CODE_SIZE_WARNING);
        assert_eq!(config.backend, BackendKind::Interpreter);
        assert!(!config.introspection);
        assert!(config.cpu_trace);
    }

    #[test]
    fn zero_and_garbage_thresholds_fall_back() {
        let config = JitConfig::default().with_overrides(env(&[
            ("ARMADA_JIT_TIER1_THRESHOLD", "0"),
            ("ARMADA_JIT_CODE_SIZE_WARNING", "lots"),
            ("ARMADA_JIT_BACKEND", "gpu"),
        ]));
        assert_eq!(config, JitConfig::default());
    }

    #[test]
    fn deserialize_partial() {
        let config: JitConfig =
            serde_json::from_str(r#"{ "tier1_threshold": 0, "backend": "interpreter" }"#).unwrap();
        let config = config.normalized();
        assert_eq!(config.tier1_threshold, DEFAULT_TIER1_THRESHOLD);
        assert_eq!(config.backend, BackendKind::Interpreter);
        assert!(config.introspection);
    }
}
