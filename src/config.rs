//! `EngineConfig`: the knobs this spec actually names, layered the way the
//! teacher's `EnterpriseConfig` groups sub-configs — trimmed to interpreter
//! limits, sandbox limits, and broadcaster buffer sizes rather than the
//! teacher's Fortune-5 observability/security/scalability surface.

use crate::interpreter::InterpreterConfig;
use crate::sandbox::{MAX_TIMEOUT_MS, MIN_TIMEOUT_MS};

/// Sandbox-specific limits, kept separate from `InterpreterConfig` because
/// they bound a single `code` block's execution, not the run as a whole.
#[derive(Debug, Clone, Copy)]
pub struct SandboxConfig {
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub default_timeout_ms: u64,
    pub console_max_entries: usize,
    pub console_max_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            min_timeout_ms: MIN_TIMEOUT_MS,
            max_timeout_ms: MAX_TIMEOUT_MS,
            default_timeout_ms: 10_000,
            console_max_entries: crate::sandbox::console::MAX_ENTRIES,
            console_max_bytes: crate::sandbox::console::MAX_TOTAL_BYTES,
        }
    }
}

/// How many events a single subscriber channel buffers before the
/// broadcaster drops it rather than block the orchestrator (spec §4.11).
#[derive(Debug, Clone, Copy)]
pub struct BroadcasterConfig {
    pub subscriber_buffer: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self { subscriber_buffer: 256 }
    }
}

/// Top-level engine configuration, constructible from defaults and
/// overridable programmatically by the embedding application.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub interpreter: InterpreterConfig,
    pub sandbox: SandboxConfig,
    pub broadcaster: BroadcasterConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_bounds() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.interpreter.max_steps, 10_000);
        assert_eq!(cfg.interpreter.max_duration_ms, 300_000);
        assert_eq!(cfg.sandbox.min_timeout_ms, 10);
        assert_eq!(cfg.sandbox.max_timeout_ms, 30_000);
    }
}
