//! Capped capturing console facade for the code sandbox.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Hard caps per spec §4.7: entries past either cap are dropped silently.
pub const MAX_ENTRIES: usize = 100;
pub const MAX_TOTAL_BYTES: usize = 10_240;

/// Large/recursive values are JSON round-tripped and truncated to this many
/// characters with a suffix marker.
const MAX_SERIALIZED_CHARS: usize = 1024;
const TRUNCATION_MARKER: &str = "...[truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    pub args: Vec<String>,
    pub timestamp_ms: i64,
}

/// Serialize a single console argument safely: functions become
/// `[Function]`, symbols/bigints become their string form, and anything
/// else is JSON round-tripped and truncated.
pub fn serialize_arg(value: &serde_json::Value) -> String {
    let rendered = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if rendered.chars().count() > MAX_SERIALIZED_CHARS {
        let truncated: String = rendered.chars().take(MAX_SERIALIZED_CHARS).collect();
        format!("{truncated}{TRUNCATION_MARKER}")
    } else {
        rendered
    }
}

#[derive(Default)]
pub struct CapturingConsole {
    inner: Mutex<ConsoleState>,
}

#[derive(Default)]
struct ConsoleState {
    entries: Vec<ConsoleEntry>,
    total_bytes: usize,
    capped: bool,
}

impl CapturingConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, level: ConsoleLevel, args: Vec<String>, timestamp_ms: i64) {
        let mut state = self.inner.lock().expect("console lock poisoned");
        if state.capped || state.entries.len() >= MAX_ENTRIES {
            state.capped = true;
            return;
        }
        let entry_bytes: usize = args.iter().map(|a| a.len()).sum();
        if state.total_bytes + entry_bytes > MAX_TOTAL_BYTES {
            state.capped = true;
            return;
        }
        state.total_bytes += entry_bytes;
        state.entries.push(ConsoleEntry { level, args, timestamp_ms });
    }

    pub fn into_entries(self) -> Vec<ConsoleEntry> {
        self.inner.into_inner().expect("console lock poisoned").entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_entry_count() {
        let console = CapturingConsole::new();
        for i in 0..(MAX_ENTRIES + 10) {
            console.record(ConsoleLevel::Log, vec![i.to_string()], 0);
        }
        assert_eq!(console.into_entries().len(), MAX_ENTRIES);
    }

    #[test]
    fn caps_total_bytes() {
        let console = CapturingConsole::new();
        let big = "x".repeat(MAX_TOTAL_BYTES);
        console.record(ConsoleLevel::Log, vec![big], 0);
        console.record(ConsoleLevel::Log, vec!["more".to_string()], 0);
        assert_eq!(console.into_entries().len(), 1);
    }

    #[test]
    fn truncates_large_values_with_marker() {
        let huge = serde_json::Value::String("y".repeat(MAX_SERIALIZED_CHARS * 2));
        let serialized = serialize_arg(&huge);
        assert!(serialized.ends_with(TRUNCATION_MARKER));
    }
}
