//! Static denylist for the code sandbox (spec §4.7). Defense-in-depth: the
//! runtime also disables dynamic code synthesis and scopes globals, but
//! this pass runs first and reports *every* match rather than
//! short-circuiting, so operators get the full inventory of what tripped.

use regex::Regex;

/// A single denylist rule: a human name plus the pattern it matches.
struct Rule {
    name: &'static str,
    pattern: &'static str,
}

const RULES: &[Rule] = &[
    Rule { name: "dynamic-require", pattern: r"\brequire\s*\(" },
    Rule { name: "dynamic-import", pattern: r"\bimport\s*\(" },
    Rule { name: "process-access", pattern: r"\bprocess\s*\." },
    Rule { name: "global-access", pattern: r"\b(global|globalThis)\s*\." },
    Rule { name: "filesystem-access", pattern: r"\bfs\s*\.\s*(read|write|unlink|append|mkdir|rmdir)" },
    Rule { name: "subprocess-spawn", pattern: r"\b(child_process|spawn|execSync|exec)\s*\(" },
    Rule { name: "prototype-escape", pattern: r"__proto__|constructor\s*\[|constructor\s*\(" },
    Rule { name: "dynamic-code-eval", pattern: r"\beval\s*\(" },
    Rule { name: "dynamic-code-function-ctor", pattern: r"\bnew\s+Function\s*\(" },
    Rule { name: "byte-buffer", pattern: r"\bBuffer\s*\.\s*(from|alloc)\s*\(" },
    Rule { name: "base64-smuggle", pattern: r"\b(atob|btoa)\s*\(" },
    Rule { name: "charcode-stringify-bypass", pattern: r"String\s*\.\s*fromCharCode\s*\(" },
];

/// A denylist pattern that matched, with the offending snippet for operator diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenylistMatch {
    pub rule: &'static str,
    pub snippet: String,
}

/// Scan `source` against every rule, returning every match found (not just
/// the first). An empty result means the source passed static analysis.
pub fn scan(source: &str) -> Vec<DenylistMatch> {
    let mut matches = Vec::new();
    for rule in RULES {
        // Rules are small, fixed, trusted patterns compiled per call; the
        // sandbox is not a hot path shared across thousands of calls per
        // second, so this favors simplicity over a lazily-cached regex set.
        if let Ok(re) = Regex::new(rule.pattern) {
            if let Some(m) = re.find(source) {
                matches.push(DenylistMatch { rule: rule.name, snippet: m.as_str().to_string() });
            }
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_rule_individually_rejects_a_minimal_source() {
        let samples: &[(&str, &str)] = &[
            ("dynamic-require", "require('fs')"),
            ("dynamic-import", "import('fs')"),
            ("process-access", "process.exit()"),
            ("global-access", "globalThis.x"),
            ("filesystem-access", "fs.readFile('x')"),
            ("subprocess-spawn", "exec('ls')"),
            ("prototype-escape", "x.__proto__"),
            ("dynamic-code-eval", "eval('1')"),
            ("dynamic-code-function-ctor", "new Function('return 1')"),
            ("byte-buffer", "Buffer.from('x')"),
            ("base64-smuggle", "atob('x')"),
            ("charcode-stringify-bypass", "String.fromCharCode(65)"),
        ];
        for (rule, src) in samples {
            let matches = scan(src);
            assert!(matches.iter().any(|m| &m.rule == rule), "expected {rule} to trip on {src}");
        }
    }

    #[test]
    fn collects_all_matches_without_short_circuiting() {
        let src = "eval('1'); process.exit(); require('fs');";
        let matches = scan(src);
        assert!(matches.len() >= 3);
    }

    #[test]
    fn clean_source_passes() {
        assert!(scan("state.a = (state.a ?? 0) + 1; return state.a;").is_empty());
    }
}
