//! Reference Resolver: dereferences `$`-prefixed scope expressions and
//! `{{...}}` interpolation templates against a `WorkflowContext`.
//!
//! Mirrors spec §4.1. Missing segments resolve to `None` — this layer
//! never raises an error; callers decide whether `None` is fatal.

use chrono::Utc;
use serde_json::Value;

use crate::context::WorkflowContext;

/// A single parsed path segment.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parse a dot/bracket path (`foo.bar[0]["baz.qux"]`) into segments.
/// Unclosed brackets are treated as literal text rather than an error.
fn parse_path(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let chars: Vec<char> = path.chars().collect();
    let mut i = 0;
    let mut current = String::new();

    fn flush(current: &mut String, segments: &mut Vec<Segment>) {
        if !current.is_empty() {
            segments.push(Segment::Key(std::mem::take(current)));
        }
    }

    while i < chars.len() {
        let c = chars[i];
        match c {
            '.' => {
                flush(&mut current, &mut segments);
                i += 1;
            }
            '[' => {
                // find matching close bracket
                if let Some(close_rel) = chars[i + 1..].iter().position(|&c| c == ']') {
                    flush(&mut current, &mut segments);
                    let close = i + 1 + close_rel;
                    let inner: String = chars[i + 1..close].iter().collect();
                    let inner_trimmed = inner.trim();
                    if (inner_trimmed.starts_with('"') && inner_trimmed.ends_with('"') && inner_trimmed.len() >= 2)
                        || (inner_trimmed.starts_with('\'') && inner_trimmed.ends_with('\'') && inner_trimmed.len() >= 2)
                    {
                        segments.push(Segment::Key(inner_trimmed[1..inner_trimmed.len() - 1].to_string()));
                    } else if let Ok(n) = inner_trimmed.parse::<usize>() {
                        segments.push(Segment::Index(n));
                    } else {
                        segments.push(Segment::Key(inner_trimmed.to_string()));
                    }
                    i = close + 1;
                } else {
                    // unclosed bracket: treat '[' as literal text
                    current.push(c);
                    i += 1;
                }
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }
    flush(&mut current, &mut segments);
    segments
}

fn walk<'a>(value: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut current = value;
    for seg in segments {
        match (seg, current) {
            (Segment::Key(k), Value::Object(map)) => {
                current = map.get(k)?;
            }
            (Segment::Index(i), Value::Array(arr)) => {
                current = arr.get(*i)?;
            }
            (Segment::Key(k), Value::Array(arr)) => {
                // non-numeric segment on an array yields undefined, except
                // numeric-looking keys, which we already route through Index.
                if let Ok(i) = k.parse::<usize>() {
                    current = arr.get(i)?;
                } else {
                    return None;
                }
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Resolve a `$`-prefixed expression against the context. Returns `None`
/// for any missing segment, unknown scope, or malformed expression.
pub fn resolve(expr: &str, ctx: &WorkflowContext) -> Option<Value> {
    let rest = expr.strip_prefix('$')?;
    if rest.is_empty() {
        return None;
    }
    let segments = parse_path(rest);
    if segments.is_empty() {
        return None;
    }
    let Segment::Key(scope) = &segments[0] else { return None };
    let tail = &segments[1..];

    match scope.as_str() {
        "state" => walk(&Value::Object(ctx.state.clone()), tail).cloned(),
        "cache" => {
            let Some(Segment::Key(first)) = tail.first() else { return None };
            let cached = ctx.cache.get(first)?.clone();
            if tail.len() > 1 {
                walk(&cached, &tail[1..]).cloned()
            } else {
                Some(cached)
            }
        }
        "artifacts" => walk(&Value::Array(ctx.artifacts.clone()), tail).cloned(),
        "secrets" => walk(&Value::Object(ctx.secrets.clone()), tail).cloned(),
        "paths" => walk(&Value::Object(ctx.paths.clone()), tail).cloned(),
        "event" => walk(&Value::Object(ctx.event.clone()), tail).cloned(),
        "run" => {
            let run_value = serde_json::to_value(&ctx.run).ok()?;
            walk(&run_value, tail).cloned()
        }
        "error" => walk(&Value::Object(ctx.last_error.clone()), tail).cloned(),
        "now" => Some(Value::String(Utc::now().to_rfc3339())),
        "keys" => {
            let joined = tail
                .iter()
                .map(|s| match s {
                    Segment::Key(k) => k.clone(),
                    Segment::Index(i) => i.to_string(),
                })
                .collect::<Vec<_>>()
                .join(".");
            let resolver = ctx.key_resolver.as_ref()?;
            resolver(&joined).map(Value::String)
        }
        "loop" => {
            let Some(Segment::Key(id)) = tail.first() else { return None };
            let state = ctx.loops.get(id)?;
            let value = serde_json::json!({ "index": state.index, "artifact": state.artifact });
            if tail.len() > 1 {
                walk(&value, &tail[1..]).cloned()
            } else {
                Some(value)
            }
        }
        "row" | "item" => {
            let id = ctx.active_loop.as_ref()?;
            let state = ctx.loops.get(id)?;
            Some(state.artifact.clone())
        }
        "index" => {
            let id = ctx.active_loop.as_ref()?;
            let state = ctx.loops.get(id)?;
            Some(Value::Number(state.index.into()))
        }
        _ => None,
    }
}

/// Replace every `{{expr}}` segment with `String(resolve(expr))`, `null`/
/// missing becoming the empty string. Surrounding text is preserved verbatim.
pub fn interpolate(template: &str, ctx: &WorkflowContext) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(rel_end) = template[i + 2..].find("}}") {
                let expr = template[i + 2..i + 2 + rel_end].trim();
                let resolved = resolve(expr, ctx);
                out.push_str(&stringify(resolved));
                i = i + 2 + rel_end + 2;
                continue;
            }
        }
        out.push(template[i..].chars().next().unwrap());
        i += template[i..].chars().next().unwrap().len_utf8();
    }
    out
}

fn stringify(value: Option<Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    }
}

/// Dispatch on the shape of `maybe_expr`: `$`-prefixed strings are
/// resolved, strings containing `{{` are interpolated, everything else
/// passes through unchanged.
pub fn resolve_value(maybe_expr: &Value, ctx: &WorkflowContext) -> Value {
    match maybe_expr {
        Value::String(s) if s.starts_with('$') => resolve(s, ctx).unwrap_or(Value::Null),
        Value::String(s) if s.contains("{{") => Value::String(interpolate(s, ctx)),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunMeta;
    use serde_json::json;

    fn ctx_with_state(state: serde_json::Map<String, Value>) -> WorkflowContext {
        let mut ctx = WorkflowContext::new(RunMeta::default(), Default::default(), Default::default(), Default::default());
        ctx.state = state;
        ctx
    }

    #[test]
    fn resolves_simple_state_path() {
        let ctx = ctx_with_state(json!({"x": 1, "y": 2}).as_object().unwrap().clone());
        assert_eq!(resolve_value(&json!("$state.x"), &ctx), json!(1));
    }

    #[test]
    fn resolves_bracket_and_quoted_paths() {
        let ctx = ctx_with_state(json!({"a": {"b.c": [10, 20]}}).as_object().unwrap().clone());
        assert_eq!(resolve("$state.a[\"b.c\"][1]", &ctx), Some(json!(20)));
    }

    #[test]
    fn interpolation_preserves_surrounding_text() {
        let ctx = ctx_with_state(json!({"x": 1, "y": 2}).as_object().unwrap().clone());
        let out = resolve_value(&json!("{{$state.x}} + {{$state.y}}"), &ctx);
        assert_eq!(out, json!("1 + 2"));
    }

    #[test]
    fn missing_segment_is_undefined_not_error() {
        let ctx = ctx_with_state(Default::default());
        assert_eq!(resolve("$state.missing.deep", &ctx), None);
    }

    #[test]
    fn unclosed_bracket_is_literal() {
        let ctx = ctx_with_state(Default::default());
        // Should not panic; falls through to no match.
        assert_eq!(resolve("$state.foo[0", &ctx), None);
    }

    #[test]
    fn now_is_fresh_each_access() {
        let ctx = ctx_with_state(Default::default());
        let a = resolve("$now", &ctx);
        assert!(a.is_some());
    }
}
