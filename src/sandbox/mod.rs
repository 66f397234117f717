//! Code Sandbox (spec §4.7): static denylist + an isolated QuickJS
//! execution scope (bindings clone/diff state, a read-only secrets proxy, a
//! method-based cache, an SSRF-filtered `fetch`, and a capped console),
//! bounded by two parallel timeouts.

pub mod console;
pub mod static_analysis;

use rquickjs::{Context, Function, Runtime};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::context::{OrderedCache, WorkflowContext};
use crate::error::{WorkflowError, WorkflowResult};
use crate::ssrf;

use self::console::{CapturingConsole, ConsoleEntry, ConsoleLevel};

/// `code_timeout_ms` clamp bounds.
pub const MIN_TIMEOUT_MS: u64 = 10;
pub const MAX_TIMEOUT_MS: u64 = 30_000;
/// Fixed timeout for the sandbox's in-script `fetch`.
const SANDBOX_FETCH_TIMEOUT_MS: u64 = 10_000;
/// Ceiling for the sandbox's in-script `setTimeout`.
const SANDBOX_SET_TIMEOUT_MAX_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeLanguage {
    Script,
    TypedScript,
}

/// What ran and what it changed.
#[derive(Debug, Default)]
pub struct SandboxOutcome {
    /// Additions, changes, and deletions (deletions marked `Value::Null`) —
    /// the only place in the system deletions are tracked.
    pub state_delta: Map<String, Value>,
    pub console: Vec<ConsoleEntry>,
    /// Cache writes performed via `cache.set`/`cache.delete` inside the
    /// script, applied by the caller to the live `OrderedCache` (a deletion
    /// is represented as `Value::Null`, mirroring `state_delta`).
    pub cache_writes: Vec<(String, Value)>,
}

pub struct Sandbox {
    http: reqwest::Client,
}

impl Sandbox {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub async fn execute(
        &self,
        source: &str,
        language: CodeLanguage,
        timeout_ms: u64,
        bind_value: Option<String>,
        ctx: &WorkflowContext,
    ) -> WorkflowResult<SandboxOutcome> {
        let clamped_timeout_ms = timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);

        let base_source = match language {
            CodeLanguage::Script => source.to_string(),
            CodeLanguage::TypedScript => strip_types(source),
        };

        let matches = static_analysis::scan(&base_source);
        if !matches.is_empty() {
            let names: Vec<&str> = matches.iter().map(|m| m.rule).collect();
            return Err(WorkflowError::Policy(format!(
                "static analysis rejected code: {}",
                names.join(", ")
            )));
        }

        let state_before = Value::Object(ctx.state.clone());
        let cache_snapshot = ctx.cache.to_pairs();
        let artifacts_snapshot = ctx.artifacts.clone();
        let secrets_snapshot = ctx.secrets.clone();

        let http = self.http.clone();
        let handle = tokio::runtime::Handle::current();
        let deadline = Instant::now() + Duration::from_millis(clamped_timeout_ms);

        let eval_task = tokio::task::spawn_blocking(move || {
            run_quickjs(
                &base_source,
                state_before,
                cache_snapshot,
                artifacts_snapshot,
                secrets_snapshot,
                http,
                handle,
                deadline,
            )
        });

        // Two timeouts race: the interrupt handler inside run_quickjs kills
        // CPU-bound busy loops; this wall-clock timeout kills pending async
        // work (a blocked native fetch/setTimeout call). Whichever trips
        // first produces the normalized timeout error.
        let wall_clock_budget = Duration::from_millis(clamped_timeout_ms + 50);
        let outcome = match tokio::time::timeout(wall_clock_budget, eval_task).await {
            Ok(Ok(Ok(raw))) => raw,
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_join_err)) => return Err(WorkflowError::Internal("sandbox task panicked".to_string())),
            Err(_elapsed) => {
                return Err(WorkflowError::SandboxTimeout(format!(
                    "Code execution timed out after {clamped_timeout_ms}ms"
                )))
            }
        };

        let state_after = outcome.state_after;
        let mut state_delta = diff_state(&ctx.state, &state_after);

        if let Some(bind) = bind_value {
            if let Some(returned) = outcome.return_value {
                state_delta.insert(bind, returned);
            }
        }

        Ok(SandboxOutcome { state_delta, console: outcome.console, cache_writes: outcome.cache_writes })
    }
}

struct RawOutcome {
    state_after: Map<String, Value>,
    return_value: Option<Value>,
    console: Vec<ConsoleEntry>,
    cache_writes: Vec<(String, Value)>,
}

#[allow(clippy::too_many_arguments)]
fn run_quickjs(
    source: &str,
    state_before: Value,
    cache_snapshot: Vec<(String, Value)>,
    artifacts_snapshot: Vec<Value>,
    secrets_snapshot: Map<String, Value>,
    http: reqwest::Client,
    handle: tokio::runtime::Handle,
    deadline: Instant,
) -> WorkflowResult<RawOutcome> {
    let runtime = Runtime::new().map_err(|e| WorkflowError::Internal(format!("sandbox runtime init failed: {e}")))?;
    runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() > deadline)));

    let context = Context::full(&runtime).map_err(|e| WorkflowError::Internal(format!("sandbox context init failed: {e}")))?;

    let console = Arc::new(CapturingConsole::new());
    let cache = Arc::new(Mutex::new(OrderedCache::from_pairs(cache_snapshot)));
    let cache_writes_log: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let secrets = Arc::new(secrets_snapshot);

    let result = context.with(|ctx| -> WorkflowResult<RawOutcome> {
        let globals = ctx.globals();

        // -- native bridge functions, underscore-prefixed so user code never calls them directly --
        {
            let console = console.clone();
            let record = Function::new(ctx.clone(), move |level: String, args_json: String| {
                let level = match level.as_str() {
                    "warn" => ConsoleLevel::Warn,
                    "error" => ConsoleLevel::Error,
                    _ => ConsoleLevel::Log,
                };
                let args: Vec<Value> = serde_json::from_str(&args_json).unwrap_or_default();
                let rendered: Vec<String> = args.iter().map(self::console::serialize_arg).collect();
                console.record(level, rendered, chrono::Utc::now().timestamp_millis());
            })
            .map_err(js_err)?;
            globals.set("__record_console", record).map_err(js_err)?;
        }

        {
            let cache = cache.clone();
            let get = Function::new(ctx.clone(), move |key: String| -> Option<String> {
                cache.lock().expect("cache lock poisoned").get(&key).map(|v| v.to_string())
            })
            .map_err(js_err)?;
            globals.set("__cache_get", get).map_err(js_err)?;
        }
        {
            let cache = cache.clone();
            let writes = cache_writes_log.clone();
            let set = Function::new(ctx.clone(), move |key: String, value_json: String| {
                let value: Value = serde_json::from_str(&value_json).unwrap_or(Value::Null);
                cache.lock().expect("cache lock poisoned").set(key.clone(), value.clone());
                writes.lock().expect("writes lock poisoned").push((key, value));
            })
            .map_err(js_err)?;
            globals.set("__cache_set", set).map_err(js_err)?;
        }
        {
            let cache = cache.clone();
            let writes = cache_writes_log.clone();
            let delete = Function::new(ctx.clone(), move |key: String| -> bool {
                let deleted = cache.lock().expect("cache lock poisoned").delete(&key);
                if deleted {
                    writes.lock().expect("writes lock poisoned").push((key, Value::Null));
                }
                deleted
            })
            .map_err(js_err)?;
            globals.set("__cache_delete", delete).map_err(js_err)?;
        }
        {
            let cache = cache.clone();
            let has = Function::new(ctx.clone(), move |key: String| -> bool { cache.lock().expect("cache lock poisoned").has(&key) })
                .map_err(js_err)?;
            globals.set("__cache_has", has).map_err(js_err)?;
        }

        {
            let secrets = secrets.clone();
            let get_secret = Function::new(ctx.clone(), move |key: String| -> Option<String> {
                secrets.get(&key).map(|v| v.to_string())
            })
            .map_err(js_err)?;
            globals.set("__secret_get", get_secret).map_err(js_err)?;
        }

        {
            let http = http.clone();
            let handle = handle.clone();
            let fetch_sync = Function::new(ctx.clone(), move |url: String, opts_json: String| -> String {
                sandbox_fetch(&http, &handle, &url, &opts_json)
                    .unwrap_or_else(|e| serde_json::json!({"error": e.to_string()}).to_string())
            })
            .map_err(js_err)?;
            globals.set("__fetch_sync", fetch_sync).map_err(js_err)?;
        }

        {
            let set_timeout_block = Function::new(ctx.clone(), move |ms: f64| {
                let capped = (ms as u64).min(SANDBOX_SET_TIMEOUT_MAX_MS);
                std::thread::sleep(Duration::from_millis(capped));
            })
            .map_err(js_err)?;
            globals.set("__set_timeout_block", set_timeout_block).map_err(js_err)?;
        }

        // Bindings preamble: console/cache/secrets/fetch/setTimeout wrappers
        // over the native bridge, plus the initial `state` and frozen
        // `artifacts`. Evaluated separately from the user script so the
        // 2-line IIFE offset below only ever applies to user source.
        let state_json = state_before.to_string();
        let artifacts_json = Value::Array(artifacts_snapshot).to_string();
        let bindings = format!(
            r#"
globalThis.state = JSON.parse({state_json_lit});
globalThis.artifacts = Object.freeze(JSON.parse({artifacts_json_lit}));
globalThis.console = {{
  log: (...args) => __record_console("log", JSON.stringify(args)),
  warn: (...args) => __record_console("warn", JSON.stringify(args)),
  error: (...args) => __record_console("error", JSON.stringify(args)),
}};
globalThis.cache = {{
  get: (k) => {{ const v = __cache_get(k); return v === undefined ? undefined : JSON.parse(v); }},
  set: (k, v) => __cache_set(k, JSON.stringify(v)),
  delete: (k) => __cache_delete(k),
  has: (k) => __cache_has(k),
}};
globalThis.secrets = new Proxy({{}}, {{
  get: (_t, prop) => {{
    if (typeof prop !== "string") return undefined;
    const v = __secret_get(prop);
    return v === undefined ? undefined : JSON.parse(v);
  }},
  set: () => {{ throw new Error("secrets are read-only"); }},
  deleteProperty: () => {{ throw new Error("secrets are read-only"); }},
  has: () => false,
  ownKeys: () => [],
  getOwnPropertyDescriptor: () => undefined,
}});
globalThis.fetch = (url, opts) => Promise.resolve(JSON.parse(__fetch_sync(String(url), JSON.stringify(opts || {{}}))));
globalThis.setTimeout = (cb, ms) => {{ __set_timeout_block(Number(ms) || 0); cb(); return 0; }};
globalThis.clearTimeout = () => {{}};
delete globalThis.eval;
globalThis.Function = function() {{ throw new Error("Function constructor is disabled"); }};
"#,
            state_json_lit = serde_json::to_string(&state_json).unwrap_or_else(|_| "\"{}\"".to_string()),
            artifacts_json_lit = serde_json::to_string(&artifacts_json).unwrap_or_else(|_| "\"[]\"".to_string()),
        );
        ctx.eval::<(), _>(bindings.as_bytes()).map_err(|e| WorkflowError::Internal(format!("sandbox bindings setup failed: {e}")))?;

        // Exactly two wrapper lines precede user source, per the spec's
        // line-offset rule for normalized error locations.
        let wrapped = format!(
            "const __sandboxPromise = (async () => {{\nreturn (async () => {{\n{source}\n}})();\n}})();\n__sandboxPromise.then((v) => {{ globalThis.__sandboxResult = (v === undefined ? null : v); }}).catch((e) => {{ globalThis.__sandboxError = {{ message: String((e && e.message) || e), stack: String((e && e.stack) || \"\") }}; }});"
        );

        let eval_result = ctx.eval::<(), _>(wrapped.as_bytes());
        if let Err(e) = eval_result {
            return Err(normalize_js_error(&e.to_string(), None));
        }

        // Pump the microtask queue until the promise settles or the runtime
        // is interrupted by the deadline.
        loop {
            match runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => return Err(normalize_js_error(&format!("{e:?}"), None)),
            }
        }

        let sandbox_error: Option<String> = globals.get("__sandboxError").ok().and_then(|v: Value| {
            if v.is_null() {
                None
            } else {
                Some(v.to_string())
            }
        });
        if let Some(err_json) = sandbox_error {
            return Err(normalize_js_error(&err_json, Some(&source)));
        }

        let state_after_json: String = ctx
            .eval::<String, _>("JSON.stringify(globalThis.state)".as_bytes())
            .map_err(|e| WorkflowError::Internal(format!("failed to read sandbox state: {e}")))?;
        let state_after: Map<String, Value> = serde_json::from_str(&state_after_json)
            .ok()
            .and_then(|v: Value| v.as_object().cloned())
            .unwrap_or_default();

        let return_json: String = ctx
            .eval::<String, _>("JSON.stringify(globalThis.__sandboxResult === undefined ? null : globalThis.__sandboxResult)".as_bytes())
            .unwrap_or_else(|_| "null".to_string());
        let return_value: Option<Value> = serde_json::from_str::<Value>(&return_json).ok().filter(|v| !v.is_null());

        Ok(RawOutcome {
            state_after,
            return_value,
            console: Vec::new(), // filled in below, once the `Context::with` borrow of `console` ends
            cache_writes: Vec::new(),
        })
    });

    let mut outcome = result?;
    outcome.console = Arc::try_unwrap(console).map(CapturingConsole::into_entries).unwrap_or_default();
    outcome.cache_writes = Arc::try_unwrap(cache_writes_log).map(|m| m.into_inner().expect("writes lock poisoned")).unwrap_or_default();
    Ok(outcome)
}

fn sandbox_fetch(http: &reqwest::Client, handle: &tokio::runtime::Handle, url: &str, opts_json: &str) -> WorkflowResult<String> {
    let parsed = ssrf::check_url(url)?;
    let opts: Value = serde_json::from_str(opts_json).unwrap_or(Value::Null);
    let method = opts.get("method").and_then(|v| v.as_str()).unwrap_or("GET").to_string();
    let body = opts.get("body").and_then(|v| v.as_str()).map(str::to_string);

    let http = http.clone();
    let response_text = handle.block_on(async move {
        let method = reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET);
        let mut request = http.request(method, parsed).timeout(Duration::from_millis(SANDBOX_FETCH_TIMEOUT_MS));
        if let Some(b) = body {
            request = request.body(b);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        Ok::<_, reqwest::Error>((status, text))
    });

    match response_text {
        Ok((status, text)) => {
            let body_value = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
            Ok(serde_json::json!({ "status": status, "body": body_value }).to_string())
        }
        Err(e) => Err(WorkflowError::TransientIo(e.to_string())),
    }
}

fn js_err(e: rquickjs::Error) -> WorkflowError {
    WorkflowError::Internal(format!("sandbox binding error: {e}"))
}

/// Key-level diff: additions/changes from `before` to `after`, plus
/// deletions (keys present in `before`, absent in `after`) marked as
/// `Value::Null` tombstones — the only delta flavor in the system that
/// tracks deletions, per spec §4.7.
fn diff_state(before: &Map<String, Value>, after: &Map<String, Value>) -> Map<String, Value> {
    let mut delta = Map::new();
    for (k, v) in after.iter() {
        if before.get(k) != Some(v) {
            delta.insert(k.clone(), v.clone());
        }
    }
    for k in before.keys() {
        if !after.contains_key(k) {
            delta.insert(k.clone(), Value::Null);
        }
    }
    delta
}

/// Best-effort TypeScript-annotation stripping: removes `: Type` and
/// `<Type>` generic markers. Not a full parser — sufficient to let the
/// static-analysis pass (and QuickJS, which has no type system) see plain
/// script.
fn strip_types(source: &str) -> String {
    let without_generics = regex::Regex::new(r"<[A-Za-z_][A-Za-z0-9_<>\[\], ]*>")
        .map(|re| re.replace_all(source, "").into_owned())
        .unwrap_or_else(|_| source.to_string());
    regex::Regex::new(r":\s*[A-Za-z_][A-Za-z0-9_<>\[\].| ]*(?=[,)=;\n])")
        .map(|re| re.replace_all(&without_generics, "").into_owned())
        .unwrap_or(without_generics)
}

/// Normalize a thrown JS error: strip the two wrapper lines from the
/// reported line number, classify as syntax vs runtime, and drop stack
/// frames that point into the sandbox's own bootstrap script.
fn normalize_js_error(raw: &str, _source: Option<&str>) -> WorkflowError {
    const WRAPPER_OFFSET: i64 = 2;
    let line_re = regex::Regex::new(r"(?i)(line\s+)?(\d+)").ok();
    let message: Value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    let text = message.get("message").and_then(|v| v.as_str()).unwrap_or(raw).to_string();
    let stack = message.get("stack").and_then(|v| v.as_str()).unwrap_or_default();

    let sanitized_stack: String = stack
        .lines()
        .filter(|l| !l.contains("__sandboxPromise") && !l.contains("bindings"))
        .collect::<Vec<_>>()
        .join("\n");

    let line = line_re
        .and_then(|re| re.captures(&sanitized_stack).or_else(|| re.captures(&text)))
        .and_then(|c| c.get(2))
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .map(|n| (n - WRAPPER_OFFSET).max(1));

    let kind = if text.to_lowercase().contains("syntaxerror") { "Syntax error" } else { "Runtime error" };
    match line {
        Some(n) => WorkflowError::UserCode(format!("{kind} at line {n}: {text}")),
        None => WorkflowError::UserCode(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_tracks_additions_changes_and_deletions() {
        let before: Map<String, Value> = serde_json::from_value(serde_json::json!({"a": 5, "b": 7})).unwrap();
        let after: Map<String, Value> = serde_json::from_value(serde_json::json!({"a": 6})).unwrap();
        let delta = diff_state(&before, &after);
        assert_eq!(delta.get("a"), Some(&Value::from(6)));
        assert_eq!(delta.get("b"), Some(&Value::Null));
    }

    #[test]
    fn strip_types_removes_simple_annotations() {
        let stripped = strip_types("function f(x: number): number { return x; }");
        assert!(!stripped.contains(": number"));
    }

    /// Bracket-notation property lookup (`globalThis[name]`) bypasses the
    /// static denylist's `global-access` rule, which only matches dotted
    /// `globalThis.` access. The runtime-level removal of `eval`/`Function`
    /// is the layer that actually stops this, per the spec's "both layers"
    /// requirement.
    #[tokio::test]
    async fn eval_and_function_constructor_are_disabled_even_via_indirection() {
        use crate::context::{RunMeta, WorkflowContext};

        let sandbox = Sandbox::new(reqwest::Client::new());
        let ctx = WorkflowContext::new(RunMeta::default(), Default::default(), Default::default(), Default::default());
        let source = "const name = 'ev' + 'al'; return typeof globalThis[name];";
        let outcome = sandbox
            .execute(source, CodeLanguage::Script, 1_000, Some("result".to_string()), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.state_delta.get("result"), Some(&Value::String("undefined".to_string())));
    }
}
