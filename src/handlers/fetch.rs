//! `fetch` handler — representative I/O block (spec §4.8). SSRF-filtered,
//! status-code matched, retried with exponential backoff.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::time::Duration;

use crate::context::WorkflowContext;
use crate::error::{WorkflowError, WorkflowResult};
use crate::handlers::bind_value_key;
use crate::model::Block;
use crate::registry::{BlockHandler, BlockResult};
use crate::resolver::resolve_value;
use crate::ssrf;

pub struct FetchHandler {
    client: Client,
}

impl FetchHandler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn resolved_str(block: &Block, ctx: &WorkflowContext, key: &str) -> Option<String> {
    block.logic.get(key).map(|v| resolve_value(v, ctx)).and_then(|v| match v {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

/// `"2xx"` / `"20x"` / `"404"` digit-length match with `x` as wildcard.
fn status_matches(pattern: &str, status: u16) -> bool {
    let status_str = status.to_string();
    if pattern.len() != status_str.len() {
        return false;
    }
    pattern
        .chars()
        .zip(status_str.chars())
        .all(|(p, s)| p.eq_ignore_ascii_case(&'x') || p == s)
}

fn accepted(patterns: &[String], status: u16) -> bool {
    patterns.iter().any(|p| status_matches(p, status))
}

#[async_trait]
impl BlockHandler for FetchHandler {
    async fn execute(&self, block: &Block, ctx: &mut WorkflowContext) -> WorkflowResult<BlockResult> {
        let url_raw = resolved_str(block, ctx, "fetch_url")
            .ok_or_else(|| WorkflowError::Validation("fetch_url is required".to_string()))?;

        let method_str = resolved_str(block, ctx, "fetch_method").unwrap_or_else(|| "GET".to_string());
        let method = Method::from_str(&method_str.to_uppercase())
            .map_err(|e| WorkflowError::Validation(format!("invalid fetch_method: {e}")))?;

        let headers: Map<String, Value> = block
            .logic
            .get("fetch_headers")
            .map(|v| resolve_value(v, ctx))
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();

        let body = block.logic.get("fetch_body").map(|v| resolve_value(v, ctx));

        let timeout_ms = block
            .logic
            .get("fetch_timeout_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(30_000);
        let max_retries = block
            .logic
            .get("fetch_max_retries")
            .and_then(|v| v.as_u64())
            .unwrap_or(1);
        let retry_delay_ms = block
            .logic
            .get("fetch_retry_delay_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(1_000);
        let backoff_multiplier = block
            .logic
            .get("fetch_backoff_multiplier")
            .and_then(|v| v.as_f64())
            .unwrap_or(2.0);
        let accepted_codes: Vec<String> = block
            .logic
            .get("fetch_accepted_status_codes")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_else(|| vec!["2xx".to_string()]);

        // SSRF check happens once, before any attempt; never retried.
        let url = ssrf::check_url(&url_raw)?;

        let mut attempt: u64 = 0;
        let mut delay = Duration::from_millis(retry_delay_ms);
        loop {
            let mut request = self.client.request(method.clone(), url.clone()).timeout(Duration::from_millis(timeout_ms));
            for (k, v) in headers.iter() {
                if let Some(s) = v.as_str() {
                    request = request.header(k.as_str(), s);
                }
            }
            if let Some(body_value) = &body {
                request = match body_value {
                    Value::String(s) => request.body(s.clone()),
                    other => request.json(other),
                };
            }

            let result = request.send().await.map_err(WorkflowError::from);
            match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if accepted(&accepted_codes, status) {
                        let status_text = response.status().canonical_reason().unwrap_or("").to_string();
                        let resp_headers: Map<String, Value> = response
                            .headers()
                            .iter()
                            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), Value::String(v.to_string()))))
                            .collect();
                        let content_type = response
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        let text = response.text().await.map_err(WorkflowError::from)?;
                        let body_value = if content_type.contains("json") {
                            serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text))
                        } else {
                            Value::String(text)
                        };

                        let payload = serde_json::json!({
                            "status": status,
                            "statusText": status_text,
                            "headers": resp_headers,
                            "body": body_value,
                        });

                        let mut result = BlockResult::default();
                        if let Some(bind) = bind_value_key(block, "fetch") {
                            result = result.with_state(bind, payload);
                        }
                        return Ok(result);
                    }

                    if attempt >= max_retries {
                        return Err(WorkflowError::TransientIo(format!(
                            "fetch received status {status}, not in accepted set {accepted_codes:?}"
                        )));
                    }
                }
                Err(e) => {
                    if attempt >= max_retries {
                        return Err(e);
                    }
                }
            }

            attempt += 1;
            tokio::time::sleep(delay).await;
            delay = Duration::from_millis(((delay.as_millis() as f64) * backoff_multiplier) as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_pattern_matching() {
        assert!(status_matches("2xx", 200));
        assert!(status_matches("2xx", 204));
        assert!(!status_matches("2xx", 301));
        assert!(status_matches("20x", 204));
        assert!(status_matches("404", 404));
        assert!(!status_matches("404", 400));
    }

    #[test]
    fn accepted_checks_any_pattern() {
        assert!(accepted(&["2xx".to_string(), "404".to_string()], 404));
        assert!(!accepted(&["2xx".to_string()], 500));
    }

    /// A live mock server only ever binds loopback, so it doubles as proof
    /// that the SSRF check rejects a real, reachable endpoint and not just a
    /// syntactically private-looking URL.
    #[tokio::test]
    async fn ssrf_check_rejects_a_live_loopback_server() {
        use crate::context::{RunMeta, WorkflowContext};
        use crate::model::BlockId;
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(200)).mount(&mock_server).await;

        let mut logic = std::collections::HashMap::new();
        logic.insert("fetch_url".to_string(), Value::String(mock_server.uri()));
        let block = Block { id: BlockId::new(), name: "call".to_string(), block_type: "fetch".to_string(), logic, conditions: vec![], order: 0 };

        let handler = FetchHandler::new(Client::new());
        let mut ctx = WorkflowContext::new(RunMeta::default(), Default::default(), Default::default(), Default::default());
        let result = handler.execute(&block, &mut ctx).await;

        assert!(matches!(result, Err(WorkflowError::Policy(_))), "expected the SSRF policy to reject {}: {result:?}", mock_server.uri());
    }
}
