//! `date` handler: deterministic date/time transforms.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;

use crate::context::WorkflowContext;
use crate::error::{WorkflowError, WorkflowResult};
use crate::handlers::{bind_value_key, operations_of};
use crate::model::Block;
use crate::registry::{BlockHandler, BlockResult};
use crate::resolver::resolve_value;

pub struct DateHandler;

fn parse(input: &Value) -> WorkflowResult<DateTime<Utc>> {
    match input {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| WorkflowError::Validation(format!("invalid date: {e}"))),
        Value::Null => Ok(Utc::now()),
        _ => Err(WorkflowError::Validation("date input must be an ISO-8601 string".to_string())),
    }
}

fn apply_op(op: &Value, ctx: &WorkflowContext, current: DateTime<Utc>) -> WorkflowResult<DateTime<Utc>> {
    let kind = op.get("op").and_then(|v| v.as_str()).unwrap_or("add");
    let amount = op.get("amount").and_then(|v| v.as_i64()).unwrap_or(0);
    let unit = op.get("unit").and_then(|v| v.as_str()).unwrap_or("days");
    let delta = match unit {
        "seconds" => ChronoDuration::seconds(amount),
        "minutes" => ChronoDuration::minutes(amount),
        "hours" => ChronoDuration::hours(amount),
        "days" => ChronoDuration::days(amount),
        other => return Err(WorkflowError::Validation(format!("unknown date unit: {other}"))),
    };
    Ok(match kind {
        "add" => current + delta,
        "subtract" => current - delta,
        "set" => parse(&op.get("value").map(|v| resolve_value(v, ctx)).unwrap_or(Value::Null))?,
        other => return Err(WorkflowError::Validation(format!("unknown date operation: {other}"))),
    })
}

#[async_trait]
impl BlockHandler for DateHandler {
    async fn execute(&self, block: &Block, ctx: &mut WorkflowContext) -> WorkflowResult<BlockResult> {
        let ops = operations_of(block, "date");
        let input = block.logic.get("date_input").map(|v| resolve_value(v, ctx)).unwrap_or(Value::Null);
        let mut current = parse(&input)?;
        for op in &ops {
            current = apply_op(op, ctx, current)?;
        }
        let mut result = BlockResult::default();
        if let Some(bind) = bind_value_key(block, "date") {
            result = result.with_state(bind, Value::String(current.to_rfc3339()));
        }
        Ok(result)
    }
}
