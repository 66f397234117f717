//! Fetch + transform + display: a version that fetches a list, filters and
//! maps it, sums a derived field, then pauses on a display block.

mod support;

use serde_json::json;
use serial_test::serial;

use workflow_engine::model::{OrgId, RunStatus, TriggerType, WorkflowId};
use workflow_engine::orchestrator::TriggerRequest;

#[tokio::test]
#[serial]
async fn fetch_filter_sum_then_pause_on_display() {
    let (orch, store) = support::orchestrator_with(support::stub_fetch_registry());
    let workflow_id = WorkflowId::new();
    let org_id = OrgId::new();

    let blocks = vec![
        support::block(
            "load_items",
            "fetch",
            0,
            vec![
                (
                    "fetch_stub_response",
                    json!({"items": [
                        {"active": true, "price": 1},
                        {"active": false, "price": 2},
                        {"active": true, "price": 3},
                    ]}),
                ),
                ("fetch_bind_value", json!("items")),
            ],
        ),
        support::block(
            "keep_active",
            "array",
            1,
            vec![
                ("array_input", json!("$state.items")),
                (
                    "array_operations",
                    json!([
                        {"op": "filter", "field": "active", "value": true},
                        {"op": "map", "field": "price"},
                    ]),
                ),
                ("array_bind_value", json!("active")),
            ],
        ),
        support::block(
            "sum_prices",
            "math",
            2,
            vec![
                ("math_operation", json!({"op": "sum", "input": "$state.active"})),
                ("math_bind_value", json!("total")),
            ],
        ),
        support::block("show_details", "ui_details", 3, vec![]),
    ];

    store.save_version(&support::published_version(workflow_id, blocks)).unwrap();

    let run_id = orch
        .trigger(TriggerRequest {
            workflow_id,
            version: 1,
            trigger_type: TriggerType::Api,
            event_data: Default::default(),
            org_id,
            run_id: None,
            device_id: None,
        })
        .await
        .unwrap();

    let run = support::wait_for_terminal(&store, run_id).await;
    assert_eq!(run.status, RunStatus::AwaitingAction);

    let paused = store.load_paused_state(run_id).unwrap().expect("paused state persisted");
    let state = &paused.context_snapshot.state;
    assert!(state.contains_key("items"));
    assert_eq!(state.get("active").and_then(|v| v.as_array()).map(|a| a.len()), Some(2));
    assert_eq!(state.get("total"), Some(&json!(4.0)));

    let steps = store.load_steps(run_id).unwrap();
    assert_eq!(steps.len(), 4);
}
