//! A run pauses at a `ui_form` block, its state is persisted (sealed) and
//! reloaded, and resuming with an action payload carries the run to
//! completion against the rehydrated context.

mod support;

use serde_json::json;
use serial_test::serial;

use workflow_engine::model::{OrgId, RunStatus, TriggerType, WorkflowId};
use workflow_engine::orchestrator::{ActionSubmission, TriggerRequest};

#[tokio::test]
#[serial]
async fn pauses_at_ui_form_and_resumes_to_completion() {
    let (orch, store) = support::orchestrator_with(support::stub_fetch_registry());
    let workflow_id = WorkflowId::new();
    let org_id = OrgId::new();

    let blocks = vec![
        support::block(
            "load_user",
            "fetch",
            0,
            vec![
                ("fetch_stub_response", json!({"balance": 50})),
                ("fetch_bind_value", json!("user")),
            ],
        ),
        support::block("confirm", "ui_form", 1, vec![]),
        support::block(
            "apply_bonus",
            "math",
            2,
            vec![
                ("math_operation", json!({"op": "add", "input": "$state.user.balance", "operand": "$state.bonus"})),
                ("math_bind_value", json!("balance")),
            ],
        ),
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

    let paused_run = support::wait_for_terminal(&store, run_id).await;
    assert_eq!(paused_run.status, RunStatus::AwaitingAction);
    let paused = store.load_paused_state(run_id).unwrap().expect("paused state persisted");
    assert_eq!(paused.context_snapshot.state.get("user"), Some(&json!({"balance": 50})));

    orch.resume(run_id, ActionSubmission { action_type: "submit".to_string(), payload: json!({"bonus": 10}) }).await.unwrap();

    let run = support::wait_for_terminal(&store, run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert!(store.load_paused_state(run_id).unwrap().is_none(), "paused state must be cleared on resume");

    let steps = store.load_steps(run_id).unwrap();
    assert_eq!(steps.len(), 3);
    let apply_bonus = steps.iter().find(|s| s.block_name == "apply_bonus").expect("apply_bonus step recorded");
    assert_eq!(apply_bonus.state_delta.get("balance"), Some(&json!(60.0)));
}
