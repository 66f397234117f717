//! A `code` block runs inside the real QuickJS sandbox and its recorded
//! step delta reflects additions, changes, and deletions against state.

mod support;

use serde_json::json;
use serial_test::serial;

use workflow_engine::model::{Condition, ConditionOperator, OrgId, RunStatus, StepStatus, TriggerType, WorkflowId};
use workflow_engine::orchestrator::TriggerRequest;

#[tokio::test]
#[serial]
async fn code_block_diff_tracks_additions_and_deletions() {
    let (orch, store) = support::orchestrator_with(support::real_registry());
    let workflow_id = WorkflowId::new();
    let org_id = OrgId::new();

    let blocks = vec![
        support::block(
            "seed",
            "math",
            0,
            vec![
                ("math_operation", json!({"op": "add", "input": 5, "operand": 0})),
                ("math_bind_value", json!("baz")),
            ],
        ),
        support::block(
            "mutate",
            "code",
            1,
            vec![("code_source", json!("state.foo = 'bar'; delete state.baz;"))],
        ),
        // Runs only if `baz` is still a key of `$state` after `mutate` — i.e.
        // only if the deletion never actually took effect on the live
        // context, not just on the recorded delta. A correct engine skips
        // this block (guard false), so its absence as a step confirms `baz`
        // was truly removed from state, not merely set to null in place.
        support::guarded_block(
            "would_run_if_baz_survives",
            "math",
            2,
            vec![
                ("math_operation", json!({"op": "add", "input": 1, "operand": 0})),
                ("math_bind_value", json!("bug_marker")),
            ],
            vec![Condition { left: json!("$state"), operator: ConditionOperator::Contains, right: json!("baz") }],
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

    let run = support::wait_for_terminal(&store, run_id).await;
    assert_eq!(run.status, RunStatus::Completed);

    let steps = store.load_steps(run_id).unwrap();
    assert_eq!(steps.len(), 3);
    let mutate_delta = &steps[1].state_delta;
    assert_eq!(mutate_delta.get("foo"), Some(&json!("bar")));
    assert_eq!(mutate_delta.get("baz"), Some(&json!(null)));

    // The guard check's own step: skipped means `baz` is truly gone from the
    // live context, not just nulled-out in the recorded delta.
    assert_eq!(steps[2].status, StepStatus::Skipped, "baz must be removed from $state, not left present as null");
    assert!(steps[2].state_delta.get("bug_marker").is_none());
}
