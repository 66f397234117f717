//! A `fetch` block targeting a private address is rejected by the SSRF
//! policy before any request is attempted; the run fails and the rejection
//! is visible on the recorded step.

mod support;

use serde_json::json;
use serial_test::serial;

use workflow_engine::model::{OrgId, RunStatus, StepStatus, TriggerType, WorkflowId};
use workflow_engine::orchestrator::TriggerRequest;

#[tokio::test]
#[serial]
async fn fetch_to_private_address_is_rejected() {
    // Real registry, real network-backed FetchHandler: the point of this
    // scenario is that the SSRF check stops the request before it ever
    // reaches the network layer, so there is nothing to stub.
    let (orch, store) = support::orchestrator_with(support::real_registry());
    let workflow_id = WorkflowId::new();
    let org_id = OrgId::new();

    let blocks = vec![support::block(
        "call_internal_admin",
        "fetch",
        0,
        vec![("fetch_url", json!("http://10.0.0.5/admin"))],
    )];

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
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap_or_default().contains("SSRF"), "run error should mention SSRF: {:?}", run.error);

    let steps = store.load_steps(run_id).unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Failed);
    let step_error = steps[0].error.as_ref().expect("a step error is recorded");
    assert!(step_error.message.contains("SSRF"), "step error should mention SSRF: {}", step_error.message);
}
