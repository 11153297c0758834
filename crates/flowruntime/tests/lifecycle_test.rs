mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{eventually, executor, harness, step, Harness};
use flowcore::{
    Config, DeleteFilter, ErrorHandling, ExecutionFilter, ExecutionMode, ExecutionStatus,
    LifecycleError, NodeSpec, PushMessage, ResponseMode, SaveDataPolicy, SchedulerConfig,
    SubmitRequest, Workflow,
};
use flowruntime::{
    ExecutionResumer, ExecutionRuntime, ExecutionStore, ResumeScheduler, StopOutcome,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn request(workflow: Workflow) -> SubmitRequest {
    SubmitRequest::new(ExecutionMode::Manual, Arc::new(workflow), "tester")
}

fn flaky_workflow() -> Workflow {
    let mut workflow = Workflow::new("flaky");
    let first = step(&mut workflow, "test.emit", "first");
    let flaky = step(&mut workflow, "test.flaky", "flaky");
    workflow.connect(first, "out", flaky, "in");
    workflow
}

fn parked_workflow(wake: chrono::DateTime<Utc>) -> Workflow {
    let mut workflow = Workflow::new("parked");
    let wait = workflow.add_node(
        NodeSpec::new("test.park")
            .with_name("wait")
            .with_config("until", wake.to_rfc3339()),
    );
    let after = step(&mut workflow, "test.emit", "after");
    workflow.connect(wait, "parked", after, "parked");
    workflow
}

fn sleeping_workflow() -> Workflow {
    let mut workflow = Workflow::new("sleeping");
    step(&mut workflow, "test.sleep", "slow");
    workflow
}

fn scheduler(h: &Harness) -> ResumeScheduler {
    ResumeScheduler::new(
        h.store.clone(),
        Arc::new(h.runtime.clone()),
        &SchedulerConfig::default(),
    )
}

#[tokio::test]
async fn test_failed_run_is_retried_and_linked() {
    let h = harness(Config::default());

    let submitted = h.runtime.submit(request(flaky_workflow())).await.unwrap();
    let original = submitted.execution_id;
    assert!(!submitted.waiting_for_webhook);

    let failed = h.runtime.wait_for_completion(original, WAIT).await.unwrap();
    assert_eq!(failed.status, ExecutionStatus::Error);
    assert_eq!(failed.error().unwrap().node.as_deref(), Some("flaky"));

    let stored = h.store.load(original).await.unwrap().unwrap();
    assert!(stored.finished);
    assert!(stored.stopped_at.is_some());
    assert_eq!(stored.status, ExecutionStatus::Error);

    h.switch.set_healthy(true);
    let retry = h.runtime.retry(original, "tester").await.unwrap().execution_id;
    let retried = h.runtime.wait_for_completion(retry, WAIT).await.unwrap();
    assert_eq!(retried.status, ExecutionStatus::Success);
    assert_eq!(retried.retry_of, Some(original));
    assert_eq!(retried.mode, ExecutionMode::Retry);
    assert_eq!(h.switch.calls(), 2);

    // The step that succeeded the first time was reused, not rerun.
    let first_run = &stored.data.result_data.run_data["first"][0];
    assert_eq!(&retried.data.result_data.run_data["first"][0], first_run);

    let original_record = h.store.load(original).await.unwrap().unwrap();
    assert_eq!(original_record.retry_success_id, Some(retry));

    let again = h.runtime.retry(original, "tester").await;
    assert!(matches!(again, Err(LifecycleError::NotRetryable { .. })));
}

#[tokio::test]
async fn test_successful_run_cannot_be_retried() {
    let h = harness(Config::default());
    h.switch.set_healthy(true);

    let id = h
        .runtime
        .submit(request(flaky_workflow()))
        .await
        .unwrap()
        .execution_id;
    let result = h.runtime.wait_for_completion(id, WAIT).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Success);

    assert!(matches!(
        h.runtime.retry(id, "tester").await,
        Err(LifecycleError::NotRetryable { .. })
    ));
    assert!(matches!(
        h.runtime.retry(uuid::Uuid::new_v4(), "tester").await,
        Err(LifecycleError::UnknownExecution(_))
    ));
}

#[tokio::test]
async fn test_retry_uses_the_stored_workflow_snapshot() {
    let h = harness(Config::default());
    let workflow = flaky_workflow();
    let id = h
        .runtime
        .submit(request(workflow.clone()))
        .await
        .unwrap()
        .execution_id;
    h.runtime.wait_for_completion(id, WAIT).await.unwrap();

    // Saving the record again with an edited definition must not replace
    // the snapshot a retry runs.
    let mut record = h.store.load(id).await.unwrap().unwrap();
    let mut edited = workflow.clone();
    edited.name = "edited".to_string();
    record.workflow_data = Arc::new(edited);
    h.store.save(&record).await.unwrap();

    h.switch.set_healthy(true);
    let retry = h.runtime.retry(id, "tester").await.unwrap().execution_id;
    h.runtime.wait_for_completion(retry, WAIT).await.unwrap();
    let retry_record = h.store.load(retry).await.unwrap().unwrap();
    assert_eq!(retry_record.workflow_data.name, "flaky");
}

#[tokio::test]
async fn test_parked_run_resumes_exactly_once() {
    let h = harness(Config::default());
    let scheduler = scheduler(&h);
    let wake = Utc::now() + ChronoDuration::hours(1);

    let id = h
        .runtime
        .submit(request(parked_workflow(wake)))
        .await
        .unwrap()
        .execution_id;
    let parked = h.runtime.wait_for_completion(id, WAIT).await.unwrap();
    assert_eq!(parked.status, ExecutionStatus::Waiting);
    assert_eq!(parked.wait_till, Some(wake));
    assert!(!parked.finished);
    assert!(!h.runtime.active().is_active(id));

    let stored = h.store.load(id).await.unwrap().unwrap();
    assert_eq!(stored.wait_till, Some(wake));
    assert!(stored.stopped_at.is_none());

    assert!(scheduler
        .tick(wake - ChronoDuration::seconds(1))
        .await
        .unwrap()
        .is_empty());

    let other = self::scheduler(&h);
    let (a, b) = tokio::join!(scheduler.tick(wake), other.tick(wake));
    let resumed: Vec<_> = a.unwrap().into_iter().chain(b.unwrap()).collect();
    assert_eq!(resumed, vec![id]);

    let finished = h.runtime.wait_for_completion(id, WAIT).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Success);
    assert!(finished.wait_till.is_none());
    assert_eq!(finished.data.result_data.run_data["wait"].len(), 1);
    assert!(finished.data.completed_outputs("after").is_some());

    assert!(scheduler
        .tick(wake + ChronoDuration::hours(1))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_push_events_arrive_in_order() {
    let h = harness(Config::default());
    let mut events = h.bus.subscribe_session("session-1");
    let mut elsewhere = h.bus.subscribe_session("session-2");

    let mut workflow = Workflow::new("pushed");
    let a = step(&mut workflow, "test.emit", "a");
    let b = step(&mut workflow, "test.emit", "b");
    workflow.connect(a, "out", b, "in");
    let mut req = request(workflow);
    req.session_id = Some("session-1".to_string());

    let id = h.runtime.submit(req).await.unwrap().execution_id;

    let mut kinds = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.execution_id(), Some(id));
        let kind = match &message {
            PushMessage::NodeExecuteBefore(m) => format!("before:{}", m.node_name),
            PushMessage::NodeExecuteAfter(m) => format!("after:{}", m.node_name),
            other => other.kind().to_string(),
        };
        kinds.push(kind);
        if let PushMessage::ExecutionFinished(finished) = message {
            assert_eq!(finished.data.status, ExecutionStatus::Success);
            break;
        }
    }
    assert_eq!(
        kinds,
        vec![
            "executionStarted",
            "before:a",
            "after:a",
            "before:b",
            "after:b",
            "executionFinished"
        ]
    );
    assert!(elsewhere.try_recv().is_none());
}

#[tokio::test]
async fn test_stop_cancels_a_running_execution() {
    let h = harness(Config::default());
    let id = h
        .runtime
        .submit(request(sleeping_workflow()))
        .await
        .unwrap()
        .execution_id;
    assert_eq!(h.runtime.current().len(), 1);
    assert_eq!(h.runtime.current()[0].id, id);

    assert_eq!(h.runtime.stop(id).await.unwrap(), StopOutcome::Cancelling);

    let result = h.runtime.wait_for_completion(id, WAIT).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Canceled);
    assert!(result.finished);
    assert!(h.runtime.current().is_empty());

    match h.runtime.stop(id).await.unwrap() {
        StopOutcome::AlreadyFinished(result) => {
            assert_eq!(result.status, ExecutionStatus::Canceled)
        }
        other => panic!("unexpected stop outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_stop_finalizes_a_waiting_execution() {
    let h = harness(Config::default());
    let scheduler = scheduler(&h);
    let wake = Utc::now() + ChronoDuration::hours(1);
    let id = h
        .runtime
        .submit(request(parked_workflow(wake)))
        .await
        .unwrap()
        .execution_id;
    h.runtime.wait_for_completion(id, WAIT).await.unwrap();

    match h.runtime.stop(id).await.unwrap() {
        StopOutcome::Stopped(result) => {
            assert_eq!(result.status, ExecutionStatus::Canceled);
            assert!(result.wait_till.is_none());
        }
        other => panic!("unexpected stop outcome {:?}", other),
    }

    let stored = h.store.load(id).await.unwrap().unwrap();
    assert!(stored.finished);
    assert_eq!(stored.status, ExecutionStatus::Canceled);
    assert!(scheduler.tick(wake).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stop_leaves_a_run_owned_elsewhere_alone() {
    let h = harness(Config::default());
    let other = ExecutionRuntime::new(
        &Config::default(),
        h.store.clone(),
        Arc::new(executor(&h.switch)),
        h.bus.clone(),
    );

    let mut workflow = Workflow::new("slow");
    workflow.add_node(
        NodeSpec::new("test.sleep")
            .with_name("slow")
            .with_config("ms", 1000.0),
    );
    let id = h.runtime.submit(request(workflow)).await.unwrap().execution_id;

    assert_eq!(other.stop(id).await.unwrap(), StopOutcome::RunningElsewhere);
    let stored = h.store.load(id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Running);
    assert!(!stored.finished);

    let result = h.runtime.wait_for_completion(id, WAIT).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Success);
    let stored = h.store.load(id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Success);
    assert!(stored.data.result_data.error.as_ref().is_none());
}

#[tokio::test]
async fn test_stop_catches_a_resume_that_has_not_registered_yet() {
    let h = harness(Config::default());
    let wake = Utc::now() + ChronoDuration::hours(1);
    let id = h
        .runtime
        .submit(request(parked_workflow(wake)))
        .await
        .unwrap()
        .execution_id;
    h.runtime.wait_for_completion(id, WAIT).await.unwrap();

    // A scheduler has claimed the record but not launched it yet.
    let claimed = h.store.claim_waiting(id, wake).await.unwrap().unwrap();
    let resumer = h.runtime.clone();
    let launch = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        resumer.resume(claimed).await
    });

    assert_eq!(h.runtime.stop(id).await.unwrap(), StopOutcome::Cancelling);
    launch.await.unwrap().unwrap();

    let result = h.runtime.wait_for_completion(id, WAIT).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Canceled);
}

#[tokio::test]
async fn test_stop_unknown_execution() {
    let h = harness(Config::default());
    assert!(matches!(
        h.runtime.stop(uuid::Uuid::new_v4()).await,
        Err(LifecycleError::UnknownExecution(_))
    ));
}

#[tokio::test]
async fn test_execution_timeout_cancels_the_run() {
    let mut config = Config::default();
    config.executions.timeout_secs = 1;
    let h = harness(config);

    let id = h
        .runtime
        .submit(request(sleeping_workflow()))
        .await
        .unwrap()
        .execution_id;
    let result = h.runtime.wait_for_completion(id, WAIT).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Canceled);
    assert_eq!(
        result.error().unwrap().message,
        "Execution timed out after 1s"
    );
}

#[tokio::test]
async fn test_save_policy_discards_successful_runs() {
    let mut config = Config::default();
    config.executions.save_data_on_success = SaveDataPolicy::None;
    let h = harness(config);

    let ok = h
        .runtime
        .submit(request(sleeping_workflow_with_ms(1)))
        .await
        .unwrap()
        .execution_id;
    let result = h.runtime.wait_for_completion(ok, WAIT).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Success);
    let store = h.store.clone();
    eventually(|| {
        let store = store.clone();
        async move { store.load(ok).await.unwrap().is_none() }
    })
    .await;

    let failed = h
        .runtime
        .submit(request(flaky_workflow()))
        .await
        .unwrap()
        .execution_id;
    h.runtime.wait_for_completion(failed, WAIT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.store.load(failed).await.unwrap().is_some());
}

#[tokio::test]
async fn test_unsaved_manual_runs_are_discarded() {
    let mut config = Config::default();
    config.executions.save_manual_executions = false;
    let h = harness(config);

    let manual = h
        .runtime
        .submit(request(flaky_workflow()))
        .await
        .unwrap()
        .execution_id;
    h.runtime.wait_for_completion(manual, WAIT).await.unwrap();

    let mut trigger = request(flaky_workflow());
    trigger.execution_mode = ExecutionMode::Trigger;
    let kept = h.runtime.submit(trigger).await.unwrap().execution_id;
    h.runtime.wait_for_completion(kept, WAIT).await.unwrap();

    let store = h.store.clone();
    eventually(|| {
        let store = store.clone();
        async move { store.load(manual).await.unwrap().is_none() }
    })
    .await;
    assert!(h.store.load(kept).await.unwrap().is_some());
}

#[tokio::test]
async fn test_failing_workflow_is_retried_automatically() {
    let h = harness(Config::default());
    let mut workflow = flaky_workflow();
    workflow.settings.on_error = ErrorHandling::RetryWorkflow { max_attempts: 2 };

    let root = h
        .runtime
        .submit(request(workflow))
        .await
        .unwrap()
        .execution_id;

    let retries_of_root = ExecutionFilter {
        filters: [("retryOf".to_string(), json!(root.to_string()))].into(),
        ..Default::default()
    };
    let runtime = h.runtime.clone();
    let filter = retries_of_root.clone();
    eventually(|| {
        let runtime = runtime.clone();
        let filter = filter.clone();
        async move {
            let page = runtime.list(&filter).await.unwrap();
            page.count == 2 && page.results.iter().all(|r| r.status == ExecutionStatus::Error)
        }
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let page = h.runtime.list(&retries_of_root).await.unwrap();
    assert_eq!(page.count, 2);
    assert!(page.results.iter().all(|r| r.mode == ExecutionMode::Retry));
    assert_eq!(h.switch.calls(), 3);
}

#[tokio::test]
async fn test_automatic_retry_stops_after_success() {
    let h = harness(Config::default());
    let mut workflow = Workflow::new("recovering");
    workflow.settings.on_error = ErrorHandling::RetryWorkflow { max_attempts: 5 };
    workflow.add_node(
        NodeSpec::new("test.flaky")
            .with_name("flaky")
            .with_config("failures", 1.0),
    );

    let root = h
        .runtime
        .submit(request(workflow))
        .await
        .unwrap()
        .execution_id;

    let store = h.store.clone();
    eventually(|| {
        let store = store.clone();
        async move {
            store
                .load(root)
                .await
                .unwrap()
                .map(|r| r.retry_success_id.is_some())
                .unwrap_or(false)
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.switch.calls(), 2);
}

#[tokio::test]
async fn test_first_response_is_handed_back_before_completion() {
    let h = harness(Config::default());
    let mut workflow = Workflow::new("responding");
    let respond = workflow.add_node(
        NodeSpec::new("test.respond")
            .with_name("respond")
            .with_config("body", "accepted"),
    );
    let slow = workflow.add_node(
        NodeSpec::new("test.sleep")
            .with_name("slow")
            .with_config("ms", 300.0),
    );
    workflow.connect(respond, "delivered", slow, "delivered");

    let mut req = request(workflow);
    req.execution_mode = ExecutionMode::Webhook;
    req.response_mode = ResponseMode::FirstResponse;
    let (submitted, pending) = h.runtime.submit_with_response(req).await.unwrap();
    assert!(submitted.waiting_for_webhook);

    let response = pending.unwrap().wait(WAIT).await.unwrap();
    assert_eq!(response.data, json!("accepted"));
    assert!(h.runtime.active().is_active(submitted.execution_id));

    let result = h
        .runtime
        .wait_for_completion(submitted.execution_id, WAIT)
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_first_response_falls_back_to_the_run_result() {
    let h = harness(Config::default());
    let mut workflow = Workflow::new("silent");
    workflow.add_node(
        NodeSpec::new("test.emit")
            .with_name("emit")
            .with_config("value", "done"),
    );

    let mut req = request(workflow);
    req.response_mode = ResponseMode::FirstResponse;
    let (_, pending) = h.runtime.submit_with_response(req).await.unwrap();

    let response = pending.unwrap().wait(WAIT).await.unwrap();
    assert_eq!(response.data, json!({ "out": "done" }));
    assert_eq!(response.response_code, None);
}

#[tokio::test]
async fn test_invalid_workflow_is_rejected_before_storing() {
    let h = harness(Config::default());
    let mut workflow = Workflow::new("dupes");
    step(&mut workflow, "test.emit", "same");
    step(&mut workflow, "test.emit", "same");

    assert!(matches!(
        h.runtime.submit(request(workflow)).await,
        Err(LifecycleError::Engine(_))
    ));
    let page = h.runtime.list(&ExecutionFilter::default()).await.unwrap();
    assert_eq!(page.count, 0);
}

#[tokio::test]
async fn test_delete_prunes_finished_executions() {
    let h = harness(Config::default());
    h.switch.set_healthy(true);
    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = h
            .runtime
            .submit(request(flaky_workflow()))
            .await
            .unwrap()
            .execution_id;
        h.runtime.wait_for_completion(id, WAIT).await.unwrap();
        ids.push(id);
    }

    let deleted = h
        .runtime
        .delete(&DeleteFilter::before(Utc::now() + ChronoDuration::seconds(1)))
        .await
        .unwrap();
    assert_eq!(deleted, 3);
    assert!(matches!(
        h.runtime.delete(&DeleteFilter::default()).await,
        Err(LifecycleError::Store(_))
    ));
}

fn sleeping_workflow_with_ms(ms: u64) -> Workflow {
    let mut workflow = Workflow::new("quick");
    workflow.add_node(
        NodeSpec::new("test.sleep")
            .with_name("quick")
            .with_config("ms", ms as f64),
    );
    workflow
}
