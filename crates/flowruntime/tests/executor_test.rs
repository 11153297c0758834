mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{engine_context, executor, step, Switch};
use flowcore::{
    ErrorHandling, PushBus, PushMessage, RunExecutionData, Value, Workflow,
};
use flowruntime::EngineOutcome;
use std::collections::HashMap;
use std::time::Duration;

fn bus() -> PushBus {
    PushBus::new(1000, Default::default())
}

#[tokio::test]
async fn test_chain_passes_outputs_downstream() {
    let switch = Switch::default();
    let mut workflow = Workflow::new("chain");
    let source = step(&mut workflow, "test.emit", "source");
    let sink = step(&mut workflow, "test.emit", "sink");
    workflow.nodes[0]
        .config
        .insert("value".to_string(), Value::from("hello"));
    workflow.connect(source, "out", sink, "in");

    let outcome = executor(&switch)
        .execute(engine_context(workflow, RunExecutionData::new(), &bus()))
        .await;

    let EngineOutcome::Finished(data) = outcome else {
        panic!("expected a finished run");
    };
    assert!(!data.failed());
    assert_eq!(
        data.completed_outputs("sink").unwrap().get("in"),
        Some(&Value::from("hello"))
    );
    assert_eq!(data.result_data.last_node_executed.as_deref(), Some("sink"));
}

#[tokio::test]
async fn test_start_inputs_reach_root_steps() {
    let switch = Switch::default();
    let mut workflow = Workflow::new("inputs");
    step(&mut workflow, "test.emit", "root");

    let mut data = RunExecutionData::new();
    data.start_data
        .inputs
        .insert("payload".to_string(), Value::Number(3.0));

    let outcome = executor(&switch)
        .execute(engine_context(workflow, data, &bus()))
        .await;

    assert_eq!(
        outcome.data().completed_outputs("root").unwrap().get("payload"),
        Some(&Value::Number(3.0))
    );
}

#[tokio::test]
async fn test_pinned_step_is_not_executed() {
    let switch = Switch::default();
    let mut workflow = Workflow::new("pinned");
    let flaky = step(&mut workflow, "test.flaky", "flaky");
    let after = step(&mut workflow, "test.emit", "after");
    workflow.connect(flaky, "call", after, "call");

    let mut data = RunExecutionData::new();
    data.result_data.pin_data = Some(HashMap::from([(
        "flaky".to_string(),
        HashMap::from([("call".to_string(), Value::Number(42.0))]),
    )]));

    let outcome = executor(&switch)
        .execute(engine_context(workflow, data, &bus()))
        .await;

    let data = outcome.data();
    assert!(!data.failed());
    assert_eq!(switch.calls(), 0);
    assert_eq!(
        data.completed_outputs("after").unwrap().get("call"),
        Some(&Value::Number(42.0))
    );
}

#[tokio::test]
async fn test_destination_node_limits_the_run() {
    let switch = Switch::default();
    let mut workflow = Workflow::new("partial");
    let a = step(&mut workflow, "test.emit", "a");
    let b = step(&mut workflow, "test.emit", "b");
    step(&mut workflow, "test.flaky", "unrelated");
    workflow.connect(a, "out", b, "in");

    let mut data = RunExecutionData::new();
    data.start_data.destination_node = Some("b".to_string());

    let outcome = executor(&switch)
        .execute(engine_context(workflow, data, &bus()))
        .await;

    let run_data = &outcome.data().result_data.run_data;
    assert!(run_data.contains_key("a"));
    assert!(run_data.contains_key("b"));
    assert!(!run_data.contains_key("unrelated"));
    assert_eq!(switch.calls(), 0);
}

#[tokio::test]
async fn test_unknown_destination_fails_the_run() {
    let switch = Switch::default();
    let mut workflow = Workflow::new("missing");
    step(&mut workflow, "test.emit", "a");

    let mut data = RunExecutionData::new();
    data.start_data.destination_node = Some("nope".to_string());

    let outcome = executor(&switch)
        .execute(engine_context(workflow, data, &bus()))
        .await;
    assert!(matches!(outcome, EngineOutcome::Finished(ref d) if d.failed()));
}

#[tokio::test]
async fn test_failure_stops_downstream_steps() {
    let switch = Switch::default();
    let mut workflow = Workflow::new("failing");
    let boom = step(&mut workflow, "test.fail", "boom");
    let after = step(&mut workflow, "test.emit", "after");
    workflow.connect(boom, "out", after, "in");

    let outcome = executor(&switch)
        .execute(engine_context(workflow, RunExecutionData::new(), &bus()))
        .await;

    let EngineOutcome::Finished(data) = outcome else {
        panic!("expected a finished run");
    };
    let error = data.result_data.error.clone().unwrap();
    assert_eq!(error.node.as_deref(), Some("boom"));
    assert!(error.message.contains("boom"));
    assert!(data.result_data.run_data["boom"][0].error.is_some());
    assert!(!data.result_data.run_data.contains_key("after"));
}

#[tokio::test]
async fn test_continue_on_error_runs_the_rest() {
    let switch = Switch::default();
    let mut workflow = Workflow::new("tolerant");
    workflow.settings.on_error = ErrorHandling::ContinueOnError;
    step(&mut workflow, "test.fail", "boom");
    step(&mut workflow, "test.emit", "other");

    let outcome = executor(&switch)
        .execute(engine_context(workflow, RunExecutionData::new(), &bus()))
        .await;

    let data = outcome.data();
    assert!(!data.failed());
    assert!(data.completed_outputs("other").is_some());
    assert!(data.result_data.run_data["boom"][0].error.is_some());
}

#[tokio::test]
async fn test_cycle_is_reported_as_failure() {
    let switch = Switch::default();
    let mut workflow = Workflow::new("cycle");
    let a = step(&mut workflow, "test.emit", "a");
    let b = step(&mut workflow, "test.emit", "b");
    workflow.connect(a, "out", b, "in");
    workflow.connect(b, "out", a, "in");

    let outcome = executor(&switch)
        .execute(engine_context(workflow, RunExecutionData::new(), &bus()))
        .await;

    let data = outcome.data();
    assert!(data.result_data.error.as_ref().unwrap().message.contains("Cyclic"));
    assert!(data.result_data.run_data.is_empty());
}

#[tokio::test]
async fn test_step_retry_policy_recovers() {
    let switch = Switch::default();
    let mut workflow = Workflow::new("retrying");
    workflow.add_node(
        flowcore::NodeSpec::new("test.flaky")
            .with_name("flaky")
            .with_config("failures", 2.0)
            .with_retry(3, 1),
    );

    let outcome = executor(&switch)
        .execute(engine_context(workflow, RunExecutionData::new(), &bus()))
        .await;

    let data = outcome.data();
    assert!(!data.failed());
    assert_eq!(switch.calls(), 3);
    assert_eq!(
        data.completed_outputs("flaky").unwrap().get("call"),
        Some(&Value::Number(3.0))
    );
}

#[tokio::test]
async fn test_step_timeout_fails_the_step() {
    let switch = Switch::default();
    let mut workflow = Workflow::new("slow");
    workflow.settings.max_execution_time_ms = Some(20);
    workflow.add_node(
        flowcore::NodeSpec::new("test.sleep")
            .with_name("slow")
            .with_config("ms", 5_000.0),
    );

    let outcome = executor(&switch)
        .execute(engine_context(workflow, RunExecutionData::new(), &bus()))
        .await;

    let error = outcome.data().result_data.error.clone().unwrap();
    assert_eq!(error.node.as_deref(), Some("slow"));
    assert!(error.message.contains("Timeout"));
}

#[tokio::test]
async fn test_panicking_step_fails_the_run() {
    let switch = Switch::default();
    let mut workflow = Workflow::new("panics");
    step(&mut workflow, "test.panic", "bad");

    let outcome = executor(&switch)
        .execute(engine_context(workflow, RunExecutionData::new(), &bus()))
        .await;

    let error = outcome.data().result_data.error.clone().unwrap();
    assert_eq!(error.node.as_deref(), Some("bad"));
    assert!(error.message.contains("panicked"));
}

#[tokio::test]
async fn test_wait_parks_and_resumes_from_stored_data() {
    let switch = Switch::default();
    let mut workflow = Workflow::new("waiting");
    let wake = Utc::now() + ChronoDuration::hours(1);
    let wait = workflow.add_node(
        flowcore::NodeSpec::new("test.park")
            .with_name("wait")
            .with_config("until", wake.to_rfc3339()),
    );
    let after = step(&mut workflow, "test.emit", "after");
    workflow.connect(wait, "parked", after, "parked");

    let executor = executor(&switch);
    let outcome = executor
        .execute(engine_context(workflow.clone(), RunExecutionData::new(), &bus()))
        .await;

    let EngineOutcome::Waiting { wait_till, data } = outcome else {
        panic!("expected the run to park");
    };
    assert_eq!(wait_till, wake);
    assert_eq!(data.execution_data.as_ref().unwrap().waiting_node, "wait");
    assert!(!data.result_data.run_data.contains_key("after"));

    let resumed = executor
        .execute(engine_context(workflow, data, &bus()))
        .await;

    let EngineOutcome::Finished(data) = resumed else {
        panic!("expected the resumed run to finish");
    };
    assert!(data.execution_data.is_none());
    assert_eq!(data.result_data.run_data["wait"].len(), 1);
    assert_eq!(
        data.completed_outputs("after").unwrap().get("parked"),
        Some(&Value::Bool(true))
    );
}

#[tokio::test]
async fn test_cancellation_stops_running_steps() {
    let switch = Switch::default();
    let mut workflow = Workflow::new("cancel");
    step(&mut workflow, "test.sleep", "slow");

    let ctx = engine_context(workflow, RunExecutionData::new(), &bus());
    let token = ctx.cancellation.clone();
    let task = tokio::spawn(async move { executor(&switch).execute(ctx).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    let EngineOutcome::Canceled(data) = outcome else {
        panic!("expected a canceled run");
    };
    assert!(data.result_data.error.unwrap().message.contains("canceled"));
}

#[tokio::test]
async fn test_step_events_are_paired_in_order() {
    let switch = Switch::default();
    let bus = bus();
    let mut events = bus.subscribe();
    let mut workflow = Workflow::new("events");
    let a = step(&mut workflow, "test.emit", "a");
    let b = step(&mut workflow, "test.emit", "b");
    workflow.connect(a, "out", b, "in");

    executor(&switch)
        .execute(engine_context(workflow, RunExecutionData::new(), &bus))
        .await;

    let mut seen = Vec::new();
    while let Some(message) = events.try_recv() {
        match message {
            PushMessage::NodeExecuteBefore(m) => seen.push(format!("before:{}", m.node_name)),
            PushMessage::NodeExecuteAfter(m) => seen.push(format!("after:{}", m.node_name)),
            _ => {}
        }
    }
    assert_eq!(seen, vec!["before:a", "after:a", "before:b", "after:b"]);
}
