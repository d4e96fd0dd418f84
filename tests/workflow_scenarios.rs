//! End-to-end workflow scenarios against the in-memory backends

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{constant, echo, Harness};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tasker_dag::orchestration::{handler_fn, HandlerError};
use tasker_dag::state_machine::{RunStatus, StepStatus, TaskStatus};
use tasker_dag::workflow::{StepDefinition, WorkflowDefinition};

fn doubling() -> impl tasker_dag::StepHandler {
    handler_fn(|input| async move { Ok(json!({"input": input, "doubled": true})) })
}

#[tokio::test]
async fn test_linear_chain_completes_with_leaf_output() {
    let harness = Harness::new();
    let workflow = Arc::new(
        WorkflowDefinition::new("linear")
            .step(StepDefinition::new("a", doubling()))
            .step(StepDefinition::new("b", doubling()).depends_on(["a"]))
            .step(StepDefinition::new("c", doubling()).depends_on(["b"]))
            .build()
            .unwrap(),
    );

    let run = harness.start_and_drive(&workflow, json!({"n": 1})).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.remaining_steps, 0);
    let output = run.output.unwrap();
    assert_eq!(output["c"]["doubled"], json!(true));
    assert_eq!(output["c"]["input"]["b"]["input"]["a"]["input"]["run"], json!({"n": 1}));
    assert!(output.get("a").is_none());

    let steps = harness.engine.step_states(run.run_id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
    assert!(steps.iter().all(|s| s.remaining_deps == 0 && s.remaining_tasks == 0));
}

#[tokio::test]
async fn test_diamond_join_sees_both_branches() {
    let harness = Harness::new();
    let seen = Arc::new(Mutex::new(None::<Value>));
    let capture = {
        let seen = seen.clone();
        handler_fn(move |input: Value| {
            let seen = seen.clone();
            async move {
                *seen.lock() = Some(input.clone());
                Ok(json!("joined"))
            }
        })
    };
    let workflow = Arc::new(
        WorkflowDefinition::new("diamond")
            .step(StepDefinition::new("a", constant(json!("A"))))
            .step(StepDefinition::new("b", constant(json!("B"))).depends_on(["a"]))
            .step(StepDefinition::new("c", constant(json!("C"))).depends_on(["a"]))
            .step(StepDefinition::new("d", capture).depends_on(["b", "c"]))
            .build()
            .unwrap(),
    );

    let run = harness.start_and_drive(&workflow, json!({})).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(json!({"d": "joined"})));
    let input = seen.lock().clone().unwrap();
    assert_eq!(input, json!({"run": {}, "b": "B", "c": "C"}));
}

#[tokio::test]
async fn test_map_step_fans_out_one_task_per_element() {
    let harness = Harness::new();
    let elements = Arc::new(Mutex::new(Vec::new()));
    let fan = {
        let elements = elements.clone();
        handler_fn(move |input: Value| {
            let elements = elements.clone();
            async move {
                let n = input["p"].as_i64().ok_or_else(|| HandlerError::permanent("no element"))?;
                elements.lock().push(n);
                Ok(json!(n * 10))
            }
        })
    };
    let workflow = Arc::new(
        WorkflowDefinition::new("mapper")
            .step(StepDefinition::new("p", constant(json!([1, 2, 3]))))
            .step(StepDefinition::new("q", fan).depends_on(["p"]).initial_tasks(3))
            .step(StepDefinition::new("r", echo()).depends_on(["q"]))
            .build()
            .unwrap(),
    );

    let run = harness.start_and_drive(&workflow, json!(null)).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output.unwrap()["r"]["q"], json!([10, 20, 30]));

    let mut seen = elements.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3]);

    let tasks = harness.engine.tasks(run.run_id).await.unwrap();
    let q_tasks: Vec<_> = tasks.iter().filter(|t| t.step_name == "q").collect();
    assert_eq!(q_tasks.len(), 3);
    assert_eq!(
        q_tasks.iter().map(|t| t.task_index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    let last_q_done = q_tasks.iter().filter_map(|t| t.completed_at).max().unwrap();
    let r_task = tasks.iter().find(|t| t.step_name == "r").unwrap();
    assert!(r_task.queued_at >= last_q_done);
}

#[tokio::test]
async fn test_flaky_step_succeeds_on_third_attempt() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    let flaky = {
        let calls = calls.clone();
        handler_fn(move |_input| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(HandlerError::retryable("not yet"))
                } else {
                    Ok(json!("finally"))
                }
            }
        })
    };
    let workflow = Arc::new(
        WorkflowDefinition::new("flaky")
            .step(StepDefinition::new("x", flaky).max_attempts(3))
            .build()
            .unwrap(),
    );

    let run = harness.start_and_drive(&workflow, json!({})).await;

    assert_eq!(run.status, RunStatus::Completed);
    let tasks = harness.engine.tasks(run.run_id).await.unwrap();
    assert_eq!(tasks[0].attempts_count, 3);
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[0].error.as_deref(), Some("not yet"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_exhausted_step_fails_run_and_blocks_descendants() {
    let harness = Harness::new();
    let workflow = Arc::new(
        WorkflowDefinition::new("doomed")
            .step(
                StepDefinition::new(
                    "y",
                    handler_fn(|_input| async move { Err(HandlerError::retryable("down")) }),
                )
                .max_attempts(2),
            )
            .step(StepDefinition::new("z", echo()).depends_on(["y"]))
            .build()
            .unwrap(),
    );

    let run = harness.start_and_drive(&workflow, json!({})).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failed_step_name.as_deref(), Some("y"));
    assert_eq!(run.error.as_deref(), Some("down"));
    assert_eq!(run.remaining_steps, 2);

    let steps = harness.engine.step_states(run.run_id).await.unwrap();
    let z = steps.iter().find(|s| s.step_name == "z").unwrap();
    assert_eq!(z.status, StepStatus::Pending);
    assert_eq!(z.remaining_deps, 1);

    let tasks = harness.engine.tasks(run.run_id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].attempts_count, 2);
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(harness.queue.live_count("doomed_tasks"), 0);
}

#[tokio::test]
async fn test_scalar_map_source_is_a_type_violation() {
    let harness = Harness::new();
    let workflow = Arc::new(
        WorkflowDefinition::new("bad_map")
            .step(StepDefinition::new("p", constant(json!(7))))
            .step(StepDefinition::new("q", echo()).depends_on(["p"]).initial_tasks(3))
            .build()
            .unwrap(),
    );

    let run = harness.start_and_drive(&workflow, json!({})).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failed_step_name.as_deref(), Some("q"));
    assert!(run.error.unwrap().contains("Type violation"));
    let tasks = harness.engine.tasks(run.run_id).await.unwrap();
    assert!(tasks.iter().all(|t| t.step_name == "p"));
}

#[tokio::test]
async fn test_map_source_of_wrong_length_is_a_size_mismatch() {
    for (label, source) in [("longer", json!([1, 2, 3, 4])), ("shorter", json!([1, 2]))] {
        let harness = Harness::new();
        let workflow = Arc::new(
            WorkflowDefinition::new(format!("{label}_map"))
                .step(StepDefinition::new("p", constant(source.clone())))
                .step(StepDefinition::new("q", echo()).depends_on(["p"]).initial_tasks(3))
                .build()
                .unwrap(),
        );

        let run = harness.start_and_drive(&workflow, json!({})).await;

        assert_eq!(run.status, RunStatus::Failed, "{label}");
        assert_eq!(run.failed_step_name.as_deref(), Some("q"));
        let error = run.error.unwrap();
        assert!(error.contains("Map size mismatch"), "{label}: {error}");
        assert!(!error.contains("Type violation"), "{label}: {error}");
        let tasks = harness.engine.tasks(run.run_id).await.unwrap();
        assert!(tasks.iter().all(|t| t.step_name == "p"), "{label}");
    }
}

#[tokio::test]
async fn test_failed_branch_does_not_cancel_sibling() {
    let harness = Harness::new();
    let workflow = Arc::new(
        WorkflowDefinition::new("siblings")
            .step(
                StepDefinition::new(
                    "broken",
                    handler_fn(|_input| async move { Err(HandlerError::permanent("no")) }),
                ),
            )
            .step(StepDefinition::new("fine", constant(json!(1))))
            .step(StepDefinition::new("after_fine", echo()).depends_on(["fine"]))
            .build()
            .unwrap(),
    );
    let run_id = harness.engine.start(&workflow, json!({})).await.unwrap();
    let worker = harness.engine.worker(workflow.clone());
    for _ in 0..10 {
        worker.process_batch().await.unwrap();
    }

    let run = harness.engine.run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failed_step_name.as_deref(), Some("broken"));

    let steps = harness.engine.step_states(run_id).await.unwrap();
    let status_of = |name: &str| steps.iter().find(|s| s.step_name == name).unwrap().status;
    assert_eq!(status_of("fine"), StepStatus::Completed);
    assert_eq!(status_of("after_fine"), StepStatus::Completed);
    assert_eq!(status_of("broken"), StepStatus::Failed);
}

#[tokio::test]
async fn test_panicking_handler_fails_permanently() {
    let harness = Harness::new();
    let workflow = Arc::new(
        WorkflowDefinition::new("panicky")
            .step(StepDefinition::new(
                "boom",
                handler_fn(|_input| async move {
                    if true {
                        panic!("kaboom");
                    }
                    Ok(json!(null))
                }),
            ))
            .build()
            .unwrap(),
    );

    let run = harness.start_and_drive(&workflow, json!({})).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("kaboom"));
    let tasks = harness.engine.tasks(run.run_id).await.unwrap();
    assert_eq!(tasks[0].attempts_count, 1);
}

#[tokio::test]
async fn test_handler_timeout_is_retried_then_fails() {
    let harness = Harness::new();
    let workflow = Arc::new(
        WorkflowDefinition::new("slow")
            .step(
                StepDefinition::new(
                    "sleepy",
                    handler_fn(|_input| async move {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        Ok(json!(null))
                    }),
                )
                .timeout(Duration::from_millis(20))
                .max_attempts(2),
            )
            .build()
            .unwrap(),
    );

    let run = harness.start_and_drive(&workflow, json!({})).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("timed out"));
    let tasks = harness.engine.tasks(run.run_id).await.unwrap();
    assert_eq!(tasks[0].attempts_count, 2);
}

#[tokio::test]
async fn test_spawned_workers_share_a_map_step() {
    let harness = Harness::new();
    let workflow = Arc::new(
        WorkflowDefinition::new("wide")
            .step(StepDefinition::new("source", constant(json!((0..20).collect::<Vec<_>>()))))
            .step(
                StepDefinition::new(
                    "square",
                    handler_fn(|input| async move {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        let n = input["source"].as_i64().unwrap_or_default();
                        Ok(json!(n * n))
                    }),
                )
                .depends_on(["source"])
                .initial_tasks(20),
            )
            .build()
            .unwrap(),
    );

    let mut handles = Vec::new();
    for _ in 0..3 {
        handles.push(harness.engine.spawn_worker(workflow.clone()).await.unwrap());
    }
    let run_id = harness.engine.start(&workflow, json!({})).await.unwrap();
    let run = harness
        .engine
        .wait_for_run(run_id, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let squares: Vec<i64> = (0..20).map(|n| n * n).collect();
    assert_eq!(run.output, Some(json!({"square": squares})));

    let workers = harness.engine.list_workers().await.unwrap();
    assert_eq!(workers.len(), 3);
    for handle in handles {
        handle.shutdown().await;
    }
    let workers = harness.engine.list_workers().await.unwrap();
    assert!(workers.iter().all(|w| w.is_stopped()));
}
