mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::echo;
use proptest::prelude::*;
use serde_json::{json, Value};
use tasker_dag::messaging::InMemoryQueue;
use tasker_dag::orchestration::RetryPolicy;
use tasker_dag::state_machine::{RunStatus, StepStatus};
use tasker_dag::store::{ClaimOutcome, InMemoryWorkflowStore, WorkflowStore};
use tasker_dag::workflow::payload::aggregate_step_output;
use tasker_dag::workflow::{StepDefinition, Workflow, WorkflowDefinition};

const QUEUE: &str = "prop_tasks";

/// Step count, one flag per `(later, earlier)` pair, and a completion-order seed per step
fn dag_strategy() -> impl Strategy<Value = (usize, Vec<bool>, Vec<usize>)> {
    (2usize..8).prop_flat_map(|n| {
        (
            Just(n),
            prop::collection::vec(any::<bool>(), n * (n - 1) / 2),
            prop::collection::vec(any::<usize>(), n),
        )
    })
}

fn build_workflow(n: usize, edges: &[bool]) -> Workflow {
    let mut definition = WorkflowDefinition::new("prop");
    let mut flags = edges.iter();
    for i in 0..n {
        let deps: Vec<String> = (0..i)
            .filter(|_| flags.next().copied().unwrap_or(false))
            .map(|j| format!("s{j}"))
            .collect();
        definition = definition.step(StepDefinition::new(format!("s{i}"), echo()).depends_on(deps));
    }
    definition.build().unwrap()
}

/// Every step's counter matches its incomplete upstream steps, and only steps with
/// no outstanding dependencies have left `Pending`
async fn assert_counters_consistent(store: &InMemoryWorkflowStore, run_id: uuid::Uuid) {
    let steps = store.step_states(run_id).await.unwrap();
    let status: HashMap<_, _> = steps.iter().map(|s| (s.step_name.clone(), s.status)).collect();
    let edges = store.step_dependencies(run_id).await.unwrap();

    for step in &steps {
        let incomplete = edges
            .iter()
            .filter(|e| e.step_name == step.step_name)
            .filter(|e| status[&e.depends_on_step_name] != StepStatus::Completed)
            .count();
        assert_eq!(
            usize::try_from(step.remaining_deps).unwrap(),
            incomplete,
            "remaining_deps of {}",
            step.step_name
        );
        assert_eq!(
            step.status != StepStatus::Pending,
            step.remaining_deps == 0,
            "readiness of {}",
            step.step_name
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_dags_complete_with_consistent_counters((n, edges, picks) in dag_strategy()) {
        tokio_test::block_on(async {
            let queue = Arc::new(InMemoryQueue::new());
            queue.create_queue(QUEUE);
            let store = InMemoryWorkflowStore::new(queue.clone());
            let workflow = build_workflow(n, &edges);
            let run = store.create_run(&workflow, json!({}), QUEUE).await.unwrap();
            assert_counters_consistent(&store, run.run_id).await;

            for pick in picks.iter().cycle().take(n) {
                // Zero visibility leaves unpicked messages readable on the next round
                let visible = queue.read_now(QUEUE, 64, Duration::ZERO).unwrap();
                assert!(!visible.is_empty(), "run stalled with steps outstanding");
                let delivery = visible[pick % visible.len()].task_message().unwrap();

                let claimed = store
                    .claim_task(&delivery.message, delivery.msg_id, "prop", QUEUE)
                    .await
                    .unwrap();
                let ClaimOutcome::Claimed(claimed) = claimed else {
                    panic!("expected a claim");
                };
                store
                    .complete_task(
                        &delivery.message,
                        claimed.task.attempts_count,
                        json!(delivery.message.step_name),
                        QUEUE,
                    )
                    .await
                    .unwrap();
                assert_counters_consistent(&store, run.run_id).await;
            }

            let run = store.run(run.run_id).await.unwrap().unwrap();
            assert_eq!(run.status, RunStatus::Completed);
            assert_eq!(run.remaining_steps, 0);
            assert_eq!(queue.live_count(QUEUE), 0);

            let output = run.output.unwrap();
            for step in workflow.leaf_steps() {
                assert_eq!(output[step.name()], json!(step.name()));
            }
        });
    }

    #[test]
    fn retry_delays_grow_and_stay_capped(
        base_ms in 1u64..2_000,
        max_ms in 1u64..600_000,
        attempts in 0u32..64,
    ) {
        let policy = RetryPolicy::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms));
        let delay = policy.delay_for(attempts);
        prop_assert!(delay <= Duration::from_millis(max_ms));
        prop_assert!(delay <= policy.delay_for(attempts + 1));
    }

    #[test]
    fn map_output_is_ordered_by_task_index(
        shuffled in Just((0..12i32).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let outputs: Vec<(i32, Value)> = shuffled.iter().map(|i| (*i, json!(i * 3))).collect();
        let aggregated = aggregate_step_output(12, outputs);
        let expected: Vec<Value> = (0..12).map(|i| json!(i * 3)).collect();
        prop_assert_eq!(aggregated, Value::Array(expected));
    }
}
