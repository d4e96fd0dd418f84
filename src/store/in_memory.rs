//! # In-Memory Workflow Store
//!
//! All state sits behind one [`parking_lot::Mutex`]; holding it is the transaction. Queue
//! effects go to an [`InMemoryQueue`] through its synchronous API while the lock is held,
//! after the queue's existence has been checked, so no operation is left half-applied.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    decide_claim, exhausted_error, CascadeReport, ClaimDecision, ClaimOutcome, ClaimedTask,
    CompletionOutcome, FailureOutcome, SkipReason, StepInputs, StoreError, StoreResult,
    WorkflowStore,
};
use crate::error::MapStepError;
use crate::messaging::{InMemoryQueue, MessagingError, TaskMessage};
use crate::models::{Run, StepDependency, StepState, Task, Worker};
use crate::orchestration::backoff::{RetryDecision, RetryPolicy};
use crate::state_machine::{RunStatus, StepStatus, TaskStatus};
use crate::workflow::payload::{
    aggregate_step_output, merge_leaf_outputs, validate_map_source, MapSourceError,
};
use crate::workflow::Workflow;

type StepKey = (Uuid, String);
type TaskKey = (Uuid, String, i32);

fn task_key(message: &TaskMessage) -> TaskKey {
    (message.run_id, message.step_name.clone(), message.task_index)
}

#[derive(Debug, Default)]
struct StoreState {
    runs: HashMap<Uuid, Run>,
    steps: BTreeMap<StepKey, StepState>,
    dependencies: HashMap<Uuid, Vec<StepDependency>>,
    tasks: BTreeMap<TaskKey, Task>,
    workers: BTreeMap<String, Worker>,
}

impl StoreState {
    fn run_mut(&mut self, run_id: Uuid) -> StoreResult<&mut Run> {
        self.runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))
    }

    fn step(&self, run_id: Uuid, step_name: &str) -> StoreResult<&StepState> {
        self.steps
            .get(&(run_id, step_name.to_string()))
            .ok_or_else(|| StoreError::StepNotFound {
                run_id,
                step_name: step_name.to_string(),
            })
    }

    fn step_mut(&mut self, run_id: Uuid, step_name: &str) -> StoreResult<&mut StepState> {
        self.steps
            .get_mut(&(run_id, step_name.to_string()))
            .ok_or_else(|| StoreError::StepNotFound {
                run_id,
                step_name: step_name.to_string(),
            })
    }

    fn run_steps(&self, run_id: Uuid) -> impl Iterator<Item = &StepState> {
        self.steps
            .range((run_id, String::new())..)
            .take_while(move |((id, _), _)| *id == run_id)
            .map(|(_, step)| step)
    }

    fn step_tasks<'a>(&'a self, run_id: Uuid, step_name: &str) -> impl Iterator<Item = &'a Task> {
        let name = step_name.to_string();
        self.tasks
            .range((run_id, name.clone(), i32::MIN)..=(run_id, name, i32::MAX))
            .map(|(_, task)| task)
    }

    fn run_dependencies(&self, run_id: Uuid) -> &[StepDependency] {
        self.dependencies
            .get(&run_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn step_output(&self, step: &StepState) -> Value {
        let outputs = self
            .step_tasks(step.run_id, &step.step_name)
            .filter_map(|task| task.output.clone().map(|output| (task.task_index, output)))
            .collect();
        aggregate_step_output(usize::try_from(step.initial_tasks).unwrap_or(1), outputs)
    }

    /// Aggregated outputs of `step_name`'s dependencies, ordered by name
    fn dependency_outputs(&self, run_id: Uuid, step_name: &str) -> StoreResult<Vec<(String, Value)>> {
        let mut upstream: Vec<&str> = self
            .run_dependencies(run_id)
            .iter()
            .filter(|dep| dep.step_name == step_name)
            .map(|dep| dep.depends_on_step_name.as_str())
            .collect();
        upstream.sort_unstable();
        upstream
            .into_iter()
            .map(|name| {
                let step = self.step(run_id, name)?;
                Ok((name.to_string(), self.step_output(step)))
            })
            .collect()
    }

    fn dependents(&self, run_id: Uuid, step_name: &str) -> Vec<String> {
        self.run_dependencies(run_id)
            .iter()
            .filter(|dep| dep.depends_on_step_name == step_name)
            .map(|dep| dep.step_name.clone())
            .collect()
    }

    fn leaf_output(&self, run_id: Uuid) -> Value {
        let deps = self.run_dependencies(run_id);
        merge_leaf_outputs(
            self.run_steps(run_id)
                .filter(|step| {
                    !deps
                        .iter()
                        .any(|dep| dep.depends_on_step_name == step.step_name)
                })
                .map(|step| (step.step_name.clone(), self.step_output(step))),
        )
    }

    /// Fail the step and, if still running, the run. Returns whether the run transitioned.
    fn fail_step_and_run(
        &mut self,
        run_id: Uuid,
        step_name: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let step = self.step_mut(run_id, step_name)?;
        if !step.status.is_terminal() {
            step.status = StepStatus::Failed;
            step.error = Some(error.to_string());
            step.failed_at = Some(now);
        }

        let run = self.run_mut(run_id)?;
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        run.status = RunStatus::Failed;
        run.error = Some(error.to_string());
        run.failed_step_name = Some(step_name.to_string());
        run.failed_at = Some(now);
        Ok(true)
    }
}

/// Store for tests and single-process embedding
///
/// ```rust
/// use std::sync::Arc;
/// use tasker_dag::messaging::InMemoryQueue;
/// use tasker_dag::store::InMemoryWorkflowStore;
///
/// let queue = Arc::new(InMemoryQueue::new());
/// let store = InMemoryWorkflowStore::new(queue.clone());
/// assert!(Arc::ptr_eq(store.queue(), &queue));
/// ```
#[derive(Debug)]
pub struct InMemoryWorkflowStore {
    state: Mutex<StoreState>,
    queue: Arc<InMemoryQueue>,
}

impl InMemoryWorkflowStore {
    pub fn new(queue: Arc<InMemoryQueue>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            queue,
        }
    }

    pub fn queue(&self) -> &Arc<InMemoryQueue> {
        &self.queue
    }

    fn require_queue(&self, queue_name: &str) -> StoreResult<()> {
        if self.queue.has_queue(queue_name) {
            Ok(())
        } else {
            Err(MessagingError::queue_not_found(queue_name).into())
        }
    }

    fn publish_task(
        &self,
        state: &mut StoreState,
        run_id: Uuid,
        step_name: &str,
        task_index: i32,
        queue_name: &str,
    ) -> StoreResult<()> {
        let mut task = Task::new(run_id, step_name, task_index);
        let msg_id = self
            .queue
            .enqueue(queue_name, task.message().to_json()?, Duration::ZERO)?;
        task.queue_message_id = Some(msg_id);
        state
            .tasks
            .insert((run_id, step_name.to_string(), task_index), task);
        Ok(())
    }

    /// Start a step whose dependencies are all complete.
    ///
    /// A map step whose source cannot be split fails itself and the run instead.
    fn start_step(
        &self,
        state: &mut StoreState,
        run_id: Uuid,
        step_name: &str,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<MapStepError>> {
        let step = state.step(run_id, step_name)?;
        let initial_tasks = step.initial_tasks;

        if step.is_map() {
            let sources = state.dependency_outputs(run_id, step_name)?;
            let expected = usize::try_from(initial_tasks).unwrap_or(0);
            let check = match sources.as_slice() {
                [(source, output)] => validate_map_source(source, output, expected),
                other => Err(MapSourceError::SourceCount(other.len())),
            };
            if let Err(reason) = check {
                let violation = MapStepError::from_source(run_id, step_name, reason);
                state.fail_step_and_run(run_id, step_name, &violation.to_string(), now)?;
                return Ok(Some(violation));
            }
        }

        let step = state.step_mut(run_id, step_name)?;
        step.status = StepStatus::Started;
        step.started_at = Some(now);
        for task_index in 0..initial_tasks {
            self.publish_task(state, run_id, step_name, task_index, queue_name)?;
        }
        Ok(None)
    }

    fn complete_locked(
        &self,
        state: &mut StoreState,
        message: &TaskMessage,
        attempt: i32,
        output: Value,
        queue_name: &str,
    ) -> StoreResult<CompletionOutcome> {
        let run_id = message.run_id;
        let step_name = message.step_name.as_str();
        let now = Utc::now();
        state.run_mut(run_id)?;

        let task = state
            .tasks
            .get_mut(&task_key(message))
            .ok_or_else(|| StoreError::TaskNotFound(message.clone()))?;
        if task.status != TaskStatus::Started {
            return Ok(CompletionOutcome::AlreadyFinalized {
                status: task.status,
            });
        }
        if task.attempts_count != attempt {
            return Ok(CompletionOutcome::Superseded {
                current_attempt: task.attempts_count,
            });
        }
        task.status = TaskStatus::Completed;
        task.output = Some(output);
        task.completed_at = Some(now);
        if let Some(msg_id) = task.queue_message_id {
            self.queue.archive_now(queue_name, msg_id)?;
        }

        let step = state.step_mut(run_id, step_name)?;
        step.remaining_tasks = step.remaining_tasks.checked_sub(1).ok_or_else(|| {
            StoreError::Inconsistent(format!("remaining_tasks underflow for {message}"))
        })?;
        let step_completed = step.remaining_tasks == 0 && step.status == StepStatus::Started;

        let mut report = CascadeReport {
            step_completed,
            started_steps: Vec::new(),
            run_status: RunStatus::Running,
            map_violations: Vec::new(),
        };

        if step_completed {
            step.status = StepStatus::Completed;
            step.completed_at = Some(now);

            for dependent in state.dependents(run_id, step_name) {
                let downstream = state.step_mut(run_id, &dependent)?;
                downstream.remaining_deps =
                    downstream.remaining_deps.checked_sub(1).ok_or_else(|| {
                        StoreError::Inconsistent(format!(
                            "remaining_deps underflow for {run_id}/{dependent}"
                        ))
                    })?;
                if downstream.remaining_deps > 0 || downstream.status != StepStatus::Pending {
                    continue;
                }
                match self.start_step(state, run_id, &dependent, queue_name, now)? {
                    Some(violation) => report.map_violations.push(violation),
                    None => report.started_steps.push(dependent),
                }
            }

            let run = state.run_mut(run_id)?;
            run.remaining_steps = run.remaining_steps.checked_sub(1).ok_or_else(|| {
                StoreError::Inconsistent(format!("remaining_steps underflow for run {run_id}"))
            })?;
            if run.remaining_steps == 0 && run.status == RunStatus::Running {
                let output = state.leaf_output(run_id);
                let run = state.run_mut(run_id)?;
                run.status = RunStatus::Completed;
                run.output = Some(output);
                run.completed_at = Some(now);
            }
        }

        report.run_status = state.run_mut(run_id)?.status;
        Ok(CompletionOutcome::Completed(report))
    }

    #[allow(clippy::too_many_arguments)]
    fn fail_locked(
        &self,
        state: &mut StoreState,
        message: &TaskMessage,
        attempt: i32,
        error: &str,
        permanent: bool,
        policy: &RetryPolicy,
        queue_name: &str,
    ) -> StoreResult<FailureOutcome> {
        let now = Utc::now();
        state.run_mut(message.run_id)?;
        let max_attempts = state.step(message.run_id, &message.step_name)?.max_attempts;

        let task = state
            .tasks
            .get_mut(&task_key(message))
            .ok_or_else(|| StoreError::TaskNotFound(message.clone()))?;
        if task.status != TaskStatus::Started {
            return Ok(FailureOutcome::AlreadyFinalized {
                status: task.status,
            });
        }
        if task.attempts_count != attempt {
            return Ok(FailureOutcome::Superseded {
                current_attempt: task.attempts_count,
            });
        }
        let attempts_count = task.attempts_count;
        task.error = Some(error.to_string());

        let decision = policy.decide(
            u32::try_from(attempts_count).unwrap_or(0),
            u32::try_from(max_attempts).unwrap_or(0),
            permanent,
        );
        match decision {
            RetryDecision::Retry { delay } => {
                task.status = TaskStatus::Queued;
                let reused = match task.queue_message_id {
                    Some(msg_id) => self.queue.set_visibility(queue_name, msg_id, delay)?,
                    None => false,
                };
                if !reused {
                    let msg_id =
                        self.queue
                            .enqueue(queue_name, message.to_json()?, delay)?;
                    task.queue_message_id = Some(msg_id);
                }
                Ok(FailureOutcome::Retrying {
                    attempts_count,
                    delay,
                })
            }
            RetryDecision::Fail => {
                task.status = TaskStatus::Failed;
                task.failed_at = Some(now);
                if let Some(msg_id) = task.queue_message_id {
                    self.queue.archive_now(queue_name, msg_id)?;
                }
                let run_failed =
                    state.fail_step_and_run(message.run_id, &message.step_name, error, now)?;
                Ok(FailureOutcome::Failed {
                    attempts_count,
                    run_failed,
                })
            }
        }
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    #[instrument(skip(self, workflow, input), fields(workflow = %workflow.name()))]
    async fn create_run(
        &self,
        workflow: &Workflow,
        input: Value,
        queue_name: &str,
    ) -> StoreResult<Run> {
        self.require_queue(queue_name)?;
        let step_count = i32::try_from(workflow.step_count())
            .map_err(|_| StoreError::Inconsistent("too many steps".to_string()))?;
        let run = Run::new(workflow.name(), input, step_count);
        let run_id = run.run_id;

        let mut state = self.state.lock();
        let mut edges = Vec::new();
        for step in workflow.steps() {
            state.steps.insert(
                (run_id, step.name().to_string()),
                StepState::for_step(run_id, step),
            );
            edges.extend(
                step.dependencies()
                    .iter()
                    .map(|upstream| StepDependency::new(run_id, step.name(), upstream.as_str())),
            );
        }
        state.dependencies.insert(run_id, edges);
        state.runs.insert(run_id, run.clone());

        for step in workflow.root_steps() {
            let initial_tasks = i32::try_from(step.initial_tasks()).unwrap_or(i32::MAX);
            for task_index in 0..initial_tasks {
                self.publish_task(&mut state, run_id, step.name(), task_index, queue_name)?;
            }
        }
        debug!(run_id = %run_id, "Run created");
        Ok(run)
    }

    async fn claim_task(
        &self,
        message: &TaskMessage,
        msg_id: i64,
        worker_id: &str,
        queue_name: &str,
    ) -> StoreResult<ClaimOutcome> {
        self.require_queue(queue_name)?;
        let now = Utc::now();
        let mut state = self.state.lock();

        let Some(task) = state.tasks.get(&task_key(message)) else {
            self.queue.archive_now(queue_name, msg_id)?;
            return Ok(ClaimOutcome::Skipped(SkipReason::UnknownTask));
        };
        let step = state.step(message.run_id, &message.step_name)?.clone();

        match decide_claim(task, &step, msg_id, now) {
            ClaimDecision::Claim { reclaimed } => {
                let task = state
                    .tasks
                    .get_mut(&task_key(message))
                    .ok_or_else(|| StoreError::TaskNotFound(message.clone()))?;
                task.status = TaskStatus::Started;
                task.attempts_count += 1;
                task.last_worker_id = Some(worker_id.to_string());
                task.started_at = Some(now);
                task.queue_message_id = Some(msg_id);
                Ok(ClaimOutcome::Claimed(ClaimedTask {
                    task: task.clone(),
                    step,
                    reclaimed,
                }))
            }
            ClaimDecision::Skip(reason) => {
                if reason.archives_message() {
                    self.queue.archive_now(queue_name, msg_id)?;
                }
                Ok(ClaimOutcome::Skipped(reason))
            }
            ClaimDecision::Exhaust => {
                let attempt = task.attempts_count;
                let error = exhausted_error(attempt);
                self.fail_locked(
                    &mut state,
                    message,
                    attempt,
                    &error,
                    true,
                    &RetryPolicy::default(),
                    queue_name,
                )?;
                Ok(ClaimOutcome::Skipped(SkipReason::AttemptsExhausted))
            }
        }
    }

    async fn step_inputs(&self, run_id: Uuid, step_name: &str) -> StoreResult<StepInputs> {
        let state = self.state.lock();
        let run = state
            .runs
            .get(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        let step = state.step(run_id, step_name)?;
        Ok(StepInputs {
            run_id,
            step_name: step_name.to_string(),
            run_input: run.input.clone(),
            initial_tasks: step.initial_tasks,
            dependency_outputs: state.dependency_outputs(run_id, step_name)?,
        })
    }

    #[instrument(skip(self, output), fields(task = %message))]
    async fn complete_task(
        &self,
        message: &TaskMessage,
        attempt: i32,
        output: Value,
        queue_name: &str,
    ) -> StoreResult<CompletionOutcome> {
        self.require_queue(queue_name)?;
        let mut state = self.state.lock();
        self.complete_locked(&mut state, message, attempt, output, queue_name)
    }

    #[instrument(skip(self, policy), fields(task = %message))]
    async fn fail_task(
        &self,
        message: &TaskMessage,
        attempt: i32,
        error: &str,
        permanent: bool,
        policy: &RetryPolicy,
        queue_name: &str,
    ) -> StoreResult<FailureOutcome> {
        self.require_queue(queue_name)?;
        let mut state = self.state.lock();
        self.fail_locked(&mut state, message, attempt, error, permanent, policy, queue_name)
    }

    async fn run(&self, run_id: Uuid) -> StoreResult<Option<Run>> {
        Ok(self.state.lock().runs.get(&run_id).cloned())
    }

    async fn step_states(&self, run_id: Uuid) -> StoreResult<Vec<StepState>> {
        Ok(self.state.lock().run_steps(run_id).cloned().collect())
    }

    async fn step_dependencies(&self, run_id: Uuid) -> StoreResult<Vec<StepDependency>> {
        let state = self.state.lock();
        let mut edges = state.run_dependencies(run_id).to_vec();
        edges.sort_by(|a, b| {
            (&a.step_name, &a.depends_on_step_name).cmp(&(&b.step_name, &b.depends_on_step_name))
        });
        Ok(edges)
    }

    async fn tasks(&self, run_id: Uuid) -> StoreResult<Vec<Task>> {
        let state = self.state.lock();
        Ok(state
            .tasks
            .range((run_id, String::new(), i32::MIN)..)
            .take_while(|((id, _, _), _)| *id == run_id)
            .map(|(_, task)| task.clone())
            .collect())
    }

    async fn record_heartbeat(&self, worker_id: &str, queue_name: &str) -> StoreResult<()> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let worker = state
            .workers
            .entry(worker_id.to_string())
            .or_insert_with(|| Worker {
                worker_id: worker_id.to_string(),
                queue_name: queue_name.to_string(),
                started_at: now,
                last_heartbeat_at: now,
                stopped_at: None,
            });
        worker.queue_name = queue_name.to_string();
        worker.last_heartbeat_at = now;
        worker.stopped_at = None;
        Ok(())
    }

    async fn mark_worker_stopped(&self, worker_id: &str) -> StoreResult<()> {
        if let Some(worker) = self.state.lock().workers.get_mut(worker_id) {
            worker.stopped_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn workers(&self) -> StoreResult<Vec<Worker>> {
        Ok(self.state.lock().workers.values().cloned().collect())
    }
}
