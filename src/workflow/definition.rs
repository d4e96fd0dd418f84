//! # Workflow Definition
//!
//! Builder for declaring steps, their dependencies and metadata. `build` validates the
//! whole declaration and produces an immutable [`Workflow`] whose steps carry their
//! handlers, resolved dependencies and dependents, in topological order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::dag;
use crate::orchestration::StepHandler;

/// Key under which the run input appears in every step input; not usable as a step name.
pub const RUN_INPUT_KEY: &str = "run";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("Workflow '{0}' declares no steps")]
    EmptyWorkflow(String),

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Duplicate step: {0}")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on undeclared step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("Step '{step}' must declare at least one initial task")]
    InvalidInitialTasks { step: String },

    #[error("Step '{step}' must allow at least one attempt")]
    InvalidMaxAttempts { step: String },

    #[error("Step '{step}' must have a positive timeout")]
    InvalidTimeout { step: String },

    #[error("Map step '{step}' must depend on exactly one step, found {found}")]
    MapStepDependencies { step: String, found: usize },
}

/// Metadata applied to steps that leave it unset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDefaults {
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

/// One step declaration
pub struct StepDefinition {
    name: String,
    handler: Arc<dyn StepHandler>,
    depends_on: Vec<String>,
    initial_tasks: u32,
    timeout: Option<Duration>,
    max_attempts: Option<u32>,
}

impl StepDefinition {
    pub fn new<H: StepHandler + 'static>(name: impl Into<String>, handler: H) -> Self {
        Self::with_handler(name, Arc::new(handler))
    }

    /// Share one handler instance between steps or workflows
    pub fn with_handler(name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            depends_on: Vec::new(),
            initial_tasks: 1,
            timeout: None,
            max_attempts: None,
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        // Repeats collapse to the first occurrence
        for dependency in dependencies {
            let dependency = dependency.into();
            if !self.depends_on.contains(&dependency) {
                self.depends_on.push(dependency);
            }
        }
        self
    }

    /// Values above one make this a map step over its single dependency's array output
    pub fn initial_tasks(mut self, initial_tasks: u32) -> Self {
        self.initial_tasks = initial_tasks;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("initial_tasks", &self.initial_tasks)
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Ordered step declarations for one workflow
#[derive(Debug)]
pub struct WorkflowDefinition {
    name: String,
    steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Validate with built-in defaults (30s timeout, 3 attempts)
    pub fn build(self) -> Result<Workflow, DefinitionError> {
        self.build_with(StepDefaults::default())
    }

    /// Validate, filling unset step metadata from `defaults`
    pub fn build_with(self, defaults: StepDefaults) -> Result<Workflow, DefinitionError> {
        validate_workflow_name(&self.name)?;
        if self.steps.is_empty() {
            return Err(DefinitionError::EmptyWorkflow(self.name));
        }

        for step in &self.steps {
            validate_step_name(&step.name)?;
            if step.initial_tasks == 0 {
                return Err(DefinitionError::InvalidInitialTasks {
                    step: step.name.clone(),
                });
            }
            if step.max_attempts.unwrap_or(defaults.max_attempts) == 0 {
                return Err(DefinitionError::InvalidMaxAttempts {
                    step: step.name.clone(),
                });
            }
            if step.timeout.unwrap_or(defaults.timeout).is_zero() {
                return Err(DefinitionError::InvalidTimeout {
                    step: step.name.clone(),
                });
            }
        }

        let graph: Vec<(&str, Vec<&str>)> = self
            .steps
            .iter()
            .map(|step| {
                (
                    step.name.as_str(),
                    step.depends_on.iter().map(String::as_str).collect(),
                )
            })
            .collect();
        let order = dag::topological_order(&graph)?;

        for step in &self.steps {
            if step.initial_tasks > 1 && step.depends_on.len() != 1 {
                return Err(DefinitionError::MapStepDependencies {
                    step: step.name.clone(),
                    found: step.depends_on.len(),
                });
            }
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for position in &order {
            let step = &self.steps[*position];
            for dependency in &step.depends_on {
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(step.name.clone());
            }
        }

        let mut slots: Vec<Option<StepDefinition>> = self.steps.into_iter().map(Some).collect();
        let mut steps = Vec::with_capacity(slots.len());
        for position in order {
            let Some(definition) = slots[position].take() else {
                continue;
            };
            let step_dependents = dependents.remove(&definition.name).unwrap_or_default();
            steps.push(WorkflowStep {
                timeout: definition.timeout.unwrap_or(defaults.timeout),
                max_attempts: definition.max_attempts.unwrap_or(defaults.max_attempts),
                initial_tasks: definition.initial_tasks,
                dependencies: definition.depends_on,
                dependents: step_dependents,
                handler: definition.handler,
                name: definition.name,
            });
        }

        let index = steps
            .iter()
            .enumerate()
            .map(|(position, step)| (step.name.clone(), position))
            .collect();

        Ok(Workflow {
            name: self.name,
            steps,
            index,
        })
    }
}

fn validate_workflow_name(name: &str) -> Result<(), DefinitionError> {
    // Workflow names become part of queue names
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DefinitionError::InvalidName {
            name: name.to_string(),
            reason: "workflow names must be non-empty ASCII letters, digits or underscores"
                .to_string(),
        });
    }
    Ok(())
}

fn validate_step_name(name: &str) -> Result<(), DefinitionError> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(DefinitionError::InvalidName {
            name: name.to_string(),
            reason: "step names must be non-empty and contain no whitespace".to_string(),
        });
    }
    if name == RUN_INPUT_KEY {
        return Err(DefinitionError::InvalidName {
            name: name.to_string(),
            reason: format!("'{RUN_INPUT_KEY}' is reserved for the run input"),
        });
    }
    Ok(())
}

/// A validated step with resolved metadata
pub struct WorkflowStep {
    name: String,
    handler: Arc<dyn StepHandler>,
    dependencies: Vec<String>,
    dependents: Vec<String>,
    initial_tasks: u32,
    timeout: Duration,
    max_attempts: u32,
}

impl WorkflowStep {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &Arc<dyn StepHandler> {
        &self.handler
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn dependents(&self) -> &[String] {
        &self.dependents
    }

    pub fn initial_tasks(&self) -> u32 {
        self.initial_tasks
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_root(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn is_leaf(&self) -> bool {
        self.dependents.is_empty()
    }

    pub fn is_map(&self) -> bool {
        self.initial_tasks > 1
    }
}

impl fmt::Debug for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowStep")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("dependents", &self.dependents)
            .field("initial_tasks", &self.initial_tasks)
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Immutable, validated DAG of steps
#[derive(Debug)]
pub struct Workflow {
    name: String,
    /// Topological order
    steps: Vec<WorkflowStep>,
    index: HashMap<String, usize>,
}

impl Workflow {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in topological order
    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn step(&self, name: &str) -> Option<&WorkflowStep> {
        self.index.get(name).map(|&position| &self.steps[position])
    }

    pub fn topological_order(&self) -> Vec<&str> {
        self.steps.iter().map(WorkflowStep::name).collect()
    }

    pub fn root_steps(&self) -> Vec<&WorkflowStep> {
        self.steps.iter().filter(|step| step.is_root()).collect()
    }

    pub fn leaf_steps(&self) -> Vec<&WorkflowStep> {
        self.steps.iter().filter(|step| step.is_leaf()).collect()
    }

    /// Empty for unknown steps
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.step(name).map(WorkflowStep::dependencies).unwrap_or(&[])
    }

    /// Empty for unknown steps
    pub fn dependents(&self, name: &str) -> &[String] {
        self.step(name).map(WorkflowStep::dependents).unwrap_or(&[])
    }
}
