//! Saga definitions, the step DAG, and saga instance state (spec.md §4.5,
//! §3). A `SagaDefinition` is built once via `SagaBuilder` and executed
//! many times against different `SagaInstance`s.

use crate::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub type StepFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>;
pub type StepAction = Arc<dyn Fn(StepContext) -> StepFuture + Send + Sync>;

/// Snapshot handed to a step or compensation action: prior results are a
/// read-only copy, not a live view, per spec.md §4.5 step 6.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub saga_id: String,
    pub input: serde_json::Value,
    pub prior_results: HashMap<String, serde_json::Value>,
    /// Set only when invoking a compensation action: the error that
    /// triggered compensation.
    pub cause: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompensationPolicy {
    Auto,
    Manual,
    Skip,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct Step {
    pub id: String,
    pub depends_on: Vec<String>,
    pub timeout: Option<Duration>,
    pub action: StepAction,
    pub compensation: Option<StepAction>,
    pub retry: RetryConfig,
}

impl Step {
    pub fn new(id: impl Into<String>, action: StepAction) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            timeout: None,
            action,
            compensation: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_compensation(mut self, compensation: StepAction) -> Self {
        self.compensation = Some(compensation);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

pub struct SagaDefinition {
    pub id: String,
    pub name: String,
    pub steps: Vec<Step>,
    pub timeout: Option<Duration>,
    pub default_step_timeout: Duration,
    pub compensation_policy: CompensationPolicy,
}

impl SagaDefinition {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Kahn's algorithm layering: each layer is the set of steps whose
    /// dependencies are all satisfied by prior layers, sorted by id for
    /// determinism (spec.md §4.5 step 4).
    pub fn layers(&self) -> Vec<Vec<String>> {
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            indegree.entry(&step.id).or_insert(0);
            for dep in &step.depends_on {
                *indegree.entry(&step.id).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(&step.id);
            }
        }

        let mut layers = Vec::new();
        let mut remaining = indegree.clone();
        while !remaining.is_empty() {
            let mut ready: Vec<&str> = remaining
                .iter()
                .filter(|(_, &deg)| deg == 0)
                .map(|(&id, _)| id)
                .collect();
            if ready.is_empty() {
                // Shouldn't happen for a validated (acyclic) definition.
                break;
            }
            ready.sort_unstable();
            for id in &ready {
                remaining.remove(id);
                if let Some(succ) = dependents.get(id) {
                    for s in succ {
                        if let Some(d) = remaining.get_mut(s) {
                            *d = d.saturating_sub(1);
                        }
                    }
                }
            }
            layers.push(ready.into_iter().map(String::from).collect());
        }
        layers
    }
}

/// Validates and assembles a `SagaDefinition`: unique step ids, every
/// `depends_on` reference resolves, and the dependency graph is acyclic.
pub struct SagaBuilder {
    id: String,
    name: String,
    steps: Vec<Step>,
    timeout: Option<Duration>,
    default_step_timeout: Duration,
    compensation_policy: CompensationPolicy,
}

impl SagaBuilder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps: Vec::new(),
            timeout: None,
            default_step_timeout: Duration::from_secs(30),
            compensation_policy: CompensationPolicy::Auto,
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    pub fn compensation_policy(mut self, policy: CompensationPolicy) -> Self {
        self.compensation_policy = policy;
        self
    }

    pub fn build(self) -> Result<SagaDefinition> {
        if self.steps.is_empty() {
            return Err(EngineError::InvalidArgument("saga must have at least one step".to_string()));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.clone()) {
                return Err(EngineError::InvalidArgument(format!("duplicate step id {}", step.id)));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep) {
                    return Err(EngineError::InvalidArgument(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    )));
                }
            }
        }
        let definition = SagaDefinition {
            id: self.id,
            name: self.name,
            steps: self.steps,
            timeout: self.timeout,
            default_step_timeout: self.default_step_timeout,
            compensation_policy: self.compensation_policy,
        };
        let total: usize = definition.steps.len();
        let layered: usize = definition.layers().iter().map(|l| l.len()).sum();
        if layered != total {
            return Err(EngineError::InvalidArgument("saga step graph has a cycle".to_string()));
        }
        Ok(definition)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaState {
    Created,
    Running,
    Completed,
    Compensating,
    PendingCompensation,
    Recovering,
    Compensated,
    CompensationFailed,
}

impl SagaState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Completed | SagaState::Compensated | SagaState::CompensationFailed)
    }

    fn can_transition_to(&self, next: SagaState) -> bool {
        if *self == next {
            return true;
        }
        use SagaState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Completed)
                | (Running, Compensating)
                | (Running, PendingCompensation)
                | (Running, Recovering)
                | (Compensating, Compensated)
                | (Compensating, CompensationFailed)
                | (PendingCompensation, Compensating)
                | (Recovering, Running)
                | (Recovering, Compensating)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    pub id: String,
    pub definition_id: String,
    pub input: serde_json::Value,
    pub state: SagaState,
    pub completed_steps: Vec<String>,
    /// Step ids that have run their compensation, in the order they
    /// completed it (reverse-topological, not declaration order).
    pub compensated_steps: Vec<String>,
    pub step_results: HashMap<String, serde_json::Value>,
    pub failed_step: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaInstance {
    pub fn new(id: impl Into<String>, definition_id: impl Into<String>, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            definition_id: definition_id.into(),
            input,
            state: SagaState::Created,
            completed_steps: Vec::new(),
            compensated_steps: Vec::new(),
            step_results: HashMap::new(),
            failed_step: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition_to(&mut self, next: SagaState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: format!("{:?}", self.state),
                to: format!("{:?}", next),
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_step_completed(&mut self, step_id: &str, result: serde_json::Value) {
        if !self.completed_steps.iter().any(|s| s == step_id) {
            self.completed_steps.push(step_id.to_string());
        }
        self.step_results.insert(step_id.to_string(), result);
        self.updated_at = Utc::now();
    }

    pub fn mark_step_compensated(&mut self, step_id: &str) {
        if !self.compensated_steps.iter().any(|s| s == step_id) {
            self.compensated_steps.push(step_id.to_string());
        }
        self.updated_at = Utc::now();
    }

    pub fn record_failure(&mut self, step_id: impl Into<String>, reason: impl Into<String>) {
        self.failed_step = Some(step_id.into());
        self.failure_reason = Some(reason.into());
        self.updated_at = Utc::now();
    }

    pub fn snapshot_prior_results(&self) -> HashMap<String, serde_json::Value> {
        self.step_results.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_action() -> StepAction {
        Arc::new(|_ctx| Box::pin(async { Ok(serde_json::json!({})) }))
    }

    #[test]
    fn layers_respect_dependencies_and_sort_ties_by_id() {
        let def = SagaBuilder::new("d1", "test")
            .step(Step::new("c", noop_action()).depends_on(["a", "b"]))
            .step(Step::new("b", noop_action()).depends_on(["a"]))
            .step(Step::new("a", noop_action()))
            .build()
            .unwrap();
        let layers = def.layers();
        assert_eq!(layers, vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]);
    }

    #[test]
    fn independent_steps_share_a_layer() {
        let def = SagaBuilder::new("d1", "test")
            .step(Step::new("a", noop_action()))
            .step(Step::new("b", noop_action()))
            .build()
            .unwrap();
        assert_eq!(def.layers(), vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let result = SagaBuilder::new("d1", "test")
            .step(Step::new("a", noop_action()).depends_on(["missing"]))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn cycle_is_rejected() {
        let result = SagaBuilder::new("d1", "test")
            .step(Step::new("a", noop_action()).depends_on(["b"]))
            .step(Step::new("b", noop_action()).depends_on(["a"]))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn valid_state_transitions_succeed_and_invalid_ones_fail() {
        let mut instance = SagaInstance::new("s1", "d1", serde_json::json!({}));
        instance.transition_to(SagaState::Running).unwrap();
        instance.transition_to(SagaState::Compensating).unwrap();
        assert!(instance.transition_to(SagaState::Completed).is_err());
        instance.transition_to(SagaState::Compensated).unwrap();
        assert!(instance.transition_to(SagaState::Running).is_err());
    }

    #[test]
    fn self_transition_is_a_no_op() {
        let mut instance = SagaInstance::new("s1", "d1", serde_json::json!({}));
        assert!(instance.transition_to(SagaState::Created).is_ok());
    }
}
