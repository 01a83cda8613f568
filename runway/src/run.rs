use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ProvisionError;
use crate::request::{ComputeTier, RepositoryId, RunnerCount};

/// Unique identifier of a single provisioning run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical identity of a run: workflow plus git ref.
///
/// At most one run per key may be in flight; a newer trigger with the same
/// key supersedes the older one.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RunKey {
    workflow: String,
    git_ref: String,
}

impl RunKey {
    pub fn new(workflow: impl Into<String>, git_ref: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            git_ref: git_ref.into(),
        }
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    pub fn git_ref(&self) -> &str {
        &self.git_ref
    }

    /// Branch (or tag) name with `/` flattened to `-`, suitable for object
    /// keys and session names.
    pub fn branch_slug(&self) -> String {
        let short = self
            .git_ref
            .strip_prefix("refs/heads/")
            .or_else(|| self.git_ref.strip_prefix("refs/tags/"))
            .unwrap_or(&self.git_ref);
        short.replace('/', "-")
    }
}

impl Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.workflow, self.git_ref)
    }
}

/// Parameters of a manual trigger, before validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunTrigger {
    pub repository: String,
    pub workflow: String,
    pub git_ref: String,
    pub runner_count: i64,
    pub compute_tier: ComputeTier,
}

impl RunTrigger {
    /// Trigger with the default runner count (1) and compute tier (S).
    pub fn new(
        repository: impl Into<String>,
        workflow: impl Into<String>,
        git_ref: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            workflow: workflow.into(),
            git_ref: git_ref.into(),
            runner_count: 1,
            compute_tier: ComputeTier::default(),
        }
    }

    pub fn with_runner_count(mut self, count: i64) -> Self {
        self.runner_count = count;
        self
    }

    pub fn with_compute_tier(mut self, tier: ComputeTier) -> Self {
        self.compute_tier = tier;
        self
    }

    pub fn run_key(&self) -> RunKey {
        RunKey::new(&self.workflow, &self.git_ref)
    }
}

/// Immutable per-run context, built once at run start and borrowed by every
/// stage of the chain.
#[derive(Clone, Debug)]
pub struct RunContext {
    pub run_id: RunId,
    pub run_key: RunKey,
    pub repository: RepositoryId,
    pub runner_count: RunnerCount,
    pub compute_tier: ComputeTier,
    pub results_location: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    /// Validate a trigger and fix the run's identity.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::InvalidRequest`] when the repository
    /// identifier or runner count is malformed.
    pub fn from_trigger(
        trigger: &RunTrigger,
        results_location: Option<String>,
    ) -> Result<Self, ProvisionError> {
        if trigger.workflow.trim().is_empty() {
            return Err(ProvisionError::InvalidRequest(
                "workflow name must not be empty".into(),
            ));
        }
        if trigger.git_ref.trim().is_empty() {
            return Err(ProvisionError::InvalidRequest(
                "git ref must not be empty".into(),
            ));
        }

        Ok(Self {
            run_id: RunId::new(),
            run_key: trigger.run_key(),
            repository: trigger.repository.parse()?,
            runner_count: RunnerCount::new(trigger.runner_count)?,
            compute_tier: trigger.compute_tier,
            results_location,
            started_at: Utc::now(),
        })
    }

    /// Role session name for this run, within the cloud provider's
    /// character set and 64-char limit.
    pub fn session_name(&self) -> String {
        let raw = format!("runway-{}-{}", self.run_key.branch_slug(), self.run_id);
        let mut name: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || "+=,.@-".contains(*c))
            .collect();
        if name.len() > 64 {
            // keep the run id suffix, it is what makes the session unique
            name = name.split_off(name.len() - 64);
        }
        name
    }
}

/// Per-run lifecycle states.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    IdentityAcquired,
    RegistryAuthenticated,
    Dispatched,
    Confirmed,
    Failed,
    RunnerJobActive,
    RunnerJobComplete,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::IdentityAcquired => "identity_acquired",
            RunState::RegistryAuthenticated => "registry_authenticated",
            RunState::Dispatched => "dispatched",
            RunState::Confirmed => "confirmed",
            RunState::Failed => "failed",
            RunState::RunnerJobActive => "runner_job_active",
            RunState::RunnerJobComplete => "runner_job_complete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Failed | RunState::RunnerJobComplete)
    }

    /// Whether `self -> next` is an edge of the run state machine.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (*self, next),
            (Pending, IdentityAcquired)
                | (IdentityAcquired, RegistryAuthenticated)
                | (RegistryAuthenticated, Dispatched)
                | (Dispatched, Confirmed)
                | (Confirmed, RunnerJobActive)
                | (RunnerJobActive, RunnerJobComplete)
                | (Pending, Failed)
                | (IdentityAcquired, Failed)
                | (RegistryAuthenticated, Failed)
                | (Dispatched, Failed)
                | (RunnerJobActive, Failed)
        )
    }
}

impl Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
#[error("illegal run transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: RunState,
    pub to: RunState,
}

/// Ordered record of the states a run passed through.
#[derive(Clone, Debug)]
pub struct RunTrace {
    history: Vec<(RunState, DateTime<Utc>)>,
}

impl Default for RunTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTrace {
    pub fn new() -> Self {
        Self {
            history: vec![(RunState::Pending, Utc::now())],
        }
    }

    pub fn current(&self) -> RunState {
        self.history
            .last()
            .map(|(state, _)| *state)
            .unwrap_or(RunState::Pending)
    }

    /// Move to `next`, refusing anything the state machine does not allow.
    pub fn advance(&mut self, next: RunState) -> Result<RunState, InvalidTransition> {
        let from = self.current();
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.history.push((next, Utc::now()));
        Ok(from)
    }

    pub fn states(&self) -> Vec<RunState> {
        self.history.iter().map(|(state, _)| *state).collect()
    }

    pub fn entered_at(&self, state: RunState) -> Option<DateTime<Utc>> {
        self.history
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, at)| *at)
    }
}
