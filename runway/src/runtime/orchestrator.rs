use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use super::key_lock::KeyLockDir;
use super::single_flight::{RunClaim, RunRegistry};
use crate::consumer::{ConsumerJob, ConsumerOutcome};
use crate::dispatch::{ProvisionBackend, RunnerDispatcher};
use crate::error::ProvisionError;
use crate::events::{RunEvent, RunEventPayload, RunEventPublisher};
use crate::identity::{IdentityBroker, RunIdentity};
use crate::registry::RegistryAuthenticator;
use crate::run::{RunContext, RunId, RunKey, RunState, RunTrace, RunTrigger};
use crate::telemetry;
use crate::validate::{ProvisionConfirmation, validate_response};

/// Default bound on the identity and registry stages.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for the provisioning orchestrator.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Opaque results sink handed to the consumer job.
    pub results_location: Option<String>,
    /// Bound on each of the identity and registry stages.
    pub stage_timeout: Duration,
    /// Shared lock directory extending single-flight across processes.
    /// In-process only when unset.
    pub lock_dir: Option<KeyLockDir>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            results_location: None,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            lock_dir: None,
        }
    }
}

/// A run that reached `Confirmed`.
///
/// Holds the run's claim on its key until dropped.
#[derive(Debug)]
pub struct ProvisionedRun {
    pub context: RunContext,
    pub confirmation: ProvisionConfirmation,
    pub trace: RunTrace,
    claim: RunClaim,
}

impl ProvisionedRun {
    pub fn claim(&self) -> &RunClaim {
        &self.claim
    }

    pub fn states(&self) -> Vec<RunState> {
        self.trace.states()
    }
}

/// Summary of a finished run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub run_id: RunId,
    pub run_key: RunKey,
    pub states: Vec<RunState>,
    pub confirmation: ProvisionConfirmation,
    pub consumer: Option<ConsumerOutcome>,
}

/// Drives the provisioning chain for each trigger, one run in flight per
/// RunKey.
pub struct ProvisioningOrchestrator<I, R, B>
where
    I: IdentityBroker + 'static,
    R: RegistryAuthenticator + 'static,
    B: ProvisionBackend + 'static,
{
    config: OrchestratorConfig,
    identity: Arc<I>,
    registry: Arc<R>,
    dispatcher: RunnerDispatcher<Arc<B>>,
    consumer: Option<Arc<dyn ConsumerJob>>,
    events: Arc<dyn RunEventPublisher>,
    runs: RunRegistry,
}

impl<I, R, B> fmt::Debug for ProvisioningOrchestrator<I, R, B>
where
    I: IdentityBroker + 'static,
    R: RegistryAuthenticator + 'static,
    B: ProvisionBackend + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningOrchestrator")
            .field("config", &self.config)
            .field("identity_type", &type_name::<I>())
            .field("registry_type", &type_name::<R>())
            .field("dispatcher", &self.dispatcher)
            .field("consumer_set", &self.consumer.is_some())
            .field("runs", &self.runs)
            .finish()
    }
}

impl<I, R, B> ProvisioningOrchestrator<I, R, B>
where
    I: IdentityBroker + 'static,
    R: RegistryAuthenticator + 'static,
    B: ProvisionBackend + 'static,
{
    pub fn new(
        config: OrchestratorConfig,
        identity: Arc<I>,
        registry: Arc<R>,
        dispatcher: RunnerDispatcher<Arc<B>>,
        consumer: Option<Arc<dyn ConsumerJob>>,
        events: Arc<dyn RunEventPublisher>,
    ) -> Self {
        let runs = match config.lock_dir.clone() {
            Some(lock_dir) => RunRegistry::with_lock_dir(lock_dir),
            None => RunRegistry::new(),
        };
        Self {
            config,
            identity,
            registry,
            dispatcher,
            consumer,
            events,
            runs,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.runs
    }

    pub fn dispatcher(&self) -> &RunnerDispatcher<Arc<B>> {
        &self.dispatcher
    }

    /// Get a clone of the event publisher.
    pub fn events(&self) -> Arc<dyn RunEventPublisher> {
        Arc::clone(&self.events)
    }

    /// Run the chain up to `Confirmed`.
    ///
    /// A newer trigger for the same key supersedes this run until its
    /// dispatch starts; after that the dispatch completes and a confirmed
    /// runner is never torn down.
    ///
    /// # Errors
    ///
    /// The first stage error, or [`ProvisionError::Superseded`].
    pub async fn provision(&self, trigger: &RunTrigger) -> Result<ProvisionedRun, ProvisionError> {
        let ctx = RunContext::from_trigger(trigger, self.config.results_location.clone())?;
        telemetry::record_run_started(&ctx.run_key);

        let claim = self
            .runs
            .claim(ctx.run_key.clone(), ctx.run_id)
            .map_err(lock_error)?;
        let mut trace = RunTrace::new();

        let span = telemetry::run_span(ctx.run_id, &ctx.run_key);
        let outcome = self.drive(&ctx, &claim, &mut trace).instrument(span).await;
        match outcome {
            Ok(confirmation) => Ok(ProvisionedRun {
                context: ctx,
                confirmation,
                trace,
                claim,
            }),
            Err(err) => {
                self.fail(&ctx, &mut trace, &err).await;
                Err(err)
            }
        }
    }

    /// Provision, then run the consumer job on the confirmed runner.
    ///
    /// The consumer is not started unless provisioning confirmed, and it is
    /// not preempted by a newer trigger.
    ///
    /// # Errors
    ///
    /// Any [`provision`](Self::provision) error, or
    /// [`ProvisionError::Consumer`].
    pub async fn run(&self, trigger: &RunTrigger) -> Result<RunReport, ProvisionError> {
        let ProvisionedRun {
            context,
            confirmation,
            mut trace,
            claim,
        } = self.provision(trigger).await?;

        let Some(consumer) = &self.consumer else {
            telemetry::record_run_finished(&context.run_key, "confirmed");
            return Ok(RunReport {
                run_id: context.run_id,
                run_key: context.run_key,
                states: trace.states(),
                confirmation,
                consumer: None,
            });
        };

        self.advance(&context, &mut trace, RunState::RunnerJobActive)
            .await;
        let timer = telemetry::start_stage("consumer");
        let outcome = consumer
            .run(&context, &confirmation)
            .instrument(telemetry::consumer_span(context.run_id))
            .await;
        timer.finish();

        self.publish(
            &context,
            RunEventPayload::ConsumerFinished {
                run_id: context.run_id,
                success: outcome.is_ok(),
                exit_code: outcome.as_ref().ok().and_then(|done| done.exit_code),
            },
        )
        .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                self.fail(&context, &mut trace, &err).await;
                return Err(err);
            }
        };
        self.advance(&context, &mut trace, RunState::RunnerJobComplete)
            .await;
        telemetry::record_run_finished(&context.run_key, "completed");
        drop(claim);

        Ok(RunReport {
            run_id: context.run_id,
            run_key: context.run_key,
            states: trace.states(),
            confirmation,
            consumer: Some(outcome),
        })
    }

    async fn drive(
        &self,
        ctx: &RunContext,
        claim: &RunClaim,
        trace: &mut RunTrace,
    ) -> Result<ProvisionConfirmation, ProvisionError> {
        self.publish(
            ctx,
            RunEventPayload::Triggered {
                run_id: ctx.run_id,
                runner_count: ctx.runner_count.get(),
                compute_tier: ctx.compute_tier,
            },
        )
        .await;
        if let Some(previous) = claim.superseded() {
            self.publish(
                ctx,
                RunEventPayload::Superseded {
                    run_id: previous,
                    by: ctx.run_id,
                },
            )
            .await;
        }

        let RunIdentity {
            requestor_token,
            cloud_credential,
        } = self
            .guarded(
                ctx,
                claim,
                "identity",
                ProvisionError::Authentication,
                self.identity
                    .acquire(ctx)
                    .instrument(telemetry::identity_span(ctx.run_id)),
            )
            .await?;
        self.advance(ctx, trace, RunState::IdentityAcquired).await;

        let login = self
            .guarded(
                ctx,
                claim,
                "registry",
                ProvisionError::RegistryAuth,
                self.registry
                    .login(ctx, &cloud_credential)
                    .instrument(telemetry::registry_span(ctx.run_id)),
            )
            .await?;
        self.advance(ctx, trace, RunState::RegistryAuthenticated)
            .await;

        let gate = tokio::select! {
            biased;
            _ = claim.token().cancelled() => return Err(superseded(ctx)),
            gate = claim.dispatch_gate() => gate.map_err(lock_error)?,
        };
        // the key may have changed hands while queued on the gate
        if claim.is_superseded() {
            return Err(superseded(ctx));
        }
        // nothing is sent, and no dispatch reported, with stale material
        self.dispatcher
            .check_scope(ctx, &cloud_credential, &login)?;

        self.advance(ctx, trace, RunState::Dispatched).await;
        self.publish(ctx, RunEventPayload::DispatchSent { run_id: ctx.run_id })
            .await;
        let timer = telemetry::start_stage("dispatch");
        let response = self
            .dispatcher
            .dispatch(ctx, requestor_token, &cloud_credential, &login)
            .await;
        timer.finish();
        drop(gate);
        let response = response?;

        let confirmation =
            telemetry::validate_span(ctx.run_id).in_scope(|| validate_response(&response))?;
        self.advance(ctx, trace, RunState::Confirmed).await;
        self.publish(
            ctx,
            RunEventPayload::Confirmed {
                run_id: ctx.run_id,
                status_code: confirmation.status_code,
            },
        )
        .await;
        tracing::info!(run_id = %ctx.run_id, "runner confirmed");

        Ok(confirmation)
    }

    /// Run a pre-dispatch stage, racing it against supersession and the
    /// stage timeout.
    async fn guarded<T, F>(
        &self,
        ctx: &RunContext,
        claim: &RunClaim,
        stage: &'static str,
        on_timeout: fn(String) -> ProvisionError,
        work: F,
    ) -> Result<T, ProvisionError>
    where
        F: Future<Output = Result<T, ProvisionError>>,
    {
        let limit = self.config.stage_timeout;
        let timer = telemetry::start_stage(stage);
        let result = tokio::select! {
            biased;
            _ = claim.token().cancelled() => Err(superseded(ctx)),
            outcome = tokio::time::timeout(limit, work) => outcome.unwrap_or_else(|_| {
                Err(on_timeout(format!("{stage} stage timed out after {}s", limit.as_secs())))
            }),
        };
        timer.finish();
        result
    }

    async fn advance(&self, ctx: &RunContext, trace: &mut RunTrace, next: RunState) {
        match trace.advance(next) {
            Ok(from) => {
                tracing::debug!(run_id = %ctx.run_id, %from, to = %next, "run transitioned");
                self.publish(
                    ctx,
                    RunEventPayload::Transitioned {
                        run_id: ctx.run_id,
                        from,
                        to: next,
                    },
                )
                .await;
            }
            Err(err) => tracing::error!(run_id = %ctx.run_id, error = %err, "transition rejected"),
        }
    }

    async fn fail(&self, ctx: &RunContext, trace: &mut RunTrace, err: &ProvisionError) {
        self.advance(ctx, trace, RunState::Failed).await;
        match err {
            ProvisionError::Superseded { .. } => {
                tracing::info!(run_id = %ctx.run_id, run_key = %ctx.run_key, "run superseded");
            }
            ProvisionError::ProvisioningFailed {
                reason,
                raw_response,
            } => {
                tracing::error!(
                    run_id = %ctx.run_id,
                    reason = %reason,
                    raw_response = %raw_response,
                    "runner provisioning failed"
                );
            }
            other => {
                tracing::error!(
                    run_id = %ctx.run_id,
                    stage = other.stage(),
                    error = %other,
                    "run failed"
                );
            }
        }
        self.publish(
            ctx,
            RunEventPayload::Failed {
                run_id: ctx.run_id,
                stage: err.stage().to_string(),
                reason: err.to_string(),
            },
        )
        .await;
        let outcome = if err.is_superseded() {
            "superseded"
        } else {
            "failed"
        };
        telemetry::record_run_finished(&ctx.run_key, outcome);
    }

    async fn publish(&self, ctx: &RunContext, payload: RunEventPayload) {
        if let Err(err) = self.events.publish(RunEvent::new(ctx, payload)).await {
            tracing::warn!(run_id = %ctx.run_id, "publish run event failed: {err}");
        }
    }
}

fn lock_error(err: std::io::Error) -> ProvisionError {
    ProvisionError::Config(format!("run key lock unavailable: {err}"))
}

fn superseded(ctx: &RunContext) -> ProvisionError {
    ProvisionError::Superseded {
        run_key: ctx.run_key.to_string(),
    }
}
