use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use runway::*;
use serde_json::Value;

use crate::context::{TEST_REGION, confirmed_payload, login_for};

/// Identity broker handing out fixed credentials.
#[derive(Clone, Debug)]
pub struct MockIdentityBroker {
    calls: Arc<Mutex<Vec<RunId>>>,
    failure: Arc<Mutex<Option<String>>>,
    delay: Arc<Mutex<Duration>>,
    credential_lifetime: Arc<Mutex<chrono::Duration>>,
    bind_to: Arc<Mutex<Option<RunId>>>,
}

impl MockIdentityBroker {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            failure: Arc::new(Mutex::new(None)),
            delay: Arc::new(Mutex::new(Duration::ZERO)),
            credential_lifetime: Arc::new(Mutex::new(chrono::Duration::hours(1))),
            bind_to: Arc::new(Mutex::new(None)),
        }
    }

    pub fn failing(reason: &str) -> Self {
        let broker = Self::new();
        broker.set_failure(Some(reason));
        broker
    }

    pub fn set_failure(&self, reason: Option<&str>) {
        *self.failure.lock() = reason.map(str::to_string);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Lifetime of minted credentials; negative mints expired ones.
    pub fn set_credential_lifetime(&self, lifetime: chrono::Duration) {
        *self.credential_lifetime.lock() = lifetime;
    }

    /// Mint credentials bound to `run_id` instead of the requesting run.
    pub fn bind_credentials_to(&self, run_id: RunId) {
        *self.bind_to.lock() = Some(run_id);
    }

    pub fn calls(&self) -> Vec<RunId> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Default for MockIdentityBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityBroker for MockIdentityBroker {
    async fn acquire(&self, ctx: &RunContext) -> Result<RunIdentity, ProvisionError> {
        self.calls.lock().push(ctx.run_id);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.failure.lock().clone() {
            return Err(ProvisionError::Authentication(reason));
        }

        let now = Utc::now();
        let bound_to = (*self.bind_to.lock()).unwrap_or(ctx.run_id);
        Ok(RunIdentity {
            requestor_token: RequestorToken::new(
                "ghs_mock_token",
                Some(now + chrono::Duration::hours(1)),
                TokenOrigin::AppInstallation,
            ),
            cloud_credential: TemporaryCredential::new(
                "ASIAMOCK",
                "mock-secret-key",
                "mock-session-token",
                now + *self.credential_lifetime.lock(),
                TEST_REGION,
                bound_to,
            ),
        })
    }
}

/// Registry authenticator enforcing credential scope like the real one.
#[derive(Clone, Debug)]
pub struct MockRegistry {
    calls: Arc<Mutex<Vec<RunId>>>,
    failure: Arc<Mutex<Option<String>>>,
    delay: Arc<Mutex<Duration>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            failure: Arc::new(Mutex::new(None)),
            delay: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn denying(reason: &str) -> Self {
        let registry = Self::new();
        registry.set_failure(Some(reason));
        registry
    }

    pub fn set_failure(&self, reason: Option<&str>) {
        *self.failure.lock() = reason.map(str::to_string);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<RunId> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Default for MockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryAuthenticator for MockRegistry {
    async fn login(
        &self,
        ctx: &RunContext,
        credential: &TemporaryCredential,
    ) -> Result<RegistryLogin, ProvisionError> {
        credential
            .ensure_usable_for(ctx.run_id, Utc::now())
            .map_err(|err| ProvisionError::RegistryAuth(err.to_string()))?;

        self.calls.lock().push(ctx.run_id);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.failure.lock().clone() {
            return Err(ProvisionError::RegistryAuth(reason));
        }
        Ok(login_for(ctx.run_id))
    }
}

/// What the mock backend answers.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// A JSON function payload.
    Payload(Value),
    /// Raw bytes, possibly not JSON.
    Raw(Vec<u8>),
    /// No answer at all.
    DispatchError(String),
}

/// One recorded invocation. Carries the redacted payload only.
#[derive(Clone, Debug)]
pub struct InvocationRecord {
    pub payload: Value,
    pub runner_count: u32,
    pub compute_tier: ComputeTier,
    pub repository: String,
    pub credential_run_id: RunId,
    pub login_run_id: RunId,
}

/// Provisioning backend recording every invocation.
#[derive(Clone, Debug)]
pub struct MockBackend {
    invocations: Arc<Mutex<Vec<InvocationRecord>>>,
    response: Arc<Mutex<MockResponse>>,
    delay: Arc<Mutex<Duration>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockBackend {
    /// Backend confirming every request.
    pub fn new() -> Self {
        Self::with_response(MockResponse::Payload(confirmed_payload()))
    }

    pub fn with_response(response: MockResponse) -> Self {
        Self {
            invocations: Arc::new(Mutex::new(Vec::new())),
            response: Arc::new(Mutex::new(response)),
            delay: Arc::new(Mutex::new(Duration::ZERO)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_response(&self, response: MockResponse) {
        *self.response.lock() = response;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn invocations(&self) -> Vec<InvocationRecord> {
        self.invocations.lock().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().len()
    }

    /// Highest number of invocations ever running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn assert_invocation_count_eq(&self, expected: usize) {
        let actual = self.invocation_count();
        assert_eq!(
            actual, expected,
            "Expected {expected} invocations, got {actual}"
        );
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProvisionBackend for MockBackend {
    async fn invoke(
        &self,
        request: &ProvisionRequest,
        credential: &TemporaryCredential,
        login: &RegistryLogin,
    ) -> Result<ProvisionResponse, ProvisionError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(Arc::clone(&self.in_flight));
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        self.invocations.lock().push(InvocationRecord {
            payload: request.redacted_payload(),
            runner_count: request.runner_count().get(),
            compute_tier: request.compute_tier(),
            repository: request.target_repository().to_string(),
            credential_run_id: credential.run_id(),
            login_run_id: login.run_id(),
        });

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let response = self.response.lock().clone();
        match response {
            MockResponse::Payload(payload) => Ok(ProvisionResponse::new(payload)),
            MockResponse::Raw(bytes) => Ok(ProvisionResponse::from_slice(&bytes)),
            MockResponse::DispatchError(reason) => Err(ProvisionError::Dispatch(reason)),
        }
    }
}

/// Consumer job recording the runs it was started for.
#[derive(Clone, Debug)]
pub struct MockConsumer {
    runs: Arc<Mutex<Vec<RunId>>>,
    failure: Arc<Mutex<Option<String>>>,
    delay: Arc<Mutex<Duration>>,
}

impl MockConsumer {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(Mutex::new(Vec::new())),
            failure: Arc::new(Mutex::new(None)),
            delay: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn failing(reason: &str) -> Self {
        let consumer = Self::new();
        *consumer.failure.lock() = Some(reason.to_string());
        consumer
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn runs(&self) -> Vec<RunId> {
        self.runs.lock().clone()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().len()
    }
}

impl Default for MockConsumer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConsumerJob for MockConsumer {
    async fn run(
        &self,
        ctx: &RunContext,
        _confirmation: &ProvisionConfirmation,
    ) -> Result<ConsumerOutcome, ProvisionError> {
        self.runs.lock().push(ctx.run_id);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.failure.lock().clone() {
            Some(reason) => Err(ProvisionError::Consumer(reason)),
            None => Ok(ConsumerOutcome {
                exit_code: Some(0),
                duration: delay,
            }),
        }
    }
}

/// Event publisher that rejects every event.
#[derive(Clone, Debug, Default)]
pub struct FailingPublisher {
    attempts: Arc<AtomicUsize>,
}

impl FailingPublisher {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventPublisher<RunEvent> for FailingPublisher {
    async fn publish(&self, _event: RunEvent) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("event sink unavailable")
    }
}

pub type MockOrchestrator = ProvisioningOrchestrator<MockIdentityBroker, MockRegistry, MockBackend>;

/// Every mock wired into one orchestrator.
#[derive(Clone, Debug)]
pub struct MockHarness {
    pub identity: MockIdentityBroker,
    pub registry: MockRegistry,
    pub backend: MockBackend,
    pub consumer: MockConsumer,
    pub events: Arc<InProcEventBus>,
}

impl MockHarness {
    pub fn new() -> Self {
        Self {
            identity: MockIdentityBroker::new(),
            registry: MockRegistry::new(),
            backend: MockBackend::new(),
            consumer: MockConsumer::new(),
            events: Arc::new(InProcEventBus::new(1024)),
        }
    }

    /// Orchestrator without a consumer job.
    pub fn orchestrator(&self) -> MockOrchestrator {
        self.builder().build().expect("all mocks provided")
    }

    /// Orchestrator starting the mock consumer on confirmation.
    pub fn orchestrator_with_consumer(&self) -> MockOrchestrator {
        self.builder()
            .with_consumer(Arc::new(self.consumer.clone()))
            .build()
            .expect("all mocks provided")
    }

    pub fn builder(
        &self,
    ) -> ProvisioningOrchestratorBuilder<MockIdentityBroker, MockRegistry, MockBackend> {
        self.builder_with(OrchestratorConfig::default())
    }

    /// Builder over the shared mocks. Orchestrators built from the same
    /// harness keep separate run registries.
    pub fn builder_with(
        &self,
        config: OrchestratorConfig,
    ) -> ProvisioningOrchestratorBuilder<MockIdentityBroker, MockRegistry, MockBackend> {
        ProvisioningOrchestratorBuilder::new(config)
            .with_identity(Arc::new(self.identity.clone()))
            .with_registry(Arc::new(self.registry.clone()))
            .with_backend(Arc::new(self.backend.clone()))
            .with_events(self.events.clone())
    }
}

impl Default for MockHarness {
    fn default() -> Self {
        Self::new()
    }
}
