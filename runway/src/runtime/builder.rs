use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::consumer::ConsumerJob;
use crate::dispatch::{DEFAULT_DISPATCH_TIMEOUT, ProvisionBackend, RunnerDispatcher};
use crate::events::{InProcEventBus, RunEventPublisher};
use crate::identity::IdentityBroker;
use crate::registry::RegistryAuthenticator;

use super::orchestrator::{OrchestratorConfig, ProvisioningOrchestrator};

/// Builder for constructing a `ProvisioningOrchestrator` with explicit
/// dependencies.
///
/// The identity broker, registry authenticator and provisioning backend are
/// required. Without a consumer the run ends at `Confirmed`; without an
/// event publisher events go to a private [`InProcEventBus`].
///
/// # Example
///
/// ```ignore
/// use runway::*;
///
/// let orchestrator = ProvisioningOrchestratorBuilder::new(config)
///     .with_identity(identity)
///     .with_registry(registry)
///     .with_backend(backend)
///     .with_dispatch_timeout(Duration::from_secs(900))
///     .with_consumer(consumer)
///     .with_events(events)
///     .build()?;
/// ```
pub struct ProvisioningOrchestratorBuilder<I, R, B>
where
    I: IdentityBroker + 'static,
    R: RegistryAuthenticator + 'static,
    B: ProvisionBackend + 'static,
{
    config: OrchestratorConfig,
    identity: Option<Arc<I>>,
    registry: Option<Arc<R>>,
    backend: Option<Arc<B>>,
    dispatch_timeout: Duration,
    consumer: Option<Arc<dyn ConsumerJob>>,
    events: Option<Arc<dyn RunEventPublisher>>,
}

impl<I, R, B> fmt::Debug for ProvisioningOrchestratorBuilder<I, R, B>
where
    I: IdentityBroker + 'static,
    R: RegistryAuthenticator + 'static,
    B: ProvisionBackend + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ProvisioningOrchestratorBuilder");
        debug.field("config", &self.config);
        debug.field("identity_set", &self.identity.is_some());
        debug.field("registry_set", &self.registry.is_some());
        debug.field("backend_set", &self.backend.is_some());
        debug.field("dispatch_timeout", &self.dispatch_timeout);
        debug.field("consumer_set", &self.consumer.is_some());
        debug.field("events_set", &self.events.is_some());

        if self.identity.is_some() {
            debug.field("identity_type", &type_name::<I>());
        }
        if self.registry.is_some() {
            debug.field("registry_type", &type_name::<R>());
        }
        if self.backend.is_some() {
            debug.field("backend_type", &type_name::<B>());
        }

        debug.finish()
    }
}

impl<I, R, B> ProvisioningOrchestratorBuilder<I, R, B>
where
    I: IdentityBroker + 'static,
    R: RegistryAuthenticator + 'static,
    B: ProvisionBackend + 'static,
{
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            identity: None,
            registry: None,
            backend: None,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            consumer: None,
            events: None,
        }
    }

    pub fn with_identity(mut self, identity: Arc<I>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_registry(mut self, registry: Arc<R>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_backend(mut self, backend: Arc<B>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn with_consumer(mut self, consumer: Arc<dyn ConsumerJob>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn RunEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> anyhow::Result<ProvisioningOrchestrator<I, R, B>> {
        let identity = self
            .identity
            .ok_or_else(|| anyhow::anyhow!("identity dependency missing"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry dependency missing"))?;
        let backend = self
            .backend
            .ok_or_else(|| anyhow::anyhow!("backend dependency missing"))?;
        if self.dispatch_timeout.is_zero() {
            anyhow::bail!("dispatch timeout must be positive");
        }
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InProcEventBus::default()));

        Ok(ProvisioningOrchestrator::new(
            self.config,
            identity,
            registry,
            RunnerDispatcher::new(backend).with_timeout(self.dispatch_timeout),
            self.consumer,
            events,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{RegistryLogin, TemporaryCredential};
    use crate::error::ProvisionError;
    use crate::identity::RunIdentity;
    use crate::request::{ProvisionRequest, ProvisionResponse};
    use crate::run::RunContext;
    use async_trait::async_trait;

    struct NoIdentity;

    #[async_trait]
    impl IdentityBroker for NoIdentity {
        async fn acquire(&self, _ctx: &RunContext) -> Result<RunIdentity, ProvisionError> {
            Err(ProvisionError::Authentication("unused".into()))
        }
    }

    struct NoRegistry;

    #[async_trait]
    impl RegistryAuthenticator for NoRegistry {
        async fn login(
            &self,
            _ctx: &RunContext,
            _credential: &TemporaryCredential,
        ) -> Result<RegistryLogin, ProvisionError> {
            Err(ProvisionError::RegistryAuth("unused".into()))
        }
    }

    struct NoBackend;

    #[async_trait]
    impl ProvisionBackend for NoBackend {
        async fn invoke(
            &self,
            _request: &ProvisionRequest,
            _credential: &TemporaryCredential,
            _login: &RegistryLogin,
        ) -> Result<ProvisionResponse, ProvisionError> {
            Err(ProvisionError::Dispatch("unused".into()))
        }
    }

    type Builder = ProvisioningOrchestratorBuilder<NoIdentity, NoRegistry, NoBackend>;

    #[test]
    fn build_requires_every_dependency() {
        let err = Builder::new(OrchestratorConfig::default())
            .with_registry(Arc::new(NoRegistry))
            .with_backend(Arc::new(NoBackend))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("identity dependency missing"));

        let err = Builder::new(OrchestratorConfig::default())
            .with_identity(Arc::new(NoIdentity))
            .with_registry(Arc::new(NoRegistry))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("backend dependency missing"));
    }

    #[test]
    fn build_applies_dispatch_timeout() {
        let orchestrator = Builder::new(OrchestratorConfig::default())
            .with_identity(Arc::new(NoIdentity))
            .with_registry(Arc::new(NoRegistry))
            .with_backend(Arc::new(NoBackend))
            .with_dispatch_timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        assert_eq!(orchestrator.dispatcher().timeout(), Duration::from_secs(30));
    }

    #[test]
    fn zero_dispatch_timeout_is_rejected() {
        let err = Builder::new(OrchestratorConfig::default())
            .with_identity(Arc::new(NoIdentity))
            .with_registry(Arc::new(NoRegistry))
            .with_backend(Arc::new(NoBackend))
            .with_dispatch_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("dispatch timeout"));
    }

    #[test]
    fn debug_lists_configured_dependencies() {
        let builder = Builder::new(OrchestratorConfig::default()).with_identity(Arc::new(NoIdentity));
        let debug = format!("{builder:?}");
        assert!(debug.contains("identity_set: true"));
        assert!(debug.contains("registry_set: false"));
        assert!(debug.contains("NoIdentity"));
    }
}
