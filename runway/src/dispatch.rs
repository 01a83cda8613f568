//! Runner dispatch.
//!
//! [`ProvisionBackend`] is the narrow seam to the remote provisioning
//! function. [`RunnerDispatcher`] builds the request from the run context,
//! enforces credential scope and the bounded wait, and hands back the raw
//! response without interpreting it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_lambda::Client;
use aws_sdk_lambda::config::Region;
use aws_sdk_lambda::config::retry::RetryConfig;
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::InvocationType;
use chrono::Utc;
use tracing::Instrument;

use crate::aws::describe_sdk_error;
use crate::credentials::{RegistryLogin, RequestorToken, TemporaryCredential};
use crate::error::ProvisionError;
use crate::request::{ProvisionRequest, ProvisionResponse};
use crate::run::RunContext;
use crate::telemetry;

/// Default bounded wait for one invocation.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(900);

/// Remote provisioning function.
///
/// Implementations return whatever the function answered, successful or
/// not. Only failures to obtain an answer at all are errors, and those are
/// always [`ProvisionError::Dispatch`].
#[async_trait]
pub trait ProvisionBackend: Send + Sync {
    async fn invoke(
        &self,
        request: &ProvisionRequest,
        credential: &TemporaryCredential,
        login: &RegistryLogin,
    ) -> Result<ProvisionResponse, ProvisionError>;
}

#[async_trait]
impl<B> ProvisionBackend for Arc<B>
where
    B: ProvisionBackend + ?Sized,
{
    async fn invoke(
        &self,
        request: &ProvisionRequest,
        credential: &TemporaryCredential,
        login: &RegistryLogin,
    ) -> Result<ProvisionResponse, ProvisionError> {
        (**self).invoke(request, credential, login).await
    }
}

/// Builds provisioning requests and sends them to a backend.
pub struct RunnerDispatcher<B: ProvisionBackend> {
    backend: B,
    timeout: Duration,
}

impl<B: ProvisionBackend> fmt::Debug for RunnerDispatcher<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerDispatcher")
            .field("backend_type", &std::any::type_name::<B>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<B: ProvisionBackend> RunnerDispatcher<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Check that the credential and login may be used by this run now.
    ///
    /// # Errors
    ///
    /// - [`ProvisionError::Authentication`] if the cloud credential is
    ///   expired or belongs to another run.
    /// - [`ProvisionError::RegistryAuth`] if the registry login is.
    pub fn check_scope(
        &self,
        ctx: &RunContext,
        credential: &TemporaryCredential,
        login: &RegistryLogin,
    ) -> Result<(), ProvisionError> {
        let now = Utc::now();
        credential
            .ensure_usable_for(ctx.run_id, now)
            .map_err(|err| ProvisionError::Authentication(err.to_string()))?;
        login
            .ensure_usable_for(ctx.run_id, now)
            .map_err(|err| ProvisionError::RegistryAuth(err.to_string()))
    }

    /// Send one provisioning request for the run.
    ///
    /// The token is consumed: it belongs to this request only. Scope is
    /// checked again here, so a caller that skipped
    /// [`check_scope`](Self::check_scope) still cannot dispatch with a
    /// foreign or expired credential.
    ///
    /// # Errors
    ///
    /// - Anything [`check_scope`](Self::check_scope) reports.
    /// - [`ProvisionError::Dispatch`] on transport failure or timeout.
    pub async fn dispatch(
        &self,
        ctx: &RunContext,
        token: RequestorToken,
        credential: &TemporaryCredential,
        login: &RegistryLogin,
    ) -> Result<ProvisionResponse, ProvisionError> {
        self.check_scope(ctx, credential, login)?;

        let request = ProvisionRequest::new(
            token,
            ctx.runner_count,
            ctx.compute_tier,
            ctx.repository.clone(),
        );
        tracing::debug!(payload = %request.redacted_payload(), "sending provisioning request");

        let invocation = tokio::time::timeout(
            self.timeout,
            self.backend.invoke(&request, credential, login),
        );
        match telemetry::instrument_dispatch(
            ctx.run_id,
            ctx.runner_count.get(),
            ctx.compute_tier,
            invocation,
        )
        .await
        {
            Ok(Ok(response)) => {
                telemetry::record_dispatch(&ctx.run_key, "sent");
                Ok(response)
            }
            Ok(Err(err)) => {
                telemetry::record_dispatch(&ctx.run_key, "transport_error");
                Err(err)
            }
            Err(_) => {
                telemetry::record_dispatch(&ctx.run_key, "timeout");
                Err(ProvisionError::Dispatch(format!(
                    "no response from provisioning backend within {}s",
                    self.timeout.as_secs()
                )))
            }
        }
    }
}

/// Synchronous Lambda invocation of the provisioning function.
///
/// Each invocation is signed with the run's own credential and never
/// retried: a retried provisioning call could register runners twice.
pub struct LambdaBackend {
    sdk_config: SdkConfig,
    function_name: String,
    endpoint: Option<String>,
}

impl fmt::Debug for LambdaBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LambdaBackend")
            .field("function_name", &self.function_name)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl LambdaBackend {
    pub fn new(sdk_config: &SdkConfig, function_name: impl Into<String>) -> Self {
        Self {
            sdk_config: sdk_config.clone(),
            function_name: function_name.into(),
            endpoint: None,
        }
    }

    /// Override the regional endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    fn client_for(&self, credential: &TemporaryCredential) -> Client {
        let mut config = aws_sdk_lambda::config::Builder::from(&self.sdk_config)
            .region(Region::new(credential.region().to_string()))
            .credentials_provider(credential.sdk_credentials())
            .retry_config(RetryConfig::disabled());
        if let Some(endpoint) = &self.endpoint {
            config = config.endpoint_url(endpoint);
        }
        Client::from_conf(config.build())
    }
}

#[async_trait]
impl ProvisionBackend for LambdaBackend {
    async fn invoke(
        &self,
        request: &ProvisionRequest,
        credential: &TemporaryCredential,
        _login: &RegistryLogin,
    ) -> Result<ProvisionResponse, ProvisionError> {
        let body = serde_json::to_vec(&request.to_payload())
            .map_err(|err| ProvisionError::Dispatch(err.to_string()))?;
        let invocation = self
            .client_for(credential)
            .invoke()
            .function_name(&self.function_name)
            .invocation_type(InvocationType::RequestResponse)
            .payload(Blob::new(body));

        let span = tracing::debug_span!("runway.dispatch.lambda", function = %self.function_name);
        async move {
            let output = invocation.send().await.map_err(|err| {
                ProvisionError::Dispatch(format!("invoke failed: {}", describe_sdk_error(&err)))
            })?;
            if let Some(kind) = output.function_error() {
                tracing::warn!(kind = %kind, "provisioning function raised an error");
            }
            let payload: &[u8] = output.payload().map(|blob| blob.as_ref()).unwrap_or(&[]);
            Ok(ProvisionResponse::from_slice(payload))
        }
        .instrument(span)
        .await
    }
}
