//! Container registry login.
//!
//! Runs strictly after identity and strictly before dispatch. A failure here
//! leaves no trace on the runner fleet, so it is cheap to abort on.

use std::fmt;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_ecr::Client;
use aws_sdk_ecr::config::Region;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use tracing::Instrument;

use crate::aws::describe_sdk_error;
use crate::credentials::{RegistryLogin, TemporaryCredential};
use crate::error::ProvisionError;
use crate::run::RunContext;

/// Second stage of the chain.
#[async_trait]
pub trait RegistryAuthenticator: Send + Sync {
    /// Log in with the run's temporary credential.
    ///
    /// # Errors
    ///
    /// [`ProvisionError::RegistryAuth`] when the credential is expired, was
    /// minted for another run, or the registry denies access.
    async fn login(
        &self,
        ctx: &RunContext,
        credential: &TemporaryCredential,
    ) -> Result<RegistryLogin, ProvisionError>;
}

/// Authenticates against ECR with `GetAuthorizationToken`.
///
/// A client is built per login, signed with that run's credential.
pub struct EcrAuthenticator {
    sdk_config: SdkConfig,
    endpoint: Option<String>,
    registry_ids: Vec<String>,
}

impl fmt::Debug for EcrAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcrAuthenticator")
            .field("endpoint", &self.endpoint)
            .field("registry_ids", &self.registry_ids)
            .finish()
    }
}

impl EcrAuthenticator {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            sdk_config: sdk_config.clone(),
            endpoint: None,
            registry_ids: Vec::new(),
        }
    }

    /// Override the regional endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Registries other than the caller's default.
    pub fn with_registry_ids(mut self, ids: Vec<String>) -> Self {
        self.registry_ids = ids;
        self
    }

    fn client_for(&self, credential: &TemporaryCredential) -> Client {
        let mut config = aws_sdk_ecr::config::Builder::from(&self.sdk_config)
            .region(Region::new(credential.region().to_string()))
            .credentials_provider(credential.sdk_credentials());
        if let Some(endpoint) = &self.endpoint {
            config = config.endpoint_url(endpoint);
        }
        Client::from_conf(config.build())
    }

    async fn get_authorization_token(
        &self,
        ctx: &RunContext,
        credential: &TemporaryCredential,
    ) -> Result<RegistryLogin, ProvisionError> {
        let mut request = self.client_for(credential).get_authorization_token();
        if !self.registry_ids.is_empty() {
            request = request.set_registry_ids(Some(self.registry_ids.clone()));
        }
        let output = request.send().await.map_err(|err| {
            ProvisionError::RegistryAuth(format!(
                "registry denied access: {}",
                describe_sdk_error(&err)
            ))
        })?;

        let data = output.authorization_data().first().ok_or_else(|| {
            ProvisionError::RegistryAuth("registry returned no authorization data".into())
        })?;
        let token = data.authorization_token().ok_or_else(|| {
            ProvisionError::RegistryAuth("authorization data carries no token".into())
        })?;
        let expires_at = data
            .expires_at()
            .and_then(|at| DateTime::from_timestamp(at.secs(), at.subsec_nanos()))
            .ok_or_else(|| ProvisionError::RegistryAuth("login expiry missing or out of range".into()))?;
        let endpoint = data.proxy_endpoint().unwrap_or_default();
        decode_login(token, endpoint, expires_at, ctx)
    }
}

/// Split a base64 `user:password` authorization token into a login.
fn decode_login(
    token: &str,
    endpoint: &str,
    expires_at: DateTime<Utc>,
    ctx: &RunContext,
) -> Result<RegistryLogin, ProvisionError> {
    let decoded = BASE64
        .decode(token.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| ProvisionError::RegistryAuth("authorization token is not base64".into()))?;
    let (username, password) = decoded.split_once(':').ok_or_else(|| {
        ProvisionError::RegistryAuth("authorization token is not user:password".into())
    })?;

    Ok(RegistryLogin::new(
        endpoint,
        username,
        password,
        expires_at,
        ctx.run_id,
    ))
}

#[async_trait]
impl RegistryAuthenticator for EcrAuthenticator {
    async fn login(
        &self,
        ctx: &RunContext,
        credential: &TemporaryCredential,
    ) -> Result<RegistryLogin, ProvisionError> {
        credential
            .ensure_usable_for(ctx.run_id, Utc::now())
            .map_err(|err| ProvisionError::RegistryAuth(err.to_string()))?;

        let span = tracing::debug_span!("runway.registry.ecr", region = credential.region());
        let login = self
            .get_authorization_token(ctx, credential)
            .instrument(span)
            .await?;
        tracing::info!(
            run_id = %ctx.run_id,
            endpoint = login.endpoint(),
            expires_at = %login.expires_at(),
            "registry login acquired"
        );
        Ok(login)
    }
}
