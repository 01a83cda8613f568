use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sts::Client;
use aws_sdk_sts::config::Region;
use chrono::DateTime;
use serde::Deserialize;
use tracing::Instrument;
use url::Url;

use super::RoleAssumer;
use crate::aws::describe_sdk_error;
use crate::credentials::{Secret, TemporaryCredential};
use crate::error::ProvisionError;
use crate::http::body_snippet;
use crate::run::RunContext;

/// Audience the OIDC token is requested for.
pub const STS_AUDIENCE: &str = "sts.amazonaws.com";

/// Shortest and longest session the role API accepts.
pub const MIN_SESSION_SECS: u32 = 900;
pub const MAX_SESSION_SECS: u32 = 43_200;

/// Where the web identity token presented to STS comes from.
pub enum WebIdentitySource {
    /// A projected token file, re-read on every assumption.
    File(PathBuf),
    /// A token resolved once at startup.
    Token(Secret),
    /// The CI runner's OIDC endpoint.
    ActionsOidc {
        request_url: String,
        request_token: Secret,
        audience: String,
    },
}

impl fmt::Debug for WebIdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebIdentitySource::File(path) => f.debug_tuple("File").field(path).finish(),
            WebIdentitySource::Token(token) => f.debug_tuple("Token").field(token).finish(),
            WebIdentitySource::ActionsOidc {
                request_url,
                audience,
                ..
            } => f
                .debug_struct("ActionsOidc")
                .field("request_url", request_url)
                .field("audience", audience)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Deserialize)]
struct OidcTokenResponse {
    value: String,
}

/// Assumes the provisioning role with a web identity token.
///
/// The call is unsigned: the web identity token is the proof.
#[derive(Debug)]
pub struct StsRoleAssumer {
    sts: Client,
    http: reqwest::Client,
    region: String,
    role_arn: String,
    session_duration_secs: u32,
    source: WebIdentitySource,
}

impl StsRoleAssumer {
    /// `http` is only used to fetch CI OIDC tokens.
    pub fn new(
        sdk_config: &SdkConfig,
        http: reqwest::Client,
        region: impl Into<String>,
        role_arn: impl Into<String>,
        source: WebIdentitySource,
    ) -> Self {
        let region = region.into();
        let config = aws_sdk_sts::config::Builder::from(sdk_config)
            .region(Region::new(region.clone()))
            .build();
        Self {
            sts: Client::from_conf(config),
            http,
            region,
            role_arn: role_arn.into(),
            session_duration_secs: 3600,
            source,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let config = self.sts.config().to_builder().endpoint_url(endpoint).build();
        self.sts = Client::from_conf(config);
        self
    }

    /// Clamped to what the role API accepts.
    pub fn with_session_duration(mut self, secs: u32) -> Self {
        self.session_duration_secs = secs.clamp(MIN_SESSION_SECS, MAX_SESSION_SECS);
        self
    }

    pub fn session_duration_secs(&self) -> u32 {
        self.session_duration_secs
    }

    async fn web_identity_token(&self) -> Result<Secret, ProvisionError> {
        let token = match &self.source {
            WebIdentitySource::File(path) => tokio::fs::read_to_string(path)
                .await
                .map(|raw| Secret::new(raw.trim()))
                .map_err(|err| {
                    ProvisionError::Authentication(format!(
                        "cannot read web identity token {}: {err}",
                        path.display()
                    ))
                })?,
            WebIdentitySource::Token(token) => token.clone(),
            WebIdentitySource::ActionsOidc {
                request_url,
                request_token,
                audience,
            } => self.fetch_oidc_token(request_url, request_token, audience).await?,
        };
        if token.is_empty() {
            return Err(ProvisionError::Authentication(
                "web identity token is empty".into(),
            ));
        }
        Ok(token)
    }

    async fn fetch_oidc_token(
        &self,
        request_url: &str,
        request_token: &Secret,
        audience: &str,
    ) -> Result<Secret, ProvisionError> {
        let mut url = Url::parse(request_url).map_err(|err| {
            ProvisionError::Authentication(format!("invalid OIDC request url: {err}"))
        })?;
        url.query_pairs_mut().append_pair("audience", audience);

        let response = self
            .http
            .get(url)
            .bearer_auth(request_token.expose())
            .send()
            .await
            .map_err(|err| ProvisionError::Authentication(format!("OIDC token request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Authentication(format!(
                "OIDC token request returned {status}: {}",
                body_snippet(&body)
            )));
        }
        let parsed: OidcTokenResponse = response.json().await.map_err(|_| {
            ProvisionError::Authentication("malformed OIDC token response".into())
        })?;
        Ok(Secret::new(parsed.value))
    }

    async fn assume_role(&self, ctx: &RunContext) -> Result<TemporaryCredential, ProvisionError> {
        let web_identity = self.web_identity_token().await?;
        let session_name = ctx.session_name();
        let duration = i32::try_from(self.session_duration_secs).unwrap_or(MAX_SESSION_SECS as i32);

        let output = self
            .sts
            .assume_role_with_web_identity()
            .role_arn(&self.role_arn)
            .role_session_name(&session_name)
            .web_identity_token(web_identity.expose())
            .duration_seconds(duration)
            .send()
            .await
            .map_err(|err| {
                ProvisionError::Authentication(format!(
                    "role {} rejected: {}",
                    self.role_arn,
                    describe_sdk_error(&err)
                ))
            })?;

        let creds = output.credentials().ok_or_else(|| {
            ProvisionError::Authentication("role assumption returned no credentials".into())
        })?;
        let expiry = creds.expiration();
        let expiration = DateTime::from_timestamp(expiry.secs(), expiry.subsec_nanos())
            .ok_or_else(|| {
                ProvisionError::Authentication("role credential expiration out of range".into())
            })?;

        tracing::debug!(
            role_arn = %self.role_arn,
            session_name = %session_name,
            expires_at = %expiration,
            "role assumed"
        );
        Ok(TemporaryCredential::new(
            creds.access_key_id(),
            creds.secret_access_key(),
            creds.session_token(),
            expiration,
            self.region.clone(),
            ctx.run_id,
        ))
    }
}

#[async_trait]
impl RoleAssumer for StsRoleAssumer {
    async fn assume(&self, ctx: &RunContext) -> Result<TemporaryCredential, ProvisionError> {
        let span = tracing::debug_span!("runway.identity.sts", role_arn = %self.role_arn);
        self.assume_role(ctx).instrument(span).await
    }
}
