use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::EncodingKey;
use octocrab::Octocrab;
use octocrab::models::AppId;
use serde::Deserialize;
use serde_json::json;
use tracing::Instrument;

use super::TokenIssuer;
use crate::credentials::{RequestorToken, Secret, TokenOrigin};
use crate::error::ProvisionError;
use crate::request::RepositoryId;
use crate::run::RunContext;

#[derive(Deserialize)]
struct MintedToken {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

/// Mints installation access tokens for a GitHub App, narrowed to the run's
/// repository with `administration: write` so the backend can register
/// self-hosted runners.
pub struct GithubAppTokenIssuer {
    api_url: String,
    app_id: u64,
    installation_id: Option<u64>,
    key: EncodingKey,
}

impl fmt::Debug for GithubAppTokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubAppTokenIssuer")
            .field("api_url", &self.api_url)
            .field("app_id", &self.app_id)
            .field("installation_id", &self.installation_id)
            .finish_non_exhaustive()
    }
}

impl GithubAppTokenIssuer {
    /// `private_key_pem` is the app's RSA key in PEM form.
    ///
    /// # Errors
    ///
    /// [`ProvisionError::Authentication`] when the key does not parse.
    pub fn new(
        api_url: impl Into<String>,
        app_id: u64,
        installation_id: Option<u64>,
        private_key_pem: &Secret,
    ) -> Result<Self, ProvisionError> {
        let key = EncodingKey::from_rsa_pem(private_key_pem.expose().as_bytes()).map_err(
            |err| ProvisionError::Authentication(format!("invalid app private key: {err}")),
        )?;
        Ok(Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            app_id,
            installation_id,
            key,
        })
    }

    /// Client authenticating as the app itself.
    fn app_client(&self) -> Result<Octocrab, ProvisionError> {
        Octocrab::builder()
            .app(AppId(self.app_id), self.key.clone())
            .base_uri(self.api_url.as_str())
            .and_then(|builder| builder.build())
            .map_err(|err| ProvisionError::Authentication(format!("GitHub client setup failed: {err}")))
    }

    async fn installation_for(
        &self,
        octocrab: &Octocrab,
        repository: &RepositoryId,
    ) -> Result<u64, ProvisionError> {
        if let Some(id) = self.installation_id {
            return Ok(id);
        }
        match octocrab
            .apps()
            .get_repository_installation(repository.owner(), repository.name())
            .await
        {
            Ok(installation) => Ok(installation.id.0),
            Err(octocrab::Error::GitHub { source, .. }) if source.status_code.as_u16() == 404 => {
                Err(ProvisionError::Authentication(format!(
                    "app {} is not installed on {repository}",
                    self.app_id
                )))
            }
            Err(err) => Err(ProvisionError::Authentication(format!(
                "installation lookup failed: {}",
                describe_github_error(&err)
            ))),
        }
    }

    async fn mint(&self, ctx: &RunContext) -> Result<RequestorToken, ProvisionError> {
        let octocrab = self.app_client()?;
        let installation = self.installation_for(&octocrab, &ctx.repository).await?;

        let scope = json!({
            "repositories": [ctx.repository.name()],
            "permissions": { "administration": "write" },
        });
        let minted: MintedToken = octocrab
            .post(
                format!("/app/installations/{installation}/access_tokens"),
                Some(&scope),
            )
            .await
            .map_err(|err| {
                ProvisionError::Authentication(format!(
                    "installation token request failed: {}",
                    describe_github_error(&err)
                ))
            })?;

        tracing::debug!(
            installation,
            expires_at = ?minted.expires_at,
            "installation token minted"
        );
        Ok(RequestorToken::new(
            minted.token,
            minted.expires_at,
            TokenOrigin::AppInstallation,
        ))
    }
}

#[async_trait]
impl TokenIssuer for GithubAppTokenIssuer {
    async fn issue(&self, ctx: &RunContext) -> Result<RequestorToken, ProvisionError> {
        let span = tracing::debug_span!("runway.identity.github", repository = %ctx.repository);
        self.mint(ctx).instrument(span).await
    }
}

/// API errors as `status: message`. Decode failures never echo the body,
/// which may hold a token.
fn describe_github_error(err: &octocrab::Error) -> String {
    match err {
        octocrab::Error::GitHub { source, .. } => {
            format!("{}: {}", source.status_code, source.message)
        }
        octocrab::Error::Serde { .. } | octocrab::Error::Json { .. } => {
            "malformed response".to_string()
        }
        other => other.to_string(),
    }
}

/// Operator-supplied token, used as-is for every run.
pub struct StaticTokenIssuer {
    token: Secret,
}

impl fmt::Debug for StaticTokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenIssuer")
            .field("token", &self.token)
            .finish()
    }
}

impl StaticTokenIssuer {
    pub fn new(token: impl Into<Secret>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenIssuer for StaticTokenIssuer {
    async fn issue(&self, _ctx: &RunContext) -> Result<RequestorToken, ProvisionError> {
        if self.token.is_empty() {
            return Err(ProvisionError::Authentication(
                "pre-shared requestor token is empty".into(),
            ));
        }
        Ok(RequestorToken::new(
            self.token.clone(),
            None,
            TokenOrigin::PreShared,
        ))
    }
}

/// Token issuer selected from configuration.
#[derive(Debug)]
pub enum GithubTokenIssuer {
    App(GithubAppTokenIssuer),
    PreShared(StaticTokenIssuer),
}

#[async_trait]
impl TokenIssuer for GithubTokenIssuer {
    async fn issue(&self, ctx: &RunContext) -> Result<RequestorToken, ProvisionError> {
        match self {
            GithubTokenIssuer::App(issuer) => issuer.issue(ctx).await,
            GithubTokenIssuer::PreShared(issuer) => issuer.issue(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunTrigger;
    use mockito::Matcher;

    const TEST_KEY: &str = include_str!("../../tests/fixtures/app-key.pem");
    const APP_JWT: &str = r"^Bearer [\w-]+\.[\w-]+\.[\w-]+$";

    fn ctx() -> RunContext {
        RunContext::from_trigger(
            &RunTrigger::new("acme/widgets", "ci", "refs/heads/main"),
            None,
        )
        .unwrap()
    }

    fn issuer(api_url: &str, installation_id: Option<u64>) -> GithubAppTokenIssuer {
        GithubAppTokenIssuer::new(api_url, 12345, installation_id, &Secret::new(TEST_KEY)).unwrap()
    }

    #[test]
    fn garbage_private_key_is_authentication_error() {
        let err = GithubAppTokenIssuer::new("http://unused", 1, None, &Secret::new("not a key"))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Authentication(_)));
    }

    #[test]
    fn debug_omits_key_material() {
        let rendered = format!("{:?}", issuer("http://unused", Some(1)));
        assert!(rendered.contains("12345"));
        assert!(!rendered.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn looks_up_installation_then_mints_scoped_token() {
        let mut server = mockito::Server::new_async().await;
        let lookup = server
            .mock("GET", "/repos/acme/widgets/installation")
            .match_header("authorization", Matcher::Regex(APP_JWT.into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(include_str!("../../tests/fixtures/installation.json"))
            .create_async()
            .await;
        let mint = server
            .mock("POST", "/app/installations/77/access_tokens")
            .match_header("authorization", Matcher::Regex(APP_JWT.into()))
            .match_body(Matcher::PartialJson(json!({
                "repositories": ["widgets"],
                "permissions": {"administration": "write"}
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token": "ghs_minted", "expires_at": "2099-01-01T00:00:00Z"}"#)
            .create_async()
            .await;

        let token = issuer(&server.url(), None).issue(&ctx()).await.unwrap();

        lookup.assert_async().await;
        mint.assert_async().await;
        assert_eq!(token.expose(), "ghs_minted");
        assert_eq!(token.origin(), TokenOrigin::AppInstallation);
        assert_eq!(token.expires_at().unwrap().to_rfc3339(), "2099-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn configured_installation_skips_lookup() {
        let mut server = mockito::Server::new_async().await;
        let lookup = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        server
            .mock("POST", "/app/installations/5/access_tokens")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token": "ghs_direct", "expires_at": "2099-01-01T00:00:00Z"}"#)
            .create_async()
            .await;

        let token = issuer(&server.url(), Some(5)).issue(&ctx()).await.unwrap();
        assert_eq!(token.expose(), "ghs_direct");
        lookup.assert_async().await;
    }

    #[tokio::test]
    async fn missing_installation_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/acme/widgets/installation")
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message": "Not Found", "documentation_url": "https://docs.github.com/rest"}"#)
            .create_async()
            .await;

        let err = issuer(&server.url(), None).issue(&ctx()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Authentication(_)));
        assert!(err.to_string().contains("not installed on acme/widgets"), "{err}");
    }

    #[tokio::test]
    async fn rejected_token_request_surfaces_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/app/installations/5/access_tokens")
            .with_status(422)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message": "permissions exceed app grant", "documentation_url": "https://docs.github.com/rest"}"#)
            .create_async()
            .await;

        let err = issuer(&server.url(), Some(5)).issue(&ctx()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("422"), "{message}");
        assert!(message.contains("permissions exceed app grant"), "{message}");
    }

    #[tokio::test]
    async fn static_issuer_passes_token_through() {
        let token = StaticTokenIssuer::new("ghp_operator").issue(&ctx()).await.unwrap();
        assert_eq!(token.expose(), "ghp_operator");
        assert_eq!(token.origin(), TokenOrigin::PreShared);
        assert!(token.expires_at().is_none());

        assert!(StaticTokenIssuer::new("").issue(&ctx()).await.is_err());
    }
}
