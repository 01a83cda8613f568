//! Identity brokering.
//!
//! A run needs two pieces of identity before anything else can happen: a
//! short-lived repository token the backend uses to register runners, and
//! temporary cloud credentials obtained by role assumption that authorize
//! the registry login and the dispatch call. Both are minted per run and
//! never persisted.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::credentials::{RequestorToken, TemporaryCredential};
use crate::error::ProvisionError;
use crate::run::RunContext;

/// GitHub App and pre-shared token issuers.
pub mod github;
/// Role assumption through STS web identity federation.
pub mod sts;

pub use github::{GithubAppTokenIssuer, GithubTokenIssuer, StaticTokenIssuer};
pub use sts::{StsRoleAssumer, WebIdentitySource};

/// Issues the repository-scoped token used for runner registration.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, ctx: &RunContext) -> Result<RequestorToken, ProvisionError>;
}

/// Exchanges a trusted identity for temporary cloud credentials.
#[async_trait]
pub trait RoleAssumer: Send + Sync {
    async fn assume(&self, ctx: &RunContext) -> Result<TemporaryCredential, ProvisionError>;
}

/// Everything the identity stage hands to the rest of the chain.
#[derive(Debug)]
pub struct RunIdentity {
    pub requestor_token: RequestorToken,
    pub cloud_credential: TemporaryCredential,
}

/// First stage of the chain.
#[async_trait]
pub trait IdentityBroker: Send + Sync {
    /// Mint the run's identity. Failures are
    /// [`ProvisionError::Authentication`].
    async fn acquire(&self, ctx: &RunContext) -> Result<RunIdentity, ProvisionError>;
}

/// Identity broker composed of a token issuer and a role assumer.
pub struct BrokeredIdentity<T, R>
where
    T: TokenIssuer,
    R: RoleAssumer,
{
    issuer: Arc<T>,
    assumer: Arc<R>,
}

impl<T, R> fmt::Debug for BrokeredIdentity<T, R>
where
    T: TokenIssuer,
    R: RoleAssumer,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokeredIdentity")
            .field("issuer_type", &std::any::type_name::<T>())
            .field("assumer_type", &std::any::type_name::<R>())
            .finish()
    }
}

impl<T, R> BrokeredIdentity<T, R>
where
    T: TokenIssuer,
    R: RoleAssumer,
{
    pub fn new(issuer: Arc<T>, assumer: Arc<R>) -> Self {
        Self { issuer, assumer }
    }
}

#[async_trait]
impl<T, R> IdentityBroker for BrokeredIdentity<T, R>
where
    T: TokenIssuer,
    R: RoleAssumer,
{
    async fn acquire(&self, ctx: &RunContext) -> Result<RunIdentity, ProvisionError> {
        let requestor_token = self.issuer.issue(ctx).await?;
        if requestor_token.is_expired_at(Utc::now()) {
            return Err(ProvisionError::Authentication(
                "issued requestor token is already expired".into(),
            ));
        }

        let cloud_credential = self.assumer.assume(ctx).await?;
        cloud_credential
            .ensure_usable_for(ctx.run_id, Utc::now())
            .map_err(|err| ProvisionError::Authentication(err.to_string()))?;

        tracing::info!(
            run_id = %ctx.run_id,
            token_origin = ?requestor_token.origin(),
            credential_expires_at = %cloud_credential.expiration(),
            "run identity acquired"
        );

        Ok(RunIdentity {
            requestor_token,
            cloud_credential,
        })
    }
}
