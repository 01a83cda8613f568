use std::fmt;
use std::time::SystemTime;

use aws_credential_types::Credentials;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::run::RunId;

/// Provider name attached to every per-run SDK credential.
pub const CREDENTIAL_PROVIDER: &str = "runway-run";

/// A secret string that is wiped on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the plaintext. Callers must not log the returned value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Where a requestor token came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenOrigin {
    /// Minted for this run from application identity material.
    AppInstallation,
    /// A long-lived token supplied by the operator.
    PreShared,
}

/// Short-lived, repository-scoped token handed to the backend so it can
/// register runners.
pub struct RequestorToken {
    value: Secret,
    expires_at: Option<DateTime<Utc>>,
    origin: TokenOrigin,
}

impl RequestorToken {
    pub fn new(
        value: impl Into<Secret>,
        expires_at: Option<DateTime<Utc>>,
        origin: TokenOrigin,
    ) -> Self {
        Self {
            value: value.into(),
            expires_at,
            origin,
        }
    }

    pub fn expose(&self) -> &str {
        self.value.expose()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn origin(&self) -> TokenOrigin {
        self.origin
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

impl fmt::Debug for RequestorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestorToken")
            .field("value", &self.value)
            .field("expires_at", &self.expires_at)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Reasons a credential may not be used by the current run.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum CredentialScopeError {
    #[error("credential was minted for run {minted_for}, not run {requested_by}")]
    ForeignRun {
        minted_for: RunId,
        requested_by: RunId,
    },
    #[error("credential expired at {0}")]
    Expired(DateTime<Utc>),
}

/// Cloud-role session credential obtained by role assumption.
///
/// Bound to the run that minted it and deliberately not `Clone`: it is
/// borrowed down the chain and dropped when the run ends. The SDK clients
/// for this run are handed [`TemporaryCredential::sdk_credentials`] and
/// nothing else.
pub struct TemporaryCredential {
    credentials: Credentials,
    expiration: DateTime<Utc>,
    region: String,
    run_id: RunId,
}

impl TemporaryCredential {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<Secret>,
        session_token: impl Into<Secret>,
        expiration: DateTime<Utc>,
        region: impl Into<String>,
        run_id: RunId,
    ) -> Self {
        let secret_access_key = secret_access_key.into();
        let session_token = session_token.into();
        let credentials = Credentials::new(
            access_key_id,
            secret_access_key.expose(),
            Some(session_token.expose().to_string()),
            Some(SystemTime::from(expiration)),
            CREDENTIAL_PROVIDER,
        );
        Self {
            credentials,
            expiration,
            region: region.into(),
            run_id,
        }
    }

    pub fn access_key_id(&self) -> &str {
        self.credentials.access_key_id()
    }

    /// Credentials for an SDK client acting on behalf of this run.
    pub fn sdk_credentials(&self) -> Credentials {
        self.credentials.clone()
    }

    pub fn expiration(&self) -> DateTime<Utc> {
        self.expiration
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Remaining lifetime at `now`, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expiration - now).max(Duration::zero())
    }

    /// Check that the credential belongs to `run_id` and is still valid.
    pub fn ensure_usable_for(
        &self,
        run_id: RunId,
        now: DateTime<Utc>,
    ) -> Result<(), CredentialScopeError> {
        if self.run_id != run_id {
            return Err(CredentialScopeError::ForeignRun {
                minted_for: self.run_id,
                requested_by: run_id,
            });
        }
        if self.expiration <= now {
            return Err(CredentialScopeError::Expired(self.expiration));
        }
        Ok(())
    }
}

impl fmt::Debug for TemporaryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporaryCredential")
            .field("access_key_id", &self.access_key_id())
            .field("secret_access_key", &"***")
            .field("session_token", &"***")
            .field("expiration", &self.expiration)
            .field("region", &self.region)
            .field("run_id", &self.run_id)
            .finish()
    }
}

/// Login context for the container registry that serves the runner image.
pub struct RegistryLogin {
    endpoint: String,
    username: String,
    password: Secret,
    expires_at: DateTime<Utc>,
    run_id: RunId,
}

impl RegistryLogin {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<Secret>,
        expires_at: DateTime<Utc>,
        run_id: RunId,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            expires_at,
            run_id,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &Secret {
        &self.password
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn ensure_usable_for(
        &self,
        run_id: RunId,
        now: DateTime<Utc>,
    ) -> Result<(), CredentialScopeError> {
        if self.run_id != run_id {
            return Err(CredentialScopeError::ForeignRun {
                minted_for: self.run_id,
                requested_by: run_id,
            });
        }
        if self.expires_at <= now {
            return Err(CredentialScopeError::Expired(self.expires_at));
        }
        Ok(())
    }
}

impl fmt::Debug for RegistryLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryLogin")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &self.password)
            .field("expires_at", &self.expires_at)
            .field("run_id", &self.run_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(run_id: RunId, ttl: Duration) -> TemporaryCredential {
        TemporaryCredential::new(
            "ASIAEXAMPLE",
            "very-secret",
            "session-secret",
            Utc::now() + ttl,
            "eu-central-1",
            run_id,
        )
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let cred = credential(RunId::new(), Duration::minutes(5));
        let rendered = format!("{cred:?}");
        assert!(rendered.contains("ASIAEXAMPLE"));
        assert!(!rendered.contains("very-secret"));
        assert!(!rendered.contains("session-secret"));
        assert!(!format!("{:?}", cred.sdk_credentials()).contains("very-secret"));

        let token = RequestorToken::new("ghs_plaintext", None, TokenOrigin::PreShared);
        assert!(!format!("{token:?}").contains("ghs_plaintext"));
    }

    #[test]
    fn credential_rejects_foreign_run() {
        let minted_for = RunId::new();
        let other = RunId::new();
        let cred = credential(minted_for, Duration::minutes(5));

        assert!(cred.ensure_usable_for(minted_for, Utc::now()).is_ok());
        assert_eq!(
            cred.ensure_usable_for(other, Utc::now()),
            Err(CredentialScopeError::ForeignRun {
                minted_for,
                requested_by: other,
            })
        );
    }

    #[test]
    fn credential_rejects_after_expiry() {
        let run_id = RunId::new();
        let cred = credential(run_id, Duration::minutes(5));
        let later = Utc::now() + Duration::minutes(6);

        assert!(matches!(
            cred.ensure_usable_for(run_id, later),
            Err(CredentialScopeError::Expired(_))
        ));
        assert_eq!(cred.remaining(later), Duration::zero());
    }

    #[test]
    fn sdk_credentials_carry_session_and_expiry() {
        let run_id = RunId::new();
        let cred = credential(run_id, Duration::minutes(5));
        let sdk = cred.sdk_credentials();

        assert_eq!(sdk.access_key_id(), "ASIAEXAMPLE");
        assert_eq!(sdk.secret_access_key(), "very-secret");
        assert_eq!(sdk.session_token(), Some("session-secret"));
        assert_eq!(sdk.expiry(), Some(SystemTime::from(cred.expiration())));
    }

    #[test]
    fn requestor_token_expiry() {
        let now = Utc::now();
        let token = RequestorToken::new(
            "ghs_x",
            Some(now + Duration::minutes(60)),
            TokenOrigin::AppInstallation,
        );
        assert!(!token.is_expired_at(now));
        assert!(token.is_expired_at(now + Duration::minutes(61)));

        let pre_shared = RequestorToken::new("ghp_x", None, TokenOrigin::PreShared);
        assert!(!pre_shared.is_expired_at(now + Duration::days(365)));
    }
}
