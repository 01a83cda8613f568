use std::fmt::{self, Display};
use std::num::NonZeroU32;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::credentials::RequestorToken;
use crate::error::ProvisionError;

/// Size class of a provisioned runner.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub enum ComputeTier {
    XS,
    #[default]
    S,
    M,
    L,
    XL,
}

impl ComputeTier {
    pub const ALL: [ComputeTier; 5] = [
        ComputeTier::XS,
        ComputeTier::S,
        ComputeTier::M,
        ComputeTier::L,
        ComputeTier::XL,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeTier::XS => "XS",
            ComputeTier::S => "S",
            ComputeTier::M => "M",
            ComputeTier::L => "L",
            ComputeTier::XL => "XL",
        }
    }
}

impl Display for ComputeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
#[error("unknown compute tier '{0}', expected one of XS, S, M, L, XL")]
pub struct UnknownComputeTier(pub String);

impl FromStr for ComputeTier {
    type Err = UnknownComputeTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        ComputeTier::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownComputeTier(s.to_string()))
    }
}

/// Number of runners requested. Always at least one.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RunnerCount(NonZeroU32);

impl RunnerCount {
    pub const ONE: RunnerCount = RunnerCount(NonZeroU32::MIN);

    /// Reject anything below one instead of clamping it.
    pub fn new(count: i64) -> Result<Self, ProvisionError> {
        u32::try_from(count)
            .ok()
            .and_then(NonZeroU32::new)
            .map(Self)
            .ok_or_else(|| {
                ProvisionError::InvalidRequest(format!(
                    "runner count must be a positive integer, got {count}"
                ))
            })
    }

    pub fn get(&self) -> u32 {
        self.0.get()
    }
}

impl Default for RunnerCount {
    fn default() -> Self {
        Self::ONE
    }
}

impl Display for RunnerCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `owner/name` identifier of the repository runners attach to.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RepositoryId {
    owner: String,
    name: String,
}

impl RepositoryId {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for RepositoryId {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            ProvisionError::InvalidRequest(format!(
                "repository must be of the form owner/name, got '{s}'"
            ))
        };
        let (owner, name) = s.trim().split_once('/').ok_or_else(invalid)?;
        let valid_part = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c))
        };
        if !valid_part(owner) || !valid_part(name) {
            return Err(invalid());
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Request sent to the provisioning backend.
#[derive(Debug)]
pub struct ProvisionRequest {
    requestor_token: RequestorToken,
    runner_count: RunnerCount,
    compute_tier: ComputeTier,
    target_repository: RepositoryId,
}

impl ProvisionRequest {
    pub fn new(
        requestor_token: RequestorToken,
        runner_count: RunnerCount,
        compute_tier: ComputeTier,
        target_repository: RepositoryId,
    ) -> Self {
        Self {
            requestor_token,
            runner_count,
            compute_tier,
            target_repository,
        }
    }

    /// Build a request from an unchecked runner count.
    pub fn build(
        requestor_token: RequestorToken,
        runner_count: i64,
        compute_tier: ComputeTier,
        target_repository: RepositoryId,
    ) -> Result<Self, ProvisionError> {
        Ok(Self::new(
            requestor_token,
            RunnerCount::new(runner_count)?,
            compute_tier,
            target_repository,
        ))
    }

    pub fn requestor_token(&self) -> &RequestorToken {
        &self.requestor_token
    }

    pub fn runner_count(&self) -> RunnerCount {
        self.runner_count
    }

    pub fn compute_tier(&self) -> ComputeTier {
        self.compute_tier
    }

    pub fn target_repository(&self) -> &RepositoryId {
        &self.target_repository
    }

    /// Wire payload: `{github_api_secret, count_container,
    /// container_compute, repository}`.
    ///
    /// This is the only place the requestor token is written out in
    /// plaintext. Never log the result.
    pub fn to_payload(&self) -> Value {
        json!({
            "github_api_secret": self.requestor_token.expose(),
            "count_container": self.runner_count.get(),
            "container_compute": self.compute_tier.as_str(),
            "repository": self.target_repository.to_string(),
        })
    }

    /// Payload with the token masked, for diagnostics.
    pub fn redacted_payload(&self) -> Value {
        let mut payload = self.to_payload();
        payload["github_api_secret"] = Value::String("***".into());
        payload
    }
}

/// Response received from the provisioning backend, kept verbatim.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionResponse {
    payload: Value,
}

impl ProvisionResponse {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }

    /// Parse raw bytes. Bytes that are not JSON are kept as a JSON string so
    /// that the diagnostic can still show them.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let payload = serde_json::from_slice(bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        });
        Self { payload }
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// `statusCode` as an integer. `None` when missing or not an integer.
    pub fn status_code(&self) -> Option<i64> {
        self.payload.get("statusCode").and_then(Value::as_i64)
    }

    pub fn body(&self) -> Option<&Value> {
        self.payload.get("body")
    }

    /// Compact JSON rendering of the whole payload.
    pub fn raw(&self) -> String {
        self.payload.to_string()
    }
}

impl Display for ProvisionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.payload)
    }
}
