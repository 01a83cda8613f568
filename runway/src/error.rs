use thiserror::Error;

/// Failure taxonomy for a provisioning run.
///
/// Every variant is fatal for the run that produced it. There is no
/// partial-success or degraded mode: the chain stops at the first error and
/// the dependent job is never started.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Identity issuance or role assumption failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Container registry login failed.
    #[error("registry authentication failed: {0}")]
    RegistryAuth(String),

    /// The provisioning backend could not be reached (network, timeout,
    /// invoke API refusal). No response was received.
    #[error("dispatch to provisioning backend failed: {0}")]
    Dispatch(String),

    /// A response was received but did not confirm the runner.
    #[error("runner provisioning failed: {reason}; raw response: {raw_response}")]
    ProvisioningFailed {
        /// Why the response was rejected.
        reason: String,
        /// The full response payload as received.
        raw_response: String,
    },

    /// The request could not be constructed from the trigger parameters.
    #[error("invalid provision request: {0}")]
    InvalidRequest(String),

    /// A newer trigger with the same run key cancelled this run.
    #[error("run superseded by a newer trigger for run key {run_key}")]
    Superseded {
        /// The contested run key.
        run_key: String,
    },

    /// The dependent consumer job failed or timed out.
    #[error("consumer job failed: {0}")]
    Consumer(String),

    /// Configuration was missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProvisionError {
    /// Short label for the chain stage that produced the error.
    pub fn stage(&self) -> &'static str {
        match self {
            ProvisionError::Authentication(_) => "identity",
            ProvisionError::RegistryAuth(_) => "registry",
            ProvisionError::Dispatch(_) => "dispatch",
            ProvisionError::ProvisioningFailed { .. } => "validate",
            ProvisionError::InvalidRequest(_) => "request",
            ProvisionError::Superseded { .. } => "superseded",
            ProvisionError::Consumer(_) => "consumer",
            ProvisionError::Config(_) => "config",
        }
    }

    /// Process exit code reported for this error. Never zero.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionError::Config(_) | ProvisionError::InvalidRequest(_) => 2,
            ProvisionError::Authentication(_) => 3,
            ProvisionError::RegistryAuth(_) => 4,
            ProvisionError::Dispatch(_) => 5,
            ProvisionError::ProvisioningFailed { .. } => 6,
            ProvisionError::Superseded { .. } => 7,
            ProvisionError::Consumer(_) => 8,
        }
    }

    /// Whether the error came from a newer trigger taking over the run key.
    pub fn is_superseded(&self) -> bool {
        matches!(self, ProvisionError::Superseded { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_never_zero() {
        let errors = [
            ProvisionError::Authentication("x".into()),
            ProvisionError::RegistryAuth("x".into()),
            ProvisionError::Dispatch("x".into()),
            ProvisionError::ProvisioningFailed {
                reason: "x".into(),
                raw_response: "{}".into(),
            },
            ProvisionError::InvalidRequest("x".into()),
            ProvisionError::Superseded {
                run_key: "ci-refs/heads/main".into(),
            },
            ProvisionError::Consumer("x".into()),
            ProvisionError::Config("x".into()),
        ];

        for err in errors {
            assert_ne!(err.exit_code(), 0, "{err} mapped to exit code 0");
        }
    }

    #[test]
    fn provisioning_failure_message_carries_raw_response() {
        let err = ProvisionError::ProvisioningFailed {
            reason: "statusCode was 500".into(),
            raw_response: r#"{"statusCode":500,"body":"capacity exceeded"}"#.into(),
        };
        let message = err.to_string();
        assert!(message.contains(r#""statusCode":500"#));
        assert!(message.contains("capacity exceeded"));
        assert_eq!(err.stage(), "validate");
    }
}
