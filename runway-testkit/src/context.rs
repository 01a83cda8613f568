use chrono::{Duration, Utc};
use runway::*;
use serde_json::json;

pub const TEST_REPOSITORY: &str = "acme/widgets";
pub const TEST_WORKFLOW: &str = "benchmarks";
pub const TEST_REF: &str = "refs/heads/main";
pub const TEST_REGION: &str = "eu-west-1";
pub const TEST_REGISTRY: &str = "https://123456789012.dkr.ecr.eu-west-1.amazonaws.com";

/// Trigger for the default test repository, workflow and ref.
pub fn trigger() -> RunTrigger {
    RunTrigger::new(TEST_REPOSITORY, TEST_WORKFLOW, TEST_REF)
}

/// Trigger for the same workflow on another ref.
pub fn trigger_on(git_ref: &str) -> RunTrigger {
    RunTrigger::new(TEST_REPOSITORY, TEST_WORKFLOW, git_ref)
}

pub fn run_context() -> RunContext {
    RunContext::from_trigger(&trigger(), None).expect("test trigger is valid")
}

pub fn requestor_token() -> RequestorToken {
    RequestorToken::new(
        "ghs_testkit_token",
        Some(Utc::now() + Duration::hours(1)),
        TokenOrigin::AppInstallation,
    )
}

/// Credential valid for an hour, bound to `run_id`.
pub fn credential_for(run_id: RunId) -> TemporaryCredential {
    credential_expiring(run_id, Duration::hours(1))
}

/// Credential with a lifetime relative to now; negative means expired.
pub fn credential_expiring(run_id: RunId, lifetime: Duration) -> TemporaryCredential {
    TemporaryCredential::new(
        "ASIATESTKIT",
        "testkit-secret-key",
        "testkit-session-token",
        Utc::now() + lifetime,
        TEST_REGION,
        run_id,
    )
}

pub fn login_for(run_id: RunId) -> RegistryLogin {
    RegistryLogin::new(
        TEST_REGISTRY,
        "AWS",
        "testkit-registry-password",
        Utc::now() + Duration::hours(12),
        run_id,
    )
}

/// Function payload confirming the runner.
pub fn confirmed_payload() -> serde_json::Value {
    json!({ "statusCode": 200, "body": "runner registered" })
}

/// Function payload rejecting the request with `status`.
pub fn rejected_payload(status: i64, body: &str) -> serde_json::Value {
    json!({ "statusCode": status, "body": body })
}
