//! Wiring from [`RunwayConfig`] to the concrete collaborators.
//!
//! Nothing here talks to a backend. Identity material referenced by the
//! configuration (key files, token variables) is resolved eagerly so a
//! misconfiguration fails before the first run starts.

use std::sync::Arc;
use std::time::Duration;

use aws_config::SdkConfig;

use crate::aws;
use crate::config::{GithubConfig, RunwayConfig, WebIdentityConfig};
use crate::consumer::CommandConsumer;
use crate::credentials::Secret;
use crate::dispatch::LambdaBackend;
use crate::error::ProvisionError;
use crate::http;
use crate::identity::{
    BrokeredIdentity, GithubAppTokenIssuer, GithubTokenIssuer, StaticTokenIssuer,
    StsRoleAssumer, WebIdentitySource,
};
use crate::registry::EcrAuthenticator;
use crate::runtime::{OrchestratorConfig, ProvisioningOrchestrator, ProvisioningOrchestratorBuilder};

/// Request timeout for OIDC token requests.
pub const API_TIMEOUT: Duration = Duration::from_secs(60);

/// Variables the CI runner sets when OIDC tokens may be requested.
pub const ACTIONS_ID_TOKEN_REQUEST_URL: &str = "ACTIONS_ID_TOKEN_REQUEST_URL";
pub const ACTIONS_ID_TOKEN_REQUEST_TOKEN: &str = "ACTIONS_ID_TOKEN_REQUEST_TOKEN";

pub type StandardIdentity = BrokeredIdentity<GithubTokenIssuer, StsRoleAssumer>;
pub type StandardOrchestrator =
    ProvisioningOrchestrator<StandardIdentity, EcrAuthenticator, LambdaBackend>;
pub type StandardOrchestratorBuilder =
    ProvisioningOrchestratorBuilder<StandardIdentity, EcrAuthenticator, LambdaBackend>;

/// Build an orchestrator from configuration and the process environment.
///
/// # Errors
///
/// [`ProvisionError::Config`] when the configuration is invalid or refers
/// to identity material that cannot be read.
pub async fn build_orchestrator(
    config: &RunwayConfig,
    with_consumer: bool,
) -> Result<StandardOrchestrator, ProvisionError> {
    let sdk_config = shared_sdk_config(config).await?;
    orchestrator_builder(config, with_consumer, &sdk_config, |name| {
        std::env::var(name).ok()
    })?
    .build()
    .map_err(|err| ProvisionError::Config(err.to_string()))
}

/// Cloud SDK configuration for the configured region.
///
/// # Errors
///
/// [`ProvisionError::Config`] when no region is configured.
pub async fn shared_sdk_config(config: &RunwayConfig) -> Result<SdkConfig, ProvisionError> {
    let region = required(config.cloud.region.as_deref(), "cloud.region")?;
    Ok(aws::load_shared_config(region).await)
}

/// Prepare a builder with every collaborator configured, resolving
/// variables through `lookup`. The caller may still attach an event
/// publisher.
///
/// # Errors
///
/// See [`build_orchestrator`].
pub fn orchestrator_builder<F>(
    config: &RunwayConfig,
    with_consumer: bool,
    sdk_config: &SdkConfig,
    lookup: F,
) -> Result<StandardOrchestratorBuilder, ProvisionError>
where
    F: Fn(&str) -> Option<String>,
{
    config.validate()?;

    let region = required(config.cloud.region.as_deref(), "cloud.region")?;
    let role_arn = required(config.cloud.role_arn.as_deref(), "cloud.role_arn")?;
    let function_name = required(
        config.dispatch.function_name.as_deref(),
        "dispatch.function_name",
    )?;

    let oidc_client = http::build_client(API_TIMEOUT).map_err(client_error)?;

    let issuer = token_issuer(&config.github, &lookup)?;
    let source = web_identity_source(&config.cloud.web_identity, &lookup)?;
    let mut assumer = StsRoleAssumer::new(sdk_config, oidc_client, region, role_arn, source)
        .with_session_duration(config.cloud.effective_session_duration());
    if let Some(endpoint) = &config.cloud.sts_endpoint {
        assumer = assumer.with_endpoint(endpoint.clone());
    }
    let identity = BrokeredIdentity::new(Arc::new(issuer), Arc::new(assumer));

    let mut registry =
        EcrAuthenticator::new(sdk_config).with_registry_ids(config.registry.registry_ids.clone());
    if let Some(endpoint) = &config.registry.endpoint {
        registry = registry.with_endpoint(endpoint.clone());
    }

    let mut backend = LambdaBackend::new(sdk_config, function_name);
    if let Some(endpoint) = &config.dispatch.endpoint {
        backend = backend.with_endpoint(endpoint.clone());
    }

    let consumer = config.consumer.as_ref().filter(|_| with_consumer);
    let results_location = consumer
        .and_then(|consumer| lookup(&consumer.results_location_env))
        .filter(|value| !value.is_empty());

    let mut builder = ProvisioningOrchestratorBuilder::new(OrchestratorConfig {
        results_location,
        lock_dir: Some(config.single_flight.key_lock_dir()),
        ..OrchestratorConfig::default()
    })
    .with_identity(Arc::new(identity))
    .with_registry(Arc::new(registry))
    .with_backend(Arc::new(backend))
    .with_dispatch_timeout(config.dispatch.timeout());

    if let Some(consumer) = consumer {
        builder = builder.with_consumer(Arc::new(
            CommandConsumer::new(consumer.program.clone())
                .with_args(consumer.args.clone())
                .with_timeout(consumer.timeout()),
        ));
    }

    tracing::debug!(?builder, "orchestrator configured");
    Ok(builder)
}

fn token_issuer<F>(github: &GithubConfig, lookup: &F) -> Result<GithubTokenIssuer, ProvisionError>
where
    F: Fn(&str) -> Option<String>,
{
    if github.uses_app() {
        let app_id = github.numeric_app_id().ok_or_else(|| {
            ProvisionError::Config("github.app_id must be numeric".into())
        })?;
        let key = app_private_key(github, lookup)?;
        let issuer = GithubAppTokenIssuer::new(
            github.api_url.clone(),
            app_id,
            github.installation_id,
            &key,
        )
        .map_err(|err| ProvisionError::Config(err.to_string()))?;
        return Ok(GithubTokenIssuer::App(issuer));
    }

    let variable = github.token_env.as_deref().ok_or_else(|| {
        ProvisionError::Config("no app credentials and no github.token_env".into())
    })?;
    let token = non_empty(lookup(variable))
        .ok_or_else(|| ProvisionError::Config(format!("token variable {variable} is not set")))?;
    Ok(GithubTokenIssuer::PreShared(StaticTokenIssuer::new(token)))
}

fn app_private_key<F>(github: &GithubConfig, lookup: &F) -> Result<Secret, ProvisionError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = &github.private_key_path {
        return std::fs::read_to_string(path)
            .map(Secret::from)
            .map_err(|err| {
                ProvisionError::Config(format!(
                    "failed to read app private key {}: {err}",
                    path.display()
                ))
            });
    }
    let variable = github
        .private_key_env
        .as_deref()
        .ok_or_else(|| ProvisionError::Config("no app private key configured".into()))?;
    non_empty(lookup(variable)).map(Secret::from).ok_or_else(|| {
        ProvisionError::Config(format!("app private key variable {variable} is not set"))
    })
}

fn web_identity_source<F>(
    config: &WebIdentityConfig,
    lookup: &F,
) -> Result<WebIdentitySource, ProvisionError>
where
    F: Fn(&str) -> Option<String>,
{
    match config {
        WebIdentityConfig::File { path } => Ok(WebIdentitySource::File(path.clone())),
        WebIdentityConfig::Env { variable } => non_empty(lookup(variable))
            .map(|token| WebIdentitySource::Token(Secret::from(token)))
            .ok_or_else(|| {
                ProvisionError::Config(format!("web identity variable {variable} is not set"))
            }),
        WebIdentityConfig::ActionsOidc { audience } => {
            let missing = |name: &str| {
                ProvisionError::Config(format!(
                    "{name} is not set; OIDC tokens are only available to jobs with id-token permission"
                ))
            };
            let request_url = non_empty(lookup(ACTIONS_ID_TOKEN_REQUEST_URL))
                .ok_or_else(|| missing(ACTIONS_ID_TOKEN_REQUEST_URL))?;
            let request_token = non_empty(lookup(ACTIONS_ID_TOKEN_REQUEST_TOKEN))
                .ok_or_else(|| missing(ACTIONS_ID_TOKEN_REQUEST_TOKEN))?;
            Ok(WebIdentitySource::ActionsOidc {
                request_url,
                request_token: Secret::from(request_token),
                audience: audience.clone(),
            })
        }
    }
}

fn required<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str, ProvisionError> {
    value
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ProvisionError::Config(format!("{what} is not configured")))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn client_error(err: reqwest::Error) -> ProvisionError {
    ProvisionError::Config(format!("failed to build HTTP client: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerConfig;
    use std::collections::HashMap;
    use std::io::Write;

    fn base_config() -> RunwayConfig {
        let mut config = RunwayConfig::default();
        config.github.token_env = Some("RUNNER_TOKEN".into());
        config.cloud.region = Some("eu-west-1".into());
        config.cloud.role_arn = Some("arn:aws:iam::123456789012:role/runway".into());
        config.cloud.web_identity = WebIdentityConfig::Env {
            variable: "WEB_IDENTITY".into(),
        };
        config.dispatch.function_name = Some("provision-runner".into());
        config
    }

    fn sdk() -> SdkConfig {
        aws::offline_config("eu-west-1")
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn builds_with_pre_shared_token() {
        let env = vars(&[("RUNNER_TOKEN", "ghs_x"), ("WEB_IDENTITY", "eyJ.x.y")]);
        let orchestrator = orchestrator_builder(&base_config(), true, &sdk(), env)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(orchestrator.dispatcher().timeout(), Duration::from_secs(900));
        assert_eq!(orchestrator.dispatcher().backend().function_name(), "provision-runner");
        assert!(orchestrator.config().results_location.is_none());
        assert!(orchestrator.runs().lock_dir().is_some());
    }

    #[test]
    fn missing_pre_shared_token_is_config_error() {
        let env = vars(&[("WEB_IDENTITY", "eyJ.x.y")]);
        let err = orchestrator_builder(&base_config(), true, &sdk(), env).unwrap_err();
        assert!(matches!(err, ProvisionError::Config(_)));
        assert!(err.to_string().contains("RUNNER_TOKEN"));
    }

    #[test]
    fn actions_oidc_requires_runner_variables() {
        let mut config = base_config();
        config.cloud.web_identity = WebIdentityConfig::default();
        let err = orchestrator_builder(&config, true, &sdk(), vars(&[("RUNNER_TOKEN", "ghs_x")]))
            .unwrap_err();
        assert!(err.to_string().contains(ACTIONS_ID_TOKEN_REQUEST_URL));

        let env = vars(&[
            ("RUNNER_TOKEN", "ghs_x"),
            (ACTIONS_ID_TOKEN_REQUEST_URL, "https://token.actions.example/req"),
            (ACTIONS_ID_TOKEN_REQUEST_TOKEN, "req-token"),
        ]);
        assert!(orchestrator_builder(&config, true, &sdk(), env).is_ok());
    }

    #[test]
    fn app_key_is_read_from_file() {
        let mut key = tempfile::NamedTempFile::new().unwrap();
        key.write_all(include_str!("../tests/fixtures/app-key.pem").as_bytes())
            .unwrap();

        let mut config = base_config();
        config.github.token_env = None;
        config.github.app_id = Some("12345".into());
        config.github.private_key_path = Some(key.path().to_path_buf());

        let builder = orchestrator_builder(&config, true, &sdk(), vars(&[("WEB_IDENTITY", "eyJ.x.y")]));
        assert!(builder.is_ok(), "{:?}", builder.err());
    }

    #[test]
    fn malformed_app_key_is_config_error() {
        let mut config = base_config();
        config.github.token_env = None;
        config.github.app_id = Some("12345".into());
        config.github.private_key_env = Some("APP_KEY".into());

        let env = vars(&[("WEB_IDENTITY", "eyJ.x.y"), ("APP_KEY", "not a pem")]);
        let err = orchestrator_builder(&config, true, &sdk(), env).unwrap_err();
        assert!(matches!(err, ProvisionError::Config(_)));
        assert!(err.to_string().contains("invalid app private key"), "{err}");
    }

    #[test]
    fn configured_lock_dir_reaches_the_registry() {
        let mut config = base_config();
        config.single_flight.lock_dir = Some("/tmp/runway-bootstrap".into());
        let env = vars(&[("RUNNER_TOKEN", "ghs_x"), ("WEB_IDENTITY", "eyJ.x.y")]);

        let orchestrator = orchestrator_builder(&config, true, &sdk(), env)
            .unwrap()
            .build()
            .unwrap();
        let lock_dir = orchestrator.runs().lock_dir().unwrap();
        assert_eq!(lock_dir.root(), std::path::Path::new("/tmp/runway-bootstrap"));
    }

    #[test]
    fn unreadable_app_key_is_config_error() {
        let mut config = base_config();
        config.github.app_id = Some("12345".into());
        config.github.private_key_path = Some("/nonexistent/app-key.pem".into());

        let err = orchestrator_builder(&config, true, &sdk(), vars(&[("WEB_IDENTITY", "eyJ.x.y")]))
            .unwrap_err();
        assert!(err.to_string().contains("failed to read app private key"));
    }

    #[test]
    fn consumer_receives_results_location() {
        let mut config = base_config();
        config.consumer = Some(ConsumerConfig::new("true"));
        let env = vars(&[
            ("RUNNER_TOKEN", "ghs_x"),
            ("WEB_IDENTITY", "eyJ.x.y"),
            ("RUNWAY_RESULTS_LOCATION", "s3://bench-results/acme"),
        ]);

        let orchestrator = orchestrator_builder(&config, true, &sdk(), &env)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            orchestrator.config().results_location.as_deref(),
            Some("s3://bench-results/acme")
        );

        let skipped = orchestrator_builder(&config, false, &sdk(), &env)
            .unwrap()
            .build()
            .unwrap();
        assert!(skipped.config().results_location.is_none());
    }

    #[test]
    fn invalid_config_is_rejected_before_wiring() {
        let mut config = base_config();
        config.cloud.role_arn = None;
        let err = orchestrator_builder(&config, true, &sdk(), vars(&[])).unwrap_err();
        assert!(err.to_string().contains("cloud.role_arn"));
    }
}
