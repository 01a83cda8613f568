//! Shared configuration for the cloud SDK clients.

use std::error::Error;
use std::fmt;

use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_sts::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

/// Load the shared client configuration for `region`.
///
/// Ambient credentials are never picked up. Role assumption is unsigned
/// and every later call is signed with the run's own credential.
pub async fn load_shared_config(region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .no_credentials()
        .load()
        .await
}

/// Shared configuration that reads nothing from the environment and never
/// retries.
pub fn offline_config(region: &str) -> SdkConfig {
    SdkConfig::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .retry_config(RetryConfig::disabled())
        .build()
}

/// `Code: message` for service errors, the full source chain otherwise.
pub(crate) fn describe_sdk_error<E, R>(err: &SdkError<E, R>) -> String
where
    E: ProvideErrorMetadata + Error + 'static,
    R: fmt::Debug,
{
    let Some(service) = err.as_service_error() else {
        return DisplayErrorContext(err).to_string();
    };
    match (service.code(), service.message()) {
        (Some(code), Some(message)) => format!("{code}: {message}"),
        (Some(code), None) => code.to_string(),
        _ => DisplayErrorContext(err).to_string(),
    }
}
