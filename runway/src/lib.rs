//! Runway - just-in-time CI runner provisioning.
//!
//! A manually triggered run walks a fixed chain: mint a repository-scoped
//! requestor token and temporary cloud credentials, log in to the container
//! registry, dispatch a provisioning request to a remote function, validate
//! its response, and only then start the job that needs the runner.
//!
//! # Core Concepts
//!
//! - **Identity**: The [`IdentityBroker`] trait hands each run a
//!   [`RequestorToken`] and a [`TemporaryCredential`] bound to its [`RunId`].
//!   [`BrokeredIdentity`] composes a [`TokenIssuer`] and a [`RoleAssumer`].
//!
//! - **Registry**: The [`RegistryAuthenticator`] trait turns the run's cloud
//!   credential into a [`RegistryLogin`].
//!
//! - **Dispatch**: [`RunnerDispatcher`] builds the [`ProvisionRequest`] and
//!   sends it through a [`ProvisionBackend`], returning the raw
//!   [`ProvisionResponse`].
//!
//! - **Validation**: [`validate_response`] accepts a response if and only if
//!   its `statusCode` is the integer `200`.
//!
//! - **Orchestration**: The [`ProvisioningOrchestrator`] ties the stages
//!   together with at most one run in flight per [`RunKey`]; a newer trigger
//!   supersedes an older one that has not dispatched yet.
//!
//! - **Events**: Lifecycle events go through a [`RunEventPublisher`];
//!   [`InProcEventBus`] broadcasts them in-process.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use runway::*;
//!
//! let config = ConfigLoader::new().load()?;
//! let orchestrator = bootstrap::build_orchestrator(&config, true).await?;
//! let report = orchestrator
//!     .run(&RunTrigger::new("acme/widgets", "benchmarks", "refs/heads/main"))
//!     .await?;
//! ```

/// Shared cloud SDK configuration.
pub mod aws;

/// Wiring from configuration to concrete collaborators.
pub mod bootstrap;

/// Configuration loading.
///
/// The `config` module defines [`RunwayConfig`] and [`ConfigLoader`], which
/// reads a TOML file, an optional dotenv file and `RUNWAY_*` overrides.
pub mod config;

/// The job gated on a confirmed runner.
pub mod consumer;

/// Secret-bearing credential types.
///
/// Every type here redacts its secrets in `Debug` and zeroizes them on
/// drop. Credentials are bound to the run that minted them.
pub mod credentials;

/// Runner dispatch to the provisioning backend.
pub mod dispatch;

/// Error taxonomy for provisioning runs.
pub mod error;

/// Event publishing and subscription system.
///
/// The `events` module provides traits and types for run lifecycle events:
/// - [`EventPublisher`] and [`EventSubscriber`] for pub/sub patterns
/// - [`RunEvent`] and [`RunEventPayload`] for event data
/// - [`InProcEventBus`] for in-process event broadcasting
pub mod events;

/// Shared HTTP client construction.
pub mod http;

/// Identity brokering: requestor tokens and role assumption.
pub mod identity;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Container registry login.
pub mod registry;

/// Provisioning request and response types.
///
/// The `request` module defines [`ProvisionRequest`], its wire payload, and
/// the [`ComputeTier`], [`RunnerCount`] and [`RepositoryId`] it carries.
pub mod request;

/// Run identity, context and lifecycle states.
pub mod run;

/// Runtime orchestration.
///
/// The `runtime` module provides the [`ProvisioningOrchestrator`] and its
/// builder, the single-flight [`RunRegistry`], and [`CancelToken`].
pub mod runtime;

/// Tracing spans and telemetry helpers.
pub mod telemetry;

/// Response validation.
pub mod validate;

pub use config::*;
pub use consumer::*;
pub use credentials::*;
pub use dispatch::*;
pub use error::ProvisionError;
pub use events::*;
pub use identity::*;
pub use registry::*;
pub use request::*;
pub use run::*;
pub use runtime::*;
pub use validate::*;
