/// Builder for constructing orchestrator instances.
pub mod builder;
/// Cooperative cancellation for superseded runs.
pub mod cancel;
/// File-backed RunKey holders shared between processes.
pub mod key_lock;
/// The provisioning orchestrator driving each run through the chain.
pub mod orchestrator;
/// Single-flight RunKey registry.
pub mod single_flight;

pub use builder::ProvisioningOrchestratorBuilder;
pub use cancel::CancelToken;
pub use orchestrator::{
    DEFAULT_STAGE_TIMEOUT, OrchestratorConfig, ProvisionedRun, ProvisioningOrchestrator,
    RunReport,
};
pub use key_lock::{DEFAULT_POLL_INTERVAL, GateLock, KeyLockDir, default_lock_dir};
pub use single_flight::{DispatchGate, RunClaim, RunRegistry};
