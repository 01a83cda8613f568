//! Configuration.
//!
//! A TOML file provides the base, `RUNWAY_*` environment variables override
//! it, and an optional dotenv file is loaded before the environment is read.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ProvisionError;
use crate::identity::sts::{MAX_SESSION_SECS, MIN_SESSION_SECS, STS_AUDIENCE};
use crate::request::{ComputeTier, RunnerCount};
use crate::runtime::key_lock::{DEFAULT_POLL_INTERVAL, KeyLockDir, default_lock_dir};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["runway.toml", "config/runway.toml"];

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "RUNWAY_CONFIG";

/// Default variable the results location is read from.
pub const DEFAULT_RESULTS_LOCATION_ENV: &str = "RUNWAY_RESULTS_LOCATION";

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunwayConfig {
    /// Repository token issuance.
    pub github: GithubConfig,
    /// Role assumption.
    pub cloud: CloudConfig,
    /// Container registry login.
    pub registry: RegistryConfig,
    /// Provisioning backend invocation.
    pub dispatch: DispatchConfig,
    /// Consumer job started once a runner is confirmed. Without it the run
    /// ends at confirmation.
    pub consumer: Option<ConsumerConfig>,
    /// Defaults for triggers that do not set count or tier.
    pub runner: RunnerDefaults,
    /// Coordination of runs sharing a RunKey across processes.
    pub single_flight: SingleFlightConfig,
}

/// GitHub App or pre-shared token settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GithubConfig {
    /// REST API base URL.
    pub api_url: String,
    /// App identifier, the JWT issuer.
    pub app_id: Option<String>,
    /// Installation to mint tokens for. Looked up from the repository when
    /// absent.
    pub installation_id: Option<u64>,
    /// PEM file holding the app's private key.
    pub private_key_path: Option<PathBuf>,
    /// Environment variable holding the PEM instead of a file.
    pub private_key_env: Option<String>,
    /// Environment variable holding a pre-shared API token. Used only when
    /// no app is configured.
    pub token_env: Option<String>,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            app_id: None,
            installation_id: None,
            private_key_path: None,
            private_key_env: None,
            token_env: None,
        }
    }
}

impl GithubConfig {
    /// True when app identity material is configured.
    pub fn uses_app(&self) -> bool {
        self.app_id.is_some()
            && (self.private_key_path.is_some() || self.private_key_env.is_some())
    }

    /// The app id as the API expects it.
    pub fn numeric_app_id(&self) -> Option<u64> {
        self.app_id.as_deref()?.trim().parse().ok()
    }
}

/// Role assumption settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CloudConfig {
    pub region: Option<String>,
    pub role_arn: Option<String>,
    /// Requested session lifetime, clamped to 900..=43200 seconds.
    pub session_duration_secs: u32,
    pub web_identity: WebIdentityConfig,
    /// Override for the STS endpoint.
    pub sts_endpoint: Option<String>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            region: None,
            role_arn: None,
            session_duration_secs: 3600,
            web_identity: WebIdentityConfig::default(),
            sts_endpoint: None,
        }
    }
}

impl CloudConfig {
    pub fn effective_session_duration(&self) -> u32 {
        self.session_duration_secs
            .clamp(MIN_SESSION_SECS, MAX_SESSION_SECS)
    }
}

/// Where the web identity token comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum WebIdentityConfig {
    /// Projected token file.
    File { path: PathBuf },
    /// Environment variable holding the token.
    Env { variable: String },
    /// CI OIDC endpoint, located through `ACTIONS_ID_TOKEN_REQUEST_URL` and
    /// `ACTIONS_ID_TOKEN_REQUEST_TOKEN`.
    ActionsOidc {
        #[serde(default = "default_audience")]
        audience: String,
    },
}

impl Default for WebIdentityConfig {
    fn default() -> Self {
        WebIdentityConfig::ActionsOidc {
            audience: default_audience(),
        }
    }
}

fn default_audience() -> String {
    STS_AUDIENCE.to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Registries to log in to. The account's default registry when empty.
    pub registry_ids: Vec<String>,
    pub endpoint: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// Name or ARN of the provisioning function.
    pub function_name: Option<String>,
    pub endpoint: Option<String>,
    /// Bounded wait for one invocation.
    pub timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            function_name: None,
            endpoint: None,
            timeout_secs: 900,
        }
    }
}

impl DispatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumerConfig {
    /// Program to run once the runner is confirmed.
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Benchmarks can run for most of a day.
    #[serde(default = "default_consumer_timeout")]
    pub timeout_secs: u64,
    /// Variable the opaque results location is read from.
    #[serde(default = "default_results_location_env")]
    pub results_location_env: String,
}

impl ConsumerConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout_secs: default_consumer_timeout(),
            results_location_env: default_results_location_env(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_consumer_timeout() -> u64 {
    86_400
}

fn default_results_location_env() -> String {
    DEFAULT_RESULTS_LOCATION_ENV.to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerDefaults {
    pub count: i64,
    pub compute: ComputeTier,
}

impl Default for RunnerDefaults {
    fn default() -> Self {
        Self {
            count: 1,
            compute: ComputeTier::S,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SingleFlightConfig {
    /// Directory shared by every runway process on this host. A per-user
    /// state directory when unset.
    pub lock_dir: Option<PathBuf>,
    /// How often a run checks whether a newer one took its key over.
    pub poll_interval_ms: u64,
}

impl Default for SingleFlightConfig {
    fn default() -> Self {
        Self {
            lock_dir: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl SingleFlightConfig {
    pub fn key_lock_dir(&self) -> KeyLockDir {
        let root = self.lock_dir.clone().unwrap_or_else(default_lock_dir);
        KeyLockDir::new(root).with_poll_interval(Duration::from_millis(self.poll_interval_ms))
    }
}

impl RunwayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply environment overrides on top of the file values.
    pub fn apply_env(&mut self, env: &EnvOverrides) {
        let github = &mut self.github;
        if let Some(value) = &env.github_api_url {
            github.api_url = value.clone();
        }
        if let Some(value) = &env.github_app_id {
            github.app_id = Some(value.clone());
        }
        if let Some(value) = env.github_installation_id {
            github.installation_id = Some(value);
        }
        if let Some(value) = &env.github_private_key_path {
            github.private_key_path = Some(value.clone());
        }

        let cloud = &mut self.cloud;
        if let Some(value) = &env.region {
            cloud.region = Some(value.clone());
        } else if cloud.region.is_none() {
            cloud.region = env.ambient_region.clone();
        }
        if let Some(value) = &env.role_arn {
            cloud.role_arn = Some(value.clone());
        }

        if let Some(value) = &env.dispatch_function {
            self.dispatch.function_name = Some(value.clone());
        }
        if let Some(value) = env.dispatch_timeout_secs {
            self.dispatch.timeout_secs = value;
        }

        if let Some(program) = &env.consumer_program {
            match &mut self.consumer {
                Some(consumer) => consumer.program = program.clone(),
                None => self.consumer = Some(ConsumerConfig::new(program.clone())),
            }
        }

        if let Some(value) = env.runner_count {
            self.runner.count = value;
        }
        if let Some(value) = env.compute_type {
            self.runner.compute = value;
        }

        if let Some(value) = &env.lock_dir {
            self.single_flight.lock_dir = Some(value.clone());
        }
    }

    /// Reject configurations that cannot provision anything.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        let missing = |what: &str| ProvisionError::Config(format!("{what} is not configured"));

        if !self.github.uses_app() && self.github.token_env.is_none() {
            return Err(ProvisionError::Config(
                "no identity material: set github.app_id with a private key, or github.token_env"
                    .into(),
            ));
        }
        if self.github.uses_app() && self.github.numeric_app_id().is_none() {
            return Err(ProvisionError::Config(format!(
                "github.app_id must be numeric, got '{}'",
                self.github.app_id.as_deref().unwrap_or_default()
            )));
        }
        if self.cloud.role_arn.as_deref().is_none_or(str::is_empty) {
            return Err(missing("cloud.role_arn"));
        }
        if self.cloud.region.as_deref().is_none_or(str::is_empty) {
            return Err(missing("cloud.region"));
        }
        if self.dispatch.function_name.as_deref().is_none_or(str::is_empty) {
            return Err(missing("dispatch.function_name"));
        }
        if self.dispatch.timeout_secs == 0 {
            return Err(ProvisionError::Config(
                "dispatch.timeout_secs must be positive".into(),
            ));
        }
        if self.single_flight.poll_interval_ms == 0 {
            return Err(ProvisionError::Config(
                "single_flight.poll_interval_ms must be positive".into(),
            ));
        }
        RunnerCount::new(self.runner.count).map_err(|_| {
            ProvisionError::Config(format!(
                "runner.count must be a positive integer, got {}",
                self.runner.count
            ))
        })?;
        if let Some(consumer) = &self.consumer {
            if consumer.program.trim().is_empty() {
                return Err(missing("consumer.program"));
            }
            if consumer.timeout_secs == 0 {
                return Err(ProvisionError::Config(
                    "consumer.timeout_secs must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

/// `RUNWAY_*` overrides gathered from the environment.
#[derive(Clone, Debug, Default)]
pub struct EnvOverrides {
    pub config_path: Option<PathBuf>,
    pub github_api_url: Option<String>,
    pub github_app_id: Option<String>,
    pub github_installation_id: Option<u64>,
    pub github_private_key_path: Option<PathBuf>,
    pub region: Option<String>,
    /// `AWS_REGION` / `AWS_DEFAULT_REGION`, used only when nothing else
    /// names a region.
    pub ambient_region: Option<String>,
    pub role_arn: Option<String>,
    pub dispatch_function: Option<String>,
    pub dispatch_timeout_secs: Option<u64>,
    pub consumer_program: Option<String>,
    pub runner_count: Option<i64>,
    pub compute_type: Option<ComputeTier>,
    pub lock_dir: Option<PathBuf>,
}

impl EnvOverrides {
    /// Read the process environment.
    pub fn gather() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        fn parse<T: std::str::FromStr>(
            key: &str,
            value: Option<String>,
        ) -> Result<Option<T>, ConfigError> {
            value
                .map(|raw| {
                    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                        key: key.to_string(),
                        value: raw.clone(),
                    })
                })
                .transpose()
        }

        Ok(Self {
            config_path: get(CONFIG_PATH_ENV).map(PathBuf::from),
            github_api_url: get("RUNWAY_GITHUB_API_URL"),
            github_app_id: get("RUNWAY_GITHUB_APP_ID"),
            github_installation_id: parse(
                "RUNWAY_GITHUB_INSTALLATION_ID",
                get("RUNWAY_GITHUB_INSTALLATION_ID"),
            )?,
            github_private_key_path: get("RUNWAY_GITHUB_PRIVATE_KEY_PATH").map(PathBuf::from),
            region: get("RUNWAY_CLOUD_REGION"),
            ambient_region: get("AWS_REGION").or_else(|| get("AWS_DEFAULT_REGION")),
            role_arn: get("RUNWAY_ROLE_ARN"),
            dispatch_function: get("RUNWAY_DISPATCH_FUNCTION"),
            dispatch_timeout_secs: parse(
                "RUNWAY_DISPATCH_TIMEOUT_SECS",
                get("RUNWAY_DISPATCH_TIMEOUT_SECS"),
            )?,
            consumer_program: get("RUNWAY_CONSUMER_PROGRAM"),
            runner_count: parse("RUNWAY_RUNNER_COUNT", get("RUNWAY_RUNNER_COUNT"))?,
            compute_type: parse("RUNWAY_COMPUTE_TYPE", get("RUNWAY_COMPUTE_TYPE"))?,
            lock_dir: get("RUNWAY_LOCK_DIR").map(PathBuf::from),
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path} does not exist")]
    MissingConfig { path: PathBuf },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to load env file: {0}")]
    EnvFile(#[from] dotenvy::Error),
    #[error("environment variable {key} has invalid value '{value}'")]
    InvalidEnv { key: String, value: String },
}

impl From<ConfigError> for ProvisionError {
    fn from(err: ConfigError) -> Self {
        ProvisionError::Config(err.to_string())
    }
}

/// Loads [`RunwayConfig`] from file, dotenv and environment.
#[derive(Clone, Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_file: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.env_file = Some(path.into());
        self
    }

    /// Load without validating.
    pub fn load(&self) -> Result<RunwayConfig, ConfigError> {
        self.load_env_file()?;
        let env = EnvOverrides::gather()?;
        self.load_with(&env)
    }

    /// Load against explicit overrides instead of the process environment.
    pub fn load_with(&self, env: &EnvOverrides) -> Result<RunwayConfig, ConfigError> {
        let mut config = match self.resolve_path(env)? {
            Some(path) => Self::read_file(&path)?,
            None => {
                tracing::debug!("no config file found, using defaults and environment");
                RunwayConfig::default()
            }
        };
        config.apply_env(env);
        Ok(config)
    }

    fn load_env_file(&self) -> Result<bool, ConfigError> {
        let loaded = match &self.env_file {
            Some(path) => dotenvy::from_path(path),
            None => dotenvy::dotenv().map(|_| ()),
        };
        match loaded {
            Ok(()) => Ok(true),
            Err(dotenvy::Error::Io(_)) if self.env_file.is_none() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn resolve_path(&self, env: &EnvOverrides) -> Result<Option<PathBuf>, ConfigError> {
        if let Some(explicit) = self.config_path.as_ref().or(env.config_path.as_ref()) {
            if !explicit.exists() {
                return Err(ConfigError::MissingConfig {
                    path: explicit.clone(),
                });
            }
            return Ok(Some(explicit.clone()));
        }
        Ok(DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.exists()))
    }

    fn read_file(path: &Path) -> Result<RunwayConfig, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        RunwayConfig::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const FULL: &str = r#"
[github]
app_id = "12345"
private_key_path = "/etc/runway/app.pem"

[cloud]
region = "eu-central-1"
role_arn = "arn:aws:iam::123456789012:role/runway"
session_duration_secs = 60

[cloud.web_identity]
source = "file"
path = "/var/run/secrets/token"

[registry]
registry_ids = ["123456789012"]

[dispatch]
function_name = "jit-runner"

[consumer]
program = "./bench.sh"
args = ["--all"]

[runner]
count = 2
compute = "L"

[single_flight]
lock_dir = "/run/runway"
"#;

    fn env(pairs: &[(&str, &str)]) -> EnvOverrides {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvOverrides::from_lookup(|key| map.get(key).cloned()).unwrap()
    }

    #[test]
    fn parses_full_file_with_defaults() {
        let config = RunwayConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.github.api_url, "https://api.github.com");
        assert!(config.github.uses_app());
        assert_eq!(config.cloud.effective_session_duration(), 900);
        assert_eq!(
            config.cloud.web_identity,
            WebIdentityConfig::File {
                path: "/var/run/secrets/token".into()
            }
        );
        assert_eq!(config.dispatch.timeout_secs, 900);
        let consumer = config.consumer.as_ref().unwrap();
        assert_eq!(consumer.timeout_secs, 86_400);
        assert_eq!(consumer.results_location_env, "RUNWAY_RESULTS_LOCATION");
        assert_eq!(config.runner.count, 2);
        assert_eq!(config.runner.compute, ComputeTier::L);
        assert_eq!(config.github.numeric_app_id(), Some(12345));
        let locks = config.single_flight.key_lock_dir();
        assert_eq!(locks.root(), Path::new("/run/runway"));
        assert_eq!(locks.poll_interval(), DEFAULT_POLL_INTERVAL);
        config.validate().unwrap();
    }

    #[test]
    fn default_web_identity_is_actions_oidc() {
        let config = RunwayConfig::from_toml_str("").unwrap();
        assert_eq!(
            config.cloud.web_identity,
            WebIdentityConfig::ActionsOidc {
                audience: "sts.amazonaws.com".into()
            }
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(RunwayConfig::from_toml_str("[dispatch]\nfunction = \"x\"\n").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = RunwayConfig::from_toml_str(FULL).unwrap();
        config.apply_env(&env(&[
            ("RUNWAY_ROLE_ARN", "arn:aws:iam::1:role/other"),
            ("RUNWAY_RUNNER_COUNT", "4"),
            ("RUNWAY_COMPUTE_TYPE", "xs"),
            ("AWS_REGION", "us-west-2"),
        ]));
        assert_eq!(config.cloud.role_arn.as_deref(), Some("arn:aws:iam::1:role/other"));
        assert_eq!(config.runner.count, 4);
        assert_eq!(config.runner.compute, ComputeTier::XS);
        // ambient region never beats an explicit one
        assert_eq!(config.cloud.region.as_deref(), Some("eu-central-1"));
    }

    #[test]
    fn ambient_region_fills_gap() {
        let mut config = RunwayConfig::default();
        config.apply_env(&env(&[("AWS_DEFAULT_REGION", "ap-south-1")]));
        assert_eq!(config.cloud.region.as_deref(), Some("ap-south-1"));
    }

    #[test]
    fn lock_dir_from_env_overrides_default() {
        let mut config = RunwayConfig::default();
        assert!(config.single_flight.key_lock_dir().root().ends_with("runway/locks"));

        config.apply_env(&env(&[("RUNWAY_LOCK_DIR", "/tmp/runway-ci")]));
        assert_eq!(
            config.single_flight.key_lock_dir().root(),
            Path::new("/tmp/runway-ci")
        );
    }

    #[test]
    fn consumer_program_from_env_creates_section() {
        let mut config = RunwayConfig::default();
        config.apply_env(&env(&[("RUNWAY_CONSUMER_PROGRAM", "bench")]));
        assert_eq!(config.consumer.unwrap().program, "bench");
    }

    #[test]
    fn malformed_env_value_is_reported() {
        let err = EnvOverrides::from_lookup(|key| {
            (key == "RUNWAY_RUNNER_COUNT").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("RUNWAY_RUNNER_COUNT"));
    }

    #[test]
    fn validation_failures() {
        let base = RunwayConfig::from_toml_str(FULL).unwrap();

        let mut config = base.clone();
        config.cloud.role_arn = None;
        assert!(matches!(config.validate(), Err(ProvisionError::Config(_))));

        let mut config = base.clone();
        config.runner.count = 0;
        assert!(config.validate().unwrap_err().to_string().contains("runner.count"));

        let mut config = base.clone();
        config.github = GithubConfig::default();
        assert!(config.validate().unwrap_err().to_string().contains("identity material"));

        let mut config = base.clone();
        config.consumer.as_mut().unwrap().timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.github.app_id = Some("runway-app".into());
        assert!(config.validate().unwrap_err().to_string().contains("must be numeric"));

        let mut config = base.clone();
        config.single_flight.poll_interval_ms = 0;
        assert!(config.validate().unwrap_err().to_string().contains("poll_interval_ms"));

        let mut config = base;
        config.github = GithubConfig {
            token_env: Some("RUNWAY_GITHUB_TOKEN".into()),
            ..GithubConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loader_reads_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();

        let config = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with(&EnvOverrides::default())
            .unwrap();
        assert_eq!(config.dispatch.function_name.as_deref(), Some("jit-runner"));
    }

    #[test]
    fn loader_rejects_missing_explicit_file() {
        let err = ConfigLoader::new()
            .with_config_path("/nonexistent/runway.toml")
            .load_with(&EnvOverrides::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingConfig { .. }));
    }

    #[test]
    fn loader_reports_parse_errors_with_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[runner\ncount = ").unwrap();

        let err = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with(&EnvOverrides::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(ProvisionError::from(err).exit_code() == 2);
    }
}
