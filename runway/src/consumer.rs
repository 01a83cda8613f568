//! The long-running job gated on a confirmed runner.
//!
//! Exporting results is the consumer's own business: runway only hands it
//! the opaque results location and waits for it to finish.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::ProvisionError;
use crate::run::RunContext;
use crate::validate::ProvisionConfirmation;

/// Default consumer timeout, one day.
pub const DEFAULT_CONSUMER_TIMEOUT: Duration = Duration::from_secs(86_400);

/// How a consumer job ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerOutcome {
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

/// Job started once the runner is confirmed.
#[async_trait]
pub trait ConsumerJob: Send + Sync {
    /// Run to completion.
    ///
    /// # Errors
    ///
    /// [`ProvisionError::Consumer`] when the job cannot start, fails, or
    /// outlives its timeout.
    async fn run(
        &self,
        ctx: &RunContext,
        confirmation: &ProvisionConfirmation,
    ) -> Result<ConsumerOutcome, ProvisionError>;
}

/// Runs an external program with the run's parameters in its environment.
///
/// | variable | value |
/// |---|---|
/// | `RUNWAY_RESULTS_LOCATION` | opaque results sink, when configured |
/// | `RUNWAY_RUN_ID` | run id |
/// | `RUNWAY_RUN_KEY` | `{workflow}-{ref}` |
/// | `RUNWAY_BRANCH` | branch name with `/` replaced by `-` |
/// | `RUNWAY_RUNNER_COUNT` | runner count |
/// | `RUNWAY_COMPUTE_TYPE` | compute tier |
pub struct CommandConsumer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl fmt::Debug for CommandConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandConsumer")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CommandConsumer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_CONSUMER_TIMEOUT,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn command(&self, ctx: &RunContext) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("RUNWAY_RUN_ID", ctx.run_id.to_string())
            .env("RUNWAY_RUN_KEY", ctx.run_key.to_string())
            .env("RUNWAY_BRANCH", ctx.run_key.branch_slug())
            .env("RUNWAY_RUNNER_COUNT", ctx.runner_count.to_string())
            .env("RUNWAY_COMPUTE_TYPE", ctx.compute_tier.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(location) = &ctx.results_location {
            command.env("RUNWAY_RESULTS_LOCATION", location);
        }
        command
    }

    fn finished(&self, status: ExitStatus, started: Instant) -> Result<ConsumerOutcome, ProvisionError> {
        if status.success() {
            Ok(ConsumerOutcome {
                exit_code: status.code(),
                duration: started.elapsed(),
            })
        } else {
            Err(ProvisionError::Consumer(format!(
                "{} exited with {status}",
                self.program
            )))
        }
    }
}

#[async_trait]
impl ConsumerJob for CommandConsumer {
    async fn run(
        &self,
        ctx: &RunContext,
        confirmation: &ProvisionConfirmation,
    ) -> Result<ConsumerOutcome, ProvisionError> {
        tracing::info!(
            program = %self.program,
            status_code = confirmation.status_code,
            timeout_secs = self.timeout.as_secs(),
            "starting consumer job"
        );
        let started = Instant::now();
        let mut child = self.command(ctx).spawn().map_err(|err| {
            ProvisionError::Consumer(format!("failed to start {}: {err}", self.program))
        })?;

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => self.finished(status, started),
            Ok(Err(err)) => Err(ProvisionError::Consumer(format!(
                "waiting on {} failed: {err}",
                self.program
            ))),
            Err(_) => {
                if let Err(err) = child.kill().await {
                    tracing::warn!(error = %err, "failed to kill timed out consumer");
                }
                Err(ProvisionError::Consumer(format!(
                    "{} did not finish within {}s",
                    self.program,
                    self.timeout.as_secs()
                )))
            }
        }
    }
}
