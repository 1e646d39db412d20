//! Execution sandbox adapter.
//!
//! `Sandbox::run` acquires a disposable environment from a `SandboxRuntime`,
//! materializes a plan's files into it, runs the verify command under the
//! wall-clock ceiling and always releases the environment. Every successful
//! `create` is matched by exactly one `destroy`, whichever way the run ends.

pub mod docker;
pub mod local;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::SandboxConfig;
use crate::model::{BuildPlan, ExecutionResult, PlanFile};
use crate::profiles::{ProfileRegistry, TargetProfile};
use crate::subprocess::{RunOutput, ToolError};

/// Upper bound on the gap between the command timeout and the wall clock.
const MAX_KILL_MARGIN: Duration = Duration::from_secs(5);

/// Resource ceilings for one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    pub memory_mb: u64,
    pub cpus: f64,
    /// Dead man's switch: the whole attempt is abandoned past this.
    pub wall_clock: Duration,
}

impl SandboxLimits {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            memory_mb: config.memory_mb,
            cpus: config.cpus,
            wall_clock: config.wall_clock(),
        }
    }

    /// Timeout handed to the verify command. Strictly below the wall clock so
    /// a hung command is killed and reported before the switch trips.
    pub fn command_timeout(&self) -> Duration {
        let margin = (self.wall_clock / 10).min(MAX_KILL_MARGIN);
        self.wall_clock.saturating_sub(margin)
    }

    /// Shrink the wall clock so it ends strictly before `remaining` runs out.
    #[must_use]
    pub fn bounded_by(&self, remaining: Duration) -> Self {
        let ceiling = remaining.mul_f64(0.9);
        Self {
            wall_clock: self.wall_clock.min(ceiling),
            ..self.clone()
        }
    }
}

/// What a runtime needs to build an environment.
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    /// Unique, name-safe label (mission short id and attempt).
    pub label: String,
    pub profile: TargetProfile,
    pub limits: SandboxLimits,
}

/// Handle to a live environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub id: String,
    pub workdir: String,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Primitive environment operations. A failed `create` must not leave
/// anything behind; every environment it does return is released by
/// `Sandbox`.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, spec: &EnvironmentSpec) -> Result<Environment, RuntimeError>;

    async fn inject(&self, env: &Environment, files: &[PlanFile]) -> Result<(), RuntimeError>;

    /// Run `command` with a shell in the environment's workdir. A command
    /// still running after `timeout` is killed and reported as timed out.
    async fn exec(
        &self,
        env: &Environment,
        command: &str,
        timeout: Duration,
        tail_bytes: usize,
    ) -> Result<RunOutput, RuntimeError>;

    async fn destroy(&self, env: &Environment) -> Result<(), RuntimeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Create,
    Inject,
    Exec,
    Teardown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Inject => "inject",
            Self::Exec => "exec",
            Self::Teardown => "teardown",
        };
        f.write_str(s)
    }
}

/// Faults of the execution substrate, never of the plan.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox {stage} failed: {message}")]
    Infrastructure { stage: Stage, message: String },

    #[error("sandbox run cancelled")]
    Cancelled,
}

impl SandboxError {
    fn infra(stage: Stage, err: impl fmt::Display) -> Self {
        Self::Infrastructure {
            stage,
            message: err.to_string(),
        }
    }
}

/// Scoped ownership of a live environment.
///
/// `release` tears it down and reports the outcome. A lease dropped without
/// `release` (the owning future was cancelled) still schedules teardown.
struct Lease {
    runtime: Arc<dyn SandboxRuntime>,
    env: Option<Environment>,
    teardown_timeout: Duration,
}

impl Lease {
    fn new(runtime: Arc<dyn SandboxRuntime>, env: Environment, teardown_timeout: Duration) -> Self {
        Self {
            runtime,
            env: Some(env),
            teardown_timeout,
        }
    }

    async fn release(mut self) -> Result<(), SandboxError> {
        let Some(env) = self.env.take() else {
            return Ok(());
        };
        match tokio::time::timeout(self.teardown_timeout, self.runtime.destroy(&env)).await {
            Ok(Ok(())) => {
                debug!(environment = %env.id, "sandbox released");
                Ok(())
            }
            Ok(Err(e)) => Err(SandboxError::infra(Stage::Teardown, format!("{}: {e}", env.id))),
            Err(_) => Err(SandboxError::infra(
                Stage::Teardown,
                format!("{}: destroy timed out after {:?}", env.id, self.teardown_timeout),
            )),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(env) = self.env.take() else { return };
        let runtime = Arc::clone(&self.runtime);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = runtime.destroy(&env).await {
                        error!(environment = %env.id, error = %e, kind = "infrastructure", "deferred teardown failed");
                    }
                });
            }
            Err(_) => {
                error!(environment = %env.id, kind = "infrastructure", "lease dropped outside a runtime; environment leaked");
            }
        }
    }
}

/// The execution sandbox adapter.
#[derive(Clone)]
pub struct Sandbox {
    runtime: Arc<dyn SandboxRuntime>,
    profiles: Arc<ProfileRegistry>,
    tail_bytes: usize,
    teardown_timeout: Duration,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("runtime", &self.runtime.name())
            .field("tail_bytes", &self.tail_bytes)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        profiles: Arc<ProfileRegistry>,
        tail_bytes: usize,
        teardown_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            profiles,
            tail_bytes,
            teardown_timeout,
        }
    }

    pub fn runtime_name(&self) -> &'static str {
        self.runtime.name()
    }

    /// Run `plan.verify_command` in a fresh environment.
    ///
    /// A command that outlives its timeout yields `Ok` with `timed_out` set.
    /// `Err` is reserved for substrate faults (teardown included) and
    /// cancellation.
    pub async fn run(
        &self,
        label: &str,
        plan: &BuildPlan,
        limits: &SandboxLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }

        let spec = EnvironmentSpec {
            label: label.to_string(),
            profile: self.profiles.get(plan.target_kind).clone(),
            limits: limits.clone(),
        };

        let env = self.acquire(spec, limits.wall_clock).await?;
        debug!(environment = %env.id, runtime = self.runtime.name(), "sandbox acquired");

        let lease = Lease::new(Arc::clone(&self.runtime), env.clone(), self.teardown_timeout);
        let outcome = self.drive(&env, plan, limits, cancel).await;
        let released = lease.release().await;

        match (outcome, released) {
            (outcome, Ok(())) => outcome,
            (Err(e), Err(teardown)) => {
                error!(error = %teardown, kind = "infrastructure", "teardown failed after an earlier sandbox error");
                Err(e)
            }
            (Ok(_), Err(teardown)) => Err(teardown),
        }
    }

    /// Create an environment, waiting at most `limit` for it.
    ///
    /// Creation runs as its own task and is never abandoned: if the caller
    /// stops waiting (the limit passed or the run was dropped), whatever the
    /// runtime eventually produces is released by that task.
    async fn acquire(&self, spec: EnvironmentSpec, limit: Duration) -> Result<Environment, SandboxError> {
        let (tx, rx) = oneshot::channel();
        let runtime = Arc::clone(&self.runtime);
        let teardown_timeout = self.teardown_timeout;
        tokio::spawn(async move {
            let created = runtime.create(&spec).await;
            if let Err(Ok(orphan)) = tx.send(created) {
                warn!(environment = %orphan.id, "environment arrived after the caller gave up; releasing");
                let lease = Lease::new(runtime, orphan, teardown_timeout);
                if let Err(e) = lease.release().await {
                    error!(error = %e, kind = "infrastructure", "late environment could not be released");
                }
            }
        });

        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(Ok(env))) => Ok(env),
            Ok(Ok(Err(e))) => Err(SandboxError::infra(Stage::Create, e)),
            Ok(Err(_)) => Err(SandboxError::infra(Stage::Create, "create task ended without a result")),
            Err(_) => Err(SandboxError::infra(
                Stage::Create,
                format!("no environment within {limit:?}"),
            )),
        }
    }

    async fn drive(
        &self,
        env: &Environment,
        plan: &BuildPlan,
        limits: &SandboxLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let switch = Instant::now() + limits.wall_clock;

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SandboxError::Cancelled),
            injected = tokio::time::timeout_at(switch, self.runtime.inject(env, &plan.files)) => match injected {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(SandboxError::infra(Stage::Inject, e)),
                Err(_) => return Err(SandboxError::infra(Stage::Inject, "file injection outlived the wall clock")),
            },
        }

        let command_timeout = limits.command_timeout();
        let started = Instant::now();
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SandboxError::Cancelled),
            ran = tokio::time::timeout_at(
                switch,
                self.runtime.exec(env, &plan.verify_command, command_timeout, self.tail_bytes),
            ) => match ran {
                Ok(Ok(output)) => Ok(ExecutionResult {
                    exit_code: output.exit_code,
                    stdout_tail: output.stdout,
                    stderr_tail: output.stderr,
                    duration: started.elapsed(),
                    timed_out: output.timed_out,
                }),
                Ok(Err(e)) => Err(SandboxError::infra(Stage::Exec, e)),
                Err(_) => {
                    warn!(environment = %env.id, wall_clock = ?limits.wall_clock, "dead man's switch tripped");
                    Ok(ExecutionResult {
                        exit_code: -1,
                        stdout_tail: String::new(),
                        stderr_tail: format!("killed after exceeding the {:?} wall clock", limits.wall_clock),
                        duration: started.elapsed(),
                        timed_out: true,
                    })
                }
            },
        }
    }
}

/// Write plan files under `root`, creating parent directories.
pub async fn materialize(root: &Path, files: &[PlanFile]) -> std::io::Result<()> {
    for file in files {
        let path = root.join(&file.path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, file.content.as_bytes()).await?;
    }
    Ok(())
}
