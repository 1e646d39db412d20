//! Sandbox runtime using temporary directories on the host.
//!
//! Only the wall-clock limit is enforced. Memory and CPU ceilings are not,
//! so this runtime is meant for development and tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use super::{Environment, EnvironmentSpec, RuntimeError, SandboxRuntime, materialize};
use crate::model::PlanFile;
use crate::subprocess::{RunOutput, Tool};

#[derive(Debug, Default)]
pub struct LocalRuntime {
    root: Option<PathBuf>,
    dirs: Mutex<HashMap<String, TempDir>>,
}

impl LocalRuntime {
    pub fn new() -> Self {
        tracing::warn!("local sandbox runtime does not enforce memory or cpu limits");
        Self::default()
    }

    /// Create environments under `root` instead of the system temp dir.
    pub fn in_dir(root: PathBuf) -> Self {
        Self {
            root: Some(root),
            dirs: Mutex::default(),
        }
    }

    /// Number of environments currently alive.
    pub fn live(&self) -> usize {
        self.dirs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn path_of(&self, env: &Environment) -> Result<PathBuf, RuntimeError> {
        self.dirs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&env.id)
            .map(|dir| dir.path().to_path_buf())
            .ok_or_else(|| RuntimeError::Other(format!("unknown environment {}", env.id)))
    }
}

#[async_trait]
impl SandboxRuntime for LocalRuntime {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<Environment, RuntimeError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("sortie-");
        let dir = match &self.root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        let id = format!("local-{}", spec.label);
        let workdir = dir.path().display().to_string();

        let previous = self
            .dirs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), dir);
        if previous.is_some() {
            tracing::warn!(environment = %id, "replaced an environment with the same label");
        }

        Ok(Environment {
            id,
            workdir,
            env: spec.profile.env.clone(),
        })
    }

    async fn inject(&self, env: &Environment, files: &[PlanFile]) -> Result<(), RuntimeError> {
        let root = self.path_of(env)?;
        materialize(&root, files).await?;
        Ok(())
    }

    async fn exec(
        &self,
        env: &Environment,
        command: &str,
        timeout: Duration,
        tail_bytes: usize,
    ) -> Result<RunOutput, RuntimeError> {
        let root = self.path_of(env)?;
        let mut tool = Tool::new("sh")
            .args(&["-c", command])
            .current_dir(&root)
            .timeout(timeout)
            .tail_bytes(tail_bytes);
        for (key, value) in &env.env {
            tool = tool.env(key, value);
        }
        Ok(tool.run().await?)
    }

    async fn destroy(&self, env: &Environment) -> Result<(), RuntimeError> {
        let dir = self
            .dirs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&env.id)
            .ok_or_else(|| RuntimeError::Other(format!("unknown environment {}", env.id)))?;
        dir.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::model::{BuildPlan, TargetKind};
    use crate::profiles::ProfileRegistry;
    use crate::sandbox::{Sandbox, SandboxError, SandboxLimits};

    fn sandbox(runtime: Arc<LocalRuntime>) -> Sandbox {
        Sandbox::new(
            runtime,
            Arc::new(ProfileRegistry::default()),
            4096,
            Duration::from_secs(5),
        )
    }

    fn plan(verify: &str) -> BuildPlan {
        BuildPlan {
            name: "local-check".into(),
            target_kind: TargetKind::Python,
            files: vec![PlanFile::new("data/input.txt", "42\n")],
            verify_command: verify.into(),
            run_command: String::new(),
        }
    }

    fn limits(wall_clock: Duration) -> SandboxLimits {
        SandboxLimits {
            memory_mb: 128,
            cpus: 1.0,
            wall_clock,
        }
    }

    #[tokio::test]
    async fn runs_verify_command_against_injected_files() {
        let runtime = Arc::new(LocalRuntime::in_dir(std::env::temp_dir()));
        let result = sandbox(Arc::clone(&runtime))
            .run("t-0", &plan("grep -q 42 data/input.txt && echo ok"), &limits(Duration::from_secs(10)), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_green());
        assert_eq!(result.stdout_tail.trim(), "ok");
        assert_eq!(runtime.live(), 0);
    }

    #[tokio::test]
    async fn failing_command_is_not_an_error() {
        let runtime = Arc::new(LocalRuntime::default());
        let result = sandbox(Arc::clone(&runtime))
            .run("t-1", &plan("echo nope >&2; exit 2"), &limits(Duration::from_secs(10)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 2);
        assert!(!result.timed_out);
        assert_eq!(result.stderr_tail.trim(), "nope");
        assert_eq!(runtime.live(), 0);
    }

    #[tokio::test]
    async fn hung_command_times_out_and_is_released() {
        let runtime = Arc::new(LocalRuntime::default());
        let result = sandbox(Arc::clone(&runtime))
            .run("t-2", &plan("sleep 30"), &limits(Duration::from_millis(500)), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(!result.is_green());
        assert_eq!(runtime.live(), 0);
    }

    #[tokio::test]
    async fn cancellation_releases_environment() {
        let runtime = Arc::new(LocalRuntime::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = sandbox(Arc::clone(&runtime))
            .run("t-3", &plan("sleep 30"), &limits(Duration::from_secs(20)), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Cancelled));
        assert_eq!(runtime.live(), 0);
    }

    #[cfg(target_os = "linux")]
    fn running(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .is_ok_and(|stat| !stat.rsplit(')').next().is_some_and(|rest| rest.trim_start().starts_with('Z')))
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dead_mans_switch_reaches_background_processes() {
        let runtime = Arc::new(LocalRuntime::default());
        let result = sandbox(Arc::clone(&runtime))
            .run("t-4", &plan("sleep 37 & echo $!; wait"), &limits(Duration::from_secs(1)), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.timed_out);
        assert_eq!(runtime.live(), 0);

        let pid: u32 = result.stdout_tail.trim().parse().unwrap();
        let mut alive = running(pid);
        for _ in 0..50 {
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            alive = running(pid);
        }
        assert!(!alive, "sleep {pid} outlived its environment");
    }

    #[tokio::test]
    async fn destroying_unknown_environment_fails() {
        let runtime = LocalRuntime::default();
        let env = Environment {
            id: "local-missing".into(),
            workdir: String::new(),
            env: Vec::new(),
        };
        assert!(runtime.destroy(&env).await.is_err());
    }
}
