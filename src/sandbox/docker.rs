//! Sandbox runtime backed by the docker CLI.
//!
//! Each environment is a detached container idling on `sleep infinity`, with
//! memory, CPU and capability limits applied at creation. Files are copied in
//! with `docker cp` and commands run through `docker exec`.

use std::time::Duration;

use async_trait::async_trait;

use super::{Environment, EnvironmentSpec, RuntimeError, SandboxRuntime, materialize};
use crate::config::SandboxConfig;
use crate::model::PlanFile;
use crate::subprocess::{RunOutput, Tool};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    bin: String,
    network: String,
}

impl DockerRuntime {
    pub fn new(bin: &str, network: &str) -> Self {
        Self {
            bin: bin.to_string(),
            network: network.to_string(),
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(&config.docker_bin, &config.network)
    }

    fn tool(&self) -> Tool {
        Tool::new(&self.bin)
    }

    /// Best-effort removal of a container that may or may not exist.
    async fn remove_by_name(&self, name: &str) {
        let removed = self
            .tool()
            .args(&["rm", "--force", "--volumes", name])
            .timeout(CONTROL_TIMEOUT)
            .run()
            .await;
        if let Err(e) = removed {
            tracing::debug!(container = %name, error = %e, "cleanup after failed create skipped");
        }
    }

    fn create_args(&self, spec: &EnvironmentSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            container_name(&spec.label),
            "--label".into(),
            "sortie.managed=true".into(),
            "--memory".into(),
            format!("{}m", spec.limits.memory_mb),
            "--memory-swap".into(),
            format!("{}m", spec.limits.memory_mb),
            "--cpus".into(),
            format!("{}", spec.limits.cpus),
            "--pids-limit".into(),
            "256".into(),
            "--network".into(),
            self.network.clone(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--workdir".into(),
            spec.profile.workdir.clone(),
        ];
        for (key, value) in &spec.profile.env {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.profile.image.clone());
        args.push("sleep".into());
        args.push("infinity".into());
        args
    }
}

/// Container names allow `[a-zA-Z0-9][a-zA-Z0-9_.-]`.
fn container_name(label: &str) -> String {
    let safe: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("sortie-{safe}")
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<Environment, RuntimeError> {
        let name = container_name(&spec.label);
        let args = self.create_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = match self
            .tool()
            .args(&args)
            .timeout(spec.limits.wall_clock)
            .run_ok()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                // A killed or failed `docker run` may still have created the container.
                self.remove_by_name(&name).await;
                return Err(e.into());
            }
        };
        let id = output.stdout.trim().to_string();
        if id.is_empty() {
            self.remove_by_name(&name).await;
            return Err(RuntimeError::Other("docker run printed no container id".into()));
        }
        tracing::debug!(container = %id, image = %spec.profile.image, "container started");
        Ok(Environment {
            id,
            workdir: spec.profile.workdir.clone(),
            env: spec.profile.env.clone(),
        })
    }

    async fn inject(&self, env: &Environment, files: &[PlanFile]) -> Result<(), RuntimeError> {
        let staging = tempfile::Builder::new().prefix("sortie-inject-").tempdir()?;
        materialize(staging.path(), files).await?;

        let source = format!("{}/.", staging.path().display());
        let target = format!("{}:{}", env.id, env.workdir);
        self.tool()
            .args(&["cp", &source, &target])
            .timeout(CONTROL_TIMEOUT)
            .run_ok()
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        env: &Environment,
        command: &str,
        timeout: Duration,
        tail_bytes: usize,
    ) -> Result<RunOutput, RuntimeError> {
        let output = self
            .tool()
            .args(&["exec", "--workdir", &env.workdir, &env.id, "sh", "-c", command])
            .timeout(timeout)
            .tail_bytes(tail_bytes)
            .run()
            .await?;
        Ok(output)
    }

    async fn destroy(&self, env: &Environment) -> Result<(), RuntimeError> {
        self.tool()
            .args(&["rm", "--force", "--volumes", &env.id])
            .timeout(CONTROL_TIMEOUT)
            .run_ok()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TargetKind;
    use crate::profiles::ProfileRegistry;
    use crate::sandbox::SandboxLimits;

    fn spec() -> EnvironmentSpec {
        EnvironmentSpec {
            label: "1a2b3c4d-0".into(),
            profile: ProfileRegistry::default().get(TargetKind::Python).clone(),
            limits: SandboxLimits {
                memory_mb: 512,
                cpus: 1.5,
                wall_clock: Duration::from_secs(60),
            },
        }
    }

    #[test]
    fn create_args_apply_limits() {
        let args = DockerRuntime::new("docker", "none").create_args(&spec());
        let joined = args.join(" ");
        assert!(joined.starts_with("run --detach --name sortie-1a2b3c4d-0"));
        assert!(joined.contains("--memory 512m"));
        assert!(joined.contains("--cpus 1.5"));
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--env PYTHONUNBUFFERED=1"));
        assert!(joined.ends_with("python:3.11-slim sleep infinity"));
    }

    #[test]
    fn container_names_are_sanitized() {
        assert_eq!(container_name("abc/1 2"), "sortie-abc-1-2");
    }

    #[tokio::test]
    async fn missing_binary_is_a_runtime_error() {
        let runtime = DockerRuntime::new("sortie-no-such-docker", "bridge");
        let err = runtime.create(&spec()).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Tool(crate::subprocess::ToolError::NotFound { .. })
        ));
    }
}
