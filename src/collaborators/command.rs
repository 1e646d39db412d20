//! Collaborators backed by external commands.
//!
//! The generator is an argv invoked as `<argv...> draft` or `<argv...> heal`
//! with a JSON request on stdin; it must print a plan as JSON. Deploy and
//! publish are shell commands run in a directory holding the plan's files.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use super::{
    DeployResult, DeployTarget, GenerationError, PlanGenerator, PlanHealer, PublishError,
    PublishResult, PublishTarget, SandboxRef,
};
use crate::error::ExitError;
use crate::heal::HealContext;
use crate::model::{BuildPlan, PlanShapeError};
use crate::sandbox::materialize;
use crate::subprocess::Tool;

#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new(argv: &[String]) -> Result<Self, ExitError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ExitError::Config("collaborators.generator is empty".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    async fn invoke(&self, verb: &str, request: &serde_json::Value) -> Result<BuildPlan, GenerationError> {
        let mut args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        args.push(verb);
        let output = Tool::new(&self.program)
            .args(&args)
            .stdin(request.to_string())
            .run_ok()
            .await
            .map_err(|e| GenerationError::Collaborator(e.to_string()))?;
        Ok(extract_plan(&output.stdout)?)
    }
}

#[async_trait]
impl PlanGenerator for CommandGenerator {
    async fn draft(&self, intent: &str) -> Result<BuildPlan, GenerationError> {
        self.invoke("draft", &json!({ "intent": intent })).await
    }
}

#[async_trait]
impl PlanHealer for CommandGenerator {
    async fn heal(&self, context: HealContext) -> Result<BuildPlan, GenerationError> {
        let request = serde_json::to_value(&context)
            .map_err(|e| GenerationError::Collaborator(e.to_string()))?;
        self.invoke("heal", &request).await
    }
}

/// Pull a plan out of generator output that may wrap the JSON in prose or
/// carry trailing commas.
pub fn extract_plan(text: &str) -> Result<BuildPlan, PlanShapeError> {
    let (Some(first), Some(last)) = (text.find('{'), text.rfind('}')) else {
        return Err(PlanShapeError::Malformed("no JSON object in output".into()));
    };
    if first >= last {
        return Err(PlanShapeError::Malformed("no JSON object in output".into()));
    }
    let candidate = &text[first..=last];
    match BuildPlan::from_json(candidate) {
        Err(PlanShapeError::Malformed(original)) => {
            let repaired = re_trailing_comma().map_or_else(
                || candidate.to_string(),
                |re| re.replace_all(candidate, "$1").into_owned(),
            );
            if repaired == candidate {
                return Err(PlanShapeError::Malformed(original));
            }
            BuildPlan::from_json(&repaired)
        }
        other => other,
    }
}

fn re_trailing_comma() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",(\s*[}\]])").ok()).as_ref()
}

fn re_production_url() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Production:\s*(https://\S+)").ok()).as_ref()
}

fn re_any_url() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https://\S+").ok()).as_ref()
}

/// The first `Production: https://...` URL, else the first `https://` URL.
pub fn extract_url(output: &str) -> Option<String> {
    if let Some(caps) = re_production_url().and_then(|re| re.captures(output))
        && let Some(url) = caps.get(1)
    {
        return Some(url.as_str().to_string());
    }
    re_any_url()
        .and_then(|re| re.find(output))
        .map(|m| m.as_str().to_string())
}

async fn run_in_plan_dir(
    command: &str,
    plan: &BuildPlan,
    env: &[(&str, &str)],
) -> Result<String, PublishError> {
    let dir = tempfile::Builder::new()
        .prefix("sortie-publish-")
        .tempdir()
        .map_err(|e| PublishError(format!("staging directory: {e}")))?;
    materialize(dir.path(), &plan.files)
        .await
        .map_err(|e| PublishError(format!("staging plan files: {e}")))?;

    let mut tool = Tool::new("sh")
        .args(&["-c", command])
        .current_dir(dir.path())
        .env("SORTIE_PLAN_NAME", &plan.name)
        .env("SORTIE_TARGET", plan.target_kind.as_str());
    for (key, value) in env {
        tool = tool.env(key, value);
    }
    let output = tool.run_ok().await.map_err(|e| PublishError(e.to_string()))?;
    Ok(output.stdout)
}

#[derive(Debug, Clone)]
pub struct CommandDeployTarget {
    command: String,
}

impl CommandDeployTarget {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

#[async_trait]
impl DeployTarget for CommandDeployTarget {
    async fn deploy(&self, plan: &BuildPlan, sandbox: &SandboxRef) -> Result<DeployResult, PublishError> {
        let mission = sandbox.mission_id.to_string();
        let attempt = sandbox.attempt.to_string();
        let stdout = run_in_plan_dir(
            &self.command,
            plan,
            &[
                ("SORTIE_MISSION_ID", &mission),
                ("SORTIE_ATTEMPT", &attempt),
                ("SORTIE_SANDBOX", &sandbox.label),
            ],
        )
        .await?;
        let url = extract_url(&stdout)
            .ok_or_else(|| PublishError("deploy command printed no https URL".into()))?;
        Ok(DeployResult { url })
    }
}

#[derive(Debug, Clone)]
pub struct CommandPublishTarget {
    command: String,
}

impl CommandPublishTarget {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

#[async_trait]
impl PublishTarget for CommandPublishTarget {
    async fn publish(
        &self,
        plan: &BuildPlan,
        deployed: Option<&DeployResult>,
    ) -> Result<PublishResult, PublishError> {
        let url = deployed.map(|d| d.url.as_str()).unwrap_or_default();
        let stdout = run_in_plan_dir(&self.command, plan, &[("SORTIE_DEPLOY_URL", url)]).await?;
        let reference = stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .ok_or_else(|| PublishError("publish command printed no reference".into()))?;
        Ok(PublishResult {
            reference: reference.to_string(),
        })
    }
}
