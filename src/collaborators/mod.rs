//! External collaborators the engine drives but does not implement.
//!
//! Generation and healing produce plans; deploy and publish act on a verified
//! plan. The orchestrator bounds every call with its own timeout.

pub mod command;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::heal::HealContext;
use crate::model::{BuildPlan, MissionId, PlanShapeError};

pub use command::{CommandDeployTarget, CommandGenerator, CommandPublishTarget};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("generator returned an unusable plan: {0}")]
    InvalidPlan(#[from] PlanShapeError),

    #[error("generator failed: {0}")]
    Collaborator(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PublishError(pub String);

/// Turns a natural-language intent into a first plan.
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn draft(&self, intent: &str) -> Result<BuildPlan, GenerationError>;
}

/// Produces a corrected plan from a failed one.
#[async_trait]
pub trait PlanHealer: Send + Sync {
    async fn heal(&self, context: HealContext) -> Result<BuildPlan, GenerationError>;
}

/// Names the sandbox run that verified a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRef {
    pub mission_id: MissionId,
    pub attempt: u32,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployResult {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    pub reference: String,
}

#[async_trait]
pub trait DeployTarget: Send + Sync {
    async fn deploy(&self, plan: &BuildPlan, sandbox: &SandboxRef) -> Result<DeployResult, PublishError>;
}

/// Only ever called after a verified execution.
#[async_trait]
pub trait PublishTarget: Send + Sync {
    async fn publish(
        &self,
        plan: &BuildPlan,
        deployed: Option<&DeployResult>,
    ) -> Result<PublishResult, PublishError>;
}
