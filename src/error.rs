use std::process::ExitCode;

use crate::model::{Failure, FailureReason};

/// Errors that cause sortie to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("mission {mission} failed: {reason}: {message}")]
    MissionFailed {
        mission: String,
        reason: FailureReason,
        message: String,
    },

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Config(_) => ExitCode::from(2),
            Self::ToolNotFound { .. } => ExitCode::from(3),
            Self::ToolFailed { .. } => ExitCode::from(4),
            Self::Timeout { .. } => ExitCode::from(5),
            Self::MissionFailed { .. } => ExitCode::from(7),
            Self::Other(_) => ExitCode::from(1),
        }
    }
}

/// Everything that can end a mission.
///
/// `ExecutionFailure` and `ExecutionTimeout` are recoverable by healing; they
/// only reach a caller folded into `RetriesExhausted`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MissionError {
    #[error("plan generation failed: {0}")]
    Generation(String),

    #[error("policy violation: {}", reasons.join("; "))]
    PolicyViolation { reasons: Vec<String> },

    #[error("verify command exited with {exit_code}")]
    ExecutionFailure { exit_code: i32 },

    #[error("verify command exceeded the sandbox wall clock")]
    ExecutionTimeout,

    #[error("heal failed: {0}")]
    HealFailed(String),

    #[error("infrastructure error during {stage}: {message}")]
    Infrastructure { stage: String, message: String },

    #[error("retry budget of {max_attempts} attempts exhausted: {last}")]
    RetriesExhausted { max_attempts: u32, last: String },

    #[error("mission deadline passed")]
    MissionTimeout,

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("aborted by operator")]
    Aborted,
}

impl MissionError {
    /// The structured reason a caller observes for this error.
    pub const fn reason(&self) -> FailureReason {
        match self {
            Self::Generation(_) => FailureReason::PlanGenerationFailed,
            Self::PolicyViolation { .. } => FailureReason::PolicyViolation,
            // Only surfaced on their own if something skipped the retry controller.
            Self::ExecutionFailure { .. } | Self::ExecutionTimeout | Self::RetriesExhausted { .. } => {
                FailureReason::RetriesExhausted
            }
            Self::HealFailed(_) => FailureReason::HealFailed,
            Self::Infrastructure { .. } => FailureReason::InfrastructureError,
            Self::MissionTimeout => FailureReason::MissionTimeout,
            Self::PublishFailed(_) => FailureReason::PublishFailed,
            Self::Aborted => FailureReason::Aborted,
        }
    }

    pub fn to_failure(&self) -> Failure {
        let details = match self {
            Self::PolicyViolation { reasons } => reasons.clone(),
            _ => Vec::new(),
        };
        Failure {
            reason: self.reason(),
            message: self.to_string(),
            details,
        }
    }
}
