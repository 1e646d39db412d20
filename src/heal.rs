//! Self-healing retry controller.
//!
//! The controller enforces the attempt budget and the shape of the loop. It
//! never interprets a failure: it packages a compact summary and leaves the
//! diagnosis to the healer. Heal context is derived only from the failing
//! plan and its execution result, so the same pair always produces the same
//! bytes.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::HealConfig;
use crate::error::MissionError;
use crate::model::{BuildPlan, ExecutionResult};
use crate::template::HealTemplate;

/// Compact description of a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureSummary {
    pub command: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub stderr_tail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_tail: Option<String>,
}

impl FailureSummary {
    pub fn new(plan: &BuildPlan, result: &ExecutionResult, max_chars: usize) -> Self {
        let stdout = result.stdout_tail.trim();
        Self {
            command: plan.verify_command.clone(),
            exit_code: result.exit_code,
            timed_out: result.timed_out,
            stderr_tail: last_chars(result.stderr_tail.trim(), max_chars),
            stdout_tail: (!stdout.is_empty()).then(|| last_chars(stdout, max_chars)),
        }
    }
}

/// Everything the healer receives. Owned and immutable: each attempt gets a
/// fresh context, nothing is shared between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealContext {
    pub plan: BuildPlan,
    pub failure: FailureSummary,
    pub prompt: String,
}

impl HealContext {
    /// SHA-256 over the serialized context.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }
}

/// What the orchestrator does after an execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// The attempt was green.
    Publish,
    /// Ask the healer for a new plan.
    Heal(Box<HealContext>),
    /// Budget spent; the mission fails.
    Exhausted(MissionError),
}

#[derive(Debug, Clone)]
pub struct RetryController {
    max_attempts: u32,
    summary_chars: usize,
    template: HealTemplate,
}

impl RetryController {
    pub const fn new(max_attempts: u32, summary_chars: usize, template: HealTemplate) -> Self {
        Self {
            max_attempts,
            summary_chars,
            template,
        }
    }

    pub fn from_config(max_attempts: u32, config: &HealConfig) -> Self {
        Self::new(
            max_attempts,
            config.summary_chars,
            HealTemplate::load(config.template.as_deref()),
        )
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide what follows execution attempt `attempt` (0-based).
    pub fn next_step(&self, attempt: u32, plan: &BuildPlan, result: &ExecutionResult) -> NextStep {
        if result.is_green() {
            return NextStep::Publish;
        }
        if attempt.saturating_add(1) < self.max_attempts {
            return NextStep::Heal(Box::new(self.context(plan, result)));
        }
        NextStep::Exhausted(MissionError::RetriesExhausted {
            max_attempts: self.max_attempts,
            last: Self::classify(result).to_string(),
        })
    }

    /// Build the context handed to the healer.
    pub fn context(&self, plan: &BuildPlan, result: &ExecutionResult) -> HealContext {
        let failure = FailureSummary::new(plan, result, self.summary_chars);
        let prompt = self.template.render(plan, &failure);
        HealContext {
            plan: plan.clone(),
            failure,
            prompt,
        }
    }

    /// The recoverable error a non-green result represents.
    pub const fn classify(result: &ExecutionResult) -> MissionError {
        if result.timed_out {
            MissionError::ExecutionTimeout
        } else {
            MissionError::ExecutionFailure {
                exit_code: result.exit_code,
            }
        }
    }
}

fn last_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    let tail: String = s.chars().skip(count - max).collect();
    format!("...{tail}")
}
