//! Mission and build-plan data model.
//!
//! A `BuildPlan` is immutable once attached to a mission attempt. Healing
//! produces a wholly new plan; nothing here hands out `&mut` access to a plan
//! that is already attached.

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::state::MissionStatus;

/// Opaque mission identifier, assigned at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MissionId(Uuid);

impl MissionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for MissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MissionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Closed set of execution profiles a plan can target.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Python,
    Node,
    Rust,
}

impl TargetKind {
    pub const ALL: [Self; 3] = [Self::Python, Self::Node, Self::Rust];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
            Self::Rust => "rust",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" => Ok(TargetKind::Python),
            "node" => Ok(TargetKind::Node),
            "rust" => Ok(TargetKind::Rust),
            other => Err(format!("unknown target kind {other:?}")),
        }
    }
}

/// A single file to materialize inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFile {
    /// Relative path inside the environment's workdir.
    pub path: String,
    pub content: String,
}

impl PlanFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// The generated artifact a mission executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub name: String,
    pub target_kind: TargetKind,
    pub files: Vec<PlanFile>,
    /// Command the sandbox runs to certify the plan.
    pub verify_command: String,
    /// Advisory only; never executed by the engine.
    #[serde(default)]
    pub run_command: String,
}

impl BuildPlan {
    /// Parse a plan from JSON and check its structure.
    pub fn from_json(json: &str) -> Result<Self, PlanShapeError> {
        let plan: BuildPlan =
            serde_json::from_str(json.trim()).map_err(|e| PlanShapeError::Malformed(e.to_string()))?;
        plan.check_shape()?;
        Ok(plan)
    }

    /// Structural checks that make a plan usable at all.
    ///
    /// These are independent of policy: a plan that fails here never reaches
    /// the policy gate.
    pub fn check_shape(&self) -> Result<(), PlanShapeError> {
        if self.name.trim().is_empty() {
            return Err(PlanShapeError::EmptyName);
        }
        if self.files.is_empty() {
            return Err(PlanShapeError::NoFiles);
        }
        if self.verify_command.trim().is_empty() {
            return Err(PlanShapeError::NoVerifyCommand);
        }

        let mut seen = HashSet::new();
        for file in &self.files {
            if !is_safe_relative(&file.path) {
                return Err(PlanShapeError::UnsafePath(file.path.clone()));
            }
            if !seen.insert(file.path.as_str()) {
                return Err(PlanShapeError::DuplicatePath(file.path.clone()));
            }
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON encoding of the plan.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }
}

fn is_safe_relative(path: &str) -> bool {
    if path.is_empty() || path.contains('\0') || path.contains('\\') {
        return false;
    }
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Reasons a generated plan is structurally unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanShapeError {
    #[error("plan is not valid JSON: {0}")]
    Malformed(String),
    #[error("plan name is empty")]
    EmptyName,
    #[error("plan has no files")]
    NoFiles,
    #[error("plan has no verify command")]
    NoVerifyCommand,
    #[error("file path {0:?} must be relative and stay inside the workdir")]
    UnsafePath(String),
    #[error("file path {0:?} appears more than once")]
    DuplicatePath(String),
}

/// Outcome of one sandbox execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Process exit code, or -1 when the command was killed.
    pub exit_code: i32,
    pub stdout_tail: String,
    pub stderr_tail: String,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub timed_out: bool,
}

impl ExecutionResult {
    /// Exit code zero and no timeout: the only result that may lead to publishing.
    pub fn is_green(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Structured terminal failure reason observed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    PlanGenerationFailed,
    PolicyViolation,
    HealFailed,
    RetriesExhausted,
    InfrastructureError,
    MissionTimeout,
    PublishFailed,
    Aborted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::PlanGenerationFailed => "PlanGenerationFailed",
            FailureReason::PolicyViolation => "PolicyViolation",
            FailureReason::HealFailed => "HealFailed",
            FailureReason::RetriesExhausted => "RetriesExhausted",
            FailureReason::InfrastructureError => "InfrastructureError",
            FailureReason::MissionTimeout => "MissionTimeout",
            FailureReason::PublishFailed => "PublishFailed",
            FailureReason::Aborted => "Aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: FailureReason,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

/// Terminal payload of a successful mission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

/// Per-submission switches for the publishing collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    pub deploy: bool,
    pub publish: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            deploy: true,
            publish: true,
        }
    }
}

/// The unit of orchestration.
///
/// Only the orchestrator's transition function mutates a live mission; every
/// other component sees clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mission {
    pub id: MissionId,
    pub status: MissionStatus,
    pub intent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<BuildPlan>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub options: SubmitOptions,
    /// True only while the latest execution attempt was green.
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<MissionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<MissionId>,
}

impl Mission {
    pub fn new(
        intent: impl Into<String>,
        max_attempts: u32,
        submitted_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
        options: SubmitOptions,
    ) -> Self {
        Self {
            id: MissionId::new(),
            status: MissionStatus::Pending,
            intent: intent.into(),
            plan: None,
            attempt: 0,
            max_attempts,
            submitted_at,
            updated_at: submitted_at,
            deadline,
            options,
            verified: false,
            result: None,
            failure: None,
            retry_of: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> BuildPlan {
        BuildPlan {
            name: "hello-api".to_string(),
            target_kind: TargetKind::Python,
            files: vec![
                PlanFile::new("app.py", "print('hi')\n"),
                PlanFile::new("tests/test_app.py", "def test_ok():\n    assert True\n"),
            ],
            verify_command: "pytest -q".to_string(),
            run_command: "python app.py".to_string(),
        }
    }

    #[test]
    fn parses_plan_json() {
        let json = r#"{
            "name": "hello-api",
            "target_kind": "python",
            "files": [{"path": "app.py", "content": "print(1)"}],
            "verify_command": "python app.py"
        }"#;
        let plan = BuildPlan::from_json(json).unwrap();
        assert_eq!(plan.target_kind, TargetKind::Python);
        assert_eq!(plan.files.len(), 1);
        assert!(plan.run_command.is_empty());
    }

    #[test]
    fn rejects_unknown_target_kind() {
        let json = r#"{"name":"x","target_kind":"cobol","files":[{"path":"a","content":""}],"verify_command":"true"}"#;
        assert!(matches!(
            BuildPlan::from_json(json),
            Err(PlanShapeError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_duplicate_paths() {
        let mut p = plan();
        p.files.push(PlanFile::new("app.py", "again"));
        assert_eq!(
            p.check_shape(),
            Err(PlanShapeError::DuplicatePath("app.py".to_string()))
        );
    }

    #[test]
    fn rejects_escaping_paths() {
        for bad in ["../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            let mut p = plan();
            p.files[0].path = bad.to_string();
            assert!(
                matches!(p.check_shape(), Err(PlanShapeError::UnsafePath(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_missing_verify_command() {
        let mut p = plan();
        p.verify_command = "  ".to_string();
        assert_eq!(p.check_shape(), Err(PlanShapeError::NoVerifyCommand));
    }

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        let a = plan();
        let b = plan();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);

        let mut c = plan();
        c.files[0].content.push('\n');
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn green_requires_zero_exit_and_no_timeout() {
        let mut r = ExecutionResult {
            exit_code: 0,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            duration: Duration::from_millis(10),
            timed_out: false,
        };
        assert!(r.is_green());
        r.timed_out = true;
        assert!(!r.is_green());
        r.timed_out = false;
        r.exit_code = 1;
        assert!(!r.is_green());
    }

    #[test]
    fn mission_id_round_trips_through_display() {
        let id = MissionId::new();
        let parsed: MissionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short().len(), 8);
    }
}
