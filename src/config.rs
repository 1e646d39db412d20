use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;
use crate::model::TargetKind;

/// Config file name constants.
pub const CONFIG_TOML: &str = "sortie.toml";
pub const CONFIG_JSON: &str = "sortie.json";

/// Find the config file path, preferring sortie.toml over sortie.json.
/// Returns None if neither exists.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let toml_path = dir.join(CONFIG_TOML);
    if toml_path.exists() {
        return Some(toml_path);
    }
    let json_path = dir.join(CONFIG_JSON);
    if json_path.exists() {
        return Some(json_path);
    }
    None
}

/// Top-level sortie.toml config.
///
/// Every section is optional; a missing file is the same as an empty one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub heal: HealConfig,
    #[serde(default)]
    pub collaborators: CollaboratorsConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OrchestratorConfig {
    /// Hard ceiling on missions past admission.
    #[serde(default = "default_max_concurrent", alias = "maxConcurrent")]
    pub max_concurrent: usize,
    /// Total execution attempts per mission, first run included.
    #[serde(default = "default_max_attempts", alias = "maxAttempts")]
    pub max_attempts: u32,
    #[serde(default = "default_timeout_900", alias = "missionTimeoutSecs")]
    pub mission_timeout_secs: u64,
    #[serde(default = "default_timeout_120", alias = "generationTimeoutSecs")]
    pub generation_timeout_secs: u64,
    #[serde(default = "default_timeout_120", alias = "publishTimeoutSecs")]
    pub publish_timeout_secs: u64,
    #[serde(default = "default_subscriber_buffer", alias = "subscriberBuffer")]
    pub subscriber_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_attempts: default_max_attempts(),
            mission_timeout_secs: default_timeout_900(),
            generation_timeout_secs: default_timeout_120(),
            publish_timeout_secs: default_timeout_120(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl OrchestratorConfig {
    pub fn mission_timeout(&self) -> Duration {
        Duration::from_secs(self.mission_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Disposable containers driven through the docker CLI.
    #[default]
    Docker,
    /// Temporary directories on the host. Enforces wall-clock limits only.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SandboxConfig {
    #[serde(default)]
    pub runtime: RuntimeKind,
    #[serde(default = "default_memory_mb", alias = "memoryMb")]
    pub memory_mb: u64,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// Dead man's switch for a single execution attempt.
    #[serde(default = "default_timeout_180", alias = "wallClockSecs")]
    pub wall_clock_secs: u64,
    #[serde(default = "default_tail_bytes", alias = "outputTailBytes")]
    pub output_tail_bytes: usize,
    #[serde(default = "default_timeout_30", alias = "teardownTimeoutSecs")]
    pub teardown_timeout_secs: u64,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_docker_bin", alias = "dockerBin")]
    pub docker_bin: String,
    #[serde(default)]
    pub profiles: ProfilesConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::default(),
            memory_mb: default_memory_mb(),
            cpus: default_cpus(),
            wall_clock_secs: default_timeout_180(),
            output_tail_bytes: default_tail_bytes(),
            teardown_timeout_secs: default_timeout_30(),
            network: default_network(),
            docker_bin: default_docker_bin(),
            profiles: ProfilesConfig::default(),
        }
    }
}

impl SandboxConfig {
    pub fn wall_clock(&self) -> Duration {
        Duration::from_secs(self.wall_clock_secs)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }
}

/// Per-target execution profile overrides.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProfilesConfig {
    #[serde(default = "default_python_profile")]
    pub python: ProfileConfig,
    #[serde(default = "default_node_profile")]
    pub node: ProfileConfig,
    #[serde(default = "default_rust_profile")]
    pub rust: ProfileConfig,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            python: default_python_profile(),
            node: default_node_profile(),
            rust: default_rust_profile(),
        }
    }
}

impl ProfilesConfig {
    pub fn get(&self, kind: TargetKind) -> &ProfileConfig {
        match kind {
            TargetKind::Python => &self.python,
            TargetKind::Node => &self.node,
            TargetKind::Rust => &self.rust,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProfileConfig {
    pub image: String,
    #[serde(default = "default_workdir")]
    pub workdir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PolicyConfig {
    #[serde(default = "default_allowed_targets", alias = "allowedTargets")]
    pub allowed_targets: Vec<TargetKind>,
    #[serde(default = "default_max_files", alias = "maxFiles")]
    pub max_files: usize,
    /// Case-insensitive regular expressions matched against file contents.
    #[serde(default = "default_forbidden_patterns", alias = "forbiddenPatterns")]
    pub forbidden_patterns: Vec<String>,
    #[serde(default = "default_name_pattern", alias = "namePattern")]
    pub name_pattern: String,
    #[serde(default = "default_max_name_len", alias = "maxNameLen")]
    pub max_name_len: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_targets: default_allowed_targets(),
            max_files: default_max_files(),
            forbidden_patterns: default_forbidden_patterns(),
            name_pattern: default_name_pattern(),
            max_name_len: default_max_name_len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HealConfig {
    /// Maximum stderr characters handed to the healer.
    #[serde(default = "default_summary_chars", alias = "summaryChars")]
    pub summary_chars: usize,
    /// Optional minijinja template overriding the built-in heal prompt.
    #[serde(default)]
    pub template: Option<PathBuf>,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            summary_chars: default_summary_chars(),
            template: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CollaboratorsConfig {
    /// Program and arguments for the plan generator; `draft` or `heal` is appended.
    #[serde(default)]
    pub generator: Vec<String>,
    /// Shell command that deploys a verified plan.
    #[serde(default)]
    pub deploy: Option<String>,
    /// Shell command that publishes a verified plan.
    #[serde(default)]
    pub publish: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StoreConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl StoreConfig {
    /// Directory holding mission documents and evidence logs.
    pub fn resolve_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("sortie")
    }
}

// Default value functions for serde
fn default_max_concurrent() -> usize { 4 }
fn default_max_attempts() -> u32 { 3 }
fn default_timeout_30() -> u64 { 30 }
fn default_timeout_120() -> u64 { 120 }
fn default_timeout_180() -> u64 { 180 }
fn default_timeout_900() -> u64 { 900 }
fn default_subscriber_buffer() -> usize { 64 }
fn default_memory_mb() -> u64 { 512 }
fn default_cpus() -> f64 { 1.0 }
fn default_tail_bytes() -> usize { 8 * 1024 }
fn default_network() -> String { "bridge".into() }
fn default_docker_bin() -> String { "docker".into() }
fn default_workdir() -> String { "/workspace".into() }
fn default_max_files() -> usize { 10 }
fn default_max_name_len() -> usize { 64 }
fn default_summary_chars() -> usize { 2000 }
fn default_name_pattern() -> String { "^[a-zA-Z][a-zA-Z0-9_-]*$".into() }
fn default_allowed_targets() -> Vec<TargetKind> { TargetKind::ALL.to_vec() }

fn default_python_profile() -> ProfileConfig {
    ProfileConfig { image: "python:3.11-slim".into(), workdir: default_workdir() }
}

fn default_node_profile() -> ProfileConfig {
    ProfileConfig { image: "node:20-alpine".into(), workdir: default_workdir() }
}

fn default_rust_profile() -> ProfileConfig {
    ProfileConfig { image: "rust:1.75-slim".into(), workdir: default_workdir() }
}

fn default_forbidden_patterns() -> Vec<String> {
    vec![
        // destructive filesystem operations
        r"rm\s+-rf\s+/".into(),
        r"\bmkfs(\.\w+)?\b".into(),
        r"\bdd\s+if=".into(),
        // fork bomb
        r":\(\)\s*\{\s*:\|:&\s*\};:".into(),
        // remote code piped into a shell
        r"(curl|wget)[^|\n]*\|\s*(ba|z)?sh\b".into(),
        // shell escapes from generated code
        r"\bos\.system\s*\(".into(),
        r"shell\s*=\s*True".into(),
        r"__import__\s*\(".into(),
        r"child_process".into(),
        // credential exfiltration
        r"\.aws/credentials".into(),
        r"/etc/shadow".into(),
        r"\.ssh/id_(rsa|ed25519)".into(),
    ]
}

impl Config {
    /// Load config from a file (TOML or JSON, auto-detected by extension).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "toml" => Self::parse_toml(&contents),
            "json" => Self::parse_json(&contents),
            _ => {
                // Try TOML first, then JSON
                Self::parse_toml(&contents).or_else(|_| Self::parse_json(&contents))
            }
        }
    }

    /// Load the explicit path if given, else the config in `dir`, else defaults.
    pub fn discover(explicit: Option<&Path>, dir: &Path) -> anyhow::Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => match find_config(dir) {
                Some(path) => Self::load(&path),
                None => Ok(Self::default()),
            },
        }
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_TOML}: {e}")))?;
        config.check()?;
        Ok(config)
    }

    /// Parse config from a JSON string.
    pub fn parse_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_JSON}: {e}")))?;
        config.check()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn check(&self) -> anyhow::Result<()> {
        let o = &self.orchestrator;
        if o.max_concurrent == 0 {
            return Err(ExitError::Config("orchestrator.max_concurrent must be at least 1".into()).into());
        }
        if o.max_attempts == 0 {
            return Err(ExitError::Config("orchestrator.max_attempts must be at least 1".into()).into());
        }
        let timeouts = [
            ("orchestrator.mission_timeout_secs", o.mission_timeout_secs),
            ("orchestrator.generation_timeout_secs", o.generation_timeout_secs),
            ("orchestrator.publish_timeout_secs", o.publish_timeout_secs),
            ("sandbox.wall_clock_secs", self.sandbox.wall_clock_secs),
            ("sandbox.teardown_timeout_secs", self.sandbox.teardown_timeout_secs),
        ];
        if let Some((key, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(ExitError::Config(format!("{key} must be greater than zero")).into());
        }
        if o.subscriber_buffer == 0 {
            return Err(ExitError::Config("orchestrator.subscriber_buffer must be at least 1".into()).into());
        }
        Ok(())
    }

    /// Serialize config to a TOML string with helpful comments.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let raw = toml::to_string_pretty(self)
            .context("serializing config to TOML")?;

        let mut doc: toml_edit::DocumentMut = raw.parse()
            .context("parsing generated TOML for comment injection")?;

        doc.decor_mut().set_prefix("# Sortie mission engine configuration\n\n");

        fn set_table_comment(doc: &mut toml_edit::DocumentMut, key: &str, comment: &str) {
            if let Some(item) = doc.get_mut(key)
                && let Some(tbl) = item.as_table_mut()
            {
                tbl.decor_mut().set_prefix(comment);
            }
        }

        set_table_comment(&mut doc, "orchestrator", "# Admission, retry budget and mission deadlines\n");
        set_table_comment(&mut doc, "sandbox", "\n# Execution sandbox limits (wall_clock_secs is the dead man's switch)\n");
        set_table_comment(&mut doc, "policy", "\n# Policy gate applied to every plan before execution\n");
        set_table_comment(&mut doc, "heal", "\n# Self-healing context handed to the generator\n");
        set_table_comment(&mut doc, "collaborators", "\n# External commands: generator drafts/heals plans, deploy/publish run after verification\n");
        set_table_comment(&mut doc, "store", "\n# Mission and evidence storage\n");

        Ok(doc.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let config = Config::parse_toml("").unwrap();
        assert_eq!(config.orchestrator.max_concurrent, 4);
        assert_eq!(config.orchestrator.max_attempts, 3);
        assert_eq!(config.sandbox.wall_clock_secs, 180);
        assert_eq!(config.sandbox.memory_mb, 512);
        assert_eq!(config.sandbox.runtime, RuntimeKind::Docker);
        assert_eq!(config.policy.max_files, 10);
        assert_eq!(config.policy.allowed_targets.len(), 3);
        assert!(config.collaborators.generator.is_empty());
    }

    #[test]
    fn parse_full_toml_config() {
        let toml_str = r#"
[orchestrator]
max_concurrent = 2
max_attempts = 5
mission_timeout_secs = 600

[sandbox]
runtime = "local"
memory_mb = 256
wall_clock_secs = 60

[sandbox.profiles.node]
image = "node:22-alpine"

[policy]
allowed_targets = ["python"]
max_files = 4
forbidden_patterns = ["sudo"]

[collaborators]
generator = ["planner", "--model", "fast"]
deploy = "vercel deploy --prod"
"#;

        let config = Config::parse_toml(toml_str).unwrap();
        assert_eq!(config.orchestrator.max_concurrent, 2);
        assert_eq!(config.orchestrator.max_attempts, 5);
        assert_eq!(config.orchestrator.generation_timeout_secs, 120);
        assert_eq!(config.sandbox.runtime, RuntimeKind::Local);
        assert_eq!(config.sandbox.profiles.node.image, "node:22-alpine");
        assert_eq!(config.sandbox.profiles.node.workdir, "/workspace");
        assert_eq!(config.sandbox.profiles.python.image, "python:3.11-slim");
        assert_eq!(config.policy.allowed_targets, vec![TargetKind::Python]);
        assert_eq!(config.policy.forbidden_patterns, vec!["sudo"]);
        assert_eq!(config.collaborators.generator, vec!["planner", "--model", "fast"]);
        assert_eq!(config.collaborators.deploy.as_deref(), Some("vercel deploy --prod"));
        assert!(config.collaborators.publish.is_none());
    }

    #[test]
    fn parse_camel_case_json() {
        let json = r#"{
            "orchestrator": { "maxConcurrent": 8, "maxAttempts": 2 },
            "sandbox": { "wallClockSecs": 30, "runtime": "local" }
        }"#;
        let config = Config::parse_json(json).unwrap();
        assert_eq!(config.orchestrator.max_concurrent, 8);
        assert_eq!(config.orchestrator.max_attempts, 2);
        assert_eq!(config.sandbox.wall_clock_secs, 30);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = Config::parse_toml("[orchestrator]\nmax_concurrent = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));
    }

    #[test]
    fn rejects_zero_attempts() {
        assert!(Config::parse_toml("[orchestrator]\nmax_attempts = 0\n").is_err());
    }

    #[test]
    fn rejects_every_zero_timeout() {
        for toml in [
            "[orchestrator]\ngeneration_timeout_secs = 0\n",
            "[orchestrator]\npublish_timeout_secs = 0\n",
            "[sandbox]\nteardown_timeout_secs = 0\n",
            "[sandbox]\nwall_clock_secs = 0\n",
        ] {
            let err = Config::parse_toml(toml).unwrap_err();
            let key = toml.lines().nth(1).unwrap().split(' ').next().unwrap();
            assert!(err.to_string().contains(key), "{toml}: {err}");
        }
    }

    #[test]
    fn parse_malformed_toml() {
        let result = Config::parse_toml("not valid toml [[[");
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("invalid sortie.toml"));
        assert!(err.downcast_ref::<ExitError>().is_some());
    }

    #[test]
    fn parse_unknown_target() {
        assert!(Config::parse_toml("[policy]\nallowed_targets = [\"cobol\"]\n").is_err());
    }

    #[test]
    fn roundtrip_toml() {
        let mut config = Config::default();
        config.orchestrator.max_concurrent = 7;
        config.collaborators.generator = vec!["planner".into()];
        let output = config.to_toml().unwrap();
        let config2 = Config::parse_toml(&output).unwrap();
        assert_eq!(config2.orchestrator.max_concurrent, 7);
        assert_eq!(config2.collaborators.generator, vec!["planner"]);
        assert_eq!(config2.policy.forbidden_patterns, config.policy.forbidden_patterns);
    }

    #[test]
    fn to_toml_includes_comments() {
        let output = Config::default().to_toml().unwrap();
        assert!(output.contains("# Sortie mission engine configuration"));
        assert!(output.contains("dead man's switch"));
    }

    #[test]
    fn find_config_prefers_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_TOML), "").unwrap();
        std::fs::write(dir.path().join(CONFIG_JSON), "{}").unwrap();

        let found = find_config(dir.path()).unwrap();
        assert!(found.to_string_lossy().ends_with(CONFIG_TOML));
    }

    #[test]
    fn discover_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::discover(None, dir.path()).unwrap();
        assert_eq!(config.orchestrator.max_attempts, 3);
    }

    #[test]
    fn store_dir_honours_override() {
        let store = StoreConfig { dir: Some(PathBuf::from("/tmp/sortie-test")) };
        assert_eq!(store.resolve_dir(), PathBuf::from("/tmp/sortie-test"));
    }
}
