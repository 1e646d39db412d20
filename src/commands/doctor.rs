use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use serde::Serialize;

use super::OutputFormat;
use crate::config::{self, Config, RuntimeKind};
use crate::error::ExitError;
use crate::heal::FailureSummary;
use crate::model::{BuildPlan, ExecutionResult, PlanFile, TargetKind};
use crate::policy::PolicyGate;
use crate::subprocess::Tool;
use crate::template::HealTemplate;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Args)]
pub struct DoctorArgs {
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub config: ConfigStatus,
    pub tools: Vec<ToolStatus>,
    pub issues: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ConfigStatus {
    pub source: String,
    pub runtime: String,
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub store: String,
}

#[derive(Debug, Serialize)]
pub struct ToolStatus {
    pub name: String,
    pub present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl DoctorArgs {
    pub async fn execute(&self, explicit: Option<&Path>, config: &Config) -> anyhow::Result<()> {
        let source = match explicit {
            Some(path) => path.display().to_string(),
            None => std::env::current_dir()
                .ok()
                .and_then(|cwd| config::find_config(&cwd))
                .map_or_else(|| "defaults".to_string(), |p| p.display().to_string()),
        };
        let store_dir = config.store.resolve_dir();

        let mut report = DoctorReport {
            config: ConfigStatus {
                source,
                runtime: match config.sandbox.runtime {
                    RuntimeKind::Docker => "docker".to_string(),
                    RuntimeKind::Local => "local".to_string(),
                },
                max_concurrent: config.orchestrator.max_concurrent,
                max_attempts: config.orchestrator.max_attempts,
                store: store_dir.display().to_string(),
            },
            tools: vec![],
            issues: vec![],
            warnings: vec![],
        };

        if let Err(e) = PolicyGate::new(&config.policy) {
            report.issues.push(format!("policy: {e}"));
        }
        if let Some(path) = &config.heal.template {
            check_template(path, &mut report.issues);
        }

        match config.sandbox.runtime {
            RuntimeKind::Docker => {
                let probe = Tool::new(&config.sandbox.docker_bin)
                    .args(&["version", "--format", "{{.Server.Version}}"])
                    .timeout(PROBE_TIMEOUT)
                    .run_ok()
                    .await;
                let present = probe.is_ok();
                report.tools.push(ToolStatus {
                    name: format!("{} (sandbox runtime)", config.sandbox.docker_bin),
                    present,
                    version: probe.ok().map(|o| o.stdout.trim().to_string()),
                });
                if !present {
                    report
                        .issues
                        .push(format!("docker daemon not reachable via {}", config.sandbox.docker_bin));
                }
            }
            RuntimeKind::Local => {
                report
                    .warnings
                    .push("sandbox.runtime = \"local\" runs plans without isolation".to_string());
            }
        }

        match config.collaborators.generator.first() {
            None => report
                .issues
                .push("collaborators.generator is not configured".to_string()),
            Some(program) => {
                let present = find_program(program).is_some();
                report.tools.push(ToolStatus {
                    name: format!("{program} (generator)"),
                    present,
                    version: None,
                });
                if !present {
                    report.issues.push(format!("generator not found: {program}"));
                }
            }
        }

        if let Err(e) = std::fs::create_dir_all(&store_dir) {
            report
                .issues
                .push(format!("store directory {} is not writable: {e}", store_dir.display()));
        }

        let issue_count = report.issues.len();
        let format = self.format.unwrap_or(OutputFormat::Text);
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Text => print_text(&report, std::io::stdout().is_terminal()),
        }

        if issue_count > 0 {
            return Err(ExitError::Other(format!("{issue_count} issue(s) found")).into());
        }
        Ok(())
    }
}

/// Render the heal template against a sample failure so a broken template
/// shows up here rather than in the middle of a mission.
fn check_template(path: &Path, issues: &mut Vec<String>) {
    let template = match HealTemplate::from_file(path) {
        Ok(template) => template,
        Err(e) => {
            issues.push(format!("heal template: {e:#}"));
            return;
        }
    };
    let plan = BuildPlan {
        name: "doctor".into(),
        target_kind: TargetKind::Python,
        files: vec![PlanFile::new("main.py", "print('ok')")],
        verify_command: "python main.py".into(),
        run_command: String::new(),
    };
    let result = ExecutionResult {
        exit_code: 1,
        stdout_tail: String::new(),
        stderr_tail: "Traceback".into(),
        duration: Duration::ZERO,
        timed_out: false,
    };
    let rendered = template.render(&plan, &FailureSummary::new(&plan, &result, 200));
    if rendered.trim().is_empty() {
        issues.push(format!("heal template {} renders to nothing", path.display()));
    }
}

/// Resolve a program the way a shell would: as a path if it has a slash,
/// else by searching `PATH`.
fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

fn print_text(report: &DoctorReport, fancy: bool) {
    let (ok, bad) = if fancy { ("✓", "✗") } else { ("ok", "!!") };
    println!("config:         {}", report.config.source);
    println!("runtime:        {}", report.config.runtime);
    println!("max_concurrent: {}", report.config.max_concurrent);
    println!("max_attempts:   {}", report.config.max_attempts);
    println!("store:          {}", report.config.store);
    if !report.tools.is_empty() {
        println!("\ntools:");
        for tool in &report.tools {
            let mark = if tool.present { ok } else { bad };
            match &tool.version {
                Some(version) => println!("  {mark} {} {version}", tool.name),
                None => println!("  {mark} {}", tool.name),
            }
        }
    }
    for warning in &report.warnings {
        println!("\nwarning: {warning}");
    }
    if !report.issues.is_empty() {
        println!("\nissues:");
        for issue in &report.issues {
            println!("  - {issue}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_programs_on_path() {
        assert!(find_program("sh").is_some());
        assert!(find_program("definitely-not-a-sortie-binary").is_none());
        assert!(find_program("/nonexistent/bin/tool").is_none());
    }

    #[test]
    fn broken_template_is_an_issue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heal.jinja");
        std::fs::write(&path, "{% if %}").unwrap();
        let mut issues = Vec::new();
        check_template(&path, &mut issues);
        assert_eq!(issues.len(), 1);
    }
}
