use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use serde::Serialize;

use super::OutputFormat;
use crate::config::Config;
use crate::error::ExitError;
use crate::model::BuildPlan;
use crate::policy::{PolicyGate, Verdict};

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Path to a plan JSON file
    pub plan: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

#[derive(Debug, Serialize)]
struct ValidationReport {
    name: String,
    target_kind: String,
    files: usize,
    digest: String,
    #[serde(flatten)]
    verdict: Verdict,
}

impl ValidateArgs {
    /// Shape checks plus the policy gate. Nothing is executed.
    pub fn execute(&self, config: &Config) -> anyhow::Result<()> {
        let json = std::fs::read_to_string(&self.plan)
            .with_context(|| format!("reading {}", self.plan.display()))?;
        let plan = BuildPlan::from_json(&json)
            .map_err(|e| ExitError::Other(format!("{}: {e}", self.plan.display())))?;
        let gate = PolicyGate::new(&config.policy).map_err(|e| ExitError::Config(e.to_string()))?;
        let verdict = gate.validate(&plan);

        let report = ValidationReport {
            name: plan.name.clone(),
            target_kind: plan.target_kind.to_string(),
            files: plan.files.len(),
            digest: plan.digest(),
            verdict,
        };
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Text => {
                println!("plan    {} ({}, {} files)", report.name, report.target_kind, report.files);
                println!("digest  {}", report.digest);
                match &report.verdict {
                    Verdict::Accept => println!("verdict accept"),
                    Verdict::Reject { rule, reasons } => {
                        println!("verdict reject ({rule})");
                        for reason in reasons {
                            println!("        - {reason}");
                        }
                    }
                }
            }
        }

        if let Verdict::Reject { rule, .. } = report.verdict {
            return Err(ExitError::Other(format!("plan rejected by {rule}")).into());
        }
        Ok(())
    }
}
