//! Heal prompt rendering.
//!
//! The template is loaded once at startup. A missing or broken template file
//! falls back to the built-in one rather than failing the engine.

use std::path::{Path, PathBuf};

use anyhow::Context;
use minijinja::Environment;
use serde::Serialize;

use crate::heal::FailureSummary;
use crate::model::BuildPlan;

const BUILTIN_HEAL_TEMPLATE: &str = include_str!("templates/heal.md.jinja");

/// Data passed to the heal template.
#[derive(Debug, Serialize)]
struct HealPromptContext<'a> {
    plan: &'a BuildPlan,
    /// The plan as pretty-printed JSON.
    plan_json: String,
    failure: &'a FailureSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateOrigin {
    Builtin,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct HealTemplate {
    source: String,
    origin: TemplateOrigin,
}

impl Default for HealTemplate {
    fn default() -> Self {
        Self::builtin()
    }
}

impl HealTemplate {
    pub fn builtin() -> Self {
        Self {
            source: BUILTIN_HEAL_TEMPLATE.to_string(),
            origin: TemplateOrigin::Builtin,
        }
    }

    /// Load the configured template, falling back to the built-in one.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::builtin();
        };
        match Self::from_file(path) {
            Ok(template) => template,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "using built-in heal template");
                Self::builtin()
            }
        }
    }

    /// Read and syntax-check a template file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Environment::new()
            .template_from_str(&source)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self {
            source,
            origin: TemplateOrigin::File(path.to_path_buf()),
        })
    }

    pub const fn origin(&self) -> &TemplateOrigin {
        &self.origin
    }

    /// Render the heal prompt. Rendering is a pure function of its inputs.
    pub fn render(&self, plan: &BuildPlan, failure: &FailureSummary) -> String {
        let ctx = HealPromptContext {
            plan,
            plan_json: serde_json::to_string_pretty(plan).unwrap_or_default(),
            failure,
        };
        match Environment::new().render_str(&self.source, &ctx) {
            Ok(rendered) => rendered,
            Err(e) => {
                tracing::warn!(error = %e, "heal template failed to render, using plain prompt");
                plain_prompt(&ctx)
            }
        }
    }
}

fn plain_prompt(ctx: &HealPromptContext<'_>) -> String {
    let outcome = if ctx.failure.timed_out {
        "killed after exceeding the time limit".to_string()
    } else {
        format!("exit code {}", ctx.failure.exit_code)
    };
    format!(
        "Fix this build plan and return it as JSON.\n\nPlan:\n{}\n\nCommand `{}` failed: {}\n\n{}\n",
        ctx.plan_json, ctx.failure.command, outcome, ctx.failure.stderr_tail
    )
}
