use anyhow::Context;
use clap::Args;
use tokio_stream::StreamExt;

use super::{OutputFormat, build_engine, print_mission};
use crate::config::Config;
use crate::error::ExitError;
use crate::model::{FailureReason, MissionId, SubmitOptions};
use crate::orchestrator::Orchestrator;
use crate::state::MissionStatus;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// What to build, in plain language
    pub intent: String,
    /// Do not call the deploy target
    #[arg(long)]
    pub no_deploy: bool,
    /// Do not call the publish target
    #[arg(long)]
    pub no_publish: bool,
    /// Output format
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

impl RunArgs {
    pub async fn execute(&self, config: &Config) -> anyhow::Result<()> {
        let engine = build_engine(config).await?;
        let options = SubmitOptions {
            deploy: !self.no_deploy,
            publish: !self.no_publish,
        };
        let id = engine.submit_with(&self.intent, options).await?;
        follow(&engine, id, self.format).await
    }
}

#[derive(Debug, Args)]
pub struct RetryArgs {
    /// ID of a FAILED mission
    pub id: MissionId,
    /// Output format
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

impl RetryArgs {
    pub async fn execute(&self, config: &Config) -> anyhow::Result<()> {
        let engine = build_engine(config).await?;
        let id = engine.retry(self.id).await?;
        follow(&engine, id, self.format).await
    }
}

/// Stream transitions to stderr until the mission is terminal, then print
/// the final snapshot. Ctrl-C aborts the mission.
async fn follow(engine: &Orchestrator, id: MissionId, format: OutputFormat) -> anyhow::Result<()> {
    let handle = engine.clone();
    ctrlc::set_handler(move || handle.abort()).context("installing Ctrl-C handler")?;

    eprintln!("mission {id} submitted");
    let mut updates = engine.subscribe(id).await?;
    while let Some(transition) = updates.next().await {
        if format == OutputFormat::Text {
            eprintln!(
                "[{}] {} -> {}  {}",
                transition.at.format("%H:%M:%S"),
                transition.from,
                transition.to,
                transition.detail
            );
        }
    }

    let mission = engine.status(id).await?;
    engine.shutdown().await;
    print_mission(&mission, format)?;

    if mission.status == MissionStatus::Failed {
        let (reason, message) = mission.failure.map_or_else(
            || (FailureReason::Aborted, "no failure recorded".to_string()),
            |f| (f.reason, f.message),
        );
        return Err(ExitError::MissionFailed {
            mission: id.to_string(),
            reason,
            message,
        }
        .into());
    }
    Ok(())
}
