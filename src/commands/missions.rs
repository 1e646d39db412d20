//! Read-only views over the mission store.

use clap::Args;

use super::{OutputFormat, open_store, print_mission};
use crate::config::Config;
use crate::error::ExitError;
use crate::evidence::{Event, Evidence};
use crate::model::MissionId;
use crate::store::MissionStore;

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Mission ID
    pub id: MissionId,
    /// Output format
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

impl StatusArgs {
    pub async fn execute(&self, config: &Config) -> anyhow::Result<()> {
        let store = open_store(config).await?;
        let mission = store
            .load(self.id)
            .await?
            .ok_or_else(|| ExitError::Other(format!("mission {} not found", self.id)))?;
        print_mission(&mission, self.format)
    }
}

#[derive(Debug, Args)]
pub struct EventsArgs {
    /// Mission ID
    pub id: MissionId,
    /// Output format
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

impl EventsArgs {
    pub async fn execute(&self, config: &Config) -> anyhow::Result<()> {
        let store = open_store(config).await?;
        if store.load(self.id).await?.is_none() {
            return Err(ExitError::Other(format!("mission {} not found", self.id)).into());
        }
        let events = store.events(self.id).await?;
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&events)?),
            OutputFormat::Text => {
                for event in &events {
                    println!("{}", event_line(event));
                }
            }
        }
        Ok(())
    }
}

fn event_line(event: &Event) -> String {
    let kind = match &event.evidence {
        None => "",
        Some(Evidence::Transition { .. }) => "transition",
        Some(Evidence::Plan { .. }) => "plan",
        Some(Evidence::PolicyRejection { .. }) => "policy",
        Some(Evidence::Execution { .. }) => "execution",
        Some(Evidence::HealRequest { .. }) => "heal",
        Some(Evidence::Deployment { .. }) => "deploy",
        Some(Evidence::Publication { .. }) => "publish",
        Some(Evidence::Skipped { .. }) => "skipped",
        Some(Evidence::Failure { .. }) => "failure",
    };
    format!(
        "{:>4}  {}  {:<12} {:<10} {}",
        event.seq,
        event.at.format("%Y-%m-%d %H:%M:%S%.3f"),
        event.phase,
        kind,
        event.detail
    )
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Maximum number of missions to show
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
    /// Output format
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

impl ListArgs {
    pub async fn execute(&self, config: &Config) -> anyhow::Result<()> {
        let store = open_store(config).await?;
        let missions = store.list(self.limit).await?;
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&missions)?),
            OutputFormat::Text => {
                if missions.is_empty() {
                    println!("no missions");
                }
                for mission in &missions {
                    let intent: String = mission.intent.chars().take(60).collect();
                    println!(
                        "{}  {:<12} {}  {}",
                        mission.id,
                        mission.status,
                        mission.submitted_at.format("%Y-%m-%d %H:%M"),
                        intent
                    );
                }
            }
        }
        Ok(())
    }
}
