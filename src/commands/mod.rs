pub mod doctor;
pub mod init;
pub mod missions;
pub mod run;
pub mod schema;
pub mod validate;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use crate::collaborators::{CommandDeployTarget, CommandGenerator, CommandPublishTarget};
use crate::config::Config;
use crate::model::Mission;
use crate::orchestrator::Orchestrator;
use crate::store::FileStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Config from `--config`, else `sortie.toml`/`sortie.json` in the working
/// directory, else defaults.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let cwd = std::env::current_dir().context("could not determine current directory")?;
    Config::discover(explicit, &cwd)
}

pub async fn open_store(config: &Config) -> anyhow::Result<FileStore> {
    let dir = config.store.resolve_dir();
    FileStore::open(&dir)
        .await
        .with_context(|| format!("opening mission store at {}", dir.display()))
}

/// An orchestrator wired to the command collaborators and the file store.
pub async fn build_engine(config: &Config) -> anyhow::Result<Orchestrator> {
    let generator = Arc::new(CommandGenerator::new(&config.collaborators.generator)?);
    let store = Arc::new(open_store(config).await?);

    let mut builder = Orchestrator::builder(config)
        .collaborator(generator)
        .store(store);
    if let Some(command) = &config.collaborators.deploy {
        builder = builder.deploy(Arc::new(CommandDeployTarget::new(command)));
    }
    if let Some(command) = &config.collaborators.publish {
        builder = builder.publish(Arc::new(CommandPublishTarget::new(command)));
    }
    Ok(builder.build()?)
}

pub fn print_mission(mission: &Mission, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(mission)?),
        OutputFormat::Text => {
            println!("mission   {}", mission.id);
            println!("status    {}", mission.status);
            println!("intent    {}", mission.intent);
            println!("attempt   {} of {}", mission.attempt + 1, mission.max_attempts);
            if let Some(plan) = &mission.plan {
                println!("plan      {} ({}, {} files)", plan.name, plan.target_kind, plan.files.len());
            }
            println!("submitted {}", mission.submitted_at.to_rfc3339());
            println!("deadline  {}", mission.deadline.to_rfc3339());
            if let Some(previous) = mission.retry_of {
                println!("retry of  {previous}");
            }
            if let Some(result) = &mission.result {
                if let Some(url) = &result.url {
                    println!("url       {url}");
                }
                if let Some(reference) = &result.reference {
                    println!("reference {reference}");
                }
            }
            if let Some(failure) = &mission.failure {
                println!("failure   {}: {}", failure.reason, failure.message);
                for detail in &failure.details {
                    println!("          - {detail}");
                }
            }
        }
    }
    Ok(())
}
