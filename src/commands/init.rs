use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use crate::config::{self, Config};
use crate::error::ExitError;

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Directory to write sortie.toml into
    #[arg(long)]
    pub dir: Option<PathBuf>,
    /// Overwrite an existing config
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let dir = match &self.dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("could not determine current directory")?,
        };
        let path = dir.join(config::CONFIG_TOML);
        if path.exists() && !self.force {
            return Err(ExitError::Config(format!(
                "{} already exists (use --force to overwrite)",
                path.display()
            ))
            .into());
        }

        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let toml = Config::default().to_toml()?;
        std::fs::write(&path, toml).with_context(|| format!("writing {}", path.display()))?;
        println!("wrote {}", path.display());
        println!("set collaborators.generator before running a mission");
        Ok(())
    }
}
