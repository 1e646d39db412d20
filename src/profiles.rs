//! Execution profiles per target kind.
//!
//! Built once from config at startup and read-only afterwards.

use std::collections::BTreeMap;

use crate::config::ProfilesConfig;
use crate::model::TargetKind;

/// How a target kind is prepared inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProfile {
    pub kind: TargetKind,
    pub image: String,
    pub workdir: String,
    /// Environment set for every command run under this profile.
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: BTreeMap<TargetKind, TargetProfile>,
}

impl ProfileRegistry {
    pub fn from_config(config: &ProfilesConfig) -> Self {
        let profiles = TargetKind::ALL
            .into_iter()
            .map(|kind| {
                let cfg = config.get(kind);
                let profile = TargetProfile {
                    kind,
                    image: cfg.image.clone(),
                    workdir: cfg.workdir.clone(),
                    env: default_env(kind),
                };
                (kind, profile)
            })
            .collect();
        Self { profiles }
    }

    /// Every kind is populated at construction, so lookup cannot miss.
    pub fn get(&self, kind: TargetKind) -> &TargetProfile {
        &self.profiles[&kind]
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetProfile> {
        self.profiles.values()
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::from_config(&ProfilesConfig::default())
    }
}

fn default_env(kind: TargetKind) -> Vec<(String, String)> {
    let pairs: &[(&str, &str)] = match kind {
        TargetKind::Python => &[
            ("PYTHONDONTWRITEBYTECODE", "1"),
            ("PYTHONUNBUFFERED", "1"),
            ("PIP_DISABLE_PIP_VERSION_CHECK", "1"),
        ],
        TargetKind::Node => &[("NODE_ENV", "test"), ("NPM_CONFIG_UPDATE_NOTIFIER", "false")],
        TargetKind::Rust => &[("CARGO_TERM_COLOR", "never"), ("CARGO_INCREMENTAL", "0")],
    };
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}
