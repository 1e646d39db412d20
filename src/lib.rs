//! Sortie - mission orchestration engine
//!
//! A mission turns an intent into a verified build: a collaborator drafts a
//! plan, the policy gate vets it, a disposable sandbox runs its verify
//! command, failures are healed within a fixed budget and only a green run
//! is handed to deploy and publish.

pub mod collaborators;
pub mod commands;
pub mod config;
pub mod error;
pub mod evidence;
pub mod heal;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod profiles;
pub mod sandbox;
pub mod state;
pub mod store;
pub mod subprocess;
pub mod telemetry;
pub mod template;
