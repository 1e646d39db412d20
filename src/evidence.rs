//! Append-only evidence log per mission.
//!
//! Events are numbered from 1 in insertion order and never rewritten. Every
//! event is also handed to the persistent store; a store failure is logged
//! and does not lose the in-memory record. Events the store refused are
//! offered again, in order, with the mission's next event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{BuildPlan, ExecutionResult, Failure, FailureReason, MissionId};
use crate::state::MissionStatus;
use crate::store::MissionStore;

/// Structured artifact attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    Transition {
        from: MissionStatus,
        to: MissionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<FailureReason>,
    },
    Plan {
        attempt: u32,
        digest: String,
        plan: BuildPlan,
    },
    PolicyRejection {
        rule: String,
        reasons: Vec<String>,
    },
    Execution {
        attempt: u32,
        result: ExecutionResult,
    },
    HealRequest {
        attempt: u32,
        fingerprint: String,
    },
    Deployment {
        url: String,
    },
    Publication {
        reference: String,
    },
    Skipped {
        step: String,
        reason: String,
    },
    Failure {
        failure: Failure,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub at: DateTime<Utc>,
    /// Mission status the event belongs to.
    pub phase: MissionStatus,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
}

#[derive(Debug, Default)]
struct Log {
    events: Vec<Event>,
    /// Highest sequence the store has accepted.
    persisted: u64,
}

pub struct EvidenceRecorder {
    logs: Mutex<HashMap<MissionId, Log>>,
    store: Arc<dyn MissionStore>,
}

impl std::fmt::Debug for EvidenceRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidenceRecorder").finish_non_exhaustive()
    }
}

impl EvidenceRecorder {
    pub fn new(store: Arc<dyn MissionStore>) -> Self {
        Self {
            logs: Mutex::default(),
            store,
        }
    }

    pub async fn record(
        &self,
        mission_id: MissionId,
        at: DateTime<Utc>,
        phase: MissionStatus,
        detail: impl Into<String>,
        evidence: Option<Evidence>,
    ) -> Event {
        let (event, unpersisted) = {
            let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
            let log = logs.entry(mission_id).or_default();
            let seq = log.events.last().map_or(1, |last| last.seq + 1);
            let event = Event {
                seq,
                at,
                phase,
                detail: detail.into(),
                evidence,
            };
            log.events.push(event.clone());
            let unpersisted: Vec<Event> = log
                .events
                .iter()
                .filter(|e| e.seq > log.persisted)
                .cloned()
                .collect();
            (event, unpersisted)
        };

        if unpersisted.len() > 1 {
            tracing::debug!(mission = %mission_id, pending = unpersisted.len() - 1, "retrying unpersisted evidence");
        }
        for pending in &unpersisted {
            if let Err(e) = self.store.append_event(mission_id, pending).await {
                tracing::warn!(mission = %mission_id, seq = pending.seq, error = %e, "evidence not persisted");
                break;
            }
            self.mark_persisted(mission_id, pending.seq);
        }
        event
    }

    fn mark_persisted(&self, mission_id: MissionId, seq: u64) {
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(log) = logs.get_mut(&mission_id) {
            log.persisted = log.persisted.max(seq);
        }
    }

    /// Ordered events for a mission. Falls back to the store for missions
    /// recorded by an earlier process.
    pub async fn events_for(&self, mission_id: MissionId) -> Vec<Event> {
        let cached = self
            .logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&mission_id)
            .map(|log| log.events.clone());
        if let Some(events) = cached {
            return events;
        }
        match self.store.events(mission_id).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(mission = %mission_id, error = %e, "could not read stored evidence");
                Vec::new()
            }
        }
    }
}
