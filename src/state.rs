//! Mission state machine.
//!
//! ```text
//! PENDING -> ARCHITECTING -> VALIDATING -> EXECUTING -> HEALING -> VALIDATING ...
//!                                                    \-> PUBLISHING -> SUCCEEDED
//! any non-terminal state -> FAILED
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{FailureReason, MissionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionStatus {
    #[default]
    Pending,
    Architecting,
    Validating,
    Executing,
    Healing,
    Publishing,
    Succeeded,
    Failed,
}

impl MissionStatus {
    pub const fn allowed_transitions(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Architecting, Self::Failed],
            Self::Architecting => &[Self::Validating, Self::Failed],
            // Policy rejection is terminal: there is no edge to Healing here.
            Self::Validating => &[Self::Executing, Self::Failed],
            Self::Executing => &[Self::Healing, Self::Publishing, Self::Failed],
            Self::Healing => &[Self::Validating, Self::Failed],
            Self::Publishing => &[Self::Succeeded, Self::Failed],
            Self::Succeeded | Self::Failed => &[],
        }
    }

    pub fn can_transition_to(self, target: Self) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Architecting => "ARCHITECTING",
            Self::Validating => "VALIDATING",
            Self::Executing => "EXECUTING",
            Self::Healing => "HEALING",
            Self::Publishing => "PUBLISHING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A status change as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub mission_id: MissionId,
    /// Evidence sequence number of the event that recorded this change.
    pub seq: u64,
    pub from: MissionStatus,
    pub to: MissionStatus,
    pub at: DateTime<Utc>,
    pub attempt: u32,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}
