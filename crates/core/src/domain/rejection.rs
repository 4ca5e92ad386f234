use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::instance::InstanceStatus;
use crate::domain::string_id;

string_id!(RejectionId);

/// Where a rejection sends the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionDestination {
    Tier { tier_level: u32 },
    Requestor,
}

/// Immutable record of one rejection. Exactly one of `returned_to_tier` and
/// `returned_to_requestor` is set; use [`RejectionHistoryEntry::new`] to keep it that way.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionHistoryEntry {
    pub id: RejectionId,
    pub tier_level: u32,
    pub rejected_by: String,
    pub delegated_from: Option<String>,
    pub rejected_at: DateTime<Utc>,
    pub reason: String,
    pub previous_status: InstanceStatus,
    pub step_name: Option<String>,
    pub returned_to_tier: Option<u32>,
    pub returned_to_requestor: bool,
}

impl RejectionHistoryEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: RejectionId,
        tier_level: u32,
        rejected_by: impl Into<String>,
        delegated_from: Option<String>,
        rejected_at: DateTime<Utc>,
        reason: impl Into<String>,
        previous_status: InstanceStatus,
        step_name: Option<String>,
        destination: RejectionDestination,
    ) -> Self {
        let (returned_to_tier, returned_to_requestor) = match destination {
            RejectionDestination::Tier { tier_level } => (Some(tier_level), false),
            RejectionDestination::Requestor => (None, true),
        };

        Self {
            id,
            tier_level,
            rejected_by: rejected_by.into(),
            delegated_from,
            rejected_at,
            reason: reason.into(),
            previous_status,
            step_name,
            returned_to_tier,
            returned_to_requestor,
        }
    }

    pub fn destination(&self) -> RejectionDestination {
        match self.returned_to_tier {
            Some(tier_level) if !self.returned_to_requestor => {
                RejectionDestination::Tier { tier_level }
            }
            _ => RejectionDestination::Requestor,
        }
    }
}
