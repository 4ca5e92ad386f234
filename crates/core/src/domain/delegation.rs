use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{normalize_key, string_id};
use crate::errors::WorkflowError;

string_id!(DelegationId);

/// Where a delegation sits relative to its window at a given instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationPhase {
    Upcoming,
    Active,
    Expiring,
    Expired,
    Revoked,
}

impl DelegationPhase {
    pub fn is_effective(&self) -> bool {
        matches!(self, Self::Active | Self::Expiring)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub id: DelegationId,
    pub delegator_id: String,
    pub delegate_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Empty means every category.
    pub categories: BTreeSet<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl DelegationRecord {
    pub fn new(
        id: DelegationId,
        delegator_id: impl Into<String>,
        delegate_id: impl Into<String>,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        categories: impl IntoIterator<Item = String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, WorkflowError> {
        let delegator_id = delegator_id.into();
        let delegate_id = delegate_id.into();

        if delegator_id.trim().is_empty() || delegate_id.trim().is_empty() {
            return Err(WorkflowError::InvalidDelegation(
                "delegator and delegate ids are required".to_string(),
            ));
        }
        if normalize_key(&delegator_id) == normalize_key(&delegate_id) {
            return Err(WorkflowError::InvalidDelegation(format!(
                "`{delegator_id}` cannot delegate to themselves"
            )));
        }
        if start_date > end_date {
            return Err(WorkflowError::InvalidDelegation(format!(
                "delegation window starts {start_date} after it ends {end_date}"
            )));
        }

        Ok(Self {
            id,
            delegator_id,
            delegate_id,
            start_date,
            end_date,
            categories: categories
                .into_iter()
                .map(|category| normalize_key(&category))
                .filter(|category| !category.is_empty())
                .collect(),
            active: true,
            created_at,
            revoked_at: None,
        })
    }

    pub fn covers_category(&self, category: &str) -> bool {
        self.categories.is_empty() || self.categories.contains(&normalize_key(category))
    }

    /// Active, not revoked, and `start_date <= now <= end_date`.
    pub fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        self.active && self.start_date <= now && now <= self.end_date
    }

    pub fn phase_at(&self, now: DateTime<Utc>, expiry_warning: Duration) -> DelegationPhase {
        if !self.active {
            DelegationPhase::Revoked
        } else if now < self.start_date {
            DelegationPhase::Upcoming
        } else if now > self.end_date {
            DelegationPhase::Expired
        } else if self.end_date - now <= expiry_warning {
            DelegationPhase::Expiring
        } else {
            DelegationPhase::Active
        }
    }

    pub fn revoke(&mut self, now: DateTime<Utc>) {
        self.active = false;
        self.revoked_at = Some(now);
    }
}
