use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome};
use crate::config::AppConfig;
use crate::domain::delegation::{DelegationId, DelegationPhase, DelegationRecord};
use crate::errors::WorkflowError;
use crate::notify::{NotificationEvent, NotificationKind};

pub const DEFAULT_EXPIRY_WARNING_HOURS: i64 = 24;

/// Who actually acts for a nominal approver at a point in time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorResolution {
    pub acting_id: String,
    /// The nominal approver, set only when a delegate is acting.
    pub delegated_from: Option<String>,
    pub record_id: Option<DelegationId>,
    /// Losing records when several delegations overlapped.
    pub ambiguous: Vec<DelegationId>,
}

impl ActorResolution {
    fn direct(nominal_id: &str) -> Self {
        Self {
            acting_id: nominal_id.to_string(),
            delegated_from: None,
            record_id: None,
            ambiguous: Vec::new(),
        }
    }

    pub fn is_delegated(&self) -> bool {
        self.delegated_from.is_some()
    }

    pub fn is_ambiguous(&self) -> bool {
        !self.ambiguous.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolutionReport {
    pub resolution: ActorResolution,
    pub notifications: Vec<NotificationEvent>,
}

/// Holds delegation records and resolves nominal approvers to acting ids.
///
/// Boundary notifications are observed lazily: a record only reports activation,
/// expiry warning or expiry when a resolution consults it.
#[derive(Clone, Debug)]
pub struct DelegationResolver {
    records: Vec<DelegationRecord>,
    observed: HashMap<DelegationId, DelegationPhase>,
    expiry_warning: Duration,
}

impl Default for DelegationResolver {
    fn default() -> Self {
        Self::new(Duration::hours(DEFAULT_EXPIRY_WARNING_HOURS))
    }
}

impl DelegationResolver {
    pub fn new(expiry_warning: Duration) -> Self {
        Self { records: Vec::new(), observed: HashMap::new(), expiry_warning }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(Duration::hours(i64::from(config.delegation.expiry_warning_hours)))
    }

    pub fn with_records(mut self, records: impl IntoIterator<Item = DelegationRecord>) -> Self {
        self.records.extend(records);
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        id: DelegationId,
        delegator_id: &str,
        delegate_id: &str,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        categories: impl IntoIterator<Item = String>,
        now: DateTime<Utc>,
    ) -> Result<DelegationRecord, WorkflowError> {
        if self.records.iter().any(|record| record.id == id) {
            return Err(WorkflowError::InvalidDelegation(format!(
                "delegation `{id}` already exists"
            )));
        }
        let record = DelegationRecord::new(
            id,
            delegator_id,
            delegate_id,
            start_date,
            end_date,
            categories,
            now,
        )?;
        self.records.push(record.clone());
        Ok(record)
    }

    /// Adds an already-persisted record.
    pub fn insert(&mut self, record: DelegationRecord) {
        self.records.retain(|existing| existing.id != record.id);
        self.records.push(record);
    }

    /// Deactivates a record. Records are never removed.
    pub fn revoke(
        &mut self,
        id: &DelegationId,
        now: DateTime<Utc>,
    ) -> Result<DelegationRecord, WorkflowError> {
        let record = self
            .records
            .iter_mut()
            .find(|record| &record.id == id)
            .ok_or_else(|| WorkflowError::InvalidDelegation(format!("unknown delegation `{id}`")))?;
        if !record.active {
            return Err(WorkflowError::InvalidDelegation(format!(
                "delegation `{id}` is already revoked"
            )));
        }
        record.revoke(now);
        Ok(record.clone())
    }

    pub fn records(&self) -> &[DelegationRecord] {
        &self.records
    }

    pub fn active_at(&self, now: DateTime<Utc>) -> Vec<&DelegationRecord> {
        self.records.iter().filter(|record| record.is_effective_at(now)).collect()
    }

    /// Pure resolution. Only delegations granted by `nominal_id` itself are consulted,
    /// so a delegate's own delegations never chain.
    pub fn resolve(&self, nominal_id: &str, category: &str, now: DateTime<Utc>) -> ActorResolution {
        let mut matches: Vec<&DelegationRecord> = self
            .records
            .iter()
            .filter(|record| {
                record.delegator_id == nominal_id
                    && record.is_effective_at(now)
                    && record.covers_category(category)
            })
            .collect();

        if matches.is_empty() {
            return ActorResolution::direct(nominal_id);
        }

        // Most recently created wins; id breaks exact timestamp ties.
        matches.sort_by(|left, right| {
            right.created_at.cmp(&left.created_at).then_with(|| right.id.cmp(&left.id))
        });
        let winner = matches[0];
        let ambiguous: Vec<DelegationId> =
            matches[1..].iter().map(|record| record.id.clone()).collect();

        if !ambiguous.is_empty() {
            warn!(
                event_name = "delegation.ambiguous",
                delegator_id = nominal_id,
                category,
                chosen = %winner.id,
                overlapping = ambiguous.len(),
                "overlapping delegations for the same delegator and category"
            );
        }

        ActorResolution {
            acting_id: winner.delegate_id.clone(),
            delegated_from: Some(nominal_id.to_string()),
            record_id: Some(winner.id.clone()),
            ambiguous,
        }
    }

    /// Records the phase of every delegation `nominal_id` holds for `category` and
    /// returns the boundary notifications crossed since the last observation.
    pub fn observe(
        &mut self,
        nominal_id: &str,
        category: &str,
        now: DateTime<Utc>,
    ) -> Vec<NotificationEvent> {
        let mut notifications = Vec::new();
        for record in self
            .records
            .iter()
            .filter(|record| record.delegator_id == nominal_id && record.covers_category(category))
        {
            let phase = record.phase_at(now, self.expiry_warning);
            let previous = self.observed.insert(record.id.clone(), phase);
            let was_effective = previous.is_some_and(|phase| phase.is_effective());

            if phase.is_effective() && !was_effective {
                notifications.push(boundary_event(
                    NotificationKind::DelegationActivated,
                    &record.delegate_id,
                    record,
                ));
            }
            if phase == DelegationPhase::Expiring && previous != Some(DelegationPhase::Expiring) {
                notifications.push(boundary_event(
                    NotificationKind::DelegationExpiring,
                    &record.delegator_id,
                    record,
                ));
            }
            if phase == DelegationPhase::Expired && was_effective {
                notifications.push(boundary_event(
                    NotificationKind::DelegationExpired,
                    &record.delegator_id,
                    record,
                ));
            }
        }

        if !notifications.is_empty() {
            debug!(
                event_name = "delegation.boundaries_observed",
                delegator_id = nominal_id,
                count = notifications.len(),
                "delegation boundary crossings observed during resolution"
            );
        }
        notifications
    }

    pub fn resolve_actor(
        &mut self,
        nominal_id: &str,
        category: &str,
        now: DateTime<Utc>,
    ) -> ResolutionReport {
        let resolution = self.resolve(nominal_id, category, now);
        let notifications = self.observe(nominal_id, category, now);
        ResolutionReport { resolution, notifications }
    }
}

/// Audit entry for a change to a delegation record, chained on the record id.
pub fn delegation_event(
    context: &AuditContext,
    record: &DelegationRecord,
    event_type: &str,
    now: DateTime<Utc>,
) -> AuditEvent {
    let mut event = context
        .event(event_type, AuditCategory::Delegation, AuditOutcome::Success)
        .at(now)
        .with_subject(record.id.as_str())
        .with_metadata("delegation_id", record.id.as_str())
        .with_metadata("delegator_id", record.delegator_id.as_str())
        .with_metadata("delegate_id", record.delegate_id.as_str())
        .with_metadata("start_date", record.start_date.to_rfc3339())
        .with_metadata("end_date", record.end_date.to_rfc3339());
    if !record.categories.is_empty() {
        let categories: Vec<&str> = record.categories.iter().map(String::as_str).collect();
        event = event.with_metadata("categories", categories.join(","));
    }
    event
}

fn boundary_event(
    kind: NotificationKind,
    recipient_id: &str,
    record: &DelegationRecord,
) -> NotificationEvent {
    NotificationEvent::new(kind, recipient_id)
        .with("delegation_id", record.id.as_str())
        .with("delegator_id", record.delegator_id.as_str())
        .with("delegate_id", record.delegate_id.as_str())
        .with("end_date", record.end_date.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::DelegationResolver;
    use crate::config::AppConfig;
    use crate::domain::delegation::DelegationId;
    use crate::errors::WorkflowError;
    use crate::notify::NotificationKind;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, day, hour, 0, 0).single().expect("valid timestamp")
    }

    fn resolver_with(categories: Vec<&str>) -> DelegationResolver {
        let mut resolver = DelegationResolver::new(Duration::hours(24));
        resolver
            .create(
                DelegationId::new("del-1"),
                "u-manager",
                "u-deputy",
                at(1, 0),
                at(10, 0),
                categories.into_iter().map(str::to_string),
                at(1, 0),
            )
            .expect("valid delegation");
        resolver
    }

    #[test]
    fn configured_expiry_warning_widens_the_warning_window() {
        let mut config = AppConfig::default();
        config.delegation.expiry_warning_hours = 72;
        let mut resolver = DelegationResolver::from_config(&config);
        resolver
            .create(
                DelegationId::new("del-1"),
                "u-manager",
                "u-deputy",
                at(1, 0),
                at(10, 0),
                Vec::new(),
                at(1, 0),
            )
            .expect("valid delegation");

        let kinds: Vec<_> = resolver
            .observe("u-manager", "maintenance", at(7, 12))
            .into_iter()
            .map(|event| event.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![NotificationKind::DelegationActivated, NotificationKind::DelegationExpiring]
        );

        let narrow = resolver_with(Vec::new()).observe("u-manager", "maintenance", at(7, 12));
        assert!(narrow.iter().all(|event| event.kind != NotificationKind::DelegationExpiring));
    }

    #[test]
    fn no_delegation_resolves_to_nominal_approver() {
        let resolver = DelegationResolver::default();
        let resolution = resolver.resolve("u-manager", "maintenance", at(2, 0));
        assert_eq!(resolution.acting_id, "u-manager");
        assert!(!resolution.is_delegated());
    }

    #[test]
    fn active_delegation_in_scope_resolves_to_delegate() {
        let resolver = resolver_with(vec!["maintenance"]);
        let resolution = resolver.resolve("u-manager", "Maintenance", at(2, 0));
        assert_eq!(resolution.acting_id, "u-deputy");
        assert_eq!(resolution.delegated_from.as_deref(), Some("u-manager"));

        let out_of_scope = resolver.resolve("u-manager", "procurement", at(2, 0));
        assert_eq!(out_of_scope.acting_id, "u-manager");

        let outside_window = resolver.resolve("u-manager", "maintenance", at(11, 0));
        assert_eq!(outside_window.acting_id, "u-manager");
    }

    #[test]
    fn resolution_is_stable_for_fixed_inputs() {
        let mut resolver = resolver_with(vec![]);
        let first = resolver.resolve_actor("u-manager", "quality", at(3, 0));
        let second = resolver.resolve_actor("u-manager", "quality", at(3, 0));
        assert_eq!(first.resolution, second.resolution);
        assert!(second.notifications.is_empty());
    }

    #[test]
    fn overlapping_delegations_pick_most_recent_and_flag_ambiguity() {
        let mut resolver = resolver_with(vec![]);
        resolver
            .create(
                DelegationId::new("del-2"),
                "u-manager",
                "u-backup",
                at(2, 0),
                at(8, 0),
                Vec::new(),
                at(1, 12),
            )
            .expect("valid delegation");

        let resolution = resolver.resolve("u-manager", "safety", at(3, 0));
        assert_eq!(resolution.acting_id, "u-backup");
        assert_eq!(resolution.ambiguous, vec![DelegationId::new("del-1")]);
    }

    #[test]
    fn delegation_is_not_transitive() {
        let mut resolver = resolver_with(vec![]);
        resolver
            .create(
                DelegationId::new("del-2"),
                "u-deputy",
                "u-intern",
                at(1, 0),
                at(10, 0),
                Vec::new(),
                at(1, 0),
            )
            .expect("valid delegation");

        assert_eq!(resolver.resolve("u-manager", "safety", at(3, 0)).acting_id, "u-deputy");
    }

    #[test]
    fn revoked_delegation_stops_resolving_but_is_kept() {
        let mut resolver = resolver_with(vec![]);
        let revoked = resolver.revoke(&DelegationId::new("del-1"), at(3, 0)).expect("revoke");
        assert!(!revoked.active);
        assert_eq!(resolver.records().len(), 1);
        assert_eq!(resolver.resolve("u-manager", "safety", at(4, 0)).acting_id, "u-manager");
        assert!(matches!(
            resolver.revoke(&DelegationId::new("del-1"), at(4, 0)),
            Err(WorkflowError::InvalidDelegation(_))
        ));
    }

    #[test]
    fn boundary_crossings_emit_notifications_once() {
        let mut resolver = resolver_with(vec![]);

        let upcoming = resolver.resolve_actor("u-manager", "safety", at(1, 0) - Duration::hours(1));
        assert!(upcoming.notifications.is_empty());

        let activated = resolver.resolve_actor("u-manager", "safety", at(2, 0));
        let kinds: Vec<_> = activated.notifications.iter().map(|event| event.kind).collect();
        assert_eq!(kinds, vec![NotificationKind::DelegationActivated]);
        assert_eq!(activated.notifications[0].recipient_id, "u-deputy");

        let expiring = resolver.resolve_actor("u-manager", "safety", at(9, 12));
        let kinds: Vec<_> = expiring.notifications.iter().map(|event| event.kind).collect();
        assert_eq!(kinds, vec![NotificationKind::DelegationExpiring]);
        assert_eq!(expiring.notifications[0].recipient_id, "u-manager");

        assert!(resolver.resolve_actor("u-manager", "safety", at(9, 18)).notifications.is_empty());

        let expired = resolver.resolve_actor("u-manager", "safety", at(11, 0));
        let kinds: Vec<_> = expired.notifications.iter().map(|event| event.kind).collect();
        assert_eq!(kinds, vec![NotificationKind::DelegationExpired]);
        assert_eq!(expired.resolution.acting_id, "u-manager");
    }

    #[test]
    fn active_at_lists_only_effective_records() {
        let mut resolver = resolver_with(vec![]);
        resolver
            .create(
                DelegationId::new("del-2"),
                "u-director",
                "u-vp",
                at(20, 0),
                at(25, 0),
                Vec::new(),
                at(1, 0),
            )
            .expect("valid delegation");

        let active = resolver.active_at(at(5, 0));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, DelegationId::new("del-1"));
    }
}
