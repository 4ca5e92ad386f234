use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::instance::InstanceId;

const GLOBAL_CHAIN: &str = "global";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Approval,
    Rejection,
    Delegation,
    Escalation,
    Dispatch,
    Lifecycle,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approval => "approval",
            Self::Rejection => "rejection",
            Self::Delegation => "delegation",
            Self::Escalation => "escalation",
            Self::Dispatch => "dispatch",
            Self::Lifecycle => "lifecycle",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approval" => Some(Self::Approval),
            "rejection" => Some(Self::Rejection),
            "delegation" => Some(Self::Delegation),
            "escalation" => Some(Self::Escalation),
            "dispatch" => Some(Self::Dispatch),
            "lifecycle" => Some(Self::Lifecycle),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    /// Accepted but changed nothing, e.g. a repeated approval.
    NoOp,
    /// Applied, with a data problem worth surfacing (overlapping delegations).
    Warning,
    Rejected,
    Failed,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NoOp => "no_op",
            Self::Warning => "warning",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "no_op" => Some(Self::NoOp),
            "warning" => Some(Self::Warning),
            "rejected" => Some(Self::Rejected),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    pub instance_id: Option<InstanceId>,
    pub correlation_id: String,
    pub actor: String,
}

impl AuditContext {
    pub fn new(
        instance_id: Option<InstanceId>,
        correlation_id: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self { instance_id, correlation_id: correlation_id.into(), actor: actor.into() }
    }

    pub fn event(
        &self,
        event_type: impl Into<String>,
        category: AuditCategory,
        outcome: AuditOutcome,
    ) -> AuditEvent {
        AuditEvent::new(
            self.instance_id.clone(),
            self.correlation_id.clone(),
            event_type,
            category,
            self.actor.clone(),
            outcome,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub instance_id: Option<InstanceId>,
    /// Chain key for events with no instance (delegation records, dispatches).
    pub subject_id: Option<String>,
    pub correlation_id: String,
    pub event_type: String,
    pub category: AuditCategory,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub prev_hash: Option<String>,
    #[serde(default)]
    pub entry_hash: Option<String>,
}

impl AuditEvent {
    pub fn new(
        instance_id: Option<InstanceId>,
        correlation_id: impl Into<String>,
        event_type: impl Into<String>,
        category: AuditCategory,
        actor: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            instance_id,
            subject_id: None,
            correlation_id: correlation_id.into(),
            event_type: event_type.into(),
            category,
            actor: actor.into(),
            outcome,
            metadata: BTreeMap::new(),
            occurred_at: Utc::now(),
            sequence: 0,
            prev_hash: None,
            entry_hash: None,
        }
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn chain_key(&self) -> &str {
        match (&self.instance_id, &self.subject_id) {
            (Some(instance_id), _) => instance_id.as_str(),
            (None, Some(subject_id)) => subject_id.as_str(),
            (None, None) => GLOBAL_CHAIN,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.entry_hash.is_some()
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Links `event` to the tail of its chain: assigns the next sequence number, the
/// previous entry hash and its own entry hash.
pub fn seal(mut event: AuditEvent, previous: Option<&AuditEvent>) -> AuditEvent {
    event.sequence = previous.map(|entry| entry.sequence + 1).unwrap_or(1);
    event.prev_hash = previous.and_then(|entry| entry.entry_hash.clone());
    event.entry_hash = Some(hash_event(&event));
    event
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub chain_key: String,
    pub valid: bool,
    pub verified_entries: usize,
    pub latest_hash: Option<String>,
    pub failure_reason: Option<String>,
}

/// Recomputes every link of a chain in sequence order.
pub fn verify_events(chain_key: &str, events: &[AuditEvent]) -> ChainVerification {
    let failure = |index: usize, latest_hash: Option<String>, reason: String| ChainVerification {
        chain_key: chain_key.to_string(),
        valid: false,
        verified_entries: index,
        latest_hash,
        failure_reason: Some(reason),
    };

    if events.is_empty() {
        return failure(0, None, "no audit entries recorded for chain".to_string());
    }

    let mut previous_hash: Option<String> = None;
    for (index, event) in events.iter().enumerate() {
        let expected_sequence = index as u64 + 1;
        if event.sequence != expected_sequence {
            return failure(
                index,
                previous_hash,
                format!(
                    "sequence gap at event {}: expected {expected_sequence}, found {}",
                    event.event_id, event.sequence
                ),
            );
        }
        if event.prev_hash != previous_hash {
            return failure(
                index,
                previous_hash,
                format!("previous hash mismatch at event {}", event.event_id),
            );
        }
        if event.entry_hash.as_deref() != Some(hash_event(event).as_str()) {
            return failure(
                index,
                previous_hash,
                format!("entry hash mismatch at event {}", event.event_id),
            );
        }
        previous_hash = event.entry_hash.clone();
    }

    ChainVerification {
        chain_key: chain_key.to_string(),
        valid: true,
        verified_entries: events.len(),
        latest_hash: previous_hash,
        failure_reason: None,
    }
}

/// Append-only, hash-chained audit log. One chain per instance (or per subject for
/// events outside an instance).
#[derive(Clone, Default)]
pub struct AuditTrail {
    chains: Arc<Mutex<HashMap<String, Vec<AuditEvent>>>>,
}

impl AuditTrail {
    pub fn record(&self, event: AuditEvent) -> AuditEvent {
        let mut chains = match self.chains.lock() {
            Ok(chains) => chains,
            Err(poisoned) => poisoned.into_inner(),
        };
        let chain = chains.entry(event.chain_key().to_string()).or_default();
        let sealed = seal(event, chain.last());
        chain.push(sealed.clone());
        sealed
    }

    pub fn events_for(&self, chain_key: &str) -> Vec<AuditEvent> {
        match self.chains.lock() {
            Ok(chains) => chains.get(chain_key).cloned().unwrap_or_default(),
            Err(poisoned) => poisoned.into_inner().get(chain_key).cloned().unwrap_or_default(),
        }
    }

    pub fn verify_chain(&self, chain_key: &str) -> ChainVerification {
        verify_events(chain_key, &self.events_for(chain_key))
    }
}

impl AuditSink for AuditTrail {
    fn emit(&self, event: AuditEvent) {
        self.record(event);
    }
}

fn hash_event(event: &AuditEvent) -> String {
    let metadata = event
        .metadata
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(";");
    let material = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        event.event_id,
        event.chain_key(),
        event.sequence,
        event.prev_hash.as_deref().unwrap_or(""),
        event.correlation_id,
        event.event_type,
        event.category.as_str(),
        event.actor,
        event.outcome.as_str(),
        event.occurred_at.to_rfc3339(),
        metadata,
    );
    let digest = Sha256::digest(material.as_bytes());
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
