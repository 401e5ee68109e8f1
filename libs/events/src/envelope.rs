//! Event envelope - the common wrapper for all events.

use chrono::{DateTime, Utc};
use holdfast_id::{AggregateSeq, EventId};
use serde::{Deserialize, Serialize};

use crate::EventError;

/// Aggregate type for event routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    #[default]
    Volume,
    Node,
    BackupVolume,
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregateType::Volume => "volume",
            AggregateType::Node => "node",
            AggregateType::BackupVolume => "backup_volume",
        };
        write!(f, "{}", s)
    }
}

/// The event envelope - common metadata for all events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Globally monotonic event identifier.
    pub event_id: EventId,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The type of aggregate this event belongs to.
    pub aggregate_type: AggregateType,

    /// The name of the aggregate instance (volume or node name).
    pub aggregate_id: String,

    /// Monotonic sequence within the aggregate.
    pub aggregate_seq: AggregateSeq,

    /// The event type (e.g., "volume.attached", "replica.failed").
    pub event_type: String,

    /// Schema version for this event type.
    pub event_version: i32,

    /// Component that emitted the event.
    pub actor_id: String,

    /// Event-specific payload.
    pub payload: P,
}

impl<P> EventEnvelope<P> {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder<P> {
        EventEnvelopeBuilder::new()
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug)]
pub struct EventEnvelopeBuilder<P> {
    event_id: Option<EventId>,
    occurred_at: Option<DateTime<Utc>>,
    aggregate_type: Option<AggregateType>,
    aggregate_id: Option<String>,
    aggregate_seq: Option<AggregateSeq>,
    event_type: Option<String>,
    event_version: i32,
    actor_id: String,
    payload: Option<P>,
}

impl<P> EventEnvelopeBuilder<P> {
    pub fn new() -> Self {
        Self {
            event_id: None,
            occurred_at: None,
            aggregate_type: None,
            aggregate_id: None,
            aggregate_seq: None,
            event_type: None,
            event_version: 1,
            actor_id: "holdfast-manager".to_string(),
            payload: None,
        }
    }

    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn aggregate(mut self, agg_type: AggregateType, agg_id: impl Into<String>) -> Self {
        self.aggregate_type = Some(agg_type);
        self.aggregate_id = Some(agg_id.into());
        self
    }

    pub fn aggregate_seq(mut self, seq: AggregateSeq) -> Self {
        self.aggregate_seq = Some(seq);
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn event_version(mut self, version: i32) -> Self {
        self.event_version = version;
        self
    }

    pub fn actor_id(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = actor_id.into();
        self
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the event envelope, failing if a required field is unset.
    pub fn build(self) -> Result<EventEnvelope<P>, EventError> {
        Ok(EventEnvelope {
            event_id: self.event_id.ok_or(EventError::MissingField("event_id"))?,
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            aggregate_type: self
                .aggregate_type
                .ok_or(EventError::MissingField("aggregate_type"))?,
            aggregate_id: self
                .aggregate_id
                .ok_or(EventError::MissingField("aggregate_id"))?,
            aggregate_seq: self
                .aggregate_seq
                .ok_or(EventError::MissingField("aggregate_seq"))?,
            event_type: self
                .event_type
                .ok_or(EventError::MissingField("event_type"))?,
            event_version: self.event_version,
            actor_id: self.actor_id,
            payload: self.payload.ok_or(EventError::MissingField("payload"))?,
        })
    }
}

impl<P> Default for EventEnvelopeBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}
