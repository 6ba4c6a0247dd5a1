//! Event classification: maps an envelope onto a table, a key, and a typed update.
//!
//! The recognized vocabulary is the closed [`EventKind`] enumeration. Names
//! are resolved once through [`FromStr`]; nothing downstream inspects the
//! raw string again.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::envelope::EventEnvelope;
use crate::error::Rejection;
use crate::record::{ExchangePatch, ExchangeTransition, ExchangeUpdate, Record, ServicePatch};
use crate::record::{ExchangeRecord, ServiceRecord};

/// The two record shapes tracked by the projector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Service,
    Exchange,
}

impl EntityKind {
    /// Table the entity kind is stored in.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Service => ServiceRecord::TABLE,
            Self::Exchange => ExchangeRecord::TABLE,
        }
    }
}

/// Every event name the projector understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServiceCreated,
    /// Also accepted under its on-chain name `ServiceUpdatedMetaUri`.
    ServiceMetadataUpdated,
    ServiceDeactivated,
    Offered,
    Funded,
    Disputed,
    Resolved,
    Refunded,
    Completed,
    Voided,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        Self::ServiceCreated,
        Self::ServiceMetadataUpdated,
        Self::ServiceDeactivated,
        Self::Offered,
        Self::Funded,
        Self::Disputed,
        Self::Resolved,
        Self::Refunded,
        Self::Completed,
        Self::Voided,
    ];

    /// Canonical event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceCreated => "ServiceCreated",
            Self::ServiceMetadataUpdated => "ServiceMetadataUpdated",
            Self::ServiceDeactivated => "ServiceDeactivated",
            Self::Offered => "Offered",
            Self::Funded => "Funded",
            Self::Disputed => "Disputed",
            Self::Resolved => "Resolved",
            Self::Refunded => "Refunded",
            Self::Completed => "Completed",
            Self::Voided => "Voided",
        }
    }

    /// Entity kind the event targets.
    pub fn entity(&self) -> EntityKind {
        match self {
            Self::ServiceCreated | Self::ServiceMetadataUpdated | Self::ServiceDeactivated => {
                EntityKind::Service
            }
            _ => EntityKind::Exchange,
        }
    }

    /// Lifecycle edge requested by an exchange event; `None` for service events.
    pub fn transition(&self) -> Option<ExchangeTransition> {
        match self {
            Self::ServiceCreated | Self::ServiceMetadataUpdated | Self::ServiceDeactivated => None,
            Self::Offered => Some(ExchangeTransition::Offer),
            Self::Funded => Some(ExchangeTransition::Fund),
            Self::Disputed => Some(ExchangeTransition::Dispute),
            Self::Resolved => Some(ExchangeTransition::Resolve),
            Self::Refunded => Some(ExchangeTransition::Refund),
            Self::Completed => Some(ExchangeTransition::Complete),
            Self::Voided => Some(ExchangeTransition::Void),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Rejection;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        if name == "ServiceUpdatedMetaUri" {
            return Ok(Self::ServiceMetadataUpdated);
        }
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| Rejection::UnknownEventKind(name.to_owned()))
    }
}

/// An event resolved to its target key and typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedEvent {
    Service {
        kind: EventKind,
        id: u64,
        patch: ServicePatch,
    },
    Exchange {
        kind: EventKind,
        id: u64,
        update: ExchangeUpdate,
    },
}

impl ClassifiedEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Service { kind, .. } | Self::Exchange { kind, .. } => *kind,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Self::Service { id, .. } | Self::Exchange { id, .. } => *id,
        }
    }

    pub fn entity(&self) -> EntityKind {
        self.kind().entity()
    }
}

/// Classify an envelope.
///
/// # Errors
///
/// * [`Rejection::UnknownEventKind`] -- the name is not in the vocabulary.
/// * [`Rejection::Validation`] -- `data` is not an object, the id is missing
///   or not an unsigned integer, a field has the wrong type, or the payload
///   contradicts what the event kind implies.
pub fn classify(envelope: &EventEnvelope) -> Result<ClassifiedEvent, Rejection> {
    let kind: EventKind = envelope.event.parse()?;
    let id = extract_id(&envelope.data)?;

    match kind.transition() {
        None => {
            let mut patch: ServicePatch = decode(&envelope.data)?;
            if kind == EventKind::ServiceDeactivated {
                if patch.active == Some(true) {
                    return Err(Rejection::Validation(
                        "ServiceDeactivated cannot set active=true".to_owned(),
                    ));
                }
                patch.active = Some(false);
            }
            Ok(ClassifiedEvent::Service { kind, id, patch })
        }
        Some(transition) => {
            let patch: ExchangePatch = decode(&envelope.data)?;
            if let Some(state) = patch.state
                && transition.target() != Some(state)
            {
                return Err(Rejection::Validation(format!(
                    "{kind} event cannot carry state {state}"
                )));
            }
            Ok(ClassifiedEvent::Exchange {
                kind,
                id,
                update: ExchangeUpdate { transition, patch },
            })
        }
    }
}

fn extract_id(data: &Value) -> Result<u64, Rejection> {
    let object = data
        .as_object()
        .ok_or_else(|| Rejection::Validation("event data must be an object".to_owned()))?;
    object
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| Rejection::Validation("missing or invalid `id`".to_owned()))
}

fn decode<T: DeserializeOwned>(data: &Value) -> Result<T, Rejection> {
    T::deserialize(data).map_err(|e| Rejection::Validation(e.to_string()))
}
