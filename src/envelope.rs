//! Wire shape of an incoming event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An event as delivered by the upstream producer.
///
/// `data` is a partial record: only the fields the event changed, keyed by
/// their camelCase names. Extra fields are ignored during classification.
///
/// # Examples
///
/// ```
/// use bionet_projector::EventEnvelope;
/// use serde_json::json;
///
/// let envelope: EventEnvelope = serde_json::from_value(json!({
///     "event": "Funded",
///     "data": { "id": 1, "price": 30, "when": 1236 }
/// }))
/// .unwrap();
///
/// assert_eq!(envelope.event, "Funded");
/// assert_eq!(envelope.data["price"], 30);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Symbolic event name, e.g. `"ServiceCreated"` or `"Funded"`.
    pub event: String,
    /// Partial record payload.
    #[serde(default)]
    pub data: Value,
}

impl EventEnvelope {
    /// Build an envelope from an event name and payload.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}
