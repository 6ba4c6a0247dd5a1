//! Projector configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default idle timeout for record actors: 5 minutes.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default bound of each actor's message channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 32;

/// Default number of times a caller respawns an actor that closed under it.
pub const DEFAULT_MAX_SPAWN_ATTEMPTS: u32 = 3;

/// How to treat an event whose `when` is older than the stored record's.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingPolicy {
    /// Merge regardless of `when`: present fields overwrite, last write wins.
    #[default]
    LastWriteWins,
    /// Reject events older than the stored record with
    /// [`Rejection::StaleEvent`](crate::Rejection::StaleEvent).
    RejectStale,
}

/// Tuning knobs for a [`Projector`](crate::Projector).
///
/// All fields have defaults, so a partial JSON document is enough:
///
/// ```
/// use std::time::Duration;
/// use bionet_projector::{OrderingPolicy, ProjectorConfig};
///
/// let config: ProjectorConfig =
///     serde_json::from_str(r#"{ "idle_timeout_ms": 1000, "ordering": "reject_stale" }"#).unwrap();
///
/// assert_eq!(config.idle_timeout, Duration::from_secs(1));
/// assert_eq!(config.ordering, OrderingPolicy::RejectStale);
/// assert_eq!(config.channel_capacity, 32);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectorConfig {
    /// How long a record actor waits for a message before shutting down.
    /// The next event for that key transparently respawns it.
    ///
    /// Default: 5 minutes.
    #[serde(rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,

    /// Bound of each actor's message channel. Senders wait when it is full.
    ///
    /// Default: 32.
    pub channel_capacity: usize,

    /// Attempts to reach a live actor for one event before giving up with
    /// [`ApplyError::ActorGone`](crate::ApplyError::ActorGone).
    ///
    /// Default: 3.
    pub max_spawn_attempts: u32,

    /// Out-of-order delivery handling.
    ///
    /// Default: [`OrderingPolicy::LastWriteWins`].
    pub ordering: OrderingPolicy,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_spawn_attempts: DEFAULT_MAX_SPAWN_ATTEMPTS,
            ordering: OrderingPolicy::default(),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
