//! Crate-level error types for classification, application, and storage.

use std::path::PathBuf;

use crate::record::IllegalTransition;

/// A permanent refusal to apply an event.
///
/// Rejections are resolved locally into a
/// [`SubmitOutcome::Rejected`](crate::SubmitOutcome::Rejected) and are never
/// worth retrying with the same payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// The event name is not part of the recognized vocabulary.
    #[error("unknown event kind `{0}`")]
    UnknownEventKind(String),

    /// The payload is missing its id, has a mistyped field, or contradicts
    /// an immutable or implied field.
    #[error("invalid event payload: {0}")]
    Validation(String),

    /// Exchange lifecycle violation.
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    /// The event is older than the stored record. Only produced under
    /// [`OrderingPolicy::RejectStale`](crate::OrderingPolicy::RejectStale).
    #[error("stale event: stored when={stored}, event when={incoming}")]
    StaleEvent {
        /// `when` of the stored record.
        stored: u64,
        /// `when` carried by the rejected event.
        incoming: u64,
    },
}

/// Failure of the underlying projection store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be converted to or from its stored form.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A stored row exists but does not parse.
    #[error("corrupt row at {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A thread panicked while holding the in-memory table lock.
    #[error("store lock poisoned")]
    Poisoned,
}

/// Error returned by the merge-upsert engine for a single key.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The update was refused; nothing was written.
    #[error(transparent)]
    Rejected(#[from] Rejection),

    /// The store could not complete the read or the write.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    /// The actor owning the key exited and could not be respawned.
    #[error("record actor is no longer running")]
    ActorGone,
}

/// Hard failure surfaced by [`Projector::submit`](crate::Projector::submit).
///
/// Expected rejections never appear here; they are reported through
/// [`SubmitOutcome`](crate::SubmitOutcome). Both variants are safe to retry
/// with the same payload.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The store could not complete the read or the write.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    /// The actor owning the key exited and could not be respawned.
    #[error("record actor is no longer running")]
    ActorGone,
}
