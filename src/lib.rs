//! Marketplace projector: folds on-chain service and exchange events into
//! queryable current-state records.
//!
//! Events arrive as [`EventEnvelope`]s, are classified into a table, key and
//! typed update, and are merged into the stored row by a per-key actor. The
//! exchange lifecycle is enforced by [`next_state`].
//!
//! ```
//! use bionet_projector::{MemoryStore, Projector};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let projector = Projector::new(MemoryStore::new());
//!
//! let outcome = projector
//!     .submit_event("ServiceCreated", json!({"id": 11, "owner": "bob", "when": 1234}))
//!     .await
//!     .unwrap();
//! assert!(outcome.is_applied());
//!
//! let services = projector.list_services().await.unwrap();
//! assert_eq!(services[0].owner.as_deref(), Some("bob"));
//! # }
//! ```

mod actor;
mod config;
mod envelope;
mod error;
mod event;
mod record;
mod storage;
mod store;

pub use config::{OrderingPolicy, ProjectorConfig};
pub use envelope::EventEnvelope;
pub use error::{ApplyError, Rejection, StoreError, SubmitError};
pub use event::{ClassifiedEvent, EntityKind, EventKind, classify};
pub use record::{
    ExchangePatch, ExchangeRecord, ExchangeState, ExchangeTransition, ExchangeUpdate,
    IllegalTransition, Record, ServicePatch, ServiceRecord, next_state,
};
pub use storage::{FileStore, MemoryStore, ProjectionStore};
pub use store::{Projector, ProjectorBuilder, SubmitOutcome};
