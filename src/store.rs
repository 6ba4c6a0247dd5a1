//! Top-level entry point: the [`Projector`] routes classified events to
//! per-key actors and serves listings straight from the store.
//!
//! The projector is opened via [`ProjectorBuilder`] with an explicitly
//! constructed [`ProjectionStore`]; nothing is process-global.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::actor::{
    ActorConfig, Delivery, ErasedHandle, RecordHandle, WriterLocks, spawn_actor, stopped,
};
use crate::config::{OrderingPolicy, ProjectorConfig};
use crate::envelope::EventEnvelope;
use crate::error::{ApplyError, Rejection, StoreError, SubmitError};
use crate::event::{ClassifiedEvent, classify};
use crate::record::{ExchangeRecord, Record, ServiceRecord};
use crate::storage::ProjectionStore;

/// Type-erased handle cache keyed by `(table, id)`.
///
/// `Box<dyn ErasedHandle>` lets a single map hold `RecordHandle<R>` for any
/// record kind. Downcasting through `as_any` recovers the typed handle.
type HandleCache = HashMap<(&'static str, u64), Box<dyn ErasedHandle>>;

/// Result of submitting one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The event was merged and written.
    Applied,
    /// The event was refused; the stored projection is unchanged.
    Rejected(Rejection),
}

impl SubmitOutcome {
    /// `true` for [`SubmitOutcome::Applied`].
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }

    /// Human-readable reason for a rejection.
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Applied => None,
            Self::Rejected(rejection) => Some(rejection.to_string()),
        }
    }
}

/// Event ingestion and projection queries over one [`ProjectionStore`].
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped. Every clone
/// shares the same actors, so the single-writer guarantee holds across
/// clones.
pub struct Projector<S: ProjectionStore> {
    store: Arc<S>,
    cache: Arc<RwLock<HandleCache>>,
    writers: Arc<WriterLocks>,
    config: ProjectorConfig,
}

impl<S: ProjectionStore> Clone for Projector<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            writers: Arc::clone(&self.writers),
            config: self.config.clone(),
        }
    }
}

// Manual `Debug` because the handle cache holds trait objects.
impl<S: ProjectionStore> std::fmt::Debug for Projector<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: ProjectionStore> Projector<S> {
    /// Open a projector over `store` with default configuration.
    pub fn new(store: S) -> Self {
        ProjectorBuilder::new().open(store)
    }

    /// Start configuring a projector.
    pub fn builder() -> ProjectorBuilder {
        ProjectorBuilder::new()
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The configuration this projector was opened with.
    pub fn config(&self) -> &ProjectorConfig {
        &self.config
    }

    /// Classify and apply one event.
    ///
    /// Unknown names, invalid payloads, illegal lifecycle transitions, and
    /// (under [`OrderingPolicy::RejectStale`]) stale events come back as
    /// [`SubmitOutcome::Rejected`] and are logged with their reason.
    ///
    /// # Errors
    ///
    /// * [`SubmitError::Storage`] -- the store failed to read or write.
    /// * [`SubmitError::ActorGone`] -- no live actor could be reached for
    ///   the key.
    ///
    /// Both are safe to retry with the same envelope.
    pub async fn submit(&self, envelope: &EventEnvelope) -> Result<SubmitOutcome, SubmitError> {
        let classified = match classify(envelope) {
            Ok(classified) => classified,
            Err(rejection) => {
                tracing::warn!(event = %envelope.event, reason = %rejection, "event rejected");
                return Ok(SubmitOutcome::Rejected(rejection));
            }
        };

        let kind = classified.kind();
        let id = classified.id();
        let result = match classified {
            ClassifiedEvent::Service { id, patch, .. } => {
                self.apply::<ServiceRecord>(id, patch).await.map(drop)
            }
            ClassifiedEvent::Exchange { id, update, .. } => {
                self.apply::<ExchangeRecord>(id, update).await.map(drop)
            }
        };

        match result {
            Ok(()) => Ok(SubmitOutcome::Applied),
            Err(ApplyError::Rejected(rejection)) => {
                tracing::warn!(event = %kind, id, reason = %rejection, "event rejected");
                Ok(SubmitOutcome::Rejected(rejection))
            }
            Err(ApplyError::Storage(e)) => {
                tracing::error!(event = %kind, id, error = %e, "storage failure applying event");
                Err(SubmitError::Storage(e))
            }
            Err(ApplyError::ActorGone) => {
                tracing::error!(event = %kind, id, "record actor unavailable");
                Err(SubmitError::ActorGone)
            }
        }
    }

    /// Convenience wrapper around [`submit`](Projector::submit).
    ///
    /// # Errors
    ///
    /// Same as [`submit`](Projector::submit).
    pub async fn submit_event(
        &self,
        event: impl Into<String>,
        data: Value,
    ) -> Result<SubmitOutcome, SubmitError> {
        self.submit(&EventEnvelope::new(event, data)).await
    }

    /// Merge `update` into row `id` of `R::TABLE` under that key's actor.
    ///
    /// # Returns
    ///
    /// The row as written.
    ///
    /// # Errors
    ///
    /// * [`ApplyError::Rejected`] -- the update was refused, nothing written.
    /// * [`ApplyError::Storage`] -- the store failed.
    /// * [`ApplyError::ActorGone`] -- the actor kept closing under us for
    ///   `max_spawn_attempts` attempts, or could not be spawned at all.
    pub async fn apply<R: Record>(&self, id: u64, update: R::Update) -> Result<R, ApplyError> {
        let mut pending = update;
        for attempt in 1..=self.config.max_spawn_attempts.max(1) {
            let handle = self.handle::<R>(id).await?;
            match handle.apply(pending).await {
                Delivery::Replied(result) => return result,
                Delivery::Closed(update) => {
                    tracing::debug!(table = R::TABLE, id, attempt, "actor closed, respawning");
                    pending = update;
                }
            }
        }
        Err(ApplyError::ActorGone)
    }

    /// Every service record, ordered by id. Empty on a fresh store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub async fn list_services(&self) -> Result<Vec<ServiceRecord>, StoreError> {
        self.list_all::<ServiceRecord>().await
    }

    /// Every exchange record, ordered by id. Empty on a fresh store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub async fn list_exchanges(&self) -> Result<Vec<ExchangeRecord>, StoreError> {
        self.list_all::<ExchangeRecord>().await
    }

    /// Number of cached actors that are still accepting requests.
    pub async fn live_actors(&self) -> usize {
        self.cache
            .read()
            .await
            .values()
            .filter(|handle| handle.is_alive())
            .count()
    }

    /// Stop every actor and wait for them to exit.
    ///
    /// Requests already accepted are still applied, and submissions still
    /// in flight on other tasks finish first. Once this returns no actor
    /// started before the call is writing, so the store can be reopened
    /// elsewhere. The projector stays usable: the next event for a key
    /// spawns a fresh actor.
    pub async fn shutdown(&self) {
        let exits: Vec<_> = {
            let mut cache = self.cache.write().await;
            cache.drain().map(|(_, handle)| handle.exit_signal()).collect()
        };
        let stopping = exits.len();
        for exit in exits {
            stopped(exit).await;
        }
        tracing::info!(stopped = stopping, "projector actors stopped");
    }

    #[cfg(test)]
    async fn cached_handles(&self) -> usize {
        self.cache.read().await.len()
    }

    async fn list_all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.list_all::<R>())
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    /// Get a handle to the actor owning `(R::TABLE, id)`, spawning it if needed.
    async fn handle<R: Record>(&self, id: u64) -> Result<RecordHandle<R>, ApplyError> {
        let key = (R::TABLE, id);

        // Fast path: check cache with read lock.
        {
            let cache = self.cache.read().await;
            if let Some(handle) = cached::<R>(&cache, key) {
                return Ok(handle);
            }
        }

        // Slow path: re-check under the write lock so two callers never
        // spawn two actors for the same key.
        let mut cache = self.cache.write().await;
        if let Some(handle) = cached::<R>(&cache, key) {
            return Ok(handle);
        }

        // Evict actors that have fully exited. A closed actor still draining
        // stays until it is replaced, so `shutdown` can wait for it.
        cache.retain(|_, handle| !handle.is_stopped());

        tracing::debug!(table = R::TABLE, id, "spawning actor");

        let handle = spawn_actor::<R, S>(
            id,
            Arc::clone(&self.store),
            &self.writers,
            self.actor_config(),
        )
        .map_err(|e| {
            tracing::error!(table = R::TABLE, id, error = %e, "failed to spawn actor");
            ApplyError::ActorGone
        })?;
        cache.insert(key, Box::new(handle.clone()));
        Ok(handle)
    }

    fn actor_config(&self) -> ActorConfig {
        ActorConfig {
            idle_timeout: self.config.idle_timeout,
            channel_capacity: self.config.channel_capacity,
            ordering: self.config.ordering,
        }
    }
}

/// A live, correctly typed handle for `key`, if the cache has one.
fn cached<R: Record>(cache: &HandleCache, key: (&'static str, u64)) -> Option<RecordHandle<R>> {
    cache
        .get(&key)
        .filter(|handle| handle.is_alive())
        .and_then(|handle| handle.as_any().downcast_ref::<RecordHandle<R>>())
        .cloned()
}

/// Builder for configuring and opening a [`Projector`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use bionet_projector::{MemoryStore, OrderingPolicy, Projector};
///
/// let projector = Projector::<MemoryStore>::builder()
///     .idle_timeout(Duration::from_secs(60))
///     .ordering(OrderingPolicy::RejectStale)
///     .open(MemoryStore::new());
///
/// assert_eq!(projector.config().idle_timeout, Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ProjectorBuilder {
    config: ProjectorConfig,
}

impl ProjectorBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration, e.g. one deserialized from a file.
    pub fn config(mut self, config: ProjectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the idle timeout after which a key's actor shuts down.
    ///
    /// Defaults to 5 minutes.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the bound of each actor's request channel.
    ///
    /// Defaults to 32.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Set how many times a caller respawns an actor that closed under it.
    ///
    /// Defaults to 3.
    pub fn max_spawn_attempts(mut self, attempts: u32) -> Self {
        self.config.max_spawn_attempts = attempts;
        self
    }

    /// Set the out-of-order delivery policy.
    ///
    /// Defaults to [`OrderingPolicy::LastWriteWins`].
    pub fn ordering(mut self, ordering: OrderingPolicy) -> Self {
        self.config.ordering = ordering;
        self
    }

    /// Build the [`Projector`] over `store`.
    ///
    /// Actors are spawned lazily, on the first event for each key.
    pub fn open<S: ProjectionStore>(self, store: S) -> Projector<S> {
        Projector {
            store: Arc::new(store),
            cache: Arc::new(RwLock::new(HashMap::new())),
            writers: Arc::new(WriterLocks::default()),
            config: self.config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ExchangeState;
    use crate::storage::testing::SlowStore;
    use crate::storage::{FileStore, MemoryStore};
    use serde_json::json;

    fn projector() -> Projector<MemoryStore> {
        Projector::new(MemoryStore::new())
    }

    async fn submit(
        projector: &Projector<impl ProjectionStore>,
        event: &str,
        data: Value,
    ) -> SubmitOutcome {
        projector
            .submit_event(event, data)
            .await
            .expect("submit should not hit a hard error")
    }

    #[tokio::test]
    async fn fresh_store_lists_nothing() {
        let projector = projector();
        assert!(projector.list_services().await.unwrap().is_empty());
        assert!(projector.list_exchanges().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn service_round_trip() {
        let projector = projector();

        let outcome = submit(
            &projector,
            "ServiceCreated",
            json!({"id": 11, "owner": "bob", "name": "X", "active": true, "when": 1234, "uri": "A"}),
        )
        .await;
        assert!(outcome.is_applied());
        assert_eq!(projector.list_services().await.unwrap().len(), 1);

        let outcome = submit(
            &projector,
            "ServiceMetadataUpdated",
            json!({"id": 11, "when": 1236, "uri": "B"}),
        )
        .await;
        assert_eq!(outcome, SubmitOutcome::Applied);

        let services = projector.list_services().await.unwrap();
        assert_eq!(
            services,
            vec![ServiceRecord {
                id: 11,
                owner: Some("bob".into()),
                name: Some("X".into()),
                active: true,
                when: 1236,
                uri: Some("B".into()),
            }]
        );
    }

    #[tokio::test]
    async fn exchange_lifecycle_round_trip() {
        let projector = projector();

        let outcome = submit(
            &projector,
            "Offered",
            json!({
                "id": 1, "serviceId": 2, "state": 0, "buyer": "bob", "seller": "alice",
                "moderator": "tom", "price": 10_000_000, "when": 1234, "uri": "ipfs//hello"
            }),
        )
        .await;
        assert!(outcome.is_applied());

        let outcome = submit(
            &projector,
            "Funded",
            json!({"id": 1, "state": 1, "price": 30_000_000, "when": 1236}),
        )
        .await;
        assert!(outcome.is_applied());

        let exchanges = projector.list_exchanges().await.unwrap();
        assert_eq!(exchanges.len(), 1);
        let exchange = &exchanges[0];
        assert_eq!(exchange.id, 1);
        assert_eq!(exchange.price, 30_000_000);
        assert_eq!(exchange.when, 1236);
        assert_eq!(exchange.state, ExchangeState::Funded);
        assert_eq!(exchange.seller.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn unknown_event_is_rejected_with_reason() {
        let projector = projector();
        let outcome = submit(&projector, "Minted", json!({"id": 1})).await;
        assert_eq!(
            outcome,
            SubmitOutcome::Rejected(Rejection::UnknownEventKind("Minted".into()))
        );
        assert_eq!(outcome.reason().as_deref(), Some("unknown event kind `Minted`"));
        assert!(projector.list_exchanges().await.unwrap().is_empty());
        assert_eq!(projector.live_actors().await, 0);
    }

    #[tokio::test]
    async fn illegal_transition_leaves_record_unchanged() {
        let projector = projector();
        for event in ["Offered", "Funded", "Completed"] {
            let outcome = submit(&projector, event, json!({"id": 5, "when": 1})).await;
            assert!(outcome.is_applied());
        }
        let before = projector.list_exchanges().await.unwrap();

        let outcome = submit(&projector, "Funded", json!({"id": 5, "price": 1, "when": 2})).await;

        assert!(matches!(
            outcome,
            SubmitOutcome::Rejected(Rejection::IllegalTransition(_))
        ));
        assert_eq!(projector.list_exchanges().await.unwrap(), before);
    }

    #[tokio::test]
    async fn applying_twice_is_idempotent() {
        let projector = projector();
        let data = json!({"id": 8, "serviceId": 1, "price": 3, "when": 7, "buyer": "b"});

        submit(&projector, "Offered", data.clone()).await;
        let once = projector.list_exchanges().await.unwrap();
        let outcome = submit(&projector, "Offered", data).await;
        let twice = projector.list_exchanges().await.unwrap();

        assert!(outcome.is_applied());
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn apply_returns_the_written_row() {
        let projector = projector();
        let record = projector
            .apply::<ServiceRecord>(
                4,
                crate::record::ServicePatch {
                    name: Some("direct".into()),
                    ..Default::default()
                },
            )
            .await
            .expect("apply should succeed");
        assert_eq!(record.id, 4);
        assert_eq!(record.name.as_deref(), Some("direct"));
        assert_eq!(projector.store().get::<ServiceRecord>(4).unwrap(), Some(record));
    }

    #[tokio::test]
    async fn one_actor_per_key() {
        let projector = projector();
        submit(&projector, "ServiceCreated", json!({"id": 1})).await;
        submit(&projector, "ServiceCreated", json!({"id": 1, "name": "again"})).await;
        submit(&projector, "ServiceCreated", json!({"id": 2})).await;
        // Same id, different table: a separate key.
        submit(&projector, "Offered", json!({"id": 1})).await;

        assert_eq!(projector.live_actors().await, 3);
    }

    #[tokio::test]
    async fn idle_actors_are_respawned_transparently() {
        let projector = Projector::<MemoryStore>::builder()
            .idle_timeout(Duration::from_millis(100))
            .open(MemoryStore::new());

        submit(&projector, "ServiceCreated", json!({"id": 3, "name": "n"})).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(projector.live_actors().await, 0);

        let outcome = submit(&projector, "ServiceDeactivated", json!({"id": 3, "when": 9})).await;
        assert!(outcome.is_applied());

        let services = projector.list_services().await.unwrap();
        assert_eq!(services[0].name.as_deref(), Some("n"));
        assert!(!services[0].active);
        assert_eq!(services[0].when, 9);
    }

    #[tokio::test]
    async fn shutdown_releases_actors() {
        let projector = projector();
        submit(&projector, "ServiceCreated", json!({"id": 1})).await;
        assert_eq!(projector.live_actors().await, 1);

        projector.shutdown().await;
        assert_eq!(projector.live_actors().await, 0);

        // Still usable afterwards.
        let outcome = submit(&projector, "ServiceCreated", json!({"id": 1, "name": "x"})).await;
        assert!(outcome.is_applied());
    }

    #[tokio::test]
    async fn reject_stale_policy() {
        let projector = Projector::<MemoryStore>::builder()
            .ordering(OrderingPolicy::RejectStale)
            .open(MemoryStore::new());

        submit(
            &projector,
            "ServiceCreated",
            json!({"id": 1, "when": 10, "uri": "new"}),
        )
        .await;
        let outcome = submit(
            &projector,
            "ServiceMetadataUpdated",
            json!({"id": 1, "when": 9, "uri": "old"}),
        )
        .await;

        assert_eq!(
            outcome,
            SubmitOutcome::Rejected(Rejection::StaleEvent { stored: 10, incoming: 9 })
        );
        let services = projector.list_services().await.unwrap();
        assert_eq!(services[0].uri.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn storage_failure_is_a_hard_error() {
        let tmp = tempfile::TempDir::new().expect("failed to create temp dir");
        let store = FileStore::open(tmp.path()).expect("open should succeed");
        // A directory where the row file should be makes the read fail.
        std::fs::create_dir_all(store.row_path("service", 1)).unwrap();
        let projector = Projector::new(store);

        let result = projector.submit_event("ServiceCreated", json!({"id": 1})).await;
        assert!(
            matches!(result, Err(SubmitError::Storage(_))),
            "expected Storage error, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn clones_share_actors() {
        let projector = projector();
        let clone = projector.clone();
        submit(&projector, "ServiceCreated", json!({"id": 1})).await;
        submit(&clone, "ServiceCreated", json!({"id": 1, "name": "c"})).await;
        assert_eq!(clone.live_actors().await, 1);
        assert_eq!(projector.list_services().await.unwrap()[0].name.as_deref(), Some("c"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_mid_apply_keeps_a_single_writer() {
        let projector = Projector::new(SlowStore::new(Duration::from_millis(200)));

        let first = tokio::spawn({
            let projector = projector.clone();
            async move {
                projector
                    .submit_event("ServiceCreated", json!({"id": 1, "name": "a"}))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopping = tokio::spawn({
            let projector = projector.clone();
            async move { projector.shutdown().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = projector
            .submit_event("ServiceMetadataUpdated", json!({"id": 1, "uri": "b"}))
            .await
            .expect("second submit");
        let first = first.await.expect("task panicked").expect("first submit");
        stopping.await.expect("shutdown panicked");

        assert!(first.is_applied());
        assert!(second.is_applied());
        assert_eq!(projector.store().max_in_flight(), 1);
        let services = projector.list_services().await.unwrap();
        assert_eq!(services[0].name.as_deref(), Some("a"));
        assert_eq!(services[0].uri.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn shutdown_waits_for_actors_to_exit() {
        let projector = Projector::new(SlowStore::new(Duration::from_millis(100)));
        let pending = tokio::spawn({
            let projector = projector.clone();
            async move { projector.submit_event("ServiceCreated", json!({"id": 1})).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        projector.shutdown().await;

        // The write accepted before shutdown has landed by the time it returns.
        assert_eq!(projector.store().writes(), 1);
        assert!(pending.await.unwrap().unwrap().is_applied());
    }

    /// Actors idle out constantly while callers keep submitting, so requests
    /// regularly land on an actor that is closing or draining.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn idle_churn_keeps_a_single_writer() {
        let projector = Projector::<SlowStore>::builder()
            .idle_timeout(Duration::from_millis(2))
            .max_spawn_attempts(20)
            .open(SlowStore::new(Duration::from_millis(1)));

        let mut tasks = Vec::new();
        for worker in 0..4u64 {
            let projector = projector.clone();
            tasks.push(tokio::spawn(async move {
                for step in 0..15u64 {
                    let outcome = projector
                        .submit_event(
                            "ServiceMetadataUpdated",
                            json!({"id": 1, "uri": format!("{worker}-{step}")}),
                        )
                        .await
                        .expect("submit should not fail hard");
                    assert!(outcome.is_applied());
                    tokio::time::sleep(Duration::from_millis(step % 4)).await;
                }
            }));
        }
        for task in tasks {
            task.await.expect("task panicked");
        }

        assert_eq!(projector.store().writes(), 60);
        assert_eq!(projector.store().max_in_flight(), 1);
    }

    #[tokio::test]
    async fn stopped_actors_are_evicted_from_the_cache() {
        let projector = Projector::<MemoryStore>::builder()
            .idle_timeout(Duration::from_millis(50))
            .open(MemoryStore::new());

        for id in 0..20 {
            submit(&projector, "ServiceCreated", json!({"id": id})).await;
        }
        assert_eq!(projector.cached_handles().await, 20);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(projector.live_actors().await, 0);

        submit(&projector, "ServiceCreated", json!({"id": 100})).await;
        assert_eq!(projector.cached_handles().await, 1);
        assert_eq!(projector.writers.len(), 1);
    }
}
