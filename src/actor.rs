//! Actor loop that owns one projection row and applies updates to it.
//!
//! Each `(table, id)` key with recent traffic has exactly one actor. The
//! actor runs on its own thread and processes requests from an `mpsc`
//! channel one at a time, so the read-merge-write cycle for a key never
//! interleaves with another. Different keys have different actors and run
//! in parallel.
//!
//! An actor for a key can be replaced (after idle shutdown or a projector
//! `shutdown`) while the old one is still draining requests it already
//! accepted. Both actors take the key's lock from [`WriterLocks`] for their
//! whole lifetime, so the replacement only starts applying once the old one
//! has exited.
//!
//! Crate-internal API: [`RecordHandle`] (cloneable async handle),
//! [`WriterLocks`] (per-key writer locks) and [`spawn_actor`] (starts the
//! actor thread).

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::OrderingPolicy;
use crate::error::{ApplyError, Rejection};
use crate::record::Record;
use crate::storage::ProjectionStore;

/// Configuration for the actor loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActorConfig {
    /// How long the actor waits for a message before shutting down.
    pub idle_timeout: Duration,
    /// Bound of the request channel.
    pub channel_capacity: usize,
    /// Out-of-order delivery handling.
    pub ordering: OrderingPolicy,
}

/// A single update sent to the actor, with the channel to reply on.
pub(crate) struct ApplyRequest<R: Record> {
    update: R::Update,
    reply: oneshot::Sender<Result<R, ApplyError>>,
}

/// Runs the actor loop on the calling (dedicated) thread.
///
/// The loop exits when the channel closes (all handles dropped) or the idle
/// timeout elapses. On idle timeout the channel is closed first and any
/// requests that were already queued are still applied, so a sender whose
/// message was accepted always gets a reply.
fn run_actor<R: Record, S: ProjectionStore>(
    id: u64,
    store: Arc<S>,
    mut rx: mpsc::Receiver<ApplyRequest<R>>,
    config: ActorConfig,
    rt: tokio::runtime::Runtime,
) {
    loop {
        // The timeout future is created inside `block_on` so its timer
        // registers with this thread's runtime.
        let idle_timeout = config.idle_timeout;
        let msg = rt.block_on(async { tokio::time::timeout(idle_timeout, rx.recv()).await });

        match msg {
            Ok(Some(request)) => handle_request(store.as_ref(), id, request, config.ordering),
            // Channel closed: all handles dropped.
            Ok(None) => break,
            Err(_elapsed) => {
                tracing::info!(table = R::TABLE, id, "actor idle, shutting down");
                rx.close();
                while let Ok(request) = rx.try_recv() {
                    handle_request(store.as_ref(), id, request, config.ordering);
                }
                break;
            }
        }
    }
}

fn handle_request<R: Record, S: ProjectionStore>(
    store: &S,
    id: u64,
    request: ApplyRequest<R>,
    ordering: OrderingPolicy,
) {
    let _span = tracing::info_span!("apply", table = R::TABLE, id).entered();
    let result = apply_update::<R, S>(store, id, request.update, ordering);
    // If the receiver was dropped, the caller no longer cares about the
    // result. The write (if any) has already happened.
    let _ = request.reply.send(result);
}

/// Read the current row, reconcile the update against it, write the result.
///
/// Nothing is written when the update is rejected.
fn apply_update<R: Record, S: ProjectionStore>(
    store: &S,
    id: u64,
    update: R::Update,
    ordering: OrderingPolicy,
) -> Result<R, ApplyError> {
    let current = store.get::<R>(id)?;

    if ordering == OrderingPolicy::RejectStale
        && let Some(stored) = current.as_ref().map(R::when)
        && let Some(incoming) = R::update_when(&update)
        && incoming < stored
    {
        return Err(Rejection::StaleEvent { stored, incoming }.into());
    }

    let next = R::reconcile(current.as_ref(), id, update)?;
    store.put(&next)?;

    tracing::info!(when = next.when(), created = current.is_none(), "record written");

    Ok(next)
}

/// What happened to an update handed to [`RecordHandle::apply`].
pub(crate) enum Delivery<R: Record> {
    /// The actor processed the update.
    Replied(Result<R, ApplyError>),
    /// The actor had already closed its channel; the update is handed back
    /// untouched so the caller can respawn and retry.
    Closed(R::Update),
}

/// Async handle to a running record actor.
pub(crate) struct RecordHandle<R: Record> {
    sender: mpsc::Sender<ApplyRequest<R>>,
    /// Closed by the actor thread as its last act.
    exit: watch::Receiver<()>,
}

// Manual `Clone` because derive would demand `R::Update: Clone`.
impl<R: Record> Clone for RecordHandle<R> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            exit: self.exit.clone(),
        }
    }
}

impl<R: Record> RecordHandle<R> {
    /// Send an update to the actor and wait for the result.
    pub(crate) async fn apply(&self, update: R::Update) -> Delivery<R> {
        let (tx, rx) = oneshot::channel();
        let request = ApplyRequest { update, reply: tx };
        if let Err(mpsc::error::SendError(request)) = self.sender.send(request).await {
            return Delivery::Closed(request.update);
        }
        match rx.await {
            Ok(result) => Delivery::Replied(result),
            // The actor thread died mid-request (a panic in the store).
            Err(_) => Delivery::Replied(Err(ApplyError::ActorGone)),
        }
    }

    /// Returns `false` once the actor has exited or stopped accepting requests.
    pub(crate) fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Returns `true` once the actor thread has finished, queue drained and
    /// writer lock released.
    pub(crate) fn is_stopped(&self) -> bool {
        self.exit.has_changed().is_err()
    }
}

/// Type-erased view of a [`RecordHandle`], so one cache can hold handles
/// for every record kind.
pub(crate) trait ErasedHandle: Send + Sync {
    fn is_alive(&self) -> bool;
    fn is_stopped(&self) -> bool;
    fn exit_signal(&self) -> watch::Receiver<()>;
    fn as_any(&self) -> &dyn Any;
}

impl<R: Record> ErasedHandle for RecordHandle<R> {
    fn is_alive(&self) -> bool {
        RecordHandle::is_alive(self)
    }

    fn is_stopped(&self) -> bool {
        RecordHandle::is_stopped(self)
    }

    fn exit_signal(&self) -> watch::Receiver<()> {
        self.exit.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Wait until the actor behind `exit` has finished.
pub(crate) async fn stopped(mut exit: watch::Receiver<()>) {
    // Nothing is ever sent; `changed` errors once the sender is dropped.
    while exit.changed().await.is_ok() {}
}

type WriterLock = Arc<Mutex<()>>;

/// Per-key writer locks shared by every actor of one projector.
///
/// Only locks some actor holds or waits on are kept; the rest are pruned
/// whenever a new slot is handed out.
#[derive(Debug, Default)]
pub(crate) struct WriterLocks {
    locks: Mutex<HashMap<(&'static str, u64), WriterLock>>,
}

impl WriterLocks {
    /// The lock for `key`, shared with any actor already holding it.
    fn slot(&self, key: (&'static str, u64)) -> WriterLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones are only made under this mutex, so a count of one means
        // no actor holds or waits on the lock.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(key).or_default())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Spawn the actor owning `R::TABLE` row `id`.
///
/// The actor blocks on store I/O, so it gets a dedicated thread with a
/// minimal current-thread runtime that only drives the idle timer. Requests
/// sent before an earlier actor for the same key has exited are queued and
/// applied once it has.
///
/// # Errors
///
/// Returns `io::Error` if the runtime or the thread cannot be created.
pub(crate) fn spawn_actor<R: Record, S: ProjectionStore>(
    id: u64,
    store: Arc<S>,
    writers: &WriterLocks,
    config: ActorConfig,
) -> io::Result<RecordHandle<R>> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    let (tx, rx) = mpsc::channel::<ApplyRequest<R>>(config.channel_capacity.max(1));
    let (exit_tx, exit_rx) = watch::channel(());
    let writer = writers.slot((R::TABLE, id));

    std::thread::Builder::new()
        .name(format!("{}-{id}", R::TABLE))
        .spawn(move || {
            let guard = writer.lock().unwrap_or_else(PoisonError::into_inner);
            run_actor::<R, S>(id, store, rx, config, rt);
            drop(guard);
            drop(writer);
            drop(exit_tx);
        })?;

    Ok(RecordHandle {
        sender: tx,
        exit: exit_rx,
    })
}
