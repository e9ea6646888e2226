mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::select_available;
pub use error::EngineError;
pub use store::InMemoryStore;

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::estimator::{DurationEstimator, PincodeDistance};
use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush + fsync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes do not leak
    // into the next batch; every caller in this batch is told it failed.
    let flushed = wal.flush_sync();
    let result = result.and(flushed);

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The reservation engine. Holds the store handle explicitly; there is no
/// global state, so every test can build its own isolated engine.
pub struct Engine {
    pub(super) store: InMemoryStore,
    /// `None` for a purely in-memory engine.
    pub(super) wal_tx: Option<mpsc::Sender<WalCommand>>,
    pub(super) estimator: Arc<dyn DurationEstimator>,
    /// Mutations hold this shared for their whole lock-check-append-apply
    /// sequence, taken before any resource lock. Compaction holds it exclusively
    /// while it snapshots state and queues the rewrite, so the snapshot and the
    /// WAL order agree.
    pub(super) compaction_gate: RwLock<()>,
}

impl Engine {
    /// Open a durable engine backed by the WAL at `wal_path`, replaying it first.
    /// Must be called inside a Tokio runtime (spawns the WAL writer).
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        Self::open_with_estimator(wal_path, Arc::new(PincodeDistance))
    }

    pub fn open_with_estimator(
        wal_path: PathBuf,
        estimator: Arc<dyn DurationEstimator>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?.events;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();
        // Sole owner during replay: every lock is uncontended.
        for event in &events {
            store.replay_event(event);
        }

        Ok(Self {
            store,
            wal_tx: Some(wal_tx),
            estimator,
            compaction_gate: RwLock::new(()),
        })
    }

    /// Engine with no durability at all.
    pub fn in_memory() -> Self {
        Self::in_memory_with_estimator(Arc::new(PincodeDistance))
    }

    pub fn in_memory_with_estimator(estimator: Arc<dyn DurationEstimator>) -> Self {
        Self {
            store: InMemoryStore::new(),
            wal_tx: None,
            estimator,
            compaction_gate: RwLock::new(()),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.wal_tx.is_some()
    }

    /// Round-trip a command to the WAL writer and wait for its answer.
    async fn wal_request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> Result<Option<T>, EngineError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(None);
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(make(tx))
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map(Some)
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))
    }

    /// Durably record `event` (no-op for in-memory engines).
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let response = self
            .wal_request(|response| WalCommand::Append {
                event: event.clone(),
                response,
            })
            .await?;
        match response {
            Some(result) => result.map_err(|e| EngineError::Storage(e.to_string())),
            None => Ok(()),
        }
    }

    /// WAL-append, then apply to the locked state. A failed append changes nothing.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(rs, event);
        Ok(())
    }

    /// Enter the commit section, fetch a resource handle and take its write
    /// lock. A resource deleted while we waited for the lock is reported as
    /// missing.
    pub(super) async fn lock_resource(&self, resource_id: Ulid) -> Result<ResourceLock<'_>, EngineError> {
        let commit = self.compaction_gate.read().await;
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let state = rs.write_owned().await;
        if state.detached {
            return Err(EngineError::NotFound(resource_id));
        }
        Ok(ResourceLock {
            state,
            _commit: commit,
        })
    }

    /// Lookup reservation → resource, then lock that resource.
    pub(super) async fn lock_reservation_owner(
        &self,
        reservation_id: Ulid,
    ) -> Result<ResourceLock<'_>, EngineError> {
        let resource_id = self
            .store
            .resource_for_reservation(&reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        let lock = self
            .lock_resource(resource_id)
            .await
            .map_err(|_| EngineError::NotFound(reservation_id))?;
        if lock.reservation(reservation_id).is_none() {
            return Err(EngineError::NotFound(reservation_id));
        }
        Ok(lock)
    }
}

/// Write access to one resource inside the commit section.
pub(super) struct ResourceLock<'a> {
    state: OwnedRwLockWriteGuard<ResourceState>,
    _commit: RwLockReadGuard<'a, ()>,
}

impl Deref for ResourceLock<'_> {
    type Target = ResourceState;

    fn deref(&self) -> &ResourceState {
        &self.state
    }
}

impl DerefMut for ResourceLock<'_> {
    fn deref_mut(&mut self) -> &mut ResourceState {
        &mut self.state
    }
}
