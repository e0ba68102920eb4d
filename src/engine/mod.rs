mod admission;
mod error;
mod lease;
mod mutations;
mod overlap;
mod queries;
mod retry;
mod txn;

pub use error::{Disposition, EngineError};
pub use lease::{InMemoryLeases, LeaseManager};
pub(crate) use overlap::now_ms;
pub use retry::{RetryPolicy, Step};
pub use txn::Transaction;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::limits::LEASE_TTL_MS;
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
/// Blocks for the first append, drains whatever else is already queued,
/// then covers the whole batch with one fsync before acknowledging anyone.
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
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Commands that touch the whole file wait for the batch.
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes never leak
    // into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch {
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
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub lease_ttl_ms: Ms,
    pub retry: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            lease_ttl_ms: LEASE_TTL_MS,
            retry: RetryPolicy::default(),
        }
    }
}

/// The reservation store plus the admission engine built on top of it.
pub struct Engine {
    pub(super) state: DashMap<Ulid, SharedResourceState>,
    /// Resource name → id. One entry per name is the uniqueness constraint.
    pub(super) names: DashMap<String, Ulid>,
    /// Reverse lookup: reservation id → resource id
    pub(super) reservation_to_resource: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) leases: Arc<dyn LeaseManager>,
    pub(super) retry: RetryPolicy,
    /// Held across check, append and insert when a resource is created, and
    /// for the whole of a compaction. Resource ids are claimed under it.
    pub(super) catalog: Mutex<()>,
}

/// Apply an event directly to a ResourceState. Caller holds the lock.
fn apply_to_resource(rs: &mut ResourceState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationCreated {
            id,
            resource_id,
            requester_id,
            span,
            created_at,
        } => {
            rs.insert_reservation(Reservation {
                id: *id,
                resource_id: *resource_id,
                requester_id: requester_id.clone(),
                span: *span,
                created_at: *created_at,
            });
            index.insert(*id, *resource_id);
            rs.version += 1;
        }
        Event::ReservationCancelled { id, .. } | Event::ReservationExpired { id, .. } => {
            rs.remove_reservation(*id);
            index.remove(id);
            rs.version += 1;
        }
        // Handled at the DashMap level, not here
        Event::ResourceCreated { .. } => {}
    }
}

/// The resource an event mutates (for non-Create events).
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationCreated { resource_id, .. }
        | Event::ReservationCancelled { resource_id, .. }
        | Event::ReservationExpired { resource_id, .. } => Some(*resource_id),
        Event::ResourceCreated { .. } => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        Self::with_options(wal_path, EngineOptions::default())
    }

    pub fn with_options(wal_path: PathBuf, options: EngineOptions) -> io::Result<Self> {
        let leases = Arc::new(InMemoryLeases::new(options.lease_ttl_ms));
        Self::with_leases(wal_path, leases, options.retry)
    }

    /// Build an engine over a caller-supplied lease primitive.
    /// Must run inside a tokio runtime: the WAL writer is spawned here.
    pub fn with_leases(
        wal_path: PathBuf,
        leases: Arc<dyn LeaseManager>,
        retry: RetryPolicy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            names: DashMap::new(),
            reservation_to_resource: DashMap::new(),
            wal_tx,
            leases,
            retry,
            catalog: Mutex::new(()),
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds. Never block here: this may run inside an async context.
        for event in &events {
            match event {
                Event::ResourceCreated { id, name } => {
                    let rs = ResourceState::new(*id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(rs)));
                    engine.names.insert(name.clone(), *id);
                }
                other => {
                    if let Some(resource_id) = event_resource_id(other)
                        && let Some(entry) = engine.state.get(&resource_id)
                    {
                        let rs = entry.value().clone();
                        let mut guard = rs
                            .try_write()
                            .map_err(|_| io::Error::other("replay: resource state contended"))?;
                        apply_to_resource(&mut guard, other, &engine.reservation_to_resource);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply. The event is durable before it is visible.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.reservation_to_resource);
        Ok(())
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn resource_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_resource
            .get(reservation_id)
            .map(|e| *e.value())
    }

    pub fn leases(&self) -> &Arc<dyn LeaseManager> {
        &self.leases
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Lookup reservation → resource, get resource, acquire write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .resource_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.write_owned().await;
        Ok((resource_id, guard))
    }
}
