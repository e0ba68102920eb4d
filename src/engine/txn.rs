use tracing::debug;
use ulid::Ulid;

use crate::limits::MAX_RESERVATIONS_PER_RESOURCE;
use crate::model::*;

use super::overlap::find_overlap;
use super::{Engine, EngineError, SharedResourceState};

/// A snapshot-isolated unit of work against one resource's reservation set.
///
/// `begin` records the resource's commit version. Reads fail with
/// `WriteConflict` once that version has moved on, and so does `commit`
/// (first committer wins). Staged writes live only in the transaction until
/// commit, so dropping it is a complete rollback.
pub struct Transaction {
    resource_id: Ulid,
    state: SharedResourceState,
    snapshot_version: u64,
    staged: Option<Reservation>,
}

impl Transaction {
    pub fn resource_id(&self) -> Ulid {
        self.resource_id
    }

    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    /// Overlap predicate evaluated under this transaction's snapshot.
    /// Returns the id of a conflicting reservation, if any.
    pub async fn conflicting(&self, span: &Span) -> Result<Option<Ulid>, EngineError> {
        let guard = self.state.read().await;
        if guard.version != self.snapshot_version {
            return Err(EngineError::WriteConflict(self.resource_id));
        }
        Ok(find_overlap(&guard, span).map(|r| r.id))
    }

    pub async fn overlaps(&self, span: &Span) -> Result<bool, EngineError> {
        Ok(self.conflicting(span).await?.is_some())
    }

    /// Stage the single reservation this unit of work will write.
    pub fn insert(&mut self, reservation: Reservation) {
        debug_assert!(self.staged.is_none(), "one insert per transaction");
        debug_assert_eq!(reservation.resource_id, self.resource_id);
        self.staged = Some(reservation);
    }

    /// Atomically publish the staged write, or fail without side effects.
    pub async fn commit(self, engine: &Engine) -> Result<(), EngineError> {
        let Some(reservation) = self.staged else {
            return Ok(());
        };
        let mut guard = self.state.write().await;
        if guard.version != self.snapshot_version {
            debug!(
                resource_id = %self.resource_id,
                snapshot = self.snapshot_version,
                current = guard.version,
                "commit lost to a concurrent writer"
            );
            metrics::counter!(crate::observability::WRITE_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::WriteConflict(self.resource_id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }
        let event = Event::reservation_created(&reservation);
        engine.persist_and_apply(&mut guard, &event).await
    }

    /// Discard staged writes. Equivalent to dropping the transaction.
    pub fn abort(self) {
        debug!(resource_id = %self.resource_id, "transaction aborted");
    }
}

impl Engine {
    /// Open a transaction on an existing resource.
    pub async fn begin(&self, resource_id: Ulid) -> Result<Transaction, EngineError> {
        let state = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let snapshot_version = state.read().await.version;
        Ok(Transaction {
            resource_id,
            state,
            snapshot_version,
            staged: None,
        })
    }
}
