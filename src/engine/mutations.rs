use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_resource(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::LimitExceeded("resource name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        let _catalog = self.catalog.lock().await;
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        // Ids are unique under the catalog lock; names through the entry guard.
        match self.names.entry(name.clone()) {
            Entry::Occupied(_) => return Err(EngineError::NameTaken(name)),
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let event = Event::ResourceCreated {
            id,
            name: name.clone(),
        };
        if let Err(e) = self.wal_append(&event).await {
            self.names.remove(&name);
            return Err(e);
        }
        let rs = ResourceState::new(id, name);
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        metrics::gauge!(crate::observability::RESOURCES_ACTIVE).set(self.state.len() as f64);
        info!(resource_id = %id, "resource created");
        Ok(())
    }

    /// Delete a reservation, freeing its interval. Needs no lease: removal
    /// can never create an overlap, and the version bump invalidates any
    /// transaction that read the old set.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (resource_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let reservation = guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let event = Event::ReservationCancelled { id, resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(reservation_id = %id, resource_id = %resource_id, "reservation cancelled");
        Ok(reservation)
    }

    /// Reservations whose end time has passed, as `(reservation_id, resource_id)`.
    /// Resources locked right now are skipped; the next sweep picks them up.
    pub fn collect_expired_reservations(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            if let Ok(guard) = rs.try_read() {
                for r in &guard.reservations {
                    if r.span.end <= now {
                        expired.push((r.id, guard.id));
                    }
                }
            }
        }
        expired
    }

    pub async fn expire_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (resource_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let event = Event::ReservationExpired { id, resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(resource_id)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    ///
    /// Every resource stays read-locked until the rewrite lands, so no event
    /// can be appended between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(resources.len());
        let mut events = Vec::new();
        for rs in resources {
            let guard = rs.read_owned().await;
            events.push(Event::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            events.extend(guard.reservations.iter().map(Event::reservation_created));
            guards.push(guard);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
