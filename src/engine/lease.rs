use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use ulid::Ulid;

use crate::model::{Lease, Ms};

use super::EngineError;

/// Store-backed mutex over one resource's reservation set.
///
/// `acquire` must be a single atomic conditional write: succeed iff no lease
/// exists for the resource or the existing one is stale. It never waits;
/// callers decide when to try again.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Take the lease for `resource_id`, or fail with `LeaseContended`.
    async fn acquire(&self, resource_id: Ulid, now: Ms) -> Result<Lease, EngineError>;

    /// Drop whatever lease exists for `resource_id`.
    async fn release(&self, resource_id: Ulid) -> Result<(), EngineError>;

    /// Delete stale leases. Returns how many were removed.
    async fn sweep_expired(&self, now: Ms) -> usize;

    /// The lease currently stored for `resource_id`, stale or not.
    async fn current(&self, resource_id: Ulid) -> Option<Lease>;
}

/// In-process lease table. One map slot per resource is the uniqueness
/// constraint; the entry guard makes check-and-write one atomic step.
pub struct InMemoryLeases {
    leases: DashMap<Ulid, Lease>,
    ttl_ms: Ms,
    next_epoch: AtomicU64,
}

impl InMemoryLeases {
    pub fn new(ttl_ms: Ms) -> Self {
        Self {
            leases: DashMap::new(),
            ttl_ms,
            next_epoch: AtomicU64::new(1),
        }
    }

    pub fn ttl_ms(&self) -> Ms {
        self.ttl_ms
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

#[async_trait]
impl LeaseManager for InMemoryLeases {
    async fn acquire(&self, resource_id: Ulid, now: Ms) -> Result<Lease, EngineError> {
        let entry = self.leases.entry(resource_id);
        if let Entry::Occupied(held) = &entry
            && !held.get().is_stale(now)
        {
            debug!(
                resource_id = %resource_id,
                held_epoch = held.get().epoch,
                "lease contended"
            );
            return Err(EngineError::LeaseContended(resource_id));
        }
        let lease = Lease {
            resource_id,
            epoch: self.next_epoch.fetch_add(1, Ordering::Relaxed),
            acquired_at: now,
            expires_at: now + self.ttl_ms,
        };
        entry.insert(lease.clone());
        Ok(lease)
    }

    async fn release(&self, resource_id: Ulid) -> Result<(), EngineError> {
        self.leases.remove(&resource_id);
        Ok(())
    }

    async fn sweep_expired(&self, now: Ms) -> usize {
        let before = self.leases.len();
        self.leases.retain(|_, lease| !lease.is_stale(now));
        before.saturating_sub(self.leases.len())
    }

    async fn current(&self, resource_id: Ulid) -> Option<Lease> {
        self.leases.get(&resource_id).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn acquire_then_contended_then_released() {
        let leases = InMemoryLeases::new(500);
        let rid = Ulid::new();

        let lease = leases.acquire(rid, 1000).await.unwrap();
        assert_eq!(lease.expires_at, 1500);

        let second = leases.acquire(rid, 1100).await;
        assert!(matches!(second, Err(EngineError::LeaseContended(id)) if id == rid));

        leases.release(rid).await.unwrap();
        assert!(leases.current(rid).await.is_none());
        assert!(leases.acquire(rid, 1200).await.is_ok());
    }

    #[tokio::test]
    async fn stale_lease_is_taken_over() {
        let leases = InMemoryLeases::new(500);
        let rid = Ulid::new();

        let crashed = leases.acquire(rid, 1000).await.unwrap();
        // never released; at expires_at the lease is stale
        let next = leases.acquire(rid, 1500).await.unwrap();
        assert!(next.epoch > crashed.epoch);
        assert_eq!(leases.current(rid).await, Some(next));
    }

    #[tokio::test]
    async fn leases_are_per_resource() {
        let leases = InMemoryLeases::new(500);
        let a = leases.acquire(Ulid::new(), 1000).await;
        let b = leases.acquire(Ulid::new(), 1000).await;
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(leases.len(), 2);
    }

    #[tokio::test]
    async fn sweep_removes_only_stale() {
        let leases = InMemoryLeases::new(500);
        let old = Ulid::new();
        let fresh = Ulid::new();
        leases.acquire(old, 1000).await.unwrap();
        leases.acquire(fresh, 1400).await.unwrap();

        assert_eq!(leases.sweep_expired(1600).await, 1);
        assert!(leases.current(old).await.is_none());
        assert!(leases.current(fresh).await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_acquires_have_one_winner() {
        let leases = Arc::new(InMemoryLeases::new(60_000));
        let rid = Ulid::new();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let leases = leases.clone();
            handles.push(tokio::spawn(async move { leases.acquire(rid, 1000).await }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
