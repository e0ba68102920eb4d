use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::model::Ms;
use crate::observability::{LEASES_SWEPT_TOTAL, RESERVATIONS_EXPIRED_TOTAL};

/// Counts from one reaper pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub reservations: usize,
    pub leases: usize,
}

/// Purge reservations that ended at or before `now` and delete stale leases.
pub async fn reap_once(engine: &Engine, now: Ms) -> Reaped {
    let mut reaped = Reaped::default();
    for (reservation_id, resource_id) in engine.collect_expired_reservations(now) {
        match engine.expire_reservation(reservation_id).await {
            Ok(_) => {
                reaped.reservations += 1;
                debug!(%reservation_id, %resource_id, "reaped expired reservation");
            }
            // May have been cancelled since it was collected.
            Err(e) => debug!("reaper skip {reservation_id}: {e}"),
        }
    }
    reaped.leases = engine.leases().sweep_expired(now).await;

    metrics::counter!(RESERVATIONS_EXPIRED_TOTAL).increment(reaped.reservations as u64);
    metrics::counter!(LEASES_SWEPT_TOTAL).increment(reaped.leases as u64);
    reaped
}

/// Background task that periodically cleans up expired reservations and leases.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let reaped = reap_once(&engine, crate::engine::now_ms()).await;
        if reaped != Reaped::default() {
            info!(
                reservations = reaped.reservations,
                leases = reaped.leases,
                "reaper pass"
            );
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "WAL compacted"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    const H: Ms = 3_600_000;
    const DAY: Ms = 1_893_456_000_000; // 2030-01-01

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("timeslot_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn reaper_purges_finished_reservations() {
        let engine = Engine::new(test_wal_path("reaper_purge.wal")).unwrap();
        let rid = Ulid::new();
        engine.create_resource(rid, "Room".into()).await.unwrap();

        let done = engine
            .create_reservation(rid, "a", Span::new(DAY, DAY + H))
            .await
            .unwrap();
        let upcoming = engine
            .create_reservation(rid, "b", Span::new(DAY + 2 * H, DAY + 3 * H))
            .await
            .unwrap();

        let reaped = reap_once(&engine, DAY + H).await;
        assert_eq!(reaped.reservations, 1);
        assert!(engine.get_reservation(done.id).await.is_err());
        assert_eq!(engine.get_reservation(upcoming.id).await.unwrap(), upcoming);

        let again = reap_once(&engine, DAY + H).await;
        assert_eq!(again.reservations, 0);
    }

    #[tokio::test]
    async fn reaper_sweeps_stale_leases() {
        let engine = Engine::new(test_wal_path("reaper_leases.wal")).unwrap();
        let rid = Ulid::new();
        engine.create_resource(rid, "Room".into()).await.unwrap();

        // Abandoned by a crashed holder.
        engine.leases().acquire(rid, 1_000).await.unwrap();

        let reaped = reap_once(&engine, DAY).await;
        assert_eq!(reaped.leases, 1);
        assert!(engine.leases().current(rid).await.is_none());
    }
}
