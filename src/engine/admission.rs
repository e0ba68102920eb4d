use std::time::Instant;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{
    ADMISSIONS_TOTAL, ADMISSION_ATTEMPTS_TOTAL, ADMISSION_DURATION_SECONDS,
    ADMISSION_RETRIES_TOTAL, LEASE_CONTENDED_TOTAL,
};

use super::overlap::{now_ms, validate_span};
use super::retry::Step;
use super::{Engine, EngineError};

impl Engine {
    /// Admit `span` on `resource_id` or fail. Retries contention and store
    /// errors within the engine's `RetryPolicy`; overlap is final.
    pub async fn create_reservation(
        &self,
        resource_id: Ulid,
        requester_id: &str,
        span: Span,
    ) -> Result<Reservation, EngineError> {
        validate_span(&span)?;
        let started = Instant::now();

        let mut attempt = 0u32;
        let outcome = loop {
            let result = self.attempt(resource_id, requester_id, span).await;
            match self.retry.step(attempt, result) {
                Step::Done(reservation) => break Ok(reservation),
                Step::Stop(err) => break Err(err),
                Step::Backoff { delay, cause } => {
                    debug!(
                        resource_id = %resource_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        cause = %cause,
                        "admission retry"
                    );
                    metrics::counter!(ADMISSION_RETRIES_TOTAL, "reason" => cause.kind())
                        .increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        metrics::histogram!(ADMISSION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        let label = match &outcome {
            Ok(_) => "created",
            Err(e) => e.kind(),
        };
        metrics::counter!(ADMISSIONS_TOTAL, "outcome" => label).increment(1);

        match &outcome {
            Ok(r) => info!(
                reservation_id = %r.id,
                resource_id = %resource_id,
                start = span.start,
                end = span.end,
                "reservation created"
            ),
            Err(EngineError::Exhausted { attempts, last }) => warn!(
                resource_id = %resource_id,
                attempts,
                last = %last,
                "admission gave up"
            ),
            Err(_) => {}
        }
        outcome
    }

    /// One lease + transaction attempt. The lease is released on every exit
    /// path, after the commit (if any) has become visible.
    pub async fn attempt(
        &self,
        resource_id: Ulid,
        requester_id: &str,
        span: Span,
    ) -> Result<Reservation, EngineError> {
        metrics::counter!(ADMISSION_ATTEMPTS_TOTAL).increment(1);
        let lease = match self.leases.acquire(resource_id, now_ms()).await {
            Ok(lease) => lease,
            Err(e) => {
                if matches!(e, EngineError::LeaseContended(_)) {
                    metrics::counter!(LEASE_CONTENDED_TOTAL).increment(1);
                }
                return Err(e);
            }
        };

        let result = self.admit_under_lease(resource_id, requester_id, span).await;

        if let Err(e) = self.leases.release(resource_id).await {
            warn!(resource_id = %resource_id, epoch = lease.epoch, error = %e, "lease release failed");
        }
        result
    }

    async fn admit_under_lease(
        &self,
        resource_id: Ulid,
        requester_id: &str,
        span: Span,
    ) -> Result<Reservation, EngineError> {
        let mut txn = self.begin(resource_id).await?;
        if let Some(existing) = txn.conflicting(&span).await? {
            txn.abort();
            return Err(EngineError::Overlap(existing));
        }
        let reservation = Reservation {
            id: Ulid::new(),
            resource_id,
            requester_id: requester_id.to_string(),
            span,
            created_at: now_ms(),
        };
        txn.insert(reservation.clone());
        txn.commit(self).await?;
        Ok(reservation)
    }
}
