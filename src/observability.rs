use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "timeslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "timeslot_query_duration_seconds";

// ── Admission ───────────────────────────────────────────────────

/// Counter: finished `create_reservation` calls. Labels: outcome
/// (created, overlap, exhausted, or the error kind).
pub const ADMISSIONS_TOTAL: &str = "timeslot_admissions_total";

/// Counter: individual lease + transaction attempts.
pub const ADMISSION_ATTEMPTS_TOTAL: &str = "timeslot_admission_attempts_total";

/// Counter: retries scheduled. Labels: reason.
pub const ADMISSION_RETRIES_TOTAL: &str = "timeslot_admission_retries_total";

/// Histogram: end-to-end admission latency in seconds, backoff included.
pub const ADMISSION_DURATION_SECONDS: &str = "timeslot_admission_duration_seconds";

/// Counter: lease acquisitions refused because a live lease exists.
pub const LEASE_CONTENDED_TOTAL: &str = "timeslot_lease_contended_total";

/// Counter: commits that lost first-committer-wins.
pub const WRITE_CONFLICTS_TOTAL: &str = "timeslot_write_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "timeslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "timeslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "timeslot_connections_rejected_total";

/// Gauge: number of resources loaded.
pub const RESOURCES_ACTIVE: &str = "timeslot_resources_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "timeslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "timeslot_wal_flush_batch_size";

// ── Reaper ──────────────────────────────────────────────────────

/// Counter: reservations purged because their end time passed.
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "timeslot_reservations_expired_total";

/// Counter: stale leases deleted by the sweep.
pub const LEASES_SWEPT_TOTAL: &str = "timeslot_leases_swept_total";

/// Install Prometheus metrics exporter on the given address. No-op if None.
pub fn init(addr: Option<SocketAddr>) -> Result<(), String> {
    let Some(addr) = addr else { return Ok(()) };
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus metrics exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectResources => "select_resources",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectHealth => "select_health",
    }
}
