use crate::model::Ms;

// ── Admission tuning ─────────────────────────────────────────

/// Lease lifetime. Long enough for one admission transaction, short enough
/// that a crashed holder blocks its resource only briefly.
pub const LEASE_TTL_MS: Ms = 500;

/// Total admission attempts per `create_reservation` call (first try included).
pub const MAX_ATTEMPTS: u32 = 5;

/// Linear backoff step: attempt `n` sleeps `BACKOFF_BASE_MS * (n + 1)`.
pub const BACKOFF_BASE_MS: u64 = 50;

/// Default interval between expiry sweeps.
pub const REAPER_INTERVAL_MS: u64 = 5_000;

// ── Input limits ─────────────────────────────────────────────

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REQUESTER_LEN: usize = 256;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// One year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

/// Upper bound on one encoded WAL payload. A larger length prefix can only
/// come from a torn or corrupt entry.
pub const MAX_EVENT_BYTES: usize = 64 * 1024;

// ── Listing ──────────────────────────────────────────────────

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;
