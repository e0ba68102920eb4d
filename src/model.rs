use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints (`self.end == other.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// An accepted booking of one resource for one interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub requester_id: String,
    pub span: Span,
    pub created_at: Ms,
}

/// Exclusive, time-bounded right to mutate one resource's reservation set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource_id: Ulid,
    /// Issued once per successful acquisition, strictly increasing per manager.
    pub epoch: u64,
    pub acquired_at: Ms,
    pub expires_at: Ms,
}

impl Lease {
    /// A stale lease is equivalent to no lease at all.
    pub fn is_stale(&self, now: Ms) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    /// Accepted reservations, sorted by `span.start`. Pairwise non-overlapping.
    pub reservations: Vec<Reservation>,
    /// Bumped on every committed change to `reservations`.
    pub version: u64,
}

impl ResourceState {
    pub fn new(id: Ulid, name: String) -> Self {
        Self {
            id,
            name,
            reservations: Vec::new(),
            version: 0,
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    /// Remove reservation by id.
    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// The event types: flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: String,
    },
    ReservationCreated {
        id: Ulid,
        resource_id: Ulid,
        requester_id: String,
        span: Span,
        created_at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        resource_id: Ulid,
    },
    ReservationExpired {
        id: Ulid,
        resource_id: Ulid,
    },
}

impl Event {
    pub fn reservation_created(r: &Reservation) -> Self {
        Event::ReservationCreated {
            id: r.id,
            resource_id: r.resource_id,
            requester_id: r.requester_id.clone(),
            span: r.span,
            created_at: r.created_at,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub reservation_count: usize,
}

/// Listing filter. `page` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationQuery {
    pub resource_id: Option<Ulid>,
    pub page: usize,
    pub page_size: usize,
}

impl Default for ReservationQuery {
    fn default() -> Self {
        Self {
            resource_id: None,
            page: 1,
            page_size: crate::limits::DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationPage {
    pub items: Vec<Reservation>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub pages: usize,
}
