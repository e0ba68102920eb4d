use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    NameTaken(String),
    /// Candidate interval intersects this accepted reservation.
    Overlap(Ulid),
    /// Another attempt holds a live lease on this resource.
    LeaseContended(Ulid),
    /// The resource changed after the transaction's snapshot was taken.
    WriteConflict(Ulid),
    /// Retry budget consumed; carries the last retryable error observed.
    Exhausted {
        attempts: u32,
        last: Box<EngineError>,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

/// How the retry controller reacts to a failed admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Business rejection: surface immediately.
    Reject,
    /// Contention or transient store failure: back off and try again.
    Retry,
    /// Deterministic fault: retrying cannot change the outcome.
    Fail,
}

impl EngineError {
    pub fn disposition(&self) -> Disposition {
        match self {
            EngineError::Overlap(_) => Disposition::Reject,
            EngineError::LeaseContended(_)
            | EngineError::WriteConflict(_)
            | EngineError::WalError(_) => Disposition::Retry,
            EngineError::NotFound(_)
            | EngineError::AlreadyExists(_)
            | EngineError::NameTaken(_)
            | EngineError::LimitExceeded(_)
            | EngineError::Exhausted { .. } => Disposition::Fail,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::NameTaken(_) => "name_taken",
            EngineError::Overlap(_) => "overlap",
            EngineError::LeaseContended(_) => "lease_contended",
            EngineError::WriteConflict(_) => "write_conflict",
            EngineError::Exhausted { .. } => "exhausted",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NameTaken(name) => write!(f, "resource name already taken: {name}"),
            EngineError::Overlap(id) => {
                write!(f, "time slot overlaps with an existing reservation: {id}")
            }
            EngineError::LeaseContended(id) => write!(f, "resource {id} is locked by another request"),
            EngineError::WriteConflict(id) => write!(f, "write conflict on resource {id}"),
            EngineError::Exhausted { attempts, last } => {
                write!(f, "resource unavailable after {attempts} attempts: {last}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Exhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}
