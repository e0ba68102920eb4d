use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::LimitExceeded("span start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// First accepted reservation on `rs` that overlaps `span`, if any.
///
/// Caller must hold the resource lock for the whole read; the answer is only
/// meaningful inside a transaction (see `Transaction::conflicting`).
pub(crate) fn find_overlap<'a>(rs: &'a ResourceState, span: &Span) -> Option<&'a Reservation> {
    rs.overlapping(span).next()
}
