use crate::limits::{MAX_QUERY_WINDOW_DAYS, MAX_SPAN_DAYS};
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

fn validate_range(span: &Span, max_days: i64, too_wide: &'static str) -> Result<(), EngineError> {
    if span.is_zero_length() || span.is_inverted() {
        return Err(EngineError::InvalidRange(*span));
    }
    if span.nights() > max_days {
        return Err(EngineError::LimitExceeded(too_wide));
    }
    Ok(())
}

/// A span that will be stored as a restriction.
pub(crate) fn validate_stay(span: &Span) -> Result<(), EngineError> {
    validate_range(span, MAX_SPAN_DAYS, "stay too long")
}

/// A span that is only read against. Runs before any room state is touched.
pub(crate) fn validate_window(span: &Span) -> Result<(), EngineError> {
    validate_range(span, MAX_QUERY_WINDOW_DAYS, "query window too wide")
}

/// No restriction of the room may overlap `span`. Caller holds the room's write lock.
pub(crate) fn check_no_conflict(rs: &RoomState, span: &Span) -> Result<(), EngineError> {
    match rs.overlapping(span).next() {
        Some(existing) => Err(EngineError::SlotTaken {
            room_id: rs.room.id,
            conflicting: existing.id,
        }),
        None => Ok(()),
    }
}
