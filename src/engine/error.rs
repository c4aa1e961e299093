use std::time::Duration;

use crate::model::{ReservationId, RestrictionId, RoomId, Span};

#[derive(Debug)]
pub enum EngineError {
    RoomNotFound(RoomId),
    RoomExists(RoomId),
    ReservationNotFound(ReservationId),
    RestrictionNotFound(RestrictionId),
    /// Another restriction on the room already covers part of the span.
    SlotTaken {
        room_id: RoomId,
        conflicting: RestrictionId,
    },
    /// Zero-length or inverted span.
    InvalidRange(Span),
    /// The restriction is a guest booking; remove it through its reservation.
    NotABlock(RestrictionId),
    LimitExceeded(&'static str),
    /// Lock or WAL append did not finish within the storage deadline.
    Timeout(Duration),
    WalError(String),
}

impl EngineError {
    /// Storage failures: the outcome of the operation is unknown to the caller.
    pub fn is_storage(&self) -> bool {
        matches!(self, EngineError::Timeout(_) | EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::RoomNotFound(id) => write!(f, "room not found: {id}"),
            EngineError::RoomExists(id) => write!(f, "room already exists: {id}"),
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::RestrictionNotFound(id) => write!(f, "restriction not found: {id}"),
            EngineError::SlotTaken {
                room_id,
                conflicting,
            } => write!(
                f,
                "room {room_id} is not available for those dates (conflicts with restriction {conflicting})"
            ),
            EngineError::InvalidRange(span) => {
                write!(f, "invalid date range {span}: end date must be after start date")
            }
            EngineError::NotABlock(id) => {
                write!(f, "restriction {id} is a reservation, not an owner block")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Timeout(after) => {
                write!(f, "storage operation timed out after {}ms", after.as_millis())
            }
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
