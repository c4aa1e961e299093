use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Unix milliseconds, used for record timestamps.
pub type Ms = i64;

pub type RoomId = i64;
pub type ReservationId = i64;
pub type RestrictionId = i64;

/// Half-open date interval `[start, end)`: the start day is occupied, the end day is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Span {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// One night: `[day, day + 1)`.
    pub fn single_day(day: NaiveDate) -> Self {
        Self::new(day, day.succ_opt().unwrap_or(day))
    }

    pub fn nights(&self) -> i64 {
        self.end.signed_duration_since(self.start).num_days()
    }

    pub fn is_zero_length(&self) -> bool {
        self.start == self.end
    }

    pub fn is_inverted(&self) -> bool {
        self.start > self.end
    }

    /// Touching endpoints do not overlap. A zero-length span only overlaps
    /// another zero-length span at the same point.
    pub fn overlaps(&self, other: &Span) -> bool {
        if self.is_zero_length() || other.is_zero_length() {
            return self.is_zero_length() && other.is_zero_length() && self.start == other.start;
        }
        self.start < other.end && other.start < self.end
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day < self.end
    }

    /// Every occupied day, in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d < end)
    }

    /// The part of `self` inside `window`, if any.
    pub fn clamp(&self, window: &Span) -> Option<Span> {
        let start = self.start.max(window.start);
        let end = self.end.min(window.end);
        (start < end).then(|| Span::new(start, end))
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Guest contact fields captured by the reservation form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub room_id: RoomId,
    pub span: Span,
    pub guest: Guest,
    pub processed: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// A reservation before it has been given an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub room_id: RoomId,
    pub span: Span,
    pub guest: Guest,
}

/// Why a room is unavailable over a restriction's span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestrictionKind {
    /// Occupied by a guest reservation.
    Booking { reservation_id: ReservationId },
    /// Closed by the owner.
    Block,
}

impl RestrictionKind {
    /// Tag used on the wire (`restriction_kind` column).
    pub fn tag(&self) -> &'static str {
        match self {
            RestrictionKind::Booking { .. } => "reservation",
            RestrictionKind::Block => "owner_block",
        }
    }

    pub fn reservation_id(&self) -> Option<ReservationId> {
        match self {
            RestrictionKind::Booking { reservation_id } => Some(*reservation_id),
            RestrictionKind::Block => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restriction {
    pub id: RestrictionId,
    pub room_id: RoomId,
    pub span: Span,
    pub kind: RestrictionKind,
    pub created_at: Ms,
}

impl Restriction {
    pub fn is_block(&self) -> bool {
        matches!(self.kind, RestrictionKind::Block)
    }
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Bookings and blocks, sorted by `span.start`.
    pub restrictions: Vec<Restriction>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            restrictions: Vec::new(),
        }
    }

    /// Insert restriction maintaining sort order by span.start.
    pub fn insert_restriction(&mut self, restriction: Restriction) {
        let pos = self
            .restrictions
            .partition_point(|r| r.span.start <= restriction.span.start);
        self.restrictions.insert(pos, restriction);
    }

    pub fn remove_restriction(&mut self, id: RestrictionId) -> Option<Restriction> {
        let pos = self.restrictions.iter().position(|r| r.id == id)?;
        Some(self.restrictions.remove(pos))
    }

    pub fn restriction(&self, id: RestrictionId) -> Option<&Restriction> {
        self.restrictions.iter().find(|r| r.id == id)
    }

    /// Restrictions whose span overlaps `query`.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Restriction> {
        let right_bound = self
            .restrictions
            .partition_point(|r| r.span.start < query.end);
        self.restrictions
            .get(..right_bound)
            .unwrap_or_default()
            .iter()
            .filter(move |r| r.span.overlaps(query))
    }
}

/// WAL record. Each variant is applied as one unit: a booked reservation and its
/// restriction are written by a single record, so neither exists without the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        room: Room,
    },
    ReservationBooked {
        reservation: Reservation,
        restriction_id: RestrictionId,
    },
    /// Contact fields and processed flag change together; `None` leaves a field as is.
    ReservationUpdated {
        id: ReservationId,
        room_id: RoomId,
        guest: Option<Guest>,
        processed: Option<bool>,
        at: Ms,
    },
    ReservationDeleted {
        id: ReservationId,
        room_id: RoomId,
        restriction_id: Option<RestrictionId>,
    },
    BlockAdded {
        restriction: Restriction,
    },
    BlockRemoved {
        id: RestrictionId,
        room_id: RoomId,
    },
    /// Written first by compaction so ids of deleted records are never handed out again.
    SequenceFloor {
        room: RoomId,
        reservation: ReservationId,
        restriction: RestrictionId,
    },
}

impl Event {
    /// The room whose lock guards this event. `None` for store-wide records.
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            Event::RoomCreated { room } => Some(room.id),
            Event::ReservationBooked { reservation, .. } => Some(reservation.room_id),
            Event::BlockAdded { restriction } => Some(restriction.room_id),
            Event::ReservationUpdated { room_id, .. }
            | Event::ReservationDeleted { room_id, .. }
            | Event::BlockRemoved { room_id, .. } => Some(*room_id),
            Event::SequenceFloor { .. } => None,
        }
    }
}

#[cfg(test)]
pub(crate) fn day(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

#[cfg(test)]
pub(crate) fn span(start: &str, end: &str) -> Span {
    Span::new(day(start), day(end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room_state() -> RoomState {
        RoomState::new(Room {
            id: 1,
            name: "General's Quarters".into(),
            created_at: 0,
            updated_at: 0,
        })
    }

    fn block(id: RestrictionId, start: &str, end: &str) -> Restriction {
        Restriction {
            id,
            room_id: 1,
            span: span(start, end),
            kind: RestrictionKind::Block,
            created_at: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = span("2024-03-10", "2024-03-15");
        assert_eq!(s.nights(), 5);
        assert!(s.contains_day(day("2024-03-10")));
        assert!(s.contains_day(day("2024-03-14")));
        assert!(!s.contains_day(day("2024-03-15"))); // half-open
        assert_eq!(s.days().count(), 5);
    }

    #[test]
    fn touching_spans_do_not_overlap() {
        let booked = span("2024-03-10", "2024-03-15");
        assert!(!booked.overlaps(&span("2024-03-15", "2024-03-20")));
        assert!(!booked.overlaps(&span("2024-03-05", "2024-03-10")));
        assert!(booked.overlaps(&span("2024-03-14", "2024-03-16")));
        assert!(booked.overlaps(&span("2024-03-01", "2024-03-31")));
    }

    #[test]
    fn zero_length_overlaps_only_same_point() {
        let point = span("2024-03-12", "2024-03-12");
        let booked = span("2024-03-10", "2024-03-15");
        assert!(!point.overlaps(&booked));
        assert!(!booked.overlaps(&point));
        assert!(point.overlaps(&span("2024-03-12", "2024-03-12")));
        assert!(!point.overlaps(&span("2024-03-13", "2024-03-13")));
    }

    #[test]
    fn clamp_to_window() {
        let month = span("2024-03-01", "2024-04-01");
        assert_eq!(
            span("2024-02-27", "2024-03-03").clamp(&month),
            Some(span("2024-03-01", "2024-03-03"))
        );
        assert_eq!(span("2024-02-01", "2024-02-10").clamp(&month), None);
    }

    #[test]
    fn single_day_is_one_night() {
        let s = Span::single_day(day("2024-02-29"));
        assert_eq!(s.end, day("2024-03-01"));
        assert_eq!(s.nights(), 1);
    }

    #[test]
    fn restrictions_stay_sorted() {
        let mut rs = room_state();
        rs.insert_restriction(block(1, "2024-03-20", "2024-03-21"));
        rs.insert_restriction(block(2, "2024-03-05", "2024-03-06"));
        rs.insert_restriction(block(3, "2024-03-12", "2024-03-13"));
        let starts: Vec<_> = rs.restrictions.iter().map(|r| r.id).collect();
        assert_eq!(starts, vec![2, 3, 1]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = room_state();
        rs.insert_restriction(block(1, "2024-03-01", "2024-03-05"));
        rs.insert_restriction(block(2, "2024-03-09", "2024-03-12"));
        rs.insert_restriction(block(3, "2024-03-20", "2024-03-22"));
        let hits: Vec<_> = rs
            .overlapping(&span("2024-03-05", "2024-03-10"))
            .map(|r| r.id)
            .collect();
        assert_eq!(hits, vec![2]);
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut rs = room_state();
        rs.insert_restriction(block(1, "2024-03-01", "2024-03-05"));
        assert!(rs.remove_restriction(99).is_none());
        assert_eq!(rs.restrictions.len(), 1);
    }

    #[test]
    fn restriction_kind_tags() {
        assert_eq!(RestrictionKind::Block.tag(), "owner_block");
        let booking = RestrictionKind::Booking { reservation_id: 7 };
        assert_eq!(booking.tag(), "reservation");
        assert_eq!(booking.reservation_id(), Some(7));
        assert_eq!(RestrictionKind::Block.reservation_id(), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BlockAdded {
            restriction: block(4, "2024-03-05", "2024-03-06"),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
        assert_eq!(decoded.room_id(), Some(1));
    }
}
