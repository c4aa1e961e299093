use crate::model::*;

use super::availability::openings;
use super::conflict::validate_window;
use super::{Engine, EngineError, ReservationFilter};

impl Engine {
    pub async fn get_room(&self, id: RoomId) -> Result<Room, EngineError> {
        let rs = self.room_handle(id)?;
        let guard = self.deadline(rs.read()).await?;
        Ok(guard.room.clone())
    }

    /// All rooms, ordered by id.
    pub async fn list_rooms(&self) -> Result<Vec<Room>, EngineError> {
        let mut handles: Vec<_> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);
        let mut rooms = Vec::with_capacity(handles.len());
        for (_, rs) in handles {
            rooms.push(self.deadline(rs.read()).await?.room.clone());
        }
        Ok(rooms)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// True iff no restriction of the room overlaps `span`.
    ///
    /// Zero-length and inverted spans are rejected before the room is read, and a
    /// missing room is an error, never "free".
    pub async fn is_room_free(&self, room_id: RoomId, span: Span) -> Result<bool, EngineError> {
        validate_window(&span)?;
        let rs = self.room_handle(room_id)?;
        let guard = self.deadline(rs.read()).await?;
        Ok(guard.overlapping(&span).next().is_none())
    }

    /// Every room with no restriction overlapping `span`, ordered by id.
    pub async fn free_rooms_for_range(&self, span: Span) -> Result<Vec<Room>, EngineError> {
        validate_window(&span)?;
        let mut handles: Vec<_> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);
        let mut free = Vec::new();
        for (_, rs) in handles {
            let guard = self.deadline(rs.read()).await?;
            if guard.overlapping(&span).next().is_none() {
                free.push(guard.room.clone());
            }
        }
        Ok(free)
    }

    /// Restrictions of a room that overlap `window`, ordered by start date.
    pub async fn restrictions_for_room(
        &self,
        room_id: RoomId,
        window: Span,
    ) -> Result<Vec<Restriction>, EngineError> {
        validate_window(&window)?;
        let rs = self.room_handle(room_id)?;
        let guard = self.deadline(rs.read()).await?;
        Ok(guard.overlapping(&window).cloned().collect())
    }

    /// Every restriction of a room, ordered by start date.
    pub async fn all_restrictions(&self, room_id: RoomId) -> Result<Vec<Restriction>, EngineError> {
        let rs = self.room_handle(room_id)?;
        let guard = self.deadline(rs.read()).await?;
        Ok(guard.restrictions.clone())
    }

    /// Free sub-ranges of `window` for one room.
    pub async fn room_openings(&self, room_id: RoomId, window: Span) -> Result<Vec<Span>, EngineError> {
        validate_window(&window)?;
        let rs = self.room_handle(room_id)?;
        let guard = self.deadline(rs.read()).await?;
        Ok(openings(&guard, &window))
    }

    pub fn get_reservation(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        self.reservations
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// Reservations ordered by start date, then id.
    pub fn list_reservations(&self, filter: ReservationFilter) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| match filter {
                ReservationFilter::All => true,
                ReservationFilter::Unprocessed => !r.processed,
            })
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    /// The booking restriction that occupies a reservation's dates.
    pub fn booking_restriction(&self, reservation_id: ReservationId) -> Option<RestrictionId> {
        self.booking_restrictions
            .get(&reservation_id)
            .map(|r| *r.value())
    }
}
