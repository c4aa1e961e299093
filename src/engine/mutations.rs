use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_stay};
use super::{Engine, EngineError, Removal, Sequences, WalCommand};

fn check_guest(guest: &Guest) -> Result<(), EngineError> {
    let fields = [
        &guest.first_name,
        &guest.last_name,
        &guest.email,
        &guest.phone,
    ];
    if fields.iter().any(|f| f.len() > MAX_GUEST_FIELD_LEN) {
        return Err(EngineError::LimitExceeded("guest field too long"));
    }
    Ok(())
}

fn check_room_capacity(rs: &RoomState) -> Result<(), EngineError> {
    if rs.restrictions.len() >= MAX_RESTRICTIONS_PER_ROOM {
        return Err(EngineError::LimitExceeded("too many restrictions on room"));
    }
    Ok(())
}

/// Record a lost race for a slot.
fn note_conflict(err: &EngineError, span: &Span) {
    if let EngineError::SlotTaken {
        room_id,
        conflicting,
    } = err
    {
        metrics::counter!(crate::observability::SLOT_CONFLICTS_TOTAL).increment(1);
        warn!(room_id, conflicting, %span, "slot taken");
    }
}

impl Engine {
    /// Create a room. With `id = None` the next free id is used.
    pub async fn create_room(&self, id: Option<RoomId>, name: String) -> Result<Room, EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("room name too long"));
        }
        if matches!(id, Some(i) if i <= 0) {
            return Err(EngineError::LimitExceeded("room id must be positive"));
        }
        let _barrier = self.deadline(self.barrier.read()).await?;
        let _creating = self.deadline(self.room_creation.lock()).await?;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        let id = match id {
            Some(id) if self.rooms.contains_key(&id) => return Err(EngineError::RoomExists(id)),
            Some(id) => id,
            None => loop {
                let candidate = Sequences::next(&self.sequences.room);
                if !self.rooms.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let now = now_ms();
        let room = Room {
            id,
            name,
            created_at: now,
            updated_at: now,
        };
        let event = Event::RoomCreated { room: room.clone() };
        self.wal_append(&event).await?;
        self.sequences.observe(&event);
        self.rooms
            .insert(id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
        info!(room_id = id, name = %room.name, "room created");
        Ok(room)
    }

    /// Persist a reservation together with its booking restriction.
    ///
    /// Either both exist afterwards or neither does. Fails with `SlotTaken` if any
    /// restriction of the room overlaps the requested span.
    pub async fn book(&self, new: NewReservation) -> Result<Reservation, EngineError> {
        validate_stay(&new.span)?;
        check_guest(&new.guest)?;
        let _barrier = self.deadline(self.barrier.read()).await?;
        let mut guard = self.lock_room(new.room_id).await?;
        check_room_capacity(&guard)?;
        if let Err(e) = check_no_conflict(&guard, &new.span) {
            note_conflict(&e, &new.span);
            return Err(e);
        }

        let now = now_ms();
        let reservation = Reservation {
            id: Sequences::next(&self.sequences.reservation),
            room_id: new.room_id,
            span: new.span,
            guest: new.guest,
            processed: false,
            created_at: now,
            updated_at: now,
        };
        let event = Event::ReservationBooked {
            reservation: reservation.clone(),
            restriction_id: Sequences::next(&self.sequences.restriction),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(crate::observability::BOOKINGS_TOTAL).increment(1);
        info!(
            reservation_id = reservation.id,
            room_id = reservation.room_id,
            span = %reservation.span,
            "reservation booked"
        );
        Ok(reservation)
    }

    fn reservation_room(&self, id: ReservationId) -> Result<RoomId, EngineError> {
        self.reservations
            .get(&id)
            .map(|r| r.room_id)
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// Replace the guest contact fields of a reservation.
    pub async fn update_reservation(
        &self,
        id: ReservationId,
        guest: Guest,
    ) -> Result<Reservation, EngineError> {
        self.amend_reservation(id, Some(guest), None).await
    }

    pub async fn set_processed(
        &self,
        id: ReservationId,
        processed: bool,
    ) -> Result<Reservation, EngineError> {
        self.amend_reservation(id, None, Some(processed)).await
    }

    /// Change contact fields and the processed flag in one record, so an admin edit
    /// lands whole or not at all.
    pub async fn amend_reservation(
        &self,
        id: ReservationId,
        guest: Option<Guest>,
        processed: Option<bool>,
    ) -> Result<Reservation, EngineError> {
        if let Some(guest) = &guest {
            check_guest(guest)?;
        }
        let room_id = self.reservation_room(id)?;
        let _barrier = self.deadline(self.barrier.read()).await?;
        let mut guard = self.lock_room(room_id).await?;
        // Re-check under the lock: a concurrent delete may have won.
        self.reservation_room(id)?;
        let event = Event::ReservationUpdated {
            id,
            room_id,
            guest,
            processed,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        if let Some(processed) = processed {
            debug!(reservation_id = id, processed, "reservation processed flag set");
        }
        self.get_reservation(id)
    }

    /// Delete a reservation and free its dates. Deleting twice is not an error.
    pub async fn delete_reservation(&self, id: ReservationId) -> Result<Removal, EngineError> {
        let Ok(room_id) = self.reservation_room(id) else {
            return Ok(Removal::AlreadyGone);
        };
        let _barrier = self.deadline(self.barrier.read()).await?;
        let mut guard = self.lock_room(room_id).await?;
        if !self.reservations.contains_key(&id) {
            return Ok(Removal::AlreadyGone);
        }
        let restriction_id = self.booking_restrictions.get(&id).map(|r| *r.value());
        let event = Event::ReservationDeleted {
            id,
            room_id,
            restriction_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(reservation_id = id, room_id, "reservation deleted");
        Ok(Removal::Removed)
    }

    /// Close a room over `span`. Blocks obey the same no-overlap rule as bookings.
    pub async fn add_block(&self, room_id: RoomId, span: Span) -> Result<RestrictionId, EngineError> {
        validate_stay(&span)?;
        let _barrier = self.deadline(self.barrier.read()).await?;
        let mut guard = self.lock_room(room_id).await?;
        check_room_capacity(&guard)?;
        if let Err(e) = check_no_conflict(&guard, &span) {
            note_conflict(&e, &span);
            return Err(e);
        }
        let restriction = Restriction {
            id: Sequences::next(&self.sequences.restriction),
            room_id,
            span,
            kind: RestrictionKind::Block,
            created_at: now_ms(),
        };
        let id = restriction.id;
        self.persist_and_apply(&mut guard, &Event::BlockAdded { restriction })
            .await?;
        debug!(restriction_id = id, room_id, %span, "block added");
        Ok(id)
    }

    /// Remove an owner block. A missing id is `AlreadyGone`; a booking is refused.
    pub async fn remove_block(&self, id: RestrictionId) -> Result<Removal, EngineError> {
        let Some(room_id) = self.restriction_rooms.get(&id).map(|r| *r.value()) else {
            return Ok(Removal::AlreadyGone);
        };
        let _barrier = self.deadline(self.barrier.read()).await?;
        let mut guard = self.lock_room(room_id).await?;
        match guard.restriction(id) {
            None => return Ok(Removal::AlreadyGone),
            Some(r) if !r.is_block() => return Err(EngineError::NotABlock(id)),
            Some(_) => {}
        }
        self.persist_and_apply(&mut guard, &Event::BlockRemoved { id, room_id })
            .await?;
        debug!(restriction_id = id, room_id, "block removed");
        Ok(Removal::Removed)
    }

    /// Rewrite the WAL as the smallest event set that rebuilds the current state.
    ///
    /// Holds the barrier exclusively, so no mutation is appended between the
    /// snapshot and the file swap.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _exclusive = self.barrier.write().await;

        let mut events = vec![Event::SequenceFloor {
            room: self.sequences.room.load(Ordering::SeqCst),
            reservation: self.sequences.reservation.load(Ordering::SeqCst),
            restriction: self.sequences.restriction.load(Ordering::SeqCst),
        }];

        let mut handles: Vec<_> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);

        for (_, handle) in handles {
            let rs = handle.read().await;
            events.push(Event::RoomCreated {
                room: rs.room.clone(),
            });
            for restriction in &rs.restrictions {
                match restriction.kind {
                    RestrictionKind::Block => events.push(Event::BlockAdded {
                        restriction: restriction.clone(),
                    }),
                    RestrictionKind::Booking { reservation_id } => {
                        match self.reservations.get(&reservation_id) {
                            Some(reservation) => events.push(Event::ReservationBooked {
                                reservation: reservation.clone(),
                                restriction_id: restriction.id,
                            }),
                            None => warn!(
                                restriction_id = restriction.id,
                                reservation_id, "booking without reservation dropped from WAL"
                            ),
                        }
                    }
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Rewrite {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
