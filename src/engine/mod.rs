mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{merge_overlapping, openings, subtract_intervals};
pub use error::EngineError;

pub(crate) use conflict::{now_ms, validate_stay};

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};

use crate::model::*;
use crate::wal::{self, Wal, WalCommand};

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Result of an idempotent delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// Nothing to delete; another session got there first.
    AlreadyGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFilter {
    All,
    Unprocessed,
}

/// Monotonic id sources. Replay raises them past every id seen in the log.
#[derive(Default)]
struct Sequences {
    room: AtomicI64,
    reservation: AtomicI64,
    restriction: AtomicI64,
}

impl Sequences {
    fn next(counter: &AtomicI64) -> i64 {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn observe(&self, event: &Event) {
        match event {
            Event::RoomCreated { room } => {
                self.room.fetch_max(room.id, Ordering::SeqCst);
            }
            Event::ReservationBooked {
                reservation,
                restriction_id,
            } => {
                self.reservation.fetch_max(reservation.id, Ordering::SeqCst);
                self.restriction.fetch_max(*restriction_id, Ordering::SeqCst);
            }
            Event::BlockAdded { restriction } => {
                self.restriction.fetch_max(restriction.id, Ordering::SeqCst);
            }
            Event::SequenceFloor {
                room,
                reservation,
                restriction,
            } => {
                self.room.fetch_max(*room, Ordering::SeqCst);
                self.reservation.fetch_max(*reservation, Ordering::SeqCst);
                self.restriction.fetch_max(*restriction, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

/// The interval store: rooms, their restrictions, and the reservations behind bookings.
///
/// Every mutation is appended to the WAL before it is applied, while the room's write
/// lock is held. Conflict checks happen under that same lock, so two restrictions of
/// one room can never overlap.
pub struct Engine {
    rooms: DashMap<RoomId, SharedRoomState>,
    reservations: DashMap<ReservationId, Reservation>,
    /// restriction id → room id
    restriction_rooms: DashMap<RestrictionId, RoomId>,
    /// reservation id → its booking restriction
    booking_restrictions: DashMap<ReservationId, RestrictionId>,
    sequences: Sequences,
    /// Serializes room creation (existence check + insert).
    room_creation: tokio::sync::Mutex<()>,
    /// Mutations hold it shared; compaction holds it exclusively.
    barrier: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    storage_timeout: Duration,
}

impl Engine {
    pub fn new(wal_path: PathBuf, storage_timeout: Duration) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let wal_tx = wal::spawn_writer(wal, 4096);

        let engine = Self {
            rooms: DashMap::new(),
            reservations: DashMap::new(),
            restriction_rooms: DashMap::new(),
            booking_restrictions: DashMap::new(),
            sequences: Sequences::default(),
            room_creation: tokio::sync::Mutex::new(()),
            barrier: RwLock::new(()),
            wal_tx,
            storage_timeout,
        };

        // Rebuild plain room states first; nothing else can see them yet.
        let mut states: HashMap<RoomId, RoomState> = HashMap::new();
        for event in &events {
            engine.sequences.observe(event);
            match event {
                Event::RoomCreated { room } => {
                    states.insert(room.id, RoomState::new(room.clone()));
                }
                Event::SequenceFloor { .. } => {}
                other => {
                    let Some(room_id) = other.room_id() else { continue };
                    match states.get_mut(&room_id) {
                        Some(rs) => engine.apply(rs, other),
                        None => warn!(room_id, "WAL event for unknown room skipped"),
                    }
                }
            }
        }
        for (id, rs) in states {
            engine.rooms.insert(id, Arc::new(RwLock::new(rs)));
        }

        info!(
            path = %wal_path.display(),
            events = events.len(),
            rooms = engine.rooms.len(),
            reservations = engine.reservations.len(),
            "store loaded"
        );
        Ok(engine)
    }

    pub fn storage_timeout(&self) -> Duration {
        self.storage_timeout
    }

    /// Bound a storage step by the engine deadline.
    pub(super) async fn deadline<F: Future>(&self, fut: F) -> Result<F::Output, EngineError> {
        tokio::time::timeout(self.storage_timeout, fut)
            .await
            .map_err(|_| EngineError::Timeout(self.storage_timeout))
    }

    pub(super) fn room_handle(&self, id: RoomId) -> Result<SharedRoomState, EngineError> {
        self.rooms
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::RoomNotFound(id))
    }

    /// Take the room's write lock under the deadline.
    pub(super) async fn lock_room(
        &self,
        id: RoomId,
    ) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let rs = self.room_handle(id)?;
        self.deadline(rs.write_owned()).await
    }

    /// Hand an event to the group-commit writer and wait for it to be durable.
    ///
    /// Only the hand-off is bounded by the deadline. Once the writer owns the record it
    /// always answers, and the caller must apply what it acknowledges.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.deadline(self.wal_tx.send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        }))
        .await?
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Append to the WAL, then apply to the locked room.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply(rs, event);
        Ok(())
    }

    /// Apply an event to a room the caller has locked, plus the engine-wide indexes.
    fn apply(&self, rs: &mut RoomState, event: &Event) {
        match event {
            Event::ReservationBooked {
                reservation,
                restriction_id,
            } => {
                rs.insert_restriction(Restriction {
                    id: *restriction_id,
                    room_id: reservation.room_id,
                    span: reservation.span,
                    kind: RestrictionKind::Booking {
                        reservation_id: reservation.id,
                    },
                    created_at: reservation.created_at,
                });
                self.restriction_rooms
                    .insert(*restriction_id, reservation.room_id);
                self.booking_restrictions
                    .insert(reservation.id, *restriction_id);
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationUpdated {
                id,
                guest,
                processed,
                at,
                ..
            } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    if let Some(guest) = guest {
                        r.guest = guest.clone();
                    }
                    if let Some(processed) = processed {
                        r.processed = *processed;
                    }
                    r.updated_at = *at;
                }
            }
            Event::ReservationDeleted {
                id, restriction_id, ..
            } => {
                if let Some(rid) = restriction_id {
                    rs.remove_restriction(*rid);
                    self.restriction_rooms.remove(rid);
                }
                self.booking_restrictions.remove(id);
                self.reservations.remove(id);
            }
            Event::BlockAdded { restriction } => {
                self.restriction_rooms
                    .insert(restriction.id, restriction.room_id);
                rs.insert_restriction(restriction.clone());
            }
            Event::BlockRemoved { id, .. } => {
                rs.remove_restriction(*id);
                self.restriction_rooms.remove(id);
            }
            // Room creation is handled at the map level.
            Event::RoomCreated { .. } | Event::SequenceFloor { .. } => {}
        }
    }
}
