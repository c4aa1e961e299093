//! Guest booking flow: search, pick a room, submit contact details, view the summary.
//!
//! The draft lives in the caller's [`Session`]. Nothing is persisted until `submit`
//! passes validation, and a booking is never rolled back because mail could not be
//! queued.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::engine::{Engine, EngineError, validate_stay};
use crate::forms::{FieldErrors, Form};
use crate::model::*;
use crate::notify::{Mailer, NotificationJob};
use crate::session::{Draft, Session, Stage};

pub const GUEST_SUBJECT: &str = "Reservation Confirmation";
pub const OWNER_SUBJECT: &str = "Reservation Notification";
pub const GUEST_TEMPLATE: &str = "basic.html";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug)]
pub enum WorkflowError {
    Validation(FieldErrors),
    NoDraft,
    NoRoomChosen,
    NoReservation,
    AlreadyBooked(ReservationId),
    Engine(EngineError),
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowError::Validation(errors) => write!(f, "invalid form: {errors}"),
            WorkflowError::NoDraft => write!(f, "no reservation in progress"),
            WorkflowError::NoRoomChosen => write!(f, "no room chosen"),
            WorkflowError::NoReservation => write!(f, "no completed reservation"),
            WorkflowError::AlreadyBooked(id) => {
                write!(f, "reservation {id} already submitted")
            }
            WorkflowError::Engine(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<EngineError> for WorkflowError {
    fn from(e: EngineError) -> Self {
        WorkflowError::Engine(e)
    }
}

/// Addresses used for outgoing mail.
#[derive(Debug, Clone)]
pub struct MailSettings {
    pub from: String,
    pub owner: String,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            from: "bnbbooking@gmail.com".into(),
            owner: "bnbbooking@gmail.com".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationStatus {
    Queued,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Booked {
    pub reservation: Reservation,
    pub room: Room,
    pub notification: NotificationStatus,
}

pub struct Workflow {
    engine: Arc<Engine>,
    mailer: Mailer,
    mail: MailSettings,
}

impl Workflow {
    pub fn new(engine: Arc<Engine>, mailer: Mailer, mail: MailSettings) -> Self {
        Self {
            engine,
            mailer,
            mail,
        }
    }

    /// Free rooms for the span. A non-empty result starts a new draft.
    pub async fn search(&self, session: &mut Session, span: Span) -> Result<Vec<Room>, WorkflowError> {
        let rooms = self.engine.free_rooms_for_range(span).await?;
        if !rooms.is_empty() {
            session.put_draft(Draft::new(span));
        }
        Ok(rooms)
    }

    /// Start a draft for a known room, as the direct booking link does.
    ///
    /// Availability is not checked here; a taken slot surfaces at `submit`.
    pub async fn book_room(
        &self,
        session: &mut Session,
        room_id: RoomId,
        span: Span,
    ) -> Result<Draft, WorkflowError> {
        validate_stay(&span)?;
        let room = self.engine.get_room(room_id).await?;
        let mut draft = Draft::new(span);
        draft.room = Some(room);
        session.put_draft(draft.clone());
        Ok(draft)
    }

    pub async fn choose_room(&self, session: &mut Session, room_id: RoomId) -> Result<Draft, WorkflowError> {
        if session.draft().is_none() {
            return Err(WorkflowError::NoDraft);
        }
        let room = self.engine.get_room(room_id).await?;
        let draft = session.draft_mut().ok_or(WorkflowError::NoDraft)?;
        if let Some(reservation) = &draft.reservation {
            return Err(WorkflowError::AlreadyBooked(reservation.id));
        }
        draft.room = Some(room);
        draft.stage = Stage::Drafted;
        Ok(draft.clone())
    }

    /// Validate the guest form, persist the booking, then queue both notifications.
    pub async fn submit(
        &self,
        session: &mut Session,
        fields: HashMap<String, String>,
    ) -> Result<Booked, WorkflowError> {
        let draft = session.draft_mut().ok_or(WorkflowError::NoDraft)?;
        if let Some(reservation) = &draft.reservation {
            return Err(WorkflowError::AlreadyBooked(reservation.id));
        }
        let room = draft.room.clone().ok_or(WorkflowError::NoRoomChosen)?;

        let mut form = Form::new(fields);
        form.required(&["first_name", "last_name", "email"]);
        form.min_length("first_name", 3);
        form.is_email("email");
        if !form.valid() {
            draft.stage = Stage::Drafted;
            return Err(WorkflowError::Validation(form.into_errors()));
        }
        draft.stage = Stage::FormValidated;

        let guest = Guest {
            first_name: form.get("first_name").to_string(),
            last_name: form.get("last_name").to_string(),
            email: form.get("email").to_string(),
            phone: form.get("phone").to_string(),
        };
        let new = NewReservation {
            room_id: room.id,
            span: draft.span,
            guest,
        };
        let reservation = match self.engine.book(new).await {
            Ok(r) => r,
            Err(e) => {
                draft.stage = Stage::Drafted;
                return Err(e.into());
            }
        };
        draft.reservation = Some(reservation.clone());
        draft.stage = Stage::Persisted;

        let notification = self.notify(&reservation, &room);
        draft.stage = match notification {
            NotificationStatus::Queued => Stage::Notified,
            NotificationStatus::Failed => Stage::NotifyFailed,
        };
        Ok(Booked {
            reservation,
            room,
            notification,
        })
    }

    fn notify(&self, reservation: &Reservation, room: &Room) -> NotificationStatus {
        let start = reservation.span.start.format(DATE_FORMAT);
        let end = reservation.span.end.format(DATE_FORMAT);

        let guest_body = format!(
            "<strong>Reservation Confirmation</strong><br>Dear {}, <br>This is to confirm your reservation from {start} to {end}.",
            reservation.guest.first_name
        );
        let guest_job = NotificationJob::new(
            &reservation.guest.email,
            &self.mail.from,
            GUEST_SUBJECT,
            guest_body,
        )
        .with_template(GUEST_TEMPLATE);

        let owner_body = format!(
            "<strong>Reservation Notification</strong><br>A reservation has been made for {} from {start} to {end}.",
            room.name
        );
        let owner_job = NotificationJob::new(&self.mail.owner, &self.mail.from, OWNER_SUBJECT, owner_body);

        let mut status = NotificationStatus::Queued;
        for job in [guest_job, owner_job] {
            if let Err(e) = self.mailer.enqueue(job) {
                warn!(reservation_id = reservation.id, "booking kept, notification not queued: {e}");
                status = NotificationStatus::Failed;
            }
        }
        if status == NotificationStatus::Queued {
            info!(reservation_id = reservation.id, "booking notifications queued");
        }
        status
    }

    /// Pop the draft once its reservation is persisted.
    pub fn summary(&self, session: &mut Session) -> Result<Draft, WorkflowError> {
        match session.draft() {
            Some(d) if d.stage.is_persisted() => {}
            _ => return Err(WorkflowError::NoReservation),
        }
        let mut draft = session.take_draft().ok_or(WorkflowError::NoReservation)?;
        if draft.stage != Stage::NotifyFailed {
            draft.stage = Stage::Complete;
        }
        Ok(draft)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::engine::ReservationFilter;
    use crate::limits::DEFAULT_STORAGE_TIMEOUT;
    use crate::mail::memory::MemoryTransport;
    use crate::notify::DispatcherConfig;
    use tokio_test::assert_ok;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("innkeep_test_workflow");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn setup(name: &str) -> (Workflow, Arc<MemoryTransport>) {
        let engine = Arc::new(Engine::new(test_wal_path(name), DEFAULT_STORAGE_TIMEOUT).unwrap());
        engine
            .create_room(None, "General's Quarters".into())
            .await
            .unwrap();
        engine.create_room(None, "Major's Suite".into()).await.unwrap();
        let transport = Arc::new(MemoryTransport::default());
        let config = DispatcherConfig {
            retry_backoff: Duration::from_millis(1),
            template_dir: std::env::temp_dir().join("innkeep_no_templates"),
            ..DispatcherConfig::default()
        };
        let mailer = Mailer::start(transport.clone(), config);
        (Workflow::new(engine, mailer, MailSettings::default()), transport)
    }

    fn fields(first: &str, email: &str) -> HashMap<String, String> {
        [
            ("first_name", first),
            ("last_name", "Smith"),
            ("email", email),
            ("phone", "555-0100"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[tokio::test]
    async fn full_flow_books_and_notifies() {
        let (wf, transport) = setup("full_flow.wal").await;
        let mut session = Session::new("guest", false);

        let rooms = wf
            .search(&mut session, span("2024-03-10", "2024-03-15"))
            .await
            .unwrap();
        assert_eq!(rooms.len(), 2);
        wf.choose_room(&mut session, 1).await.unwrap();

        let booked = wf
            .submit(&mut session, fields("John", "john@example.com"))
            .await
            .unwrap();
        assert_eq!(booked.notification, NotificationStatus::Queued);
        assert_eq!(booked.reservation.room_id, 1);
        assert_eq!(session.draft().unwrap().stage, Stage::Notified);

        let summary = wf.summary(&mut session).unwrap();
        assert_eq!(summary.stage, Stage::Complete);
        assert_eq!(summary.reservation.unwrap().guest.first_name, "John");
        assert!(session.draft().is_none());

        wf.mailer.drain().await;
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].to, "john@example.com");
        assert_eq!(sent[0].subject, GUEST_SUBJECT);
        assert!(sent[0].body.contains("Dear John"));
        assert!(sent[0].body.contains("from 2024-03-10 to 2024-03-15"));
        assert_eq!(sent[1].to, "bnbbooking@gmail.com");
        assert_eq!(sent[1].subject, OWNER_SUBJECT);
        assert!(sent[1].body.contains("made for General's Quarters"));
    }

    #[tokio::test]
    async fn invalid_email_writes_nothing() {
        let (wf, _) = setup("bad_email.wal").await;
        let mut session = Session::new("guest", false);
        wf.book_room(&mut session, 1, span("2024-03-10", "2024-03-12"))
            .await
            .unwrap();

        let err = wf
            .submit(&mut session, fields("John", "not-an-email"))
            .await
            .unwrap_err();
        match err {
            WorkflowError::Validation(errors) => {
                assert_eq!(errors.get("email"), Some(crate::forms::INVALID_EMAIL));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(session.draft().unwrap().stage, Stage::Drafted);
        assert!(wf.engine.list_reservations(ReservationFilter::All).is_empty());
        let window = span("2024-01-01", "2025-01-01");
        assert!(wf.engine.restrictions_for_room(1, window).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn short_first_name_rejected() {
        let (wf, _) = setup("short_name.wal").await;
        let mut session = Session::new("guest", false);
        wf.book_room(&mut session, 1, span("2024-03-10", "2024-03-12"))
            .await
            .unwrap();
        let err = wf
            .submit(&mut session, fields("Jo", "jo@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(e) if e.get("first_name").is_some()));
    }

    #[tokio::test]
    async fn steps_need_session_state() {
        let (wf, _) = setup("no_draft.wal").await;
        let mut session = Session::new("guest", false);
        assert!(matches!(
            wf.choose_room(&mut session, 1).await,
            Err(WorkflowError::NoDraft)
        ));
        assert!(matches!(
            wf.submit(&mut session, fields("John", "john@example.com")).await,
            Err(WorkflowError::NoDraft)
        ));
        assert!(matches!(wf.summary(&mut session), Err(WorkflowError::NoReservation)));

        wf.search(&mut session, span("2024-03-10", "2024-03-12"))
            .await
            .unwrap();
        assert!(matches!(
            wf.submit(&mut session, fields("John", "john@example.com")).await,
            Err(WorkflowError::NoRoomChosen)
        ));
        assert!(matches!(wf.summary(&mut session), Err(WorkflowError::NoReservation)));
    }

    #[tokio::test]
    async fn search_without_free_rooms_keeps_no_draft() {
        let (wf, _) = setup("search_full.wal").await;
        let window = span("2024-03-10", "2024-03-12");
        wf.engine.add_block(1, window).await.unwrap();
        wf.engine.add_block(2, window).await.unwrap();

        let mut session = Session::new("guest", false);
        let rooms = wf.search(&mut session, window).await.unwrap();
        assert!(rooms.is_empty());
        assert!(session.draft().is_none());
    }

    #[tokio::test]
    async fn book_room_rejects_unknown_room_and_bad_range() {
        let (wf, _) = setup("book_room_errors.wal").await;
        let mut session = Session::new("guest", false);
        assert!(matches!(
            wf.book_room(&mut session, 99, span("2024-03-10", "2024-03-12")).await,
            Err(WorkflowError::Engine(EngineError::RoomNotFound(99)))
        ));
        assert!(matches!(
            wf.book_room(&mut session, 1, span("2024-03-10", "2024-03-10")).await,
            Err(WorkflowError::Engine(EngineError::InvalidRange(_)))
        ));
    }

    #[tokio::test]
    async fn concurrent_submissions_book_at_most_once() {
        let (wf, _) = setup("concurrent_submit.wal").await;
        let wf = Arc::new(wf);
        let mut handles = Vec::new();
        for n in 0..8 {
            let wf = wf.clone();
            handles.push(tokio::spawn(async move {
                let mut session = Session::new(format!("guest{n}"), false);
                wf.book_room(&mut session, 1, span("2024-03-10", "2024-03-15"))
                    .await
                    .unwrap();
                wf.submit(&mut session, fields("John", "john@example.com"))
                    .await
            }));
        }
        let mut won = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => won += 1,
                Err(WorkflowError::Engine(EngineError::SlotTaken { room_id: 1, .. })) => {}
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(wf.engine.list_reservations(ReservationFilter::All).len(), 1);
    }

    #[tokio::test]
    async fn closed_queue_keeps_booking_as_notify_failed() {
        let (wf, transport) = setup("notify_failed.wal").await;
        wf.mailer.drain().await;

        let mut session = Session::new("guest", false);
        wf.book_room(&mut session, 2, span("2024-04-01", "2024-04-03"))
            .await
            .unwrap();
        let booked = wf
            .submit(&mut session, fields("Alice", "alice@example.com"))
            .await
            .unwrap();
        assert_eq!(booked.notification, NotificationStatus::Failed);
        assert!(wf.engine.get_reservation(booked.reservation.id).is_ok());

        let summary = assert_ok!(wf.summary(&mut session));
        assert_eq!(summary.stage, Stage::NotifyFailed);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn resubmitting_a_booked_draft_is_refused() {
        let (wf, _) = setup("resubmit.wal").await;
        let mut session = Session::new("guest", false);
        wf.book_room(&mut session, 1, span("2024-05-01", "2024-05-02"))
            .await
            .unwrap();
        let booked = wf
            .submit(&mut session, fields("John", "john@example.com"))
            .await
            .unwrap();
        let id = booked.reservation.id;
        assert!(matches!(
            wf.submit(&mut session, fields("John", "john@example.com")).await,
            Err(WorkflowError::AlreadyBooked(got)) if got == id
        ));
    }
}
