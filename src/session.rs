use std::collections::HashMap;

use ulid::Ulid;

use crate::calendar::{BlockScratch, MonthWindow};
use crate::model::{Reservation, Room, Span};

/// Where a booking attempt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Drafted,
    FormValidated,
    Persisted,
    Notified,
    /// Persisted, but a notification could not be queued.
    NotifyFailed,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Drafted => "drafted",
            Stage::FormValidated => "form_validated",
            Stage::Persisted => "persisted",
            Stage::Notified => "notified",
            Stage::NotifyFailed => "notify_failed",
            Stage::Complete => "complete",
        }
    }

    /// The reservation exists in storage.
    pub fn is_persisted(&self) -> bool {
        matches!(
            self,
            Stage::Persisted | Stage::Notified | Stage::NotifyFailed | Stage::Complete
        )
    }
}

/// An in-progress booking carried between the search, choose-room and submit steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub span: Span,
    pub room: Option<Room>,
    pub reservation: Option<Reservation>,
    pub stage: Stage,
}

impl Draft {
    pub fn new(span: Span) -> Self {
        Self {
            span,
            room: None,
            reservation: None,
            stage: Stage::Drafted,
        }
    }
}

/// Per-connection state, passed explicitly to every step that needs it.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Ulid,
    pub user: String,
    pub admin: bool,
    draft: Option<Draft>,
    block_scratch: HashMap<(i32, u32), BlockScratch>,
}

impl Session {
    pub fn new(user: impl Into<String>, admin: bool) -> Self {
        Self {
            id: Ulid::new(),
            user: user.into(),
            admin,
            draft: None,
            block_scratch: HashMap::new(),
        }
    }

    pub fn draft(&self) -> Option<&Draft> {
        self.draft.as_ref()
    }

    pub fn draft_mut(&mut self) -> Option<&mut Draft> {
        self.draft.as_mut()
    }

    pub fn put_draft(&mut self, draft: Draft) {
        self.draft = Some(draft);
    }

    pub fn take_draft(&mut self) -> Option<Draft> {
        self.draft.take()
    }

    pub fn put_block_scratch(&mut self, window: &MonthWindow, scratch: BlockScratch) {
        self.block_scratch.insert(window.key(), scratch);
    }

    /// Pop-once: a second submission for the same month recomputes from storage.
    pub fn take_block_scratch(&mut self, window: &MonthWindow) -> Option<BlockScratch> {
        self.block_scratch.remove(&window.key())
    }

    pub fn clear(&mut self) {
        self.draft = None;
        self.block_scratch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::span;

    #[test]
    fn draft_put_take() {
        let mut s = Session::new("guest", false);
        assert!(s.draft().is_none());
        s.put_draft(Draft::new(span("2024-03-10", "2024-03-12")));
        s.draft_mut().unwrap().stage = Stage::FormValidated;
        assert_eq!(s.draft().unwrap().stage, Stage::FormValidated);
        assert!(s.take_draft().is_some());
        assert!(s.take_draft().is_none());
    }

    #[test]
    fn block_scratch_is_per_month_and_pops_once() {
        let mut s = Session::new("admin", true);
        let march = MonthWindow::new(2024, 3).unwrap();
        let april = march.next();
        s.put_block_scratch(&march, BlockScratch::new());
        assert!(s.take_block_scratch(&april).is_none());
        assert!(s.take_block_scratch(&march).is_some());
        assert!(s.take_block_scratch(&march).is_none());
    }

    #[test]
    fn persisted_stages() {
        assert!(!Stage::Drafted.is_persisted());
        assert!(!Stage::FormValidated.is_persisted());
        assert!(Stage::NotifyFailed.is_persisted());
        assert_eq!(Stage::NotifyFailed.as_str(), "notify_failed");
    }
}
