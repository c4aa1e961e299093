//! Month occupancy grid and reconciliation of posted block edits.
//!
//! The grid stamps each room's bookings and owner blocks onto the days of one month.
//! Its block map is kept as session scratch and diffed against the admin's next
//! submission: existing blocks not retained are deleted, newly ticked days get a block.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use chrono::{Datelike, Months, NaiveDate};
use tracing::{info, warn};

use crate::engine::{Engine, EngineError, Removal};
use crate::limits::{MAX_FORM_FIELDS, MAX_YEAR, MIN_YEAR};
use crate::model::*;

/// Value of an unoccupied day in a [`DayMap`].
pub const FREE: i64 = 0;

const KEEP_PREFIX: &str = "remove_block_";
const ADD_PREFIX: &str = "add_block_";

#[derive(Debug)]
pub enum CalendarError {
    InvalidMonth { year: i32, month: u32 },
    MalformedField(String),
    TooManyFields,
    Storage(EngineError),
}

impl fmt::Display for CalendarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalendarError::InvalidMonth { year, month } => {
                write!(f, "invalid month: {year}-{month}")
            }
            CalendarError::MalformedField(name) => write!(f, "malformed block field: {name}"),
            CalendarError::TooManyFields => write!(f, "too many form fields"),
            CalendarError::Storage(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CalendarError {}

impl From<EngineError> for CalendarError {
    fn from(e: EngineError) -> Self {
        CalendarError::Storage(e)
    }
}

// ── Month window ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonthWindow {
    first: NaiveDate,
}

impl MonthWindow {
    pub fn new(year: i32, month: u32) -> Result<Self, CalendarError> {
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(CalendarError::InvalidMonth { year, month });
        }
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(|first| Self { first })
            .ok_or(CalendarError::InvalidMonth { year, month })
    }

    pub fn containing(day: NaiveDate) -> Self {
        Self {
            first: day.with_day(1).unwrap_or(day),
        }
    }

    pub fn year(&self) -> i32 {
        self.first.year()
    }

    pub fn month(&self) -> u32 {
        self.first.month()
    }

    /// Scratch key for this month.
    pub fn key(&self) -> (i32, u32) {
        (self.year(), self.month())
    }

    pub fn first_day(&self) -> NaiveDate {
        self.first
    }

    pub fn last_day(&self) -> NaiveDate {
        self.span().end.pred_opt().unwrap_or(self.first)
    }

    pub fn days_in_month(&self) -> u32 {
        self.last_day().day()
    }

    /// `[first of month, first of next month)`.
    pub fn span(&self) -> Span {
        Span::new(self.first, self.next().first)
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        self.span().days()
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.span().contains_day(day)
    }

    pub fn previous(&self) -> Self {
        Self {
            first: self.first - Months::new(1),
        }
    }

    pub fn next(&self) -> Self {
        Self {
            first: self.first + Months::new(1),
        }
    }
}

impl fmt::Display for MonthWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year(), self.month())
    }
}

// ── Grid ─────────────────────────────────────────────────

/// Every day of a month mapped to an id, or [`FREE`].
pub type DayMap = BTreeMap<NaiveDate, i64>;

/// Room id → block map, as last shown to the admin.
pub type BlockScratch = HashMap<RoomId, DayMap>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMonth {
    pub room: Room,
    /// Day → reservation id.
    pub reservations: DayMap,
    /// Day → block restriction id (start day of the block only).
    pub blocks: DayMap,
}

#[derive(Debug, Clone)]
pub struct MonthGrid {
    pub window: MonthWindow,
    pub rooms: Vec<RoomMonth>,
}

impl MonthGrid {
    pub fn block_scratch(&self) -> BlockScratch {
        self.rooms
            .iter()
            .map(|rm| (rm.room.id, rm.blocks.clone()))
            .collect()
    }
}

fn empty_month(window: &MonthWindow) -> DayMap {
    window.days().map(|d| (d, FREE)).collect()
}

/// Stamp one room's restrictions onto the days of `window`.
pub fn stamp_room(room: Room, restrictions: &[Restriction], window: &MonthWindow) -> RoomMonth {
    let mut reservations = empty_month(window);
    let mut blocks = empty_month(window);
    let month = window.span();

    for r in restrictions {
        match r.kind {
            RestrictionKind::Booking { reservation_id } => {
                if let Some(visible) = r.span.clamp(&month) {
                    for day in visible.days() {
                        reservations.insert(day, reservation_id);
                    }
                }
            }
            RestrictionKind::Block => {
                if window.contains(r.span.start) {
                    blocks.insert(r.span.start, r.id);
                }
            }
        }
    }

    RoomMonth {
        room,
        reservations,
        blocks,
    }
}

/// Build the grid for every room, ordered by room id.
pub async fn month_grid(engine: &Engine, window: &MonthWindow) -> Result<MonthGrid, CalendarError> {
    let rooms = engine.list_rooms().await?;
    let mut grid = Vec::with_capacity(rooms.len());
    for room in rooms {
        let restrictions = engine.restrictions_for_room(room.id, window.span()).await?;
        grid.push(stamp_room(room, &restrictions, window));
    }
    Ok(MonthGrid {
        window: *window,
        rooms: grid,
    })
}

// ── Form keys ────────────────────────────────────────────

/// `2024-03-5`: zero-padded month, unpadded day, as the calendar form posts it.
pub fn day_key(day: NaiveDate) -> String {
    format!("{}-{:02}-{}", day.year(), day.month(), day.day())
}

/// Accepts both padded and unpadded month/day.
pub fn parse_day_key(s: &str) -> Option<NaiveDate> {
    let mut parts = s.splitn(3, '-');
    let year = parts.next()?.parse().ok()?;
    let month = parts.next()?.parse().ok()?;
    let day = parts.next()?.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn parse_room_day(name: &str, rest: &str) -> Result<(RoomId, NaiveDate), CalendarError> {
    let malformed = || CalendarError::MalformedField(name.to_string());
    let (room, day) = rest.split_once('_').ok_or_else(malformed)?;
    let room: RoomId = room.parse().map_err(|_| malformed())?;
    let day = parse_day_key(day).ok_or_else(malformed)?;
    Ok((room, day))
}

pub fn keep_field(room_id: RoomId, day: NaiveDate) -> String {
    format!("{KEEP_PREFIX}{room_id}_{}", day_key(day))
}

pub fn add_field(room_id: RoomId, day: NaiveDate) -> String {
    format!("{ADD_PREFIX}{room_id}_{}", day_key(day))
}

/// The admin's posted block state for a month.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockForm {
    /// Existing blocks the admin left ticked.
    pub retained: HashSet<(RoomId, NaiveDate)>,
    /// Free days the admin ticked.
    pub added: BTreeSet<(RoomId, NaiveDate)>,
}

impl BlockForm {
    /// Parse posted field names. Fields without a block prefix are ignored.
    pub fn parse<'a, I>(fields: I) -> Result<Self, CalendarError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut form = BlockForm::default();
        for (n, name) in fields.into_iter().enumerate() {
            if n >= MAX_FORM_FIELDS {
                return Err(CalendarError::TooManyFields);
            }
            if let Some(rest) = name.strip_prefix(KEEP_PREFIX) {
                form.retained.insert(parse_room_day(name, rest)?);
            } else if let Some(rest) = name.strip_prefix(ADD_PREFIX) {
                form.added.insert(parse_room_day(name, rest)?);
            }
        }
        Ok(form)
    }

    /// Parse an `&`-separated field list, e.g. `remove_block_1_2024-03-5&add_block_1_2024-03-20`.
    /// A `name=value` pair counts by name only.
    pub fn parse_encoded(encoded: &str) -> Result<Self, CalendarError> {
        Self::parse(
            encoded
                .split('&')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(|f| f.split_once('=').map_or(f, |(name, _)| name)),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockPlan {
    pub to_delete: Vec<(RoomId, NaiveDate, RestrictionId)>,
    pub to_add: Vec<(RoomId, NaiveDate)>,
}

impl BlockPlan {
    pub fn is_empty(&self) -> bool {
        self.to_delete.is_empty() && self.to_add.is_empty()
    }
}

/// `to_delete = existing \ retained`, `to_add = posted \ existing`.
pub fn plan(scratch: &BlockScratch, form: &BlockForm) -> BlockPlan {
    let mut existing: Vec<(RoomId, NaiveDate, RestrictionId)> = scratch
        .iter()
        .flat_map(|(room, days)| {
            days.iter()
                .filter(|(_, id)| **id != FREE)
                .map(move |(day, id)| (*room, *day, *id))
        })
        .collect();
    existing.sort();

    let shown: HashSet<(RoomId, NaiveDate)> =
        existing.iter().map(|(room, day, _)| (*room, *day)).collect();

    BlockPlan {
        to_delete: existing
            .into_iter()
            .filter(|(room, day, _)| !form.retained.contains(&(*room, *day)))
            .collect(),
        to_add: form
            .added
            .iter()
            .filter(|key| !shown.contains(key))
            .copied()
            .collect(),
    }
}

// ── Reconciliation ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    Deleted,
    /// The block was already removed, e.g. by another admin session.
    AlreadyGone,
    Added(RestrictionId),
    Rejected(String),
}

impl ReconcileAction {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileAction::Deleted => "deleted",
            ReconcileAction::AlreadyGone => "already_gone",
            ReconcileAction::Added(_) => "added",
            ReconcileAction::Rejected(_) => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileEntry {
    pub room_id: RoomId,
    pub day: NaiveDate,
    pub action: ReconcileAction,
}

fn record(entries: &mut Vec<ReconcileEntry>, room_id: RoomId, day: NaiveDate, action: ReconcileAction) {
    metrics::counter!(crate::observability::RECONCILE_ACTIONS_TOTAL, "action" => action.label())
        .increment(1);
    match &action {
        ReconcileAction::Rejected(reason) => {
            warn!(room_id, day = %day, reason = %reason, "block change rejected")
        }
        other => info!(room_id, day = %day, action = other.label(), "block reconciled"),
    }
    entries.push(ReconcileEntry {
        room_id,
        day,
        action,
    });
}

/// Outcome for one failed step: storage failures abort, everything else is reported.
fn rejected(e: EngineError) -> Result<ReconcileAction, CalendarError> {
    if e.is_storage() {
        return Err(CalendarError::Storage(e));
    }
    Ok(ReconcileAction::Rejected(e.to_string()))
}

/// Apply a plan: every delete first, then every insert.
pub async fn reconcile(engine: &Engine, plan: &BlockPlan) -> Result<Vec<ReconcileEntry>, CalendarError> {
    let mut entries = Vec::with_capacity(plan.to_delete.len() + plan.to_add.len());

    for &(room_id, day, restriction_id) in &plan.to_delete {
        let action = match engine.remove_block(restriction_id).await {
            Ok(Removal::Removed) => ReconcileAction::Deleted,
            Ok(Removal::AlreadyGone) => ReconcileAction::AlreadyGone,
            Err(e) => rejected(e)?,
        };
        record(&mut entries, room_id, day, action);
    }

    for &(room_id, day) in &plan.to_add {
        let action = match engine.add_block(room_id, Span::single_day(day)).await {
            Ok(id) => ReconcileAction::Added(id),
            Err(e) => rejected(e)?,
        };
        record(&mut entries, room_id, day, action);
    }

    Ok(entries)
}

/// Reconcile a posted form for `window`.
///
/// `scratch` is the block map the admin was shown. When it is missing (new session,
/// or already consumed) the map is rebuilt from storage.
pub async fn submit_blocks(
    engine: &Engine,
    window: &MonthWindow,
    scratch: Option<BlockScratch>,
    form: &BlockForm,
) -> Result<Vec<ReconcileEntry>, CalendarError> {
    let scratch = match scratch {
        Some(s) => s,
        None => month_grid(engine, window).await?.block_scratch(),
    };
    let plan = plan(&scratch, form);
    reconcile(engine, &plan).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::DEFAULT_STORAGE_TIMEOUT;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("innkeep_test_calendar");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn march() -> MonthWindow {
        MonthWindow::new(2024, 3).unwrap()
    }

    fn room(id: RoomId) -> Room {
        Room {
            id,
            name: format!("Room {id}"),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn restriction(id: RestrictionId, s: Span, kind: RestrictionKind) -> Restriction {
        Restriction {
            id,
            room_id: 1,
            span: s,
            kind,
            created_at: 0,
        }
    }

    fn nonzero(map: &DayMap) -> Vec<(u32, i64)> {
        map.iter()
            .filter(|(_, v)| **v != FREE)
            .map(|(d, v)| (d.day(), *v))
            .collect()
    }

    #[test]
    fn month_window_navigation() {
        let w = MonthWindow::new(2024, 2).unwrap();
        assert_eq!(w.days_in_month(), 29);
        assert_eq!(w.last_day(), day("2024-02-29"));
        assert_eq!(w.previous(), MonthWindow::new(2024, 1).unwrap());
        assert_eq!(w.next(), march());
        assert_eq!(MonthWindow::new(2024, 12).unwrap().next().key(), (2025, 1));
        assert_eq!(MonthWindow::new(2024, 1).unwrap().previous().key(), (2023, 12));
        assert_eq!(MonthWindow::containing(day("2024-03-17")), march());
        assert_eq!(march().to_string(), "2024-03");
    }

    #[test]
    fn month_window_rejects_bad_month() {
        assert!(matches!(
            MonthWindow::new(2024, 13),
            Err(CalendarError::InvalidMonth { year: 2024, month: 13 })
        ));
        assert!(MonthWindow::new(2024, 0).is_err());
        assert!(MonthWindow::new(12, 5).is_err());
    }

    #[test]
    fn empty_room_is_all_free() {
        let rm = stamp_room(room(1), &[], &march());
        assert_eq!(rm.reservations.len(), 31);
        assert_eq!(rm.blocks.len(), 31);
        assert!(nonzero(&rm.reservations).is_empty());
        assert!(nonzero(&rm.blocks).is_empty());
    }

    #[test]
    fn booking_stamps_half_open_days_clamped_to_month() {
        let restrictions = [
            restriction(
                1,
                span("2024-02-27", "2024-03-03"),
                RestrictionKind::Booking { reservation_id: 7 },
            ),
            restriction(
                2,
                span("2024-03-30", "2024-04-02"),
                RestrictionKind::Booking { reservation_id: 8 },
            ),
        ];
        let rm = stamp_room(room(1), &restrictions, &march());
        assert_eq!(
            nonzero(&rm.reservations),
            vec![(1, 7), (2, 7), (30, 8), (31, 8)]
        );
    }

    #[test]
    fn block_stamps_start_day_inside_month_only() {
        let restrictions = [
            restriction(3, span("2024-02-28", "2024-03-04"), RestrictionKind::Block),
            restriction(4, span("2024-03-12", "2024-03-15"), RestrictionKind::Block),
        ];
        let rm = stamp_room(room(1), &restrictions, &march());
        assert_eq!(nonzero(&rm.blocks), vec![(12, 4)]);
        assert!(nonzero(&rm.reservations).is_empty());
    }

    #[test]
    fn day_keys() {
        assert_eq!(day_key(day("2024-03-05")), "2024-03-5");
        assert_eq!(parse_day_key("2024-03-5"), Some(day("2024-03-05")));
        assert_eq!(parse_day_key("2024-3-05"), Some(day("2024-03-05")));
        assert_eq!(parse_day_key("2024-02-30"), None);
        assert_eq!(parse_day_key("nope"), None);
        assert_eq!(keep_field(2, day("2024-03-20")), "remove_block_2_2024-03-20");
    }

    #[test]
    fn form_parse_ignores_unrelated_fields() {
        let form = BlockForm::parse([
            "csrf_token",
            "y",
            "m",
            "remove_block_1_2024-03-5",
            "add_block_2_2024-03-20",
        ])
        .unwrap();
        assert!(form.retained.contains(&(1, day("2024-03-05"))));
        assert!(form.added.contains(&(2, day("2024-03-20"))));
        assert_eq!(form.retained.len() + form.added.len(), 2);
    }

    #[test]
    fn form_parse_rejects_malformed_block_field() {
        for bad in ["add_block_x_2024-03-5", "add_block_1", "remove_block_1_2024-13-1"] {
            assert!(
                matches!(BlockForm::parse([bad]), Err(CalendarError::MalformedField(ref f)) if f == bad),
                "{bad}"
            );
        }
    }

    #[test]
    fn form_parse_encoded_pairs() {
        let form =
            BlockForm::parse_encoded("remove_block_1_2024-03-5=on&add_block_1_2024-03-20&").unwrap();
        assert_eq!(form.retained.len(), 1);
        assert_eq!(form.added.len(), 1);
    }

    #[test]
    fn plan_is_set_difference() {
        let mut blocks = empty_month(&march());
        blocks.insert(day("2024-03-05"), 11);
        blocks.insert(day("2024-03-12"), 12);
        let scratch: BlockScratch = [(1, blocks)].into_iter().collect();

        let form = BlockForm::parse([
            "remove_block_1_2024-03-5",
            "add_block_1_2024-03-20",
            // Already a block; not re-added.
            "add_block_1_2024-03-12",
        ])
        .unwrap();
        let p = plan(&scratch, &form);
        assert_eq!(p.to_delete, vec![(1, day("2024-03-12"), 12)]);
        assert_eq!(p.to_add, vec![(1, day("2024-03-20"))]);
    }

    #[test]
    fn plan_with_nothing_changed_is_empty() {
        let mut blocks = empty_month(&march());
        blocks.insert(day("2024-03-05"), 11);
        let scratch: BlockScratch = [(1, blocks)].into_iter().collect();
        let form = BlockForm::parse(["remove_block_1_2024-03-5"]).unwrap();
        assert!(plan(&scratch, &form).is_empty());
    }

    async fn engine_with_room(name: &str) -> Engine {
        let engine = Engine::new(test_wal_path(name), DEFAULT_STORAGE_TIMEOUT).unwrap();
        engine.create_room(Some(1), "General's Quarters".into()).await.unwrap();
        engine
    }

    fn block_days(grid: &MonthGrid) -> Vec<u32> {
        nonzero(&grid.rooms[0].blocks).iter().map(|(d, _)| *d).collect()
    }

    #[tokio::test]
    async fn reconcile_round_trip() {
        let engine = engine_with_room("round_trip.wal").await;
        engine.add_block(1, span("2024-03-05", "2024-03-06")).await.unwrap();
        engine.add_block(1, span("2024-03-12", "2024-03-13")).await.unwrap();

        let grid = month_grid(&engine, &march()).await.unwrap();
        assert_eq!(block_days(&grid), vec![5, 12]);

        let form =
            BlockForm::parse(["remove_block_1_2024-03-5", "add_block_1_2024-03-20"]).unwrap();
        let entries = submit_blocks(&engine, &march(), Some(grid.block_scratch()), &form)
            .await
            .unwrap();
        let actions: Vec<_> = entries.iter().map(|e| (e.day.day(), e.action.label())).collect();
        assert_eq!(actions, vec![(12, "deleted"), (20, "added")]);

        let after = month_grid(&engine, &march()).await.unwrap();
        assert_eq!(block_days(&after), vec![5, 20]);
    }

    #[tokio::test]
    async fn stale_scratch_delete_is_noop() {
        let engine = engine_with_room("stale_scratch.wal").await;
        let id = engine.add_block(1, span("2024-03-12", "2024-03-13")).await.unwrap();
        let scratch = month_grid(&engine, &march()).await.unwrap().block_scratch();

        // Another admin session removes it first.
        engine.remove_block(id).await.unwrap();

        let entries = submit_blocks(&engine, &march(), Some(scratch), &BlockForm::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, ReconcileAction::AlreadyGone);
    }

    #[tokio::test]
    async fn add_over_booking_is_rejected_not_fatal() {
        let engine = engine_with_room("add_over_booking.wal").await;
        engine
            .book(NewReservation {
                room_id: 1,
                span: span("2024-03-10", "2024-03-15"),
                guest: Guest::default(),
            })
            .await
            .unwrap();
        let form = BlockForm::parse([
            "add_block_1_2024-03-11",
            "add_block_1_2024-03-16",
            "add_block_9_2024-03-16",
        ])
        .unwrap();
        let entries = submit_blocks(&engine, &march(), None, &form).await.unwrap();
        let labels: Vec<_> = entries.iter().map(|e| e.action.label()).collect();
        assert_eq!(labels, vec!["rejected", "added", "rejected"]);
        assert_eq!(
            block_days(&month_grid(&engine, &march()).await.unwrap()),
            vec![16]
        );
    }

    #[tokio::test]
    async fn missing_scratch_recomputes_from_storage() {
        let engine = engine_with_room("missing_scratch.wal").await;
        engine.add_block(1, span("2024-03-05", "2024-03-06")).await.unwrap();
        engine.add_block(1, span("2024-03-12", "2024-03-13")).await.unwrap();
        let form = BlockForm::parse(["remove_block_1_2024-03-12"]).unwrap();
        let entries = submit_blocks(&engine, &march(), None, &form).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].day, day("2024-03-05"));
        assert_eq!(entries[0].action, ReconcileAction::Deleted);
    }
}
