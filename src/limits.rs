use std::time::Duration;

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_GUEST_FIELD_LEN: usize = 255;
pub const MAX_RESTRICTIONS_PER_ROOM: usize = 50_000;

/// Longest single reservation or block, in nights.
pub const MAX_SPAN_DAYS: i64 = 366;
/// Widest availability / restriction query window, in days.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 3 * 366;

pub const MIN_YEAR: i32 = 1970;
pub const MAX_YEAR: i32 = 9999;

/// Upper bound on fields in one posted calendar form.
pub const MAX_FORM_FIELDS: usize = 10_000;
pub const MAX_SQL_LENGTH: usize = 64 * 1024;

pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_secs(3);
