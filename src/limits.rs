use crate::model::Ms;

// ── Slot & duration bounds ───────────────────────────────────────

/// Shortest bookable slot, minutes.
pub const MIN_SLOT_MINUTES: u32 = 15;
/// Longest bookable slot, minutes.
pub const MAX_SLOT_MINUTES: u32 = 480;

// ── Capacity bounds ──────────────────────────────────────────────

/// Lowest capacity `set_capacity` accepts.
pub const MIN_DAY_CAPACITY: u32 = 1;
/// Highest capacity `set_capacity` accepts.
pub const MAX_DAY_CAPACITY: u32 = 50;

/// Widest date range (inclusive, in days) a bulk capacity update may span.
pub const MAX_RANGE_DAYS: i64 = 90;

// ── Availability query bounds ────────────────────────────────────

/// Widest look-ahead horizon for open-slot listings, days.
pub const MAX_HORIZON_DAYS: u32 = 90;
/// Horizon used when the query does not specify one.
pub const DEFAULT_HORIZON_DAYS: u32 = 7;

// ── Booking time rules ───────────────────────────────────────────

/// Generic booking updates may not move an appointment that starts
/// within this window.
pub const UPDATE_CUTOFF_MS: Ms = 24 * 3_600_000;

// ── Calendar sync settings bounds ────────────────────────────────

pub const MIN_SYNC_FREQUENCY_MINUTES: u32 = 5;
pub const MAX_SYNC_FREQUENCY_MINUTES: u32 = 1440;
/// Longest reminder lead time, minutes (7 days).
pub const MAX_REMINDER_MINUTES: u32 = 10_080;

// ── Input size caps ──────────────────────────────────────────────

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_PACKAGE_MEMBERS: usize = 16;
pub const MAX_SELECTED_OPTIONALS: usize = 16;
pub const MAX_REMINDERS: usize = 8;

// ── Timestamp sanity window ──────────────────────────────────────

/// 2000-01-01T00:00:00Z — anything earlier is a caller bug.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
