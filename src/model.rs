use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only timestamp type. All values are UTC and
/// minute-granular (multiples of [`MINUTE_MS`]).
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;

/// Calendar date of a timestamp, in the reporting timezone (UTC).
pub fn day_of(ts: Ms) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(ts)
        .expect("timestamp within validity window")
        .date_naive()
}

/// Midnight of `date` as a timestamp.
pub fn day_start_ms(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

pub fn is_minute_aligned(ts: Ms) -> bool {
    ts % MINUTE_MS == 0
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: Ms,
    pub end: Ms,
}

impl Slot {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Slot start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Slot) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_slot(&self, other: &Slot) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Reference data ───────────────────────────────────────────────

/// A bookable service and its scheduling configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: Option<String>,
    /// Slot length, minutes.
    pub duration_min: u32,
    /// Working-day open, minutes from midnight.
    pub open_min: u16,
    /// Working-day close, minutes from midnight. Must exceed `open_min`.
    pub close_min: u16,
    /// Earliest a booking may be placed: at least this many hours out.
    pub min_advance_hours: u32,
    /// Latest a booking may be placed: at most this many days out.
    pub max_advance_days: u32,
    pub requires_consultation: bool,
    pub consultation_duration_min: Option<u32>,
    /// Parent package, when the service is sold as part of one.
    pub package_id: Option<Ulid>,
    /// Per-day concurrent bookings allowed when no capacity record exists.
    pub default_capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMember {
    pub service_id: Ulid,
    pub optional: bool,
}

/// An ordered bundle of services booked as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePackage {
    pub id: Ulid,
    pub name: Option<String>,
    pub members: Vec<PackageMember>,
    /// Package-level advance window; members keep their own regardless.
    pub min_advance_hours: Option<u32>,
    pub max_advance_days: Option<u32>,
}

impl ServicePackage {
    /// Package-level bookability window check for a candidate timestamp.
    pub fn can_be_booked_on(&self, now: Ms, ts: Ms) -> bool {
        let lead = ts - now;
        if let Some(h) = self.min_advance_hours
            && lead < h as Ms * HOUR_MS
        {
            return false;
        }
        if let Some(d) = self.max_advance_days
            && lead > d as Ms * DAY_MS
        {
            return false;
        }
        true
    }

    pub fn is_optional_member(&self, service_id: &Ulid) -> bool {
        self.members
            .iter()
            .any(|m| m.optional && m.service_id == *service_id)
    }

    pub fn required_member_ids(&self) -> impl Iterator<Item = Ulid> + '_ {
        self.members
            .iter()
            .filter(|m| !m.optional)
            .map(|m| m.service_id)
    }
}

/// Optional sub-scope of a service with its own capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLocation {
    pub id: Ulid,
    pub service_id: Ulid,
    pub name: Option<String>,
    /// Overrides the service's `default_capacity` when set.
    pub capacity: Option<u32>,
}

// ── Availability exceptions ──────────────────────────────────────

/// Discriminant of an exception, used for type-conditional field rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionType {
    Blocked,
    CustomHours,
    SpecialPricing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionKind {
    /// The whole day is unbookable.
    Blocked,
    /// Replaces the service's working window for the day.
    CustomHours { open_min: u16, close_min: u16 },
    /// Pricing override, basis points relative to the list price.
    SpecialPricing { price_modifier_bps: i32 },
}

impl ExceptionKind {
    pub fn exception_type(&self) -> ExceptionType {
        match self {
            ExceptionKind::Blocked => ExceptionType::Blocked,
            ExceptionKind::CustomHours { .. } => ExceptionType::CustomHours,
            ExceptionKind::SpecialPricing { .. } => ExceptionType::SpecialPricing,
        }
    }
}

/// Date-scoped override of a service's default availability or pricing.
/// At most one exception exists per (service, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityException {
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub kind: ExceptionKind,
}

// ── Capacity ledger ──────────────────────────────────────────────

/// The unit of capacity accounting. Ordering is the global lock order:
/// service, then location, then day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellKey {
    pub service_id: Ulid,
    pub location_id: Option<Ulid>,
    pub day: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapacityAction {
    Block,
    Unblock,
    SetCapacity,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Confirmed, Completed)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
        )
    }

    /// Pending and Confirmed bookings may still move or be cancelled;
    /// terminal ones may not.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What a booking reserves: a single service, or a package with an explicit
/// choice among its optional members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingTarget {
    Service { id: Ulid },
    Package { id: Ulid, selected_optional: Vec<Ulid> },
}

impl BookingTarget {
    pub fn id(&self) -> Ulid {
        match self {
            BookingTarget::Service { id } | BookingTarget::Package { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientContact {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsultationRecord {
    pub notes: String,
    /// The accept/decline decision. Declining cancels the booking.
    pub proceed: bool,
    pub recommended_services: Vec<Ulid>,
    pub estimated_duration_min: Option<u32>,
    pub completed_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub target: BookingTarget,
    pub location_id: Option<Ulid>,
    pub client: ClientContact,
    pub scheduled_at: Ms,
    pub status: BookingStatus,
    pub requires_consultation: bool,
    pub consultation: Option<ConsultationRecord>,
    pub notes: Option<String>,
    /// Capacity cells consumed by this booking, fixed at reservation time so
    /// release stays exact even if service configuration later changes.
    pub cells: Vec<CellKey>,
}

// ── Calendar sync settings (boundary contract) ───────────────────

/// Per-integration sync configuration, owned by the external calendar
/// integration entity. Consumed here only for cadence and reminder timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSyncSettings {
    pub integration_id: Ulid,
    pub sync_frequency_min: u32,
    pub reminder_minutes: Vec<u32>,
    /// Display color, `#rrggbb`.
    pub calendar_color: Option<String>,
}

// ── WAL record format ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceRegistered {
        service: Service,
    },
    ServiceUpdated {
        service: Service,
    },
    PackageRegistered {
        package: ServicePackage,
    },
    LocationRegistered {
        location: ServiceLocation,
    },
    ExceptionUpserted {
        service_id: Ulid,
        date: NaiveDate,
        kind: ExceptionKind,
    },
    ExceptionRemoved {
        service_id: Ulid,
        date: NaiveDate,
    },
    CapacityAdjusted {
        service_id: Ulid,
        location_id: Option<Ulid>,
        start: NaiveDate,
        end: NaiveDate,
        action: CapacityAction,
        capacity: Option<u32>,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingConfirmed {
        id: Ulid,
    },
    BookingRescheduled {
        id: Ulid,
        scheduled_at: Ms,
        cells: Vec<CellKey>,
    },
    BookingUpdated {
        id: Ulid,
        notes: Option<String>,
    },
    BookingCancelled {
        id: Ulid,
    },
    BookingCompleted {
        id: Ulid,
    },
    ConsultationRecorded {
        id: Ulid,
        record: ConsultationRecord,
    },
}

// ── Query result types ───────────────────────────────────────────

/// One ledger row of a capacity summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayCapacity {
    pub date: NaiveDate,
    pub capacity: u32,
    pub consumed: u32,
    pub available: u32,
}

/// Result of a bulk capacity update. Blocking a day never cancels its
/// consumed bookings; such days come back flagged for operator review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkUpdateOutcome {
    pub days_applied: u32,
    pub flagged_for_review: Vec<NaiveDate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_basics() {
        let s = Slot::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn slot_overlap() {
        let a = Slot::new(100, 200);
        let b = Slot::new(150, 250);
        let c = Slot::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn slot_contains_slot() {
        let outer = Slot::new(100, 400);
        let inner = Slot::new(150, 300);
        let partial = Slot::new(50, 200);
        assert!(outer.contains_slot(&inner));
        assert!(outer.contains_slot(&outer));
        assert!(!outer.contains_slot(&partial));
    }

    #[test]
    fn day_conversion_roundtrip() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let midnight = day_start_ms(date);
        assert_eq!(day_of(midnight), date);
        assert_eq!(day_of(midnight + DAY_MS - 1), date);
        assert_eq!(day_of(midnight + DAY_MS), date.succ_opt().unwrap());
    }

    #[test]
    fn minute_alignment() {
        assert!(is_minute_aligned(0));
        assert!(is_minute_aligned(9 * HOUR_MS + 30 * MINUTE_MS));
        assert!(!is_minute_aligned(MINUTE_MS + 1));
    }

    #[test]
    fn status_transitions() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Confirmed));
    }

    #[test]
    fn status_activity() {
        assert!(BookingStatus::Pending.is_active());
        assert!(BookingStatus::Confirmed.is_active());
        assert!(!BookingStatus::Completed.is_active());
        assert!(!BookingStatus::Cancelled.is_active());
    }

    #[test]
    fn package_window_check() {
        let pkg = ServicePackage {
            id: Ulid::new(),
            name: None,
            members: vec![],
            min_advance_hours: Some(24),
            max_advance_days: Some(30),
        };
        let now = 1_700_000_000_000;
        assert!(!pkg.can_be_booked_on(now, now + 23 * HOUR_MS));
        assert!(pkg.can_be_booked_on(now, now + 25 * HOUR_MS));
        assert!(pkg.can_be_booked_on(now, now + 30 * DAY_MS));
        assert!(!pkg.can_be_booked_on(now, now + 31 * DAY_MS));
    }

    #[test]
    fn package_unbounded_window_accepts_everything() {
        let pkg = ServicePackage {
            id: Ulid::new(),
            name: None,
            members: vec![],
            min_advance_hours: None,
            max_advance_days: None,
        };
        let now = 1_700_000_000_000;
        assert!(pkg.can_be_booked_on(now, now + 1));
        assert!(pkg.can_be_booked_on(now, now + 365 * DAY_MS));
    }

    #[test]
    fn package_optional_membership() {
        let opt = Ulid::new();
        let req = Ulid::new();
        let pkg = ServicePackage {
            id: Ulid::new(),
            name: None,
            members: vec![
                PackageMember { service_id: req, optional: false },
                PackageMember { service_id: opt, optional: true },
            ],
            min_advance_hours: None,
            max_advance_days: None,
        };
        assert!(pkg.is_optional_member(&opt));
        assert!(!pkg.is_optional_member(&req));
        assert!(!pkg.is_optional_member(&Ulid::new()));
        assert_eq!(pkg.required_member_ids().collect::<Vec<_>>(), vec![req]);
    }

    #[test]
    fn cell_key_global_order() {
        let a = Ulid::from_parts(1, 1);
        let b = Ulid::from_parts(2, 2);
        let d1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();

        let mut keys = vec![
            CellKey { service_id: b, location_id: None, day: d1 },
            CellKey { service_id: a, location_id: None, day: d2 },
            CellKey { service_id: a, location_id: None, day: d1 },
        ];
        keys.sort();
        assert_eq!(keys[0].service_id, a);
        assert_eq!(keys[0].day, d1);
        assert_eq!(keys[1].service_id, a);
        assert_eq!(keys[1].day, d2);
        assert_eq!(keys[2].service_id, b);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                target: BookingTarget::Service { id: Ulid::new() },
                location_id: None,
                client: ClientContact {
                    name: "Ada".into(),
                    email: Some("ada@example.com".into()),
                    phone: None,
                },
                scheduled_at: 1_700_000_040_000,
                status: BookingStatus::Pending,
                requires_consultation: true,
                consultation: None,
                notes: None,
                cells: vec![CellKey {
                    service_id: Ulid::new(),
                    location_id: None,
                    day: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
                }],
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn exception_kind_type() {
        assert_eq!(ExceptionKind::Blocked.exception_type(), ExceptionType::Blocked);
        assert_eq!(
            ExceptionKind::CustomHours { open_min: 600, close_min: 720 }.exception_type(),
            ExceptionType::CustomHours
        );
        assert_eq!(
            ExceptionKind::SpecialPricing { price_modifier_bps: -1500 }.exception_type(),
            ExceptionType::SpecialPricing
        );
    }
}
