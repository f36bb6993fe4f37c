//! Pure slot generation: no locks, no I/O, no clock.

use chrono::NaiveDate;

use crate::limits::{MAX_SLOT_MINUTES, MIN_SLOT_MINUTES};
use crate::model::*;

/// Effective slot length in minutes: the service default, or the caller's
/// override clamped to the allowed band.
pub fn effective_duration_min(service: &Service, override_min: Option<u32>) -> u32 {
    match override_min {
        Some(d) => d.clamp(MIN_SLOT_MINUTES, MAX_SLOT_MINUTES),
        None => service.duration_min,
    }
}

/// Working window for a date as an absolute `[open, close)` interval.
///
/// A `CustomHours` exception replaces the service default wholesale; a
/// `Blocked` exception erases the day. `SpecialPricing` leaves hours alone.
pub fn day_window(
    service: &Service,
    exception: Option<&AvailabilityException>,
    date: NaiveDate,
) -> Option<Slot> {
    let (open_min, close_min) = match exception.map(|e| &e.kind) {
        Some(ExceptionKind::Blocked) => return None,
        Some(ExceptionKind::CustomHours { open_min, close_min }) => (*open_min, *close_min),
        Some(ExceptionKind::SpecialPricing { .. }) | None => (service.open_min, service.close_min),
    };
    if open_min >= close_min {
        return None;
    }
    let base = day_start_ms(date);
    Some(Slot::new(
        base + open_min as Ms * MINUTE_MS,
        base + close_min as Ms * MINUTE_MS,
    ))
}

/// Consecutive non-overlapping slots of a fixed duration filling a working
/// window. Finite, lazy, and restartable (`Clone` re-yields from the front).
#[derive(Debug, Clone)]
pub struct SlotIter {
    next_start: Ms,
    window_end: Ms,
    duration_ms: Ms,
}

impl SlotIter {
    pub fn new(window: Slot, duration_min: u32) -> Self {
        Self {
            next_start: window.start,
            window_end: window.end,
            duration_ms: duration_min as Ms * MINUTE_MS,
        }
    }

    pub fn empty() -> Self {
        Self { next_start: 0, window_end: 0, duration_ms: MINUTE_MS }
    }
}

impl Iterator for SlotIter {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        let end = self.next_start + self.duration_ms;
        if end > self.window_end {
            return None;
        }
        let slot = Slot::new(self.next_start, end);
        self.next_start = end;
        Some(slot)
    }
}

/// All candidate slots for a service on one day. A blocked day yields the
/// empty iterator.
pub fn slots_for_day(
    service: &Service,
    exception: Option<&AvailabilityException>,
    date: NaiveDate,
    duration_override: Option<u32>,
) -> SlotIter {
    match day_window(service, exception, date) {
        Some(window) => SlotIter::new(window, effective_duration_min(service, duration_override)),
        None => SlotIter::empty(),
    }
}

/// The slot starting exactly at `ts`, if `ts` is a valid slot boundary for
/// the day: inside the working window and aligned to the slot grid.
pub fn slot_at(
    service: &Service,
    exception: Option<&AvailabilityException>,
    ts: Ms,
    duration_override: Option<u32>,
) -> Option<Slot> {
    let window = day_window(service, exception, day_of(ts))?;
    let duration_ms = effective_duration_min(service, duration_override) as Ms * MINUTE_MS;
    if ts < window.start || (ts - window.start) % duration_ms != 0 {
        return None;
    }
    let end = ts + duration_ms;
    if end > window.end {
        return None;
    }
    Some(Slot::new(ts, end))
}
