use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar;
use crate::limits::*;
use crate::model::*;

use super::{now_ms, Engine, EngineError};

/// One member's share of a booking: which service occupies which sub-slot.
/// A plain service booking is a one-element layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MemberSlot {
    pub service_id: Ulid,
    pub slot: Slot,
}

impl MemberSlot {
    pub(crate) fn cell(&self, location_id: Option<Ulid>) -> CellKey {
        CellKey {
            service_id: self.service_id,
            location_id,
            day: day_of(self.slot.start),
        }
    }
}

/// An open-slot listing request over a bounded horizon.
#[derive(Debug, Clone)]
pub struct AvailabilityQuery {
    pub target: BookingTarget,
    pub location_id: Option<Ulid>,
    pub from: NaiveDate,
    /// 1–90; defaults to 7.
    pub days_ahead: Option<u32>,
    /// 15–480 minutes; service targets only.
    pub duration_override: Option<u32>,
}

impl AvailabilityQuery {
    fn validate(&self) -> Result<u32, EngineError> {
        let days = self.days_ahead.unwrap_or(DEFAULT_HORIZON_DAYS);
        if days == 0 || days > MAX_HORIZON_DAYS {
            return Err(EngineError::Validation {
                field: "days_ahead",
                reason: "must be between 1 and 90",
            });
        }
        if let Some(d) = self.duration_override
            && !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&d)
        {
            return Err(EngineError::Validation {
                field: "duration_override",
                reason: "outside the allowed band",
            });
        }
        Ok(days)
    }
}

impl Engine {
    /// Validate a package's optional selection and expand to the ordered
    /// scheduled member services (all required + exactly the selected
    /// optionals). A selection outside the package's optional set fails with
    /// the offending index.
    pub(crate) fn scheduled_services(
        &self,
        package: &ServicePackage,
        selected: &[Ulid],
    ) -> Result<Vec<Service>, EngineError> {
        if selected.len() > MAX_SELECTED_OPTIONALS {
            return Err(EngineError::Validation {
                field: "selected_optional_services",
                reason: "too many selections",
            });
        }
        for (index, service_id) in selected.iter().enumerate() {
            if !package.is_optional_member(service_id) {
                return Err(EngineError::InvalidSelection { index, service_id: *service_id });
            }
        }
        let mut out = Vec::new();
        for member in &package.members {
            if !member.optional || selected.contains(&member.service_id) {
                let service = self
                    .services
                    .get(&member.service_id)
                    .ok_or(EngineError::NotFound(member.service_id))?
                    .clone();
                out.push(service);
            }
        }
        Ok(out)
    }

    /// Sequential, non-overlapping sub-slots from `start`, in member order.
    pub(crate) fn layout_from(services: &[Service], start: Ms) -> Vec<MemberSlot> {
        let mut cursor = start;
        services
            .iter()
            .map(|service| {
                let slot = Slot::new(cursor, cursor + service.duration_min as Ms * MINUTE_MS);
                cursor = slot.end;
                MemberSlot { service_id: service.id, slot }
            })
            .collect()
    }

    /// Calendar fit for one member: its day must not be blocked and the
    /// sub-slot must sit inside the member's (exception-adjusted) window.
    fn member_slot_fits(&self, service: &Service, slot: Slot) -> bool {
        let date = day_of(slot.start);
        let exception = self.exceptions.exception_for(&service.id, date);
        calendar::day_window(service, exception.as_ref(), date)
            .is_some_and(|w| w.contains_slot(&slot))
    }

    /// Resolve a target at `ts` into its member layout: selection, location
    /// scoping and calendar fit. `Ok(None)` means the timestamp is simply not
    /// a candidate slot; capacity is not consulted here.
    pub(crate) fn resolve_layout(
        &self,
        target: &BookingTarget,
        location_id: Option<Ulid>,
        ts: Ms,
        duration_override: Option<u32>,
    ) -> Result<Option<Vec<MemberSlot>>, EngineError> {
        match target {
            BookingTarget::Service { id } => {
                let service = self
                    .services
                    .get(id)
                    .ok_or(EngineError::NotFound(*id))?
                    .clone();
                // Validates that the location exists and is scoped to this service.
                self.configured_capacity(id, location_id)?;
                let exception = self.exceptions.exception_for(id, day_of(ts));
                Ok(calendar::slot_at(&service, exception.as_ref(), ts, duration_override)
                    .map(|slot| vec![MemberSlot { service_id: *id, slot }]))
            }
            BookingTarget::Package { id, selected_optional } => {
                let package = self
                    .packages
                    .get(id)
                    .ok_or(EngineError::NotFound(*id))?
                    .clone();
                if location_id.is_some() {
                    return Err(EngineError::Validation {
                        field: "location_id",
                        reason: "not supported for package bookings",
                    });
                }
                if duration_override.is_some() {
                    return Err(EngineError::Validation {
                        field: "duration_override",
                        reason: "not supported for package bookings",
                    });
                }
                let services = self.scheduled_services(&package, selected_optional)?;
                if services.is_empty() {
                    return Ok(None);
                }
                let layout = Self::layout_from(&services, ts);
                let fits = services
                    .iter()
                    .zip(&layout)
                    .all(|(service, member)| self.member_slot_fits(service, member.slot));
                Ok(fits.then_some(layout))
            }
        }
    }

    /// Lock-free capacity peek for a layout, multiplicity-aware. Advisory
    /// only: the reservation path re-validates under the cell locks.
    pub(crate) async fn capacity_ok(
        &self,
        layout: &[MemberSlot],
        location_id: Option<Ulid>,
    ) -> bool {
        let cells: Vec<CellKey> = layout.iter().map(|m| m.cell(location_id)).collect();
        let mut uniq = cells.clone();
        uniq.sort();
        uniq.dedup();
        for key in uniq {
            let demand = cells.iter().filter(|k| **k == key).count() as u32;
            let available = self
                .ledger
                .available(&key, self.default_capacity_for_cell(&key))
                .await;
            if available < demand {
                return false;
            }
        }
        true
    }

    /// Whether a single timestamp can currently be booked. Unknown targets
    /// and invalid selections are errors; a timestamp that merely does not
    /// fit is `Ok(false)`.
    pub async fn is_bookable(
        &self,
        target: &BookingTarget,
        location_id: Option<Ulid>,
        ts: Ms,
    ) -> Result<bool, EngineError> {
        if !is_minute_aligned(ts) || !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&ts)
        {
            return Ok(false);
        }
        match self.resolve_layout(target, location_id, ts, None)? {
            None => Ok(false),
            Some(layout) => Ok(self.capacity_ok(&layout, location_id).await),
        }
    }

    /// All open slots over the horizon: calendar slots minus blocked days,
    /// with exception-adjusted hours, minus days without capacity, minus the
    /// past. Reads take no write locks and may observe a stale snapshot.
    pub async fn open_slots(&self, query: &AvailabilityQuery) -> Result<Vec<Slot>, EngineError> {
        let days = query.validate()?;
        let now = now_ms();
        metrics::counter!(crate::observability::OPEN_SLOT_QUERIES_TOTAL).increment(1);

        match &query.target {
            BookingTarget::Service { id } => {
                let service = self
                    .services
                    .get(id)
                    .ok_or(EngineError::NotFound(*id))?
                    .clone();
                self.configured_capacity(id, query.location_id)?;

                let mut out = Vec::new();
                let mut date = query.from;
                for _ in 0..days {
                    let key = CellKey { service_id: *id, location_id: query.location_id, day: date };
                    let available = self
                        .ledger
                        .available(&key, self.default_capacity_for_cell(&key))
                        .await;
                    if available > 0 {
                        let exception = self.exceptions.exception_for(id, date);
                        for slot in calendar::slots_for_day(
                            &service,
                            exception.as_ref(),
                            date,
                            query.duration_override,
                        ) {
                            if slot.start >= now {
                                out.push(slot);
                            }
                        }
                    }
                    date = date.succ_opt().expect("date within chrono range");
                }
                Ok(out)
            }
            BookingTarget::Package { id, selected_optional } => {
                let package = self
                    .packages
                    .get(id)
                    .ok_or(EngineError::NotFound(*id))?
                    .clone();
                if query.location_id.is_some() {
                    return Err(EngineError::Validation {
                        field: "location_id",
                        reason: "not supported for package bookings",
                    });
                }
                if query.duration_override.is_some() {
                    return Err(EngineError::Validation {
                        field: "duration_override",
                        reason: "not supported for package bookings",
                    });
                }
                let services = self.scheduled_services(&package, selected_optional)?;
                let Some(first) = services.first().cloned() else {
                    return Ok(Vec::new());
                };
                let total_min: u32 = services.iter().map(|s| s.duration_min).sum();

                let mut out = Vec::new();
                let mut date = query.from;
                for _ in 0..days {
                    let exception = self.exceptions.exception_for(&first.id, date);
                    if let Some(window) = calendar::day_window(&first, exception.as_ref(), date) {
                        // Candidate starts on the first member's grid, stepped
                        // by the total package duration.
                        for candidate in calendar::SlotIter::new(window, total_min) {
                            if candidate.start < now {
                                continue;
                            }
                            let layout = Self::layout_from(&services, candidate.start);
                            let fits = services
                                .iter()
                                .zip(&layout)
                                .all(|(s, m)| self.member_slot_fits(s, m.slot));
                            if fits && self.capacity_ok(&layout, None).await {
                                out.push(candidate);
                            }
                        }
                    }
                    date = date.succ_opt().expect("date within chrono range");
                }
                Ok(out)
            }
        }
    }
}
