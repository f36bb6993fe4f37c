use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::ledger::days_in_range;
use super::{Engine, EngineError};

impl Engine {
    // ── Bookings ─────────────────────────────────────────

    pub async fn get_booking(&self, id: &Ulid) -> Result<Booking, EngineError> {
        let arc = self.booking_arc(id)?;
        let guard = arc.read().await;
        Ok(guard.clone())
    }

    /// Every booking that consumes capacity of the given service, newest
    /// schedule first.
    pub async fn list_bookings_for_service(&self, service_id: &Ulid) -> Vec<Booking> {
        let arcs: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for arc in arcs {
            let guard = arc.read().await;
            if guard.cells.iter().any(|c| c.service_id == *service_id) {
                out.push(guard.clone());
            }
        }
        out.sort_by_key(|b| std::cmp::Reverse(b.scheduled_at));
        out
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    // ── Capacity ─────────────────────────────────────────

    /// Configured minus consumed for one day. Lock-free; the reservation
    /// path re-validates under lock.
    pub async fn available_capacity(
        &self,
        service_id: &Ulid,
        location_id: Option<Ulid>,
        date: NaiveDate,
    ) -> Result<u32, EngineError> {
        let default = self.configured_capacity(service_id, location_id)?;
        let key = CellKey { service_id: *service_id, location_id, day: date };
        Ok(self.ledger.available(&key, default).await)
    }

    /// Per-day ledger rows over an inclusive date range (≤ 90 days).
    pub async fn capacity_summary(
        &self,
        service_id: &Ulid,
        location_id: Option<Ulid>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DayCapacity>, EngineError> {
        let default = self.configured_capacity(service_id, location_id)?;
        let days = days_in_range(start, end)?;
        Ok(self.ledger.summary(*service_id, location_id, &days, default).await)
    }

    // ── Exceptions ───────────────────────────────────────

    pub fn exception_for(&self, service_id: &Ulid, date: NaiveDate) -> Option<AvailabilityException> {
        self.exceptions.exception_for(service_id, date)
    }

    pub fn list_exceptions(&self, service_id: &Ulid) -> Vec<AvailabilityException> {
        self.exceptions.list_for(service_id)
    }

    // ── Reference data ───────────────────────────────────

    pub fn get_service(&self, id: &Ulid) -> Option<Service> {
        self.services.get(id).map(|e| e.value().clone())
    }

    pub fn get_package(&self, id: &Ulid) -> Option<ServicePackage> {
        self.packages.get(id).map(|e| e.value().clone())
    }

    pub fn get_location(&self, id: &Ulid) -> Option<ServiceLocation> {
        self.locations.get(id).map(|e| e.value().clone())
    }

    pub fn list_services(&self) -> Vec<Service> {
        self.services.iter().map(|e| e.value().clone()).collect()
    }
}
