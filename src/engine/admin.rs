use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::ledger::{days_in_range, validate_bulk_args};
use super::{today_utc, Engine, EngineError, ExceptionRequest};

/// A validated-shape bulk capacity update over an inclusive date range.
#[derive(Debug, Clone)]
pub struct BulkCapacityUpdate {
    pub service_id: Ulid,
    pub location_id: Option<Ulid>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub action: CapacityAction,
    pub capacity: Option<u32>,
    pub reason: Option<String>,
}

fn validate_name(name: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::Validation { field: "name", reason: "too long" });
    }
    Ok(())
}

fn validate_service_config(service: &Service) -> Result<(), EngineError> {
    validate_name(&service.name)?;
    if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&service.duration_min) {
        return Err(EngineError::Validation {
            field: "duration_minutes",
            reason: "outside the allowed band",
        });
    }
    if service.close_min > 1440 {
        return Err(EngineError::Validation {
            field: "close_time",
            reason: "beyond end of day",
        });
    }
    if service.open_min >= service.close_min {
        return Err(EngineError::Validation {
            field: "close_time",
            reason: "must be after open_time",
        });
    }
    if !(MIN_DAY_CAPACITY..=MAX_DAY_CAPACITY).contains(&service.default_capacity) {
        return Err(EngineError::InvalidCapacity(service.default_capacity));
    }
    // The advance window must leave at least one bookable instant.
    if service.min_advance_hours as u64 > service.max_advance_days as u64 * 24 {
        return Err(EngineError::Validation {
            field: "min_advance_booking_hours",
            reason: "exceeds the maximum advance window",
        });
    }
    match (service.requires_consultation, service.consultation_duration_min) {
        (true, None) => Err(EngineError::Validation {
            field: "consultation_duration_minutes",
            reason: "required when consultation is required",
        }),
        (_, Some(d)) if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&d) => {
            Err(EngineError::Validation {
                field: "consultation_duration_minutes",
                reason: "outside the allowed band",
            })
        }
        _ => Ok(()),
    }
}

impl Engine {
    // ── Reference data ───────────────────────────────────

    pub async fn register_service(&self, service: Service) -> Result<(), EngineError> {
        validate_service_config(&service)?;
        if self.services.contains_key(&service.id) {
            return Err(EngineError::AlreadyExists(service.id));
        }
        let event = Event::ServiceRegistered { service: service.clone() };
        self.wal_append(&event).await?;
        self.services.insert(service.id, service);
        Ok(())
    }

    pub async fn update_service(&self, service: Service) -> Result<(), EngineError> {
        validate_service_config(&service)?;
        if !self.services.contains_key(&service.id) {
            return Err(EngineError::NotFound(service.id));
        }
        let event = Event::ServiceUpdated { service: service.clone() };
        self.wal_append(&event).await?;
        self.services.insert(service.id, service);
        Ok(())
    }

    pub async fn register_package(&self, package: ServicePackage) -> Result<(), EngineError> {
        validate_name(&package.name)?;
        if self.packages.contains_key(&package.id) {
            return Err(EngineError::AlreadyExists(package.id));
        }
        if package.members.is_empty() || package.members.len() > MAX_PACKAGE_MEMBERS {
            return Err(EngineError::Validation {
                field: "members",
                reason: "must name between 1 and 16 services",
            });
        }
        if package.required_member_ids().next().is_none() {
            return Err(EngineError::Validation {
                field: "members",
                reason: "at least one member must be required",
            });
        }
        let mut seen = std::collections::HashSet::new();
        for member in &package.members {
            if !seen.insert(member.service_id) {
                return Err(EngineError::Validation {
                    field: "members",
                    reason: "duplicate member service",
                });
            }
            if !self.services.contains_key(&member.service_id) {
                return Err(EngineError::NotFound(member.service_id));
            }
        }
        if let (Some(h), Some(d)) = (package.min_advance_hours, package.max_advance_days)
            && h as u64 > d as u64 * 24
        {
            return Err(EngineError::Validation {
                field: "min_advance_booking_hours",
                reason: "exceeds the maximum advance window",
            });
        }

        let event = Event::PackageRegistered { package: package.clone() };
        self.wal_append(&event).await?;
        self.packages.insert(package.id, package);
        Ok(())
    }

    pub async fn register_location(&self, location: ServiceLocation) -> Result<(), EngineError> {
        validate_name(&location.name)?;
        if self.locations.contains_key(&location.id) {
            return Err(EngineError::AlreadyExists(location.id));
        }
        if !self.services.contains_key(&location.service_id) {
            return Err(EngineError::NotFound(location.service_id));
        }
        if let Some(cap) = location.capacity
            && !(MIN_DAY_CAPACITY..=MAX_DAY_CAPACITY).contains(&cap)
        {
            return Err(EngineError::InvalidCapacity(cap));
        }
        let event = Event::LocationRegistered { location: location.clone() };
        self.wal_append(&event).await?;
        self.locations.insert(location.id, location);
        Ok(())
    }

    // ── Availability exceptions ──────────────────────────

    /// Create or replace the exception for (service, date). Last write wins.
    pub async fn upsert_exception(
        &self,
        request: ExceptionRequest,
    ) -> Result<AvailabilityException, EngineError> {
        if !self.services.contains_key(&request.service_id) {
            return Err(EngineError::NotFound(request.service_id));
        }
        let exception = request.validate(today_utc())?;
        let event = Event::ExceptionUpserted {
            service_id: exception.service_id,
            date: exception.date,
            kind: exception.kind,
        };
        self.wal_append(&event).await?;
        self.exceptions.upsert(exception.clone());
        Ok(exception)
    }

    pub async fn remove_exception(
        &self,
        service_id: Ulid,
        date: NaiveDate,
    ) -> Result<(), EngineError> {
        if self.exceptions.exception_for(&service_id, date).is_none() {
            return Err(EngineError::NotFound(service_id));
        }
        let event = Event::ExceptionRemoved { service_id, date };
        self.wal_append(&event).await?;
        self.exceptions.remove(&service_id, date);
        Ok(())
    }

    // ── Bulk capacity ────────────────────────────────────

    /// Block, unblock or set capacity across a date range, atomically per
    /// day. Blocking never cancels consumed bookings; affected days come
    /// back flagged for operator review.
    pub async fn update_capacity(
        &self,
        update: BulkCapacityUpdate,
    ) -> Result<BulkUpdateOutcome, EngineError> {
        validate_bulk_args(update.action, update.capacity)?;
        if let Some(reason) = &update.reason
            && reason.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::Validation { field: "reason", reason: "too long" });
        }
        let default = self.configured_capacity(&update.service_id, update.location_id)?;
        let days = days_in_range(update.start, update.end)?;

        let event = Event::CapacityAdjusted {
            service_id: update.service_id,
            location_id: update.location_id,
            start: update.start,
            end: update.end,
            action: update.action,
            capacity: update.capacity,
        };
        self.wal_append(&event).await?;
        let outcome = self
            .ledger
            .bulk_apply(
                update.service_id,
                update.location_id,
                &days,
                update.action,
                update.capacity,
                default,
            )
            .await;
        tracing::info!(
            service_id = %update.service_id,
            action = ?update.action,
            days = outcome.days_applied,
            flagged = outcome.flagged_for_review.len(),
            "bulk capacity update applied"
        );
        Ok(outcome)
    }
}
