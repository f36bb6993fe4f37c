use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{BookingNotice, NoticeKind};

use super::resolver::MemberSlot;
use super::{now_ms, Engine, EngineError};

// ── Named domain-invariant checks ────────────────────────
// Composed by the operations below; each failure is attributable to one rule.

pub(crate) fn validate_timestamp(ts: Ms, now: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&ts) {
        return Err(EngineError::Validation {
            field: "scheduled_at",
            reason: "outside the supported time range",
        });
    }
    if !is_minute_aligned(ts) {
        return Err(EngineError::Validation {
            field: "scheduled_at",
            reason: "must be minute-granular",
        });
    }
    if ts <= now {
        return Err(EngineError::Validation {
            field: "scheduled_at",
            reason: "must be in the future",
        });
    }
    Ok(())
}

/// Dedicated-reschedule rule: the NEW timestamp must sit inside the
/// configured advance window, measured from now — not from the original
/// booking time.
pub(crate) fn validate_advance_window(
    now: Ms,
    ts: Ms,
    min_advance_hours: u32,
    max_advance_days: u32,
) -> Result<(), EngineError> {
    let lead = ts - now;
    if lead < min_advance_hours as Ms * HOUR_MS {
        return Err(EngineError::AdvanceWindow {
            scheduled_at: ts,
            reason: "before the minimum advance window",
        });
    }
    if lead > max_advance_days as Ms * DAY_MS {
        return Err(EngineError::AdvanceWindow {
            scheduled_at: ts,
            reason: "beyond the maximum advance window",
        });
    }
    Ok(())
}

/// Generic-update rule: an appointment whose CURRENT start is less than 24
/// hours away is frozen against time changes.
pub(crate) fn validate_imminent_cutoff(current_scheduled_at: Ms, now: Ms) -> Result<(), EngineError> {
    if current_scheduled_at - now < UPDATE_CUTOFF_MS {
        return Err(EngineError::AdvanceWindow {
            scheduled_at: current_scheduled_at,
            reason: "starts less than 24 hours from now",
        });
    }
    Ok(())
}

fn validate_client(client: &ClientContact) -> Result<(), EngineError> {
    if client.name.is_empty() {
        return Err(EngineError::Validation { field: "client_name", reason: "must not be empty" });
    }
    if client.name.len() > MAX_NAME_LEN {
        return Err(EngineError::Validation { field: "client_name", reason: "too long" });
    }
    Ok(())
}

fn validate_notes(notes: Option<&String>) -> Result<(), EngineError> {
    if let Some(n) = notes
        && n.len() > MAX_NOTES_LEN
    {
        return Err(EngineError::Validation { field: "notes", reason: "too long" });
    }
    Ok(())
}

// ── Request shapes ───────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub target: BookingTarget,
    pub location_id: Option<Ulid>,
    pub client: ClientContact,
    pub scheduled_at: Ms,
    pub notes: Option<String>,
}

/// The dedicated reschedule flow: new time validated against the target's
/// configured advance window.
#[derive(Debug, Clone)]
pub struct RescheduleRequest {
    pub scheduled_at: Ms,
    pub reason: Option<String>,
    pub notify_client: bool,
}

/// The generic update flow: time changes gated by the 24-hour imminence
/// cutoff on the current appointment instead of the advance window.
#[derive(Debug, Clone, Default)]
pub struct UpdateBooking {
    pub scheduled_at: Option<Ms>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConsultationOutcome {
    pub notes: String,
    pub proceed: bool,
    pub recommended_services: Vec<Ulid>,
    pub estimated_duration_min: Option<u32>,
    pub completed_at: Option<Ms>,
}

impl Engine {
    // ── Target-level checks ──────────────────────────────

    /// Advance-window rules for a resolved layout: the service's own window,
    /// or for packages the package window (when configured) plus every
    /// scheduled member's window at its sub-slot start.
    fn validate_target_window(
        &self,
        target: &BookingTarget,
        layout: &[MemberSlot],
        now: Ms,
        ts: Ms,
    ) -> Result<(), EngineError> {
        match target {
            BookingTarget::Service { id } => {
                let service = self.services.get(id).ok_or(EngineError::NotFound(*id))?;
                validate_advance_window(now, ts, service.min_advance_hours, service.max_advance_days)
            }
            BookingTarget::Package { id, .. } => {
                let package = self.packages.get(id).ok_or(EngineError::NotFound(*id))?;
                if !package.can_be_booked_on(now, ts) {
                    return Err(EngineError::AdvanceWindow {
                        scheduled_at: ts,
                        reason: "outside the package booking window",
                    });
                }
                drop(package);
                for member in layout {
                    let service = self
                        .services
                        .get(&member.service_id)
                        .ok_or(EngineError::NotFound(member.service_id))?;
                    validate_advance_window(
                        now,
                        member.slot.start,
                        service.min_advance_hours,
                        service.max_advance_days,
                    )?;
                }
                Ok(())
            }
        }
    }

    fn layout_requires_consultation(&self, layout: &[MemberSlot]) -> bool {
        layout.iter().any(|m| {
            self.services
                .get(&m.service_id)
                .map(|s| s.requires_consultation)
                .unwrap_or(false)
        })
    }

    fn emit(&self, kind: NoticeKind, booking: &Booking) {
        let mut service_ids: Vec<Ulid> = booking.cells.iter().map(|c| c.service_id).collect();
        service_ids.sort();
        service_ids.dedup();
        for service_id in service_ids {
            self.notify.send(BookingNotice {
                kind,
                booking_id: booking.id,
                service_id,
                scheduled_at: booking.scheduled_at,
            });
        }
    }

    // ── Create ───────────────────────────────────────────

    /// Reserve a slot and create the booking, atomically: the WAL append and
    /// ledger consumption happen under the cells' write locks, so either both
    /// take effect or neither does.
    pub async fn create_booking(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        let now = now_ms();
        validate_timestamp(request.scheduled_at, now)?;
        validate_client(&request.client)?;
        validate_notes(request.notes.as_ref())?;

        let layout = self
            .resolve_layout(&request.target, request.location_id, request.scheduled_at, None)?
            .ok_or(EngineError::Validation {
                field: "scheduled_at",
                reason: "not an open slot for this target",
            })?;
        self.validate_target_window(&request.target, &layout, now, request.scheduled_at)?;

        let cells: Vec<CellKey> = layout.iter().map(|m| m.cell(request.location_id)).collect();
        let entries = self.cell_lock_entries(&cells);
        let mut guards = self.ledger.lock_cells(&entries).await;
        if let Err(e) = guards.validate_demand(&cells, &[]) {
            metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let booking = Booking {
            id: Ulid::new(),
            requires_consultation: self.layout_requires_consultation(&layout),
            target: request.target,
            location_id: request.location_id,
            client: request.client,
            scheduled_at: request.scheduled_at,
            status: BookingStatus::Pending,
            consultation: None,
            notes: request.notes,
            cells: cells.clone(),
        };
        let event = Event::BookingCreated { booking: booking.clone() };
        self.wal_append(&event).await?;
        guards.consume(&cells);
        self.bookings
            .insert(booking.id, Arc::new(RwLock::new(booking.clone())));
        drop(guards);

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        tracing::debug!(booking_id = %booking.id, scheduled_at = booking.scheduled_at, "booking created");
        self.emit(NoticeKind::Created, &booking);
        Ok(booking)
    }

    // ── Status transitions ───────────────────────────────

    pub async fn confirm_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let arc = self.booking_arc(&id)?;
        let mut booking = arc.write_owned().await;
        if !booking.status.can_transition_to(BookingStatus::Confirmed) {
            return Err(EngineError::InvalidTransition { from: booking.status, op: "confirm" });
        }
        self.wal_append(&Event::BookingConfirmed { id }).await?;
        booking.status = BookingStatus::Confirmed;
        Ok(())
    }

    /// Completion is gated on a recorded consultation when the booking
    /// requires one.
    pub async fn complete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let arc = self.booking_arc(&id)?;
        let mut booking = arc.write_owned().await;
        if !booking.status.can_transition_to(BookingStatus::Completed) {
            return Err(EngineError::InvalidTransition { from: booking.status, op: "complete" });
        }
        if booking.requires_consultation && booking.consultation.is_none() {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                op: "complete before its consultation",
            });
        }
        self.wal_append(&Event::BookingCompleted { id }).await?;
        booking.status = BookingStatus::Completed;
        Ok(())
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let arc = self.booking_arc(&id)?;
        let mut booking = arc.write_owned().await;
        if !booking.status.is_active() {
            return Err(EngineError::InvalidTransition { from: booking.status, op: "cancel" });
        }
        let cells = booking.cells.clone();
        let entries = self.cell_lock_entries(&cells);
        let mut guards = self.ledger.lock_cells(&entries).await;

        self.wal_append(&Event::BookingCancelled { id }).await?;
        booking.status = BookingStatus::Cancelled;
        guards.release(&cells);
        drop(guards);

        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        self.emit(NoticeKind::Cancelled, &booking);
        Ok(())
    }

    // ── Reschedule & update ──────────────────────────────

    /// Swap the booking onto a new layout: new cells reserved before the old
    /// ones are released, all under one set of guards, so no zero-booking
    /// window exists and a same-day move never collides with itself.
    async fn swap_slot(
        &self,
        booking: &mut Booking,
        layout: &[MemberSlot],
        ts: Ms,
    ) -> Result<(), EngineError> {
        let new_cells: Vec<CellKey> = layout.iter().map(|m| m.cell(booking.location_id)).collect();
        let old_cells = booking.cells.clone();
        let mut all = new_cells.clone();
        all.extend_from_slice(&old_cells);
        let entries = self.cell_lock_entries(&all);
        let mut guards = self.ledger.lock_cells(&entries).await;
        if let Err(e) = guards.validate_demand(&new_cells, &old_cells) {
            metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let event = Event::BookingRescheduled { id: booking.id, scheduled_at: ts, cells: new_cells.clone() };
        self.wal_append(&event).await?;
        guards.consume(&new_cells);
        guards.release(&old_cells);
        booking.scheduled_at = ts;
        booking.cells = new_cells;
        Ok(())
    }

    pub async fn reschedule_booking(
        &self,
        id: Ulid,
        request: RescheduleRequest,
    ) -> Result<Booking, EngineError> {
        validate_notes(request.reason.as_ref())?;
        let now = now_ms();
        validate_timestamp(request.scheduled_at, now)?;

        let arc = self.booking_arc(&id)?;
        let mut booking = arc.write_owned().await;
        if !booking.status.is_active() {
            return Err(EngineError::InvalidTransition { from: booking.status, op: "reschedule" });
        }
        let layout = self
            .resolve_layout(&booking.target, booking.location_id, request.scheduled_at, None)?
            .ok_or(EngineError::Validation {
                field: "scheduled_at",
                reason: "not an open slot for this target",
            })?;
        self.validate_target_window(&booking.target, &layout, now, request.scheduled_at)?;

        self.swap_slot(&mut booking, &layout, request.scheduled_at).await?;

        tracing::debug!(
            booking_id = %id,
            scheduled_at = booking.scheduled_at,
            notify_client = request.notify_client,
            reason = request.reason.as_deref().unwrap_or(""),
            "booking rescheduled"
        );
        self.emit(NoticeKind::Rescheduled, &booking);
        Ok(booking.clone())
    }

    pub async fn update_booking(
        &self,
        id: Ulid,
        update: UpdateBooking,
    ) -> Result<Booking, EngineError> {
        validate_notes(update.notes.as_ref())?;
        let now = now_ms();

        let arc = self.booking_arc(&id)?;
        let mut booking = arc.write_owned().await;

        if let Some(ts) = update.scheduled_at {
            if !booking.status.is_active() {
                return Err(EngineError::InvalidTransition { from: booking.status, op: "update" });
            }
            // Imminence guard on the CURRENT time; the configured advance
            // window is the dedicated reschedule flow's rule, not this one's.
            validate_imminent_cutoff(booking.scheduled_at, now)?;
            validate_timestamp(ts, now)?;
            let layout = self
                .resolve_layout(&booking.target, booking.location_id, ts, None)?
                .ok_or(EngineError::Validation {
                    field: "scheduled_at",
                    reason: "not an open slot for this target",
                })?;
            self.swap_slot(&mut booking, &layout, ts).await?;
            self.emit(NoticeKind::Rescheduled, &booking);
        }

        if let Some(notes) = update.notes {
            let event = Event::BookingUpdated { id, notes: Some(notes.clone()) };
            self.wal_append(&event).await?;
            booking.notes = Some(notes);
        }

        Ok(booking.clone())
    }

    // ── Consultation ─────────────────────────────────────

    /// Record the consultation outcome. Declining (`proceed = false`)
    /// cancels the booking and restores its capacity in the same apply.
    pub async fn complete_consultation(
        &self,
        id: Ulid,
        outcome: ConsultationOutcome,
    ) -> Result<Booking, EngineError> {
        if outcome.notes.len() > MAX_NOTES_LEN {
            return Err(EngineError::Validation { field: "notes", reason: "too long" });
        }
        if outcome.recommended_services.len() > MAX_SELECTED_OPTIONALS {
            return Err(EngineError::Validation {
                field: "recommended_services",
                reason: "too many entries",
            });
        }
        if let Some(d) = outcome.estimated_duration_min
            && !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&d)
        {
            return Err(EngineError::Validation {
                field: "estimated_duration_minutes",
                reason: "outside the allowed band",
            });
        }
        let now = now_ms();

        let arc = self.booking_arc(&id)?;
        let mut booking = arc.write_owned().await;
        if !booking.requires_consultation {
            return Err(EngineError::Validation {
                field: "booking_id",
                reason: "does not require a consultation",
            });
        }
        if booking.consultation.is_some() {
            return Err(EngineError::Validation {
                field: "booking_id",
                reason: "consultation already recorded",
            });
        }
        if !booking.status.is_active() {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                op: "record a consultation for",
            });
        }

        let record = ConsultationRecord {
            notes: outcome.notes,
            proceed: outcome.proceed,
            recommended_services: outcome.recommended_services,
            estimated_duration_min: outcome.estimated_duration_min,
            completed_at: outcome.completed_at.unwrap_or(now),
        };
        let event = Event::ConsultationRecorded { id, record: record.clone() };

        if record.proceed {
            self.wal_append(&event).await?;
            booking.consultation = Some(record);
        } else {
            let cells = booking.cells.clone();
            let entries = self.cell_lock_entries(&cells);
            let mut guards = self.ledger.lock_cells(&entries).await;
            self.wal_append(&event).await?;
            booking.consultation = Some(record);
            booking.status = BookingStatus::Cancelled;
            guards.release(&cells);
            drop(guards);
            tracing::debug!(booking_id = %id, "consultation declined; booking cancelled");
            self.emit(NoticeKind::Cancelled, &booking);
        }
        Ok(booking.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Ms = 1_700_000_040_000; // minute-aligned

    #[test]
    fn timestamp_rules() {
        assert!(validate_timestamp(NOW + HOUR_MS, NOW).is_ok());
        // past
        assert!(validate_timestamp(NOW - HOUR_MS, NOW).is_err());
        // present
        assert!(validate_timestamp(NOW, NOW).is_err());
        // sub-minute
        assert!(validate_timestamp(NOW + HOUR_MS + 1, NOW).is_err());
        // outside sanity window
        assert!(validate_timestamp(0, NOW).is_err());
    }

    #[test]
    fn advance_window_boundaries() {
        // min 24h, max 30d
        assert!(validate_advance_window(NOW, NOW + 24 * HOUR_MS, 24, 30).is_ok());
        assert!(matches!(
            validate_advance_window(NOW, NOW + 24 * HOUR_MS - MINUTE_MS, 24, 30),
            Err(EngineError::AdvanceWindow { .. })
        ));
        assert!(validate_advance_window(NOW, NOW + 30 * DAY_MS, 24, 30).is_ok());
        assert!(matches!(
            validate_advance_window(NOW, NOW + 30 * DAY_MS + MINUTE_MS, 24, 30),
            Err(EngineError::AdvanceWindow { .. })
        ));
    }

    #[test]
    fn imminent_cutoff_boundary() {
        assert!(validate_imminent_cutoff(NOW + 24 * HOUR_MS, NOW).is_ok());
        assert!(matches!(
            validate_imminent_cutoff(NOW + 24 * HOUR_MS - MINUTE_MS, NOW),
            Err(EngineError::AdvanceWindow { .. })
        ));
    }

    #[test]
    fn client_contact_rules() {
        let ok = ClientContact { name: "Ada".into(), email: None, phone: None };
        assert!(validate_client(&ok).is_ok());
        let empty = ClientContact { name: String::new(), email: None, phone: None };
        assert!(validate_client(&empty).is_err());
        let long = ClientContact { name: "x".repeat(MAX_NAME_LEN + 1), email: None, phone: None };
        assert!(validate_client(&long).is_err());
    }
}
