//! Calendar sync coordination — the boundary collaborator.
//!
//! Validates per-integration sync settings, derives the reconciliation
//! cadence and reminder lead times, and forwards booking notices to an
//! external calendar port as JSON payloads. The reconciliation protocol
//! itself (OAuth, webhooks) lives outside this crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::*;
use crate::model::{CalendarSyncSettings, Ms, MINUTE_MS};
use crate::notify::{BookingNotice, NotifyHub};

pub fn validate_sync_settings(settings: &CalendarSyncSettings) -> Result<(), EngineError> {
    if !(MIN_SYNC_FREQUENCY_MINUTES..=MAX_SYNC_FREQUENCY_MINUTES)
        .contains(&settings.sync_frequency_min)
    {
        return Err(EngineError::Validation {
            field: "sync_frequency_minutes",
            reason: "must be between 5 and 1440",
        });
    }
    if settings.reminder_minutes.len() > MAX_REMINDERS {
        return Err(EngineError::Validation {
            field: "reminder_minutes",
            reason: "too many reminders",
        });
    }
    for &lead in &settings.reminder_minutes {
        if lead > MAX_REMINDER_MINUTES {
            return Err(EngineError::Validation {
                field: "reminder_minutes",
                reason: "beyond one week",
            });
        }
    }
    if let Some(color) = &settings.calendar_color {
        let ok = color.len() == 7
            && color.starts_with('#')
            && color[1..].chars().all(|c| c.is_ascii_hexdigit());
        if !ok {
            return Err(EngineError::Validation {
                field: "calendar_color",
                reason: "must be #rrggbb",
            });
        }
    }
    Ok(())
}

/// Reconciliation cadence from the settings.
pub fn sync_interval(settings: &CalendarSyncSettings) -> Duration {
    Duration::from_secs(settings.sync_frequency_min as u64 * 60)
}

/// Reminder instants for an appointment, soonest first. Leads already in the
/// past are dropped; duplicate leads collapse.
pub fn reminder_times(settings: &CalendarSyncSettings, scheduled_at: Ms, now: Ms) -> Vec<Ms> {
    let mut out: Vec<Ms> = settings
        .reminder_minutes
        .iter()
        .map(|&lead| scheduled_at - lead as Ms * MINUTE_MS)
        .filter(|&t| t > now)
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Destination for booking changes on the external calendar side.
#[async_trait]
pub trait CalendarPort: Send + Sync {
    async fn push_event(&self, payload: serde_json::Value) -> Result<(), EngineError>;
}

/// Couples one integration's settings to a port and a service's notice
/// stream.
pub struct SyncCoordinator<P: CalendarPort> {
    settings: CalendarSyncSettings,
    port: Arc<P>,
}

impl<P: CalendarPort> SyncCoordinator<P> {
    pub fn new(settings: CalendarSyncSettings, port: Arc<P>) -> Result<Self, EngineError> {
        validate_sync_settings(&settings)?;
        Ok(Self { settings, port })
    }

    pub fn cadence(&self) -> Duration {
        sync_interval(&self.settings)
    }

    /// The JSON shape handed to the port for one notice.
    pub fn payload(&self, notice: &BookingNotice, now: Ms) -> serde_json::Value {
        json!({
            "integration_id": self.settings.integration_id,
            "kind": notice.kind,
            "booking_id": notice.booking_id,
            "service_id": notice.service_id,
            "scheduled_at": notice.scheduled_at,
            "reminders": reminder_times(&self.settings, notice.scheduled_at, now),
            "calendar_color": self.settings.calendar_color,
        })
    }

    /// Forward a service's booking notices to the port until the engine side
    /// goes away. Lagging behind drops notices with a warning rather than
    /// blocking the engine.
    pub async fn run(&self, hub: &NotifyHub, service_id: Ulid) {
        let mut rx = hub.subscribe(service_id);
        loop {
            match rx.recv().await {
                Ok(notice) => {
                    let payload = self.payload(&notice, crate::engine::now_ms());
                    if let Err(e) = self.port.push_event(payload).await {
                        tracing::warn!(%service_id, "calendar push failed: {e}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(%service_id, skipped, "sync fell behind; notices dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}
