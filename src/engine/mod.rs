mod admin;
mod bookings;
mod error;
mod exceptions;
mod ledger;
mod queries;
mod resolver;

pub use admin::BulkCapacityUpdate;
pub use bookings::{BookingRequest, ConsultationOutcome, RescheduleRequest, UpdateBooking};
pub use error::EngineError;
pub use exceptions::{required_fields, ExceptionRequest, ExceptionStore};
pub use ledger::{days_in_range, validate_bulk_args, CapacityLedger, CellGuards};
pub use resolver::AvailabilityQuery;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedBooking = Arc<RwLock<Booking>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as Ms
}

pub(crate) fn today_utc() -> NaiveDate {
    day_of(now_ms())
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(crate) services: DashMap<Ulid, Service>,
    pub(crate) packages: DashMap<Ulid, ServicePackage>,
    pub(crate) locations: DashMap<Ulid, ServiceLocation>,
    pub(crate) bookings: DashMap<Ulid, SharedBooking>,
    pub(crate) exceptions: ExceptionStore,
    pub(crate) ledger: CapacityLedger,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            services: DashMap::new(),
            packages: DashMap::new(),
            locations: DashMap::new(),
            bookings: DashMap::new(),
            exceptions: ExceptionStore::new(),
            ledger: CapacityLedger::new(),
            wal_tx,
            notify,
        };

        // Replay — we're the sole owner of every Arc here, so try_write always
        // succeeds instantly. Never use blocking_write: this may run inside an
        // async context.
        for event in &events {
            engine.apply_replay(event);
        }

        Ok(engine)
    }

    /// Apply one replayed event to in-memory state. Unconditional: the WAL
    /// only ever holds events that were valid when written.
    fn apply_replay(&self, event: &Event) {
        match event {
            Event::ServiceRegistered { service } | Event::ServiceUpdated { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::PackageRegistered { package } => {
                self.packages.insert(package.id, package.clone());
            }
            Event::LocationRegistered { location } => {
                self.locations.insert(location.id, location.clone());
            }
            Event::ExceptionUpserted { service_id, date, kind } => {
                self.exceptions.upsert(AvailabilityException {
                    service_id: *service_id,
                    date: *date,
                    kind: *kind,
                });
            }
            Event::ExceptionRemoved { service_id, date } => {
                self.exceptions.remove(service_id, *date);
            }
            Event::CapacityAdjusted { service_id, location_id, start, end, action, capacity } => {
                let default = self.default_capacity_for(service_id, *location_id);
                // Replayed ranges were validated when written.
                let mut days = Vec::new();
                let mut day = *start;
                while day <= *end {
                    days.push(day);
                    day = day.succ_opt().expect("date within chrono range");
                }
                self.ledger
                    .bulk_apply_replay(*service_id, *location_id, &days, *action, *capacity, default);
            }
            Event::BookingCreated { booking } => {
                // Compaction snapshots carry terminal bookings too; only
                // non-cancelled ones still hold their cells.
                if booking.status != BookingStatus::Cancelled {
                    self.ledger
                        .consume_replay(&booking.cells, |k| self.default_capacity_for_cell(k));
                }
                self.bookings
                    .insert(booking.id, Arc::new(RwLock::new(booking.clone())));
            }
            Event::BookingConfirmed { id } => {
                if let Some(entry) = self.bookings.get(id) {
                    let arc = entry.value().clone();
                    arc.try_write().expect("replay: uncontended write").status =
                        BookingStatus::Confirmed;
                }
            }
            Event::BookingRescheduled { id, scheduled_at, cells } => {
                if let Some(entry) = self.bookings.get(id) {
                    let arc = entry.value().clone();
                    let mut b = arc.try_write().expect("replay: uncontended write");
                    self.ledger
                        .consume_replay(cells, |k| self.default_capacity_for_cell(k));
                    self.ledger.release_replay(&b.cells);
                    b.scheduled_at = *scheduled_at;
                    b.cells = cells.clone();
                }
            }
            Event::BookingUpdated { id, notes } => {
                if let Some(entry) = self.bookings.get(id) {
                    let arc = entry.value().clone();
                    arc.try_write().expect("replay: uncontended write").notes = notes.clone();
                }
            }
            Event::BookingCancelled { id } => {
                if let Some(entry) = self.bookings.get(id) {
                    let arc = entry.value().clone();
                    let mut b = arc.try_write().expect("replay: uncontended write");
                    if b.status != BookingStatus::Cancelled {
                        self.ledger.release_replay(&b.cells);
                    }
                    b.status = BookingStatus::Cancelled;
                }
            }
            Event::BookingCompleted { id } => {
                if let Some(entry) = self.bookings.get(id) {
                    let arc = entry.value().clone();
                    arc.try_write().expect("replay: uncontended write").status =
                        BookingStatus::Completed;
                }
            }
            Event::ConsultationRecorded { id, record } => {
                if let Some(entry) = self.bookings.get(id) {
                    let arc = entry.value().clone();
                    let mut b = arc.try_write().expect("replay: uncontended write");
                    if !record.proceed && b.status != BookingStatus::Cancelled {
                        self.ledger.release_replay(&b.cells);
                        b.status = BookingStatus::Cancelled;
                    }
                    b.consultation = Some(record.clone());
                }
            }
        }
    }

    /// Write an event through the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    // ── Capacity defaults ────────────────────────────────

    /// Default per-day capacity for a cell: location override when present,
    /// service default otherwise. Infallible for replay robustness.
    pub(crate) fn default_capacity_for_cell(&self, key: &CellKey) -> u32 {
        self.default_capacity_for(&key.service_id, key.location_id)
    }

    fn default_capacity_for(&self, service_id: &Ulid, location_id: Option<Ulid>) -> u32 {
        if let Some(lid) = location_id
            && let Some(loc) = self.locations.get(&lid)
            && let Some(cap) = loc.capacity
        {
            return cap;
        }
        self.services
            .get(service_id)
            .map(|s| s.default_capacity)
            .unwrap_or(1)
    }

    pub(crate) fn booking_arc(&self, id: &Ulid) -> Result<SharedBooking, EngineError> {
        self.bookings
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }

    /// Validated service + optional-location lookup; errors on unknown ids
    /// and on a location that belongs to a different service.
    pub(crate) fn configured_capacity(
        &self,
        service_id: &Ulid,
        location_id: Option<Ulid>,
    ) -> Result<u32, EngineError> {
        let service = self
            .services
            .get(service_id)
            .ok_or(EngineError::NotFound(*service_id))?;
        match location_id {
            Some(lid) => {
                let loc = self.locations.get(&lid).ok_or(EngineError::NotFound(lid))?;
                if loc.service_id != *service_id {
                    return Err(EngineError::Validation {
                        field: "location_id",
                        reason: "does not belong to the service",
                    });
                }
                Ok(loc.capacity.unwrap_or(service.default_capacity))
            }
            None => Ok(service.default_capacity),
        }
    }

    /// Sorted, deduplicated `(cell, default)` lock entries for a cell list.
    pub(crate) fn cell_lock_entries(&self, cells: &[CellKey]) -> Vec<(CellKey, u32)> {
        let mut keys: Vec<CellKey> = cells.to_vec();
        keys.sort();
        keys.dedup();
        keys.into_iter()
            .map(|k| (k, self.default_capacity_for_cell(&k)))
            .collect()
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        for entry in self.services.iter() {
            events.push(Event::ServiceRegistered { service: entry.value().clone() });
        }
        for entry in self.packages.iter() {
            events.push(Event::PackageRegistered { package: entry.value().clone() });
        }
        for entry in self.locations.iter() {
            events.push(Event::LocationRegistered { location: entry.value().clone() });
        }
        for ex in self.exceptions.snapshot() {
            events.push(Event::ExceptionUpserted {
                service_id: ex.service_id,
                date: ex.date,
                kind: ex.kind,
            });
        }
        events.extend(self.ledger.snapshot_events());
        for entry in self.bookings.iter() {
            let arc = entry.value().clone();
            let booking = arc.try_read().expect("compact: uncontended read").clone();
            events.push(Event::BookingCreated { booking });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
