use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// One (service, location, day) accounting cell.
#[derive(Debug, Clone)]
pub struct CapacityCell {
    pub capacity: u32,
    pub consumed: u32,
    /// Pre-block capacity, restored by `Unblock`.
    prior_capacity: Option<u32>,
}

impl CapacityCell {
    fn new(capacity: u32) -> Self {
        Self { capacity, consumed: 0, prior_capacity: None }
    }

    pub fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.consumed)
    }

    fn consume(&mut self, n: u32) {
        self.consumed += n;
    }

    /// Never drives `consumed` below zero.
    fn release(&mut self, n: u32) {
        self.consumed = self.consumed.saturating_sub(n);
    }

    /// Applies one bulk action. Returns true if the day should be flagged
    /// for operator review (blocked while bookings were consumed).
    fn apply_action(&mut self, action: CapacityAction, capacity: Option<u32>, default: u32) -> bool {
        match action {
            CapacityAction::Block => {
                if self.capacity > 0 {
                    self.prior_capacity = Some(self.capacity);
                }
                self.capacity = 0;
                self.consumed > 0
            }
            CapacityAction::Unblock => {
                if self.capacity == 0 {
                    self.capacity = self.prior_capacity.take().unwrap_or(default);
                }
                false
            }
            CapacityAction::SetCapacity => {
                self.capacity = capacity.unwrap_or(default);
                self.prior_capacity = None;
                false
            }
        }
    }
}

pub type SharedCell = Arc<RwLock<CapacityCell>>;

/// Write guards over a sorted set of cells, held across a reservation's
/// validate + WAL append + apply sequence.
pub struct CellGuards {
    guards: Vec<(CellKey, OwnedRwLockWriteGuard<CapacityCell>)>,
}

impl CellGuards {
    fn index_of(&self, key: &CellKey) -> Option<usize> {
        self.guards.iter().position(|(k, _)| k == key)
    }

    /// Validates that every cell can absorb its net demand: occurrences in
    /// `wanted` minus occurrences in `held` (cells the caller already
    /// consumes, e.g. the old slot during a reschedule). Nothing is mutated.
    pub fn validate_demand(&self, wanted: &[CellKey], held: &[CellKey]) -> Result<(), EngineError> {
        for (key, guard) in &self.guards {
            let want = wanted.iter().filter(|k| *k == key).count() as i64;
            let have = held.iter().filter(|k| *k == key).count() as i64;
            let net = want - have;
            if net > 0 && (guard.available() as i64) < net {
                return Err(EngineError::CapacityExhausted {
                    service_id: key.service_id,
                    day: key.day,
                });
            }
        }
        Ok(())
    }

    /// Increments consumption for each occurrence in `cells`. Callers must
    /// have validated demand first.
    pub fn consume(&mut self, cells: &[CellKey]) {
        for key in cells {
            if let Some(i) = self.index_of(key) {
                self.guards[i].1.consume(1);
            }
        }
    }

    /// Decrements consumption for each occurrence in `cells`, floored at zero.
    pub fn release(&mut self, cells: &[CellKey]) {
        for key in cells {
            if let Some(i) = self.index_of(key) {
                self.guards[i].1.release(1);
            }
        }
    }
}

/// The single source of truth for "is there room": per-cell capacity and
/// consumption, guarded by per-cell write locks acquired in global key order.
pub struct CapacityLedger {
    cells: DashMap<CellKey, SharedCell>,
}

impl Default for CapacityLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl CapacityLedger {
    pub fn new() -> Self {
        Self { cells: DashMap::new() }
    }

    fn cell(&self, key: CellKey, default_capacity: u32) -> SharedCell {
        self.cells
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(CapacityCell::new(default_capacity))))
            .clone()
    }

    /// Configured-minus-consumed for one cell. Lock-free callers may observe
    /// a stale value; `CellGuards` re-validates under lock.
    pub async fn available(&self, key: &CellKey, default_capacity: u32) -> u32 {
        match self.cells.get(key).map(|e| e.value().clone()) {
            Some(cell) => cell.read().await.available(),
            None => default_capacity,
        }
    }

    /// Acquires write locks for the given `(key, default_capacity)` entries.
    /// Entries must be sorted by key and deduplicated — the sort order is the
    /// global lock order that keeps cross-cell reservations deadlock-free.
    pub async fn lock_cells(&self, entries: &[(CellKey, u32)]) -> CellGuards {
        debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0), "cell lock order violated");
        let mut guards = Vec::with_capacity(entries.len());
        for (key, default) in entries {
            let cell = self.cell(*key, *default);
            guards.push((*key, cell.write_owned().await));
        }
        CellGuards { guards }
    }

    /// Unchecked consumption used only during WAL replay, where the engine is
    /// the sole owner and bookings may legitimately exceed a later-blocked
    /// day's capacity.
    pub(super) fn consume_replay(&self, cells: &[CellKey], default_capacity: impl Fn(&CellKey) -> u32) {
        for key in cells {
            let cell = self.cell(*key, default_capacity(key));
            cell.try_write().expect("replay: uncontended write").consume(1);
        }
    }

    pub(super) fn release_replay(&self, cells: &[CellKey]) {
        for key in cells {
            if let Some(cell) = self.cells.get(key).map(|e| e.value().clone()) {
                cell.try_write().expect("replay: uncontended write").release(1);
            }
        }
    }

    /// Applies one action across a validated day range, atomically per day.
    /// Returns the applied-day count and the days flagged for review.
    pub async fn bulk_apply(
        &self,
        service_id: Ulid,
        location_id: Option<Ulid>,
        days: &[NaiveDate],
        action: CapacityAction,
        capacity: Option<u32>,
        default_capacity: u32,
    ) -> BulkUpdateOutcome {
        let mut flagged = Vec::new();
        for &day in days {
            let key = CellKey { service_id, location_id, day };
            let cell = self.cell(key, default_capacity);
            let mut guard = cell.write().await;
            if guard.apply_action(action, capacity, default_capacity) {
                tracing::warn!(%service_id, %day, consumed = guard.consumed,
                    "blocked a day with consumed bookings; flagged for review");
                flagged.push(day);
            }
        }
        BulkUpdateOutcome { days_applied: days.len() as u32, flagged_for_review: flagged }
    }

    /// Replay variant of `bulk_apply`: same per-cell effect, uncontended locks.
    pub(super) fn bulk_apply_replay(
        &self,
        service_id: Ulid,
        location_id: Option<Ulid>,
        days: &[NaiveDate],
        action: CapacityAction,
        capacity: Option<u32>,
        default_capacity: u32,
    ) {
        for &day in days {
            let key = CellKey { service_id, location_id, day };
            let cell = self.cell(key, default_capacity);
            cell.try_write()
                .expect("replay: uncontended write")
                .apply_action(action, capacity, default_capacity);
        }
    }

    /// Events that recreate each cell's configured capacity after a replay.
    /// Consumption is not emitted — it is re-derived from booking events.
    pub(super) fn snapshot_events(&self) -> Vec<Event> {
        let mut out = Vec::new();
        for entry in self.cells.iter() {
            let key = *entry.key();
            let cell = entry.value().clone();
            let guard = cell.try_read().expect("compact: uncontended read");
            let mut emit = |action: CapacityAction, capacity: Option<u32>| {
                out.push(Event::CapacityAdjusted {
                    service_id: key.service_id,
                    location_id: key.location_id,
                    start: key.day,
                    end: key.day,
                    action,
                    capacity,
                });
            };
            if guard.capacity == 0 {
                // Preserve blocked state; re-block over the prior capacity so
                // a later unblock still restores it.
                if let Some(prior) = guard.prior_capacity {
                    emit(CapacityAction::SetCapacity, Some(prior));
                    emit(CapacityAction::Block, None);
                } else {
                    emit(CapacityAction::SetCapacity, Some(0));
                }
            } else {
                emit(CapacityAction::SetCapacity, Some(guard.capacity));
            }
        }
        out
    }

    /// Per-day capacity rows over a day range. Days with no explicit record
    /// report the default capacity with zero consumption.
    pub async fn summary(
        &self,
        service_id: Ulid,
        location_id: Option<Ulid>,
        days: &[NaiveDate],
        default_capacity: u32,
    ) -> Vec<DayCapacity> {
        let mut rows = Vec::with_capacity(days.len());
        for &day in days {
            let key = CellKey { service_id, location_id, day };
            let row = match self.cells.get(&key).map(|e| e.value().clone()) {
                Some(cell) => {
                    let guard = cell.read().await;
                    DayCapacity {
                        date: day,
                        capacity: guard.capacity,
                        consumed: guard.consumed,
                        available: guard.available(),
                    }
                }
                None => DayCapacity {
                    date: day,
                    capacity: default_capacity,
                    consumed: 0,
                    available: default_capacity,
                },
            };
            rows.push(row);
        }
        rows
    }
}

/// Expands an inclusive date range into its days, enforcing the bulk-range
/// cap. Rejection happens before any cell is touched.
pub fn days_in_range(start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>, EngineError> {
    let days = (end - start).num_days() + 1;
    if end < start || days > MAX_RANGE_DAYS {
        return Err(EngineError::InvalidRange { days });
    }
    let mut out = Vec::with_capacity(days as usize);
    let mut day = start;
    while day <= end {
        out.push(day);
        day = day.succ_opt().expect("date within chrono range");
    }
    Ok(out)
}

/// Cross-field validation for a bulk capacity update request.
pub fn validate_bulk_args(action: CapacityAction, capacity: Option<u32>) -> Result<(), EngineError> {
    match action {
        CapacityAction::SetCapacity => match capacity {
            None => Err(EngineError::Validation {
                field: "capacity",
                reason: "required for set_capacity",
            }),
            Some(n) if !(MIN_DAY_CAPACITY..=MAX_DAY_CAPACITY).contains(&n) => {
                Err(EngineError::InvalidCapacity(n))
            }
            Some(_) => Ok(()),
        },
        CapacityAction::Block | CapacityAction::Unblock => Ok(()),
    }
}
