use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Fields an exception type demands, by wire name. Drives request validation
/// before a typed exception is constructed.
pub fn required_fields(t: ExceptionType) -> &'static [&'static str] {
    match t {
        ExceptionType::Blocked => &[],
        ExceptionType::CustomHours => &["start_time", "end_time"],
        ExceptionType::SpecialPricing => &["price_modifier"],
    }
}

/// An exception create/update request before type-conditional validation.
#[derive(Debug, Clone)]
pub struct ExceptionRequest {
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub exception_type: ExceptionType,
    pub open_min: Option<u16>,
    pub close_min: Option<u16>,
    pub price_modifier_bps: Option<i32>,
}

impl ExceptionRequest {
    fn has(&self, field: &str) -> bool {
        match field {
            "start_time" => self.open_min.is_some(),
            "end_time" => self.close_min.is_some(),
            "price_modifier" => self.price_modifier_bps.is_some(),
            _ => true,
        }
    }

    /// Full validation: date not in the past, type-required fields present,
    /// cross-field invariants hold, no stray fields on `blocked`.
    pub fn validate(&self, today: NaiveDate) -> Result<AvailabilityException, EngineError> {
        if self.date < today {
            return Err(EngineError::Validation {
                field: "exception_date",
                reason: "must not be in the past",
            });
        }
        for &field in required_fields(self.exception_type) {
            if !self.has(field) {
                return Err(EngineError::Validation { field: "exception_type", reason: "missing required field" });
            }
        }

        let kind = match self.exception_type {
            ExceptionType::Blocked => {
                if self.open_min.is_some() || self.close_min.is_some() || self.price_modifier_bps.is_some() {
                    return Err(EngineError::Validation {
                        field: "exception_type",
                        reason: "blocked takes no time or pricing fields",
                    });
                }
                ExceptionKind::Blocked
            }
            ExceptionType::CustomHours => {
                let open = self.open_min.ok_or(EngineError::Validation {
                    field: "start_time",
                    reason: "required for custom_hours",
                })?;
                let close = self.close_min.ok_or(EngineError::Validation {
                    field: "end_time",
                    reason: "required for custom_hours",
                })?;
                if close > 1440 {
                    return Err(EngineError::Validation {
                        field: "end_time",
                        reason: "beyond end of day",
                    });
                }
                if open >= close {
                    return Err(EngineError::Validation {
                        field: "end_time",
                        reason: "must be after start_time",
                    });
                }
                ExceptionKind::CustomHours { open_min: open, close_min: close }
            }
            ExceptionType::SpecialPricing => {
                let bps = self.price_modifier_bps.ok_or(EngineError::Validation {
                    field: "price_modifier",
                    reason: "required for special_pricing",
                })?;
                if bps == 0 {
                    return Err(EngineError::Validation {
                        field: "price_modifier",
                        reason: "must be non-zero",
                    });
                }
                ExceptionKind::SpecialPricing { price_modifier_bps: bps }
            }
        };

        Ok(AvailabilityException { service_id: self.service_id, date: self.date, kind })
    }
}

/// Date-scoped overrides, at most one per (service, date). Read-mostly;
/// writes funnel through the engine's WAL path.
pub struct ExceptionStore {
    by_date: DashMap<(Ulid, NaiveDate), AvailabilityException>,
}

impl Default for ExceptionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExceptionStore {
    pub fn new() -> Self {
        Self { by_date: DashMap::new() }
    }

    pub fn exception_for(&self, service_id: &Ulid, date: NaiveDate) -> Option<AvailabilityException> {
        self.by_date.get(&(*service_id, date)).map(|e| e.value().clone())
    }

    /// Last write wins: any prior exception for the same (service, date) is
    /// replaced.
    pub fn upsert(&self, exception: AvailabilityException) {
        self.by_date
            .insert((exception.service_id, exception.date), exception);
    }

    pub fn remove(&self, service_id: &Ulid, date: NaiveDate) -> Option<AvailabilityException> {
        self.by_date.remove(&(*service_id, date)).map(|(_, v)| v)
    }

    /// Every stored exception, for WAL compaction snapshots.
    pub(super) fn snapshot(&self) -> Vec<AvailabilityException> {
        self.by_date.iter().map(|e| e.value().clone()).collect()
    }

    pub fn list_for(&self, service_id: &Ulid) -> Vec<AvailabilityException> {
        let mut out: Vec<_> = self
            .by_date
            .iter()
            .filter(|e| e.key().0 == *service_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|e| e.date);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn request(t: ExceptionType) -> ExceptionRequest {
        ExceptionRequest {
            service_id: Ulid::new(),
            date: today(),
            exception_type: t,
            open_min: None,
            close_min: None,
            price_modifier_bps: None,
        }
    }

    #[test]
    fn required_fields_by_type() {
        assert!(required_fields(ExceptionType::Blocked).is_empty());
        assert_eq!(
            required_fields(ExceptionType::CustomHours),
            &["start_time", "end_time"]
        );
        assert_eq!(required_fields(ExceptionType::SpecialPricing), &["price_modifier"]);
    }

    #[test]
    fn past_date_rejected_today_accepted() {
        let mut req = request(ExceptionType::Blocked);
        req.date = today().pred_opt().unwrap();
        assert!(matches!(
            req.validate(today()),
            Err(EngineError::Validation { field: "exception_date", .. })
        ));

        let req = request(ExceptionType::Blocked);
        assert!(req.validate(today()).is_ok());
    }

    #[test]
    fn blocked_rejects_stray_fields() {
        let mut req = request(ExceptionType::Blocked);
        req.price_modifier_bps = Some(500);
        assert!(req.validate(today()).is_err());

        let mut req = request(ExceptionType::Blocked);
        req.open_min = Some(540);
        assert!(req.validate(today()).is_err());
    }

    #[test]
    fn custom_hours_demands_ordered_window() {
        let mut req = request(ExceptionType::CustomHours);
        assert!(req.validate(today()).is_err()); // both times missing

        req.open_min = Some(600);
        assert!(req.validate(today()).is_err()); // end missing

        req.close_min = Some(600);
        assert!(req.validate(today()).is_err()); // start == end

        req.close_min = Some(540);
        assert!(req.validate(today()).is_err()); // inverted

        req.close_min = Some(720);
        let ex = req.validate(today()).unwrap();
        assert_eq!(ex.kind, ExceptionKind::CustomHours { open_min: 600, close_min: 720 });
    }

    #[test]
    fn custom_hours_bounded_by_midnight() {
        let mut req = request(ExceptionType::CustomHours);
        req.open_min = Some(600);
        req.close_min = Some(1441);
        assert!(req.validate(today()).is_err());
        req.close_min = Some(1440);
        assert!(req.validate(today()).is_ok());
    }

    #[test]
    fn special_pricing_demands_nonzero_modifier() {
        let mut req = request(ExceptionType::SpecialPricing);
        assert!(req.validate(today()).is_err());

        req.price_modifier_bps = Some(0);
        assert!(req.validate(today()).is_err());

        req.price_modifier_bps = Some(-2500);
        let ex = req.validate(today()).unwrap();
        assert_eq!(ex.kind, ExceptionKind::SpecialPricing { price_modifier_bps: -2500 });
    }

    #[test]
    fn upsert_replaces_same_date() {
        let store = ExceptionStore::new();
        let sid = Ulid::new();
        store.upsert(AvailabilityException {
            service_id: sid,
            date: today(),
            kind: ExceptionKind::Blocked,
        });
        store.upsert(AvailabilityException {
            service_id: sid,
            date: today(),
            kind: ExceptionKind::CustomHours { open_min: 600, close_min: 720 },
        });

        let got = store.exception_for(&sid, today()).unwrap();
        assert_eq!(got.kind, ExceptionKind::CustomHours { open_min: 600, close_min: 720 });
        assert_eq!(store.list_for(&sid).len(), 1);
    }

    #[test]
    fn listing_is_per_service_and_date_ordered() {
        let store = ExceptionStore::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let d2 = today().succ_opt().unwrap();
        store.upsert(AvailabilityException { service_id: a, date: d2, kind: ExceptionKind::Blocked });
        store.upsert(AvailabilityException { service_id: a, date: today(), kind: ExceptionKind::Blocked });
        store.upsert(AvailabilityException { service_id: b, date: today(), kind: ExceptionKind::Blocked });

        let listed = store.list_for(&a);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].date, today());
        assert_eq!(listed[1].date, d2);
    }

    #[test]
    fn remove_returns_the_exception() {
        let store = ExceptionStore::new();
        let sid = Ulid::new();
        store.upsert(AvailabilityException {
            service_id: sid,
            date: today(),
            kind: ExceptionKind::Blocked,
        });
        assert!(store.remove(&sid, today()).is_some());
        assert!(store.remove(&sid, today()).is_none());
        assert!(store.exception_for(&sid, today()).is_none());
    }
}
