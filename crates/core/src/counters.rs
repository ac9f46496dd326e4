use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Per-stage counters.
///
/// Every record entering a stage either leaves through `records_out` or lands
/// in exactly one drop reason; `records_in == records_out + sum(drops)` holds
/// over any interval, modulo records a stage is explicitly documented to
/// buffer (the correlator reports those under a gauge).
#[derive(Debug, Default)]
pub struct StageCounters {
    records_in: AtomicU64,
    records_out: AtomicU64,
    batches_in: AtomicU64,
    drops: Mutex<BTreeMap<String, u64>>,
    extras: Mutex<BTreeMap<String, u64>>,
    gauges: Mutex<BTreeMap<String, u64>>,
}

impl StageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_in(&self, n: u64) {
        self.records_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_out(&self, n: u64) {
        self.records_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn batch_in(&self) {
        self.batches_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drop_record(&self, reason: &str) {
        *self.drops.lock().entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn drop_records(&self, reason: &str, n: u64) {
        if n > 0 {
            *self.drops.lock().entry(reason.to_string()).or_insert(0) += n;
        }
    }

    /// Free-form event counter (parse errors, timeouts, suppressions).
    pub fn incr(&self, name: &str) {
        *self.extras.lock().entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn add(&self, name: &str, n: u64) {
        if n > 0 {
            *self.extras.lock().entry(name.to_string()).or_insert(0) += n;
        }
    }

    /// Point-in-time gauge (cache sizes, buffered records).
    pub fn set_gauge(&self, name: &str, value: u64) {
        self.gauges.lock().insert(name.to_string(), value);
    }

    pub fn records_in(&self) -> u64 {
        self.records_in.load(Ordering::Relaxed)
    }

    pub fn records_out(&self) -> u64 {
        self.records_out.load(Ordering::Relaxed)
    }

    pub fn dropped(&self, reason: &str) -> u64 {
        self.drops.lock().get(reason).copied().unwrap_or(0)
    }

    pub fn dropped_total(&self) -> u64 {
        self.drops.lock().values().sum()
    }

    pub fn extra(&self, name: &str) -> u64 {
        self.extras.lock().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self, stage: &str) -> StageSnapshot {
        StageSnapshot {
            stage: stage.to_string(),
            records_in: self.records_in(),
            records_out: self.records_out(),
            batches_in: self.batches_in.load(Ordering::Relaxed),
            drops: self.drops.lock().clone(),
            counters: self.extras.lock().clone(),
            gauges: self.gauges.lock().clone(),
        }
    }
}

/// Serializable snapshot for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StageSnapshot {
    pub stage: String,
    pub records_in: u64,
    pub records_out: u64,
    pub batches_in: u64,
    pub drops: BTreeMap<String, u64>,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, u64>,
}

impl StageSnapshot {
    pub fn dropped_total(&self) -> u64 {
        self.drops.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conservation_across_reasons() {
        let c = StageCounters::new();
        c.record_in(10);
        c.record_out(7);
        c.drop_record("duplicate");
        c.drop_records("sampled", 2);

        assert_eq!(c.records_in(), c.records_out() + c.dropped_total());
        assert_eq!(c.dropped("duplicate"), 1);
        assert_eq!(c.dropped("sampled"), 2);
    }

    #[test]
    fn snapshot_carries_gauges_and_extras() {
        let c = StageCounters::new();
        c.incr("plan.parse_errors");
        c.set_gauge("cache.size", 42);
        let snap = c.snapshot("plan_attribute_extractor");
        assert_eq!(snap.counters.get("plan.parse_errors"), Some(&1));
        assert_eq!(snap.gauges.get("cache.size"), Some(&42));
        assert_eq!(snap.stage, "plan_attribute_extractor");
    }
}
