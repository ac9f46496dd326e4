use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use db_intel_core::{Batch, Clock, PipelineError, Record, StageCounters, StageSnapshot};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::CostConfig;
use crate::processors::{Processor, ShutdownSignal};

/// Projects the month's export bill from a rolling bytes-per-minute window
/// and sheds load in two steps before the budget is blown.
///
/// The ledger is updated once per batch under a single lock; per-record work
/// only estimates sizes.
pub struct CostControl {
    config: CostConfig,
    ledger: Mutex<CostLedger>,
    clock: Arc<dyn Clock>,
    counters: StageCounters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Normal,
    Throttle,
    Aggressive,
}

impl Regime {
    fn as_str(&self) -> &'static str {
        match self {
            Regime::Normal => "normal",
            Regime::Throttle => "throttle",
            Regime::Aggressive => "aggressive",
        }
    }

    fn code(&self) -> u64 {
        match self {
            Regime::Normal => 0,
            Regime::Throttle => 1,
            Regime::Aggressive => 2,
        }
    }
}

/// Rolling window of bytes per minute, zero-filled: the average divides the
/// window total by the full window length.
#[derive(Debug)]
struct CostLedger {
    slots: VecDeque<(i64, u64)>,
    window_minutes: usize,
    last_emitted_minute: Option<i64>,
}

impl CostLedger {
    fn new(window_minutes: usize) -> Self {
        Self {
            slots: VecDeque::with_capacity(window_minutes),
            window_minutes,
            last_emitted_minute: None,
        }
    }

    fn add(&mut self, minute: i64, bytes: u64) {
        match self.slots.back_mut() {
            Some((m, b)) if *m == minute => *b += bytes,
            _ => self.slots.push_back((minute, bytes)),
        }
        let horizon = minute - self.window_minutes as i64;
        while matches!(self.slots.front(), Some((m, _)) if *m <= horizon) {
            self.slots.pop_front();
        }
    }

    fn bytes_per_minute(&self) -> f64 {
        let total: u64 = self.slots.iter().map(|(_, b)| *b).sum();
        total as f64 / self.window_minutes as f64
    }
}

/// Attributes that survive aggressive stripping.
const MINIMAL_KEYS: [&str; 5] = [
    "service.name",
    "db.system",
    "db.name",
    "sampling.rule",
    "sampling.priority",
];

fn is_essential(key: &str) -> bool {
    MINIMAL_KEYS.contains(&key)
        || key.starts_with("db.")
        || key.starts_with("sampling.")
        || key.starts_with("correlation.")
        || key.starts_with("circuit.")
}

impl CostControl {
    pub fn new(config: CostConfig, clock: Arc<dyn Clock>) -> Self {
        let ledger = Mutex::new(CostLedger::new(config.window_minutes));
        Self {
            config,
            ledger,
            clock,
            counters: StageCounters::new(),
        }
    }

    fn minutes_in_current_month(&self) -> f64 {
        let now = self.clock.now();
        let (year, month) = (now.year(), now.month());
        let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month start");
        let next = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)
        }
        .expect("valid month start");
        (next - first).num_days() as f64 * 24.0 * 60.0
    }

    fn usd_per_byte(&self) -> f64 {
        self.config.pricing_tier.usd_per_gb() / 1e9
    }

    fn projected_usd(&self, bytes_per_minute: f64) -> f64 {
        bytes_per_minute * self.minutes_in_current_month() * self.usd_per_byte()
    }

    fn regime_for(&self, projected_usd: f64) -> Regime {
        let budget = self.config.monthly_budget_usd;
        if projected_usd < 0.8 * budget {
            Regime::Normal
        } else if projected_usd < budget {
            Regime::Throttle
        } else {
            Regime::Aggressive
        }
    }

    fn strip_attributes(record: &mut Record, keep: impl Fn(&str) -> bool) -> u64 {
        let doomed: Vec<String> = record
            .attributes
            .keys()
            .filter(|k| !keep(k))
            .cloned()
            .collect();
        let stripped = doomed.len() as u64;
        for key in doomed {
            record.attributes.remove(&key);
        }
        stripped
    }

    fn keep_in_throttle(&self, record: &Record) -> bool {
        let priority = record
            .attr("sampling.priority")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        priority >= self.config.throttle_priority_floor
    }

    fn keep_in_aggressive(&self, record: &Record) -> bool {
        match record.attr_str("sampling.rule") {
            Some(rule) => self.config.always_keep.iter().any(|k| k == rule),
            None => false,
        }
    }

    /// Synthetic `cost.*` metric points, emitted downstream once per minute
    /// roll.
    fn emit_cost_metrics(
        &self,
        out: &mut Vec<Record>,
        bytes_per_minute: f64,
        projected_usd: f64,
        regime: Regime,
    ) {
        let now = self.clock.now();
        let resource = out
            .first()
            .map(|r| r.resource.clone())
            .unwrap_or_default();
        let scope = "cost_control";
        let regime_attr = regime.as_str();

        for (name, value) in [
            ("cost.bytes_per_minute", bytes_per_minute),
            ("cost.projected_usd", projected_usd),
            ("cost.regime", regime.code() as f64),
        ] {
            out.push(
                Record::metric(name, now, value)
                    .with_resource(resource.clone())
                    .with_scope(scope)
                    .with_attr("cost.regime.name", regime_attr)
                    .with_attr("cost.pricing_tier", tier_name(&self.config)),
            );
        }
    }
}

fn tier_name(config: &CostConfig) -> &'static str {
    match config.pricing_tier {
        crate::config::PricingTier::Standard => "standard",
        crate::config::PricingTier::DataPlus => "dataPlus",
    }
}

#[async_trait]
impl Processor for CostControl {
    fn name(&self) -> &'static str {
        "cost_control"
    }

    async fn start(&self, _shutdown: ShutdownSignal) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn process(&self, batch: Batch) -> Batch {
        self.counters.batch_in();
        self.counters.record_in(batch.len() as u64);

        // read the ledger once; the regime holds for the whole batch
        let (bytes_per_minute, projected, regime) = {
            let ledger = self.ledger.lock();
            let bpm = ledger.bytes_per_minute();
            let projected = self.projected_usd(bpm);
            (bpm, projected, self.regime_for(projected))
        };

        let mut stripped_total = 0u64;
        let mut out = Vec::with_capacity(batch.len());
        for mut record in batch {
            match regime {
                Regime::Normal => out.push(record),
                Regime::Throttle => {
                    if !self.keep_in_throttle(&record) {
                        self.counters.drop_record("cost_throttle");
                        continue;
                    }
                    stripped_total += Self::strip_attributes(&mut record, |k| {
                        is_essential(k) || k.starts_with("service.")
                    });
                    out.push(record);
                }
                Regime::Aggressive => {
                    if !self.keep_in_aggressive(&record) {
                        self.counters.drop_record("cost_aggressive");
                        continue;
                    }
                    stripped_total +=
                        Self::strip_attributes(&mut record, |k| MINIMAL_KEYS.contains(&k));
                    out.push(record);
                }
            }
        }

        // account the bytes actually leaving, then emit cost telemetry on
        // minute roll
        let emitted_bytes: u64 = out.iter().map(|r| r.encoded_len() as u64).sum();
        let minute = self.clock.now().timestamp() / 60;
        let roll = {
            let mut ledger = self.ledger.lock();
            ledger.add(minute, emitted_bytes);
            let roll = ledger.last_emitted_minute != Some(minute);
            ledger.last_emitted_minute = Some(minute);
            roll
        };
        if roll {
            match regime {
                Regime::Normal => info!(
                    projected_usd = projected,
                    budget = self.config.monthly_budget_usd,
                    "cost projection updated"
                ),
                _ => warn!(
                    projected_usd = projected,
                    budget = self.config.monthly_budget_usd,
                    regime = regime.as_str(),
                    "cost regime shedding records"
                ),
            }
            self.emit_cost_metrics(&mut out, bytes_per_minute, projected, regime);
        }

        self.counters.add("attributes_stripped", stripped_total);
        self.counters.set_gauge("cost.regime", regime.code());
        self.counters
            .set_gauge("cost.projected_usd_cents", (projected * 100.0).max(0.0) as u64);
        self.counters
            .set_gauge("cost.bytes_per_minute", bytes_per_minute as u64);
        self.counters.record_out(out.len() as u64);
        Batch::new(out)
    }

    async fn shutdown(&self) {}

    fn snapshot(&self) -> StageSnapshot {
        self.counters.snapshot(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PricingTier;
    use chrono::{TimeZone, Utc};
    use db_intel_core::ManualClock;

    fn clock() -> Arc<ManualClock> {
        // June: a 30-day month, 43,200 minutes
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap(),
        ))
    }

    fn config() -> CostConfig {
        CostConfig {
            monthly_budget_usd: 100.0,
            pricing_tier: PricingTier::Standard,
            window_minutes: 60,
            always_keep: vec!["slow-queries".to_string()],
            throttle_priority_floor: 50,
        }
    }

    /// Seed the ledger with an observed rate of `gb_per_hour` over the full
    /// window.
    fn seed_ledger(cost: &CostControl, clock: &ManualClock, gb_per_hour: f64) {
        let per_minute = (gb_per_hour * 1e9 / 60.0) as u64;
        let minute = clock.now().timestamp() / 60;
        let mut ledger = cost.ledger.lock();
        for i in 0..60 {
            ledger.add(minute - 59 + i, per_minute);
        }
    }

    fn sampled_record(clock: &ManualClock, rule: &str, priority: i64) -> Record {
        Record::metric("postgresql.query.duration", clock.now(), 1.0)
            .with_attr("sampling.rule", rule)
            .with_attr("sampling.priority", priority)
            .with_attr("db.name", "orders")
            .with_attr("debug.note", "verbose diagnostic payload")
    }

    #[tokio::test]
    async fn projection_matches_window_times_month_times_rate() {
        let c = clock();
        let cost = CostControl::new(config(), c.clone());
        seed_ledger(&cost, &c, 1.8);

        let bpm = cost.ledger.lock().bytes_per_minute();
        let projected = cost.projected_usd(bpm);
        // 1.8 GB/h ≈ 453.6 USD/month at 0.35/GB over a 30-day month
        assert!((projected - 453.6).abs() < 0.5, "projected = {projected}");
        assert_eq!(cost.regime_for(projected), Regime::Aggressive);
    }

    #[tokio::test]
    async fn scenario_s5_aggressive_keeps_only_allowlist() {
        let c = clock();
        let cost = CostControl::new(config(), c.clone());
        seed_ledger(&cost, &c, 1.8);

        let batch = Batch::new(vec![
            sampled_record(&c, "slow-queries", 100),
            sampled_record(&c, "default", 0),
        ]);
        let out = cost.process(batch).await;
        let kept: Vec<&Record> = out
            .records
            .iter()
            .filter(|r| !r.name.starts_with("cost."))
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].attr_str("sampling.rule"), Some("slow-queries"));
        // minimal attribute set only
        assert!(kept[0].attr("debug.note").is_none());
        assert_eq!(cost.snapshot().drops.get("cost_aggressive"), Some(&1));
    }

    #[tokio::test]
    async fn throttle_drops_low_priority_and_strips_noise() {
        let c = clock();
        let cost = CostControl::new(config(), c.clone());
        // 0.35/GB: 100 USD budget ⇒ ~0.38 GB/h trips 80%; 0.36 lands between
        seed_ledger(&cost, &c, 0.36);

        let bpm = cost.ledger.lock().bytes_per_minute();
        let projected = cost.projected_usd(bpm);
        assert_eq!(cost.regime_for(projected), Regime::Throttle, "{projected}");

        let batch = Batch::new(vec![
            sampled_record(&c, "slow-queries", 100),
            sampled_record(&c, "default", 0),
        ]);
        let out = cost.process(batch).await;
        let kept: Vec<&Record> = out
            .records
            .iter()
            .filter(|r| !r.name.starts_with("cost."))
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(
            kept[0].attr("sampling.priority").and_then(|v| v.as_i64()),
            Some(100)
        );
        assert!(kept[0].attr("debug.note").is_none(), "noise attr kept");
        assert!(kept[0].attr("db.name").is_some(), "essential attr stripped");
        assert_eq!(cost.snapshot().drops.get("cost_throttle"), Some(&1));
    }

    #[tokio::test]
    async fn normal_regime_passes_everything() {
        let c = clock();
        let cost = CostControl::new(config(), c.clone());
        let batch = Batch::new(vec![
            sampled_record(&c, "default", 0),
            sampled_record(&c, "default", 0),
        ]);
        let out = cost.process(batch).await;
        let kept: Vec<&Record> = out
            .records
            .iter()
            .filter(|r| !r.name.starts_with("cost."))
            .collect();
        assert_eq!(kept.len(), 2);
        assert!(kept[0].attr("debug.note").is_some());
    }

    #[tokio::test]
    async fn cost_metrics_emitted_once_per_minute() {
        let c = clock();
        let cost = CostControl::new(config(), c.clone());

        let out = cost
            .process(Batch::new(vec![sampled_record(&c, "default", 0)]))
            .await;
        let cost_metrics: Vec<&Record> = out
            .records
            .iter()
            .filter(|r| r.name.starts_with("cost."))
            .collect();
        assert_eq!(cost_metrics.len(), 3);
        assert!(cost_metrics.iter().any(|r| r.name == "cost.projected_usd"));

        // same minute: no second emission
        let out = cost
            .process(Batch::new(vec![sampled_record(&c, "default", 0)]))
            .await;
        assert!(!out.records.iter().any(|r| r.name.starts_with("cost.")));

        // next minute rolls
        c.advance(chrono::Duration::seconds(61));
        let out = cost
            .process(Batch::new(vec![sampled_record(&c, "default", 0)]))
            .await;
        assert!(out.records.iter().any(|r| r.name.starts_with("cost.")));
    }

    #[tokio::test]
    async fn dataplus_tier_rates_differ() {
        let c = clock();
        let mut cfg = config();
        cfg.pricing_tier = PricingTier::DataPlus;
        let cost = CostControl::new(cfg, c.clone());
        seed_ledger(&cost, &c, 1.0);
        let bpm = cost.ledger.lock().bytes_per_minute();
        // 1 GB/h over 30 days at 0.55/GB
        let projected = cost.projected_usd(bpm);
        assert!((projected - 396.0).abs() < 0.5, "projected = {projected}");
    }
}
