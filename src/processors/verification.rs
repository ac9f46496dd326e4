use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db_intel_core::{
    Batch, Clock, PipelineError, Record, RecordValue, StageCounters, StageSnapshot,
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::VerificationConfig;
use crate::processors::{Processor, ShutdownSignal, WorkerSet};
use crate::sanitize::{self, PiiAction, PiiKind, ScanOutcome};

/// Quality, privacy, and cardinality policy enforcement, in that order:
/// schema checks first, then the PII scan, then the cardinality budget.
/// Verification adds or redacts attributes but never reorders a batch.
pub struct Verification {
    config: VerificationConfig,
    ledger: Arc<CardinalityLedger>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
    counters: StageCounters,
    workers: WorkerSet,
}

const LEDGER_SHARDS: usize = 16;

/// Windowed per-key distinct-value estimate. Values are tracked as hashes
/// up to the budget plus one; past that the key is saturated until the next
/// window roll. Shards are keyed by attribute name so concurrent batches
/// contend only when they touch the same keys.
struct CardinalityLedger {
    shards: Vec<Mutex<HashMap<String, KeyEstimate>>>,
    budget: usize,
}

#[derive(Debug, Default)]
struct KeyEstimate {
    values: HashSet<u64>,
    saturated: bool,
}

impl CardinalityLedger {
    fn new(budget: usize) -> Self {
        Self {
            shards: (0..LEDGER_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            budget,
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<HashMap<String, KeyEstimate>> {
        let digest = Sha256::digest(key.as_bytes());
        &self.shards[digest[0] as usize % LEDGER_SHARDS]
    }

    /// Record one observation; returns true when the key is over budget and
    /// the attribute should be suppressed on this record.
    fn observe(&self, key: &str, rendered_value: &str) -> bool {
        let value_hash = {
            let digest = Sha256::digest(rendered_value.as_bytes());
            u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
        };
        let mut shard = self.shard_for(key).lock();
        let estimate = shard.entry(key.to_string()).or_default();
        if estimate.saturated {
            return true;
        }
        estimate.values.insert(value_hash);
        if estimate.values.len() > self.budget {
            estimate.saturated = true;
            estimate.values.clear();
            return true;
        }
        false
    }

    fn distinct(&self, key: &str) -> usize {
        self.shard_for(key)
            .lock()
            .get(key)
            .map(|e| if e.saturated { self.budget + 1 } else { e.values.len() })
            .unwrap_or(0)
    }

    fn roll_window(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    fn tracked_keys(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

impl Verification {
    pub fn new(config: VerificationConfig, clock: Arc<dyn Clock>) -> Self {
        let ledger = Arc::new(CardinalityLedger::new(config.max_cardinality));
        Self {
            config,
            ledger,
            started_at: Mutex::new(None),
            clock,
            counters: StageCounters::new(),
            workers: WorkerSet::new(),
        }
    }

    fn action_for(&self, kind: PiiKind) -> PiiAction {
        let actions = &self.config.pii_actions;
        match kind {
            PiiKind::Email => actions.email,
            PiiKind::Ssn => actions.ssn,
            PiiKind::CreditCardLuhn => actions.credit_card_luhn,
            PiiKind::PhoneUs => actions.phone_us,
            PiiKind::Ipv4 => actions.ipv4,
            PiiKind::ApikeyHeuristic => actions.apikey_heuristic,
        }
    }

    fn schema_ok(&self, record: &Record) -> bool {
        for required in &self.config.required_attributes {
            match record.attr(&required.key) {
                Some(value) if required.r#type.matches(value) => {}
                Some(value) => {
                    debug!(
                        key = %required.key,
                        found = value.type_name(),
                        "schema check failed: wrong type"
                    );
                    return false;
                }
                None => {
                    debug!(key = %required.key, "schema check failed: missing attribute");
                    return false;
                }
            }
        }
        true
    }

    /// Scan the configured keys on one record. Returns false when a
    /// `drop_record` action fired.
    fn apply_pii(&self, record: &mut Record) -> bool {
        for key in &self.config.scan_keys {
            let text = if key == "log.body" {
                match &record.value {
                    RecordValue::Text(body) => Some(body.clone()),
                    _ => None,
                }
            } else {
                record.attributes.get(key).and_then(|v| v.as_str()).map(str::to_string)
            };
            let Some(text) = text else { continue };

            let mut hits = Vec::new();
            let outcome = sanitize::scan_text(&text, |kind| self.action_for(kind), &mut hits);
            for kind in &hits {
                self.counters.incr(&format!("pii.{}", kind.as_str()));
            }
            match outcome {
                ScanOutcome::Clean => {}
                ScanOutcome::Rewritten(clean) => {
                    if key == "log.body" {
                        record.value = RecordValue::Text(clean);
                    } else {
                        record.set_attr(key.clone(), clean);
                    }
                }
                ScanOutcome::DropAttribute(_) => {
                    if key == "log.body" {
                        record.value = RecordValue::Text(String::new());
                    } else {
                        record.attributes.remove(key);
                    }
                    self.counters.incr("pii.attributes_dropped");
                }
                ScanOutcome::DropRecord(_) => return false,
            }
        }
        true
    }

    fn in_warmup(&self, now: DateTime<Utc>) -> bool {
        if !self.config.auto_tune.enabled {
            return false;
        }
        match *self.started_at.lock() {
            Some(started) => {
                (now - started).num_seconds() < self.config.auto_tune.warmup_seconds as i64
            }
            None => false,
        }
    }

    fn apply_cardinality(&self, record: &mut Record, observe_only: bool) {
        let over_budget: Vec<String> = record
            .attributes
            .iter()
            .map(|(key, value)| (key.clone(), value.render()))
            .filter(|(key, rendered)| self.ledger.observe(key, rendered))
            .map(|(key, _)| key)
            .collect();

        if observe_only {
            return;
        }
        for key in over_budget {
            record.attributes.remove(&key);
            self.counters.incr("cardinality.suppressed");
        }
    }
}

#[async_trait]
impl Processor for Verification {
    fn name(&self) -> &'static str {
        "verification"
    }

    async fn start(&self, shutdown: ShutdownSignal) -> Result<(), PipelineError> {
        *self.started_at.lock() = Some(self.clock.now());

        let ledger = self.ledger.clone();
        let window = Duration::from_secs(self.config.cardinality_window_seconds.max(1));
        let mut signal = shutdown;
        self.workers.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(window);
            tick.tick().await; // immediate first tick is not a roll
            loop {
                tokio::select! {
                    _ = signal.cancelled() => break,
                    _ = tick.tick() => ledger.roll_window(),
                }
            }
        }));
        Ok(())
    }

    async fn process(&self, batch: Batch) -> Batch {
        self.counters.batch_in();
        self.counters.record_in(batch.len() as u64);
        let observe_only = self.in_warmup(self.clock.now());

        let mut out = Vec::with_capacity(batch.len());
        for mut record in batch {
            if !self.schema_ok(&record) {
                self.counters.drop_record("schema");
                continue;
            }
            if !self.apply_pii(&mut record) {
                self.counters.drop_record("pii");
                continue;
            }
            self.apply_cardinality(&mut record, observe_only);
            out.push(record);
        }

        self.counters.record_out(out.len() as u64);
        self.counters
            .set_gauge("cardinality.tracked_keys", self.ledger.tracked_keys() as u64);
        Batch::new(out)
    }

    async fn shutdown(&self) {
        self.workers.join_all().await;
    }

    fn snapshot(&self) -> StageSnapshot {
        self.counters.snapshot(self.name())
    }
}
