use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use db_intel_core::{Batch, Clock, PipelineError, Record, StageCounters, StageSnapshot};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::processors::{Processor, ShutdownSignal, WorkerSet};

/// Per-database protection gate.
///
/// Scrape outcomes reported by the receiver side and the record gate both
/// mutate the same per-database entry; the concurrent map keys the lock by
/// database, so every read-check-write happens inside one critical section.
pub struct CircuitBreaker {
    config: BreakerConfig,
    states: Arc<DashMap<DbKey, CircuitEntry>>,
    clock: Arc<dyn Clock>,
    counters: StageCounters,
    workers: WorkerSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbKey {
    pub system: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct CircuitEntry {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// whether the current failure streak contains a classified error
    known_failure_in_streak: bool,
    opened_at: Option<DateTime<Utc>>,
    current_open_timeout_ms: u64,
    open_cycles: u32,
    ewma_latency_ms: Option<f64>,
    latency_breach_streak: u32,
    error_class_counts: BTreeMap<String, u64>,
    last_report: DateTime<Utc>,
}

impl CircuitEntry {
    fn new(now: DateTime<Utc>, base_timeout_ms: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            known_failure_in_streak: false,
            opened_at: None,
            current_open_timeout_ms: base_timeout_ms,
            open_cycles: 0,
            ewma_latency_ms: None,
            latency_breach_streak: 0,
            error_class_counts: BTreeMap::new(),
            last_report: now,
        }
    }

    fn open(&mut self, now: DateTime<Utc>, config: &BreakerConfig) {
        let timeout = (config.open_timeout_ms as f64
            * config.backoff_factor.powi(self.open_cycles as i32))
        .min(config.max_open_timeout_ms as f64) as u64;
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.current_open_timeout_ms = timeout;
        self.open_cycles = self.open_cycles.saturating_add(1);
        self.consecutive_successes = 0;
        self.latency_breach_streak = 0;
    }

    fn close(&mut self, config: &BreakerConfig) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.open_cycles = 0;
        self.current_open_timeout_ms = config.open_timeout_ms;
        self.consecutive_failures = 0;
        self.known_failure_in_streak = false;
        self.latency_breach_streak = 0;
    }

    fn open_timeout_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.opened_at {
            Some(at) => {
                (now - at).num_milliseconds() >= self.current_open_timeout_ms as i64
            }
            None => true,
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            states: Arc::new(DashMap::new()),
            clock,
            counters: StageCounters::new(),
            workers: WorkerSet::new(),
        }
    }

    /// Scrape-side hook: outcomes are totally ordered per database by the
    /// host, and each one is applied inside the entry's critical section.
    pub fn report_outcome(
        &self,
        db_system: &str,
        db_name: &str,
        success: bool,
        latency_ms: f64,
        error_class: Option<&str>,
    ) {
        let key = DbKey {
            system: db_system.to_string(),
            name: db_name.to_string(),
        };
        let now = self.clock.now();
        let config = &self.config;

        let mut entry = self
            .states
            .entry(key.clone())
            .or_insert_with(|| CircuitEntry::new(now, config.open_timeout_ms));
        entry.last_report = now;

        entry.ewma_latency_ms = Some(match entry.ewma_latency_ms {
            Some(prev) => config.ewma_alpha * latency_ms + (1.0 - config.ewma_alpha) * prev,
            None => latency_ms,
        });

        if success {
            entry.consecutive_failures = 0;
            entry.known_failure_in_streak = false;
            entry.consecutive_successes = entry.consecutive_successes.saturating_add(1);
            if entry.state == CircuitState::HalfOpen
                && entry.consecutive_successes >= config.success_threshold
            {
                info!(db = %key.name, system = %key.system, "circuit closed after successful probes");
                entry.close(config);
            }
        } else {
            let class = error_class.unwrap_or("unknown");
            *entry.error_class_counts.entry(class.to_string()).or_insert(0) += 1;
            entry.consecutive_successes = 0;
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            if class != "unknown" {
                entry.known_failure_in_streak = true;
            }

            match entry.state {
                CircuitState::HalfOpen => {
                    warn!(db = %key.name, system = %key.system, "probe failed, circuit re-opened");
                    entry.open(now, config);
                }
                CircuitState::Closed => {
                    let unknown_only =
                        !entry.known_failure_in_streak && !config.count_unknown_as_failure;
                    if entry.consecutive_failures >= config.failure_threshold && !unknown_only {
                        warn!(
                            db = %key.name,
                            system = %key.system,
                            failures = entry.consecutive_failures,
                            "failure threshold reached, circuit opened"
                        );
                        entry.open(now, config);
                    }
                }
                CircuitState::Open => {}
            }
        }

        // latency pressure only trips a Closed circuit
        if let Some(ewma) = entry.ewma_latency_ms {
            if ewma > config.latency_ceiling_ms {
                entry.latency_breach_streak = entry.latency_breach_streak.saturating_add(1);
            } else {
                entry.latency_breach_streak = 0;
            }
            if entry.state == CircuitState::Closed
                && entry.latency_breach_streak >= config.latency_breach_window
            {
                warn!(
                    db = %key.name,
                    system = %key.system,
                    ewma_ms = ewma,
                    "latency ceiling breached, circuit opened"
                );
                entry.open(now, config);
            }
        }
    }

    /// Current state per database, for the health surface.
    pub fn circuit_states(&self) -> BTreeMap<String, String> {
        self.states
            .iter()
            .map(|entry| {
                let key = entry.key();
                (
                    format!("{}/{}", key.system, key.name),
                    entry.value().state.as_str().to_string(),
                )
            })
            .collect()
    }

    fn record_key(record: &Record) -> Option<DbKey> {
        let system = record.attr_str("db.system").unwrap_or("unknown").to_string();
        let name = record
            .attr_str("db.name")
            .or_else(|| record.attr_str("db.system"))?
            .to_string();
        Some(DbKey { system, name })
    }

    /// Gate decision for one record, within the entry's critical section.
    fn admit(&self, record: &mut Record, now: DateTime<Utc>) -> bool {
        let Some(key) = Self::record_key(record) else {
            // records without database identity are not subject to the gate
            return true;
        };
        let Some(mut entry) = self.states.get_mut(&key) else {
            return true;
        };

        if entry.state == CircuitState::Open && entry.open_timeout_elapsed(now) {
            info!(db = %key.name, system = %key.system, "open timeout elapsed, circuit half-open");
            entry.state = CircuitState::HalfOpen;
            entry.consecutive_successes = 0;
        }

        match entry.state {
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                drop(entry);
                record.set_attr("circuit.state", CircuitState::HalfOpen.as_str());
                true
            }
            CircuitState::Closed => true,
        }
    }

    fn update_gauges(&self) {
        let mut open = 0u64;
        let mut half_open = 0u64;
        let mut by_class: BTreeMap<String, u64> = BTreeMap::new();
        for entry in self.states.iter() {
            match entry.value().state {
                CircuitState::Open => open += 1,
                CircuitState::HalfOpen => half_open += 1,
                CircuitState::Closed => {}
            }
            for (class, count) in &entry.value().error_class_counts {
                *by_class.entry(class.clone()).or_insert(0) += count;
            }
        }
        self.counters.set_gauge("circuits.total", self.states.len() as u64);
        self.counters.set_gauge("circuits.open", open);
        self.counters.set_gauge("circuits.half_open", half_open);
        for (class, count) in by_class {
            self.counters.set_gauge(&format!("errors.{class}"), count);
        }
    }

    /// Promote expired Open circuits and drop entries idle far beyond the
    /// report stream; keeps the table bounded without a separate cap.
    fn sweep(states: &DashMap<DbKey, CircuitEntry>, now: DateTime<Utc>, idle_cutoff_ms: i64) {
        let stale: Vec<DbKey> = states
            .iter()
            .filter(|e| (now - e.value().last_report).num_milliseconds() > idle_cutoff_ms)
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            states.remove_if(&key, |_, v| {
                v.state == CircuitState::Closed
                    && (now - v.last_report).num_milliseconds() > idle_cutoff_ms
            });
        }
        for mut entry in states.iter_mut() {
            if entry.state == CircuitState::Open && entry.open_timeout_elapsed(now) {
                entry.state = CircuitState::HalfOpen;
                entry.consecutive_successes = 0;
            }
        }
    }
}

#[async_trait]
impl Processor for CircuitBreaker {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    async fn start(&self, shutdown: ShutdownSignal) -> Result<(), PipelineError> {
        let states = self.states.clone();
        let clock = self.clock.clone();
        let mut signal = shutdown;
        // entries with no reports for 100 open-timeouts are abandoned
        let idle_cutoff_ms = (self.config.max_open_timeout_ms as i64).saturating_mul(100);
        self.workers.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(500));
            loop {
                tokio::select! {
                    _ = signal.cancelled() => break,
                    _ = tick.tick() => {
                        Self::sweep(&states, clock.now(), idle_cutoff_ms);
                    }
                }
            }
        }));
        Ok(())
    }

    async fn process(&self, batch: Batch) -> Batch {
        self.counters.batch_in();
        self.counters.record_in(batch.len() as u64);
        let now = self.clock.now();

        let mut admitted = Vec::with_capacity(batch.len());
        for mut record in batch {
            if self.admit(&mut record, now) {
                admitted.push(record);
            } else {
                self.counters.drop_record("circuit_open");
            }
        }

        self.counters.record_out(admitted.len() as u64);
        self.update_gauges();
        Batch::new(admitted)
    }

    async fn shutdown(&self) {
        self.workers.join_all().await;
    }

    fn snapshot(&self) -> StageSnapshot {
        self.counters.snapshot(self.name())
    }
}
