use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db_intel_core::{Batch, Clock, PipelineError, Record, StageCounters, StageSnapshot};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::CorrelatorConfig;
use crate::processors::{Processor, ShutdownSignal, WorkerSet};

/// Joins query records that share a session or transaction.
///
/// Records inside an open transaction are buffered in the session row and
/// emitted together when the commit or rollback boundary arrives, all
/// carrying the same deterministic `correlation.txn_id`. Everything else is
/// annotated with `correlation.session_id` and passes straight through.
/// Emission never reorders: buffered records leave in arrival order, ahead
/// of their boundary record.
pub struct QueryCorrelator {
    config: CorrelatorConfig,
    sessions: Arc<Mutex<HashMap<SessionKey, SessionRow>>>,
    /// records from expired or evicted sessions, re-emitted at the head of
    /// the next batch
    pending: Arc<Mutex<Vec<Record>>>,
    clock: Arc<dyn Clock>,
    counters: Arc<StageCounters>,
    workers: WorkerSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    system: String,
    session: String,
}

#[derive(Debug)]
struct SessionRow {
    last_seen: DateTime<Utc>,
    current_txn: Option<String>,
    buffered: Vec<Record>,
}

impl SessionKey {
    fn of(record: &Record) -> Option<SessionKey> {
        let session = record
            .attr_str("db.session_id")
            .or_else(|| record.attr_str("db.connection_id"))?;
        Some(SessionKey {
            system: record.attr_str("db.system").unwrap_or("unknown").to_string(),
            session: session.to_string(),
        })
    }

    fn session_correlation_id(&self) -> String {
        short_id(&["session", &self.system, &self.session])
    }

    fn txn_correlation_id(&self, txn: &str) -> String {
        short_id(&["txn", &self.system, &self.session, txn])
    }
}

/// Deterministic 16-hex id over the parts.
fn short_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(&hasher.finalize()[..8])
}

/// Hard cap on records buffered for one open transaction; overflow flushes
/// early rather than grow without bound.
const MAX_BUFFERED_PER_SESSION: usize = 256;

fn is_txn_boundary(record: &Record) -> bool {
    matches!(
        record.attr_str("db.transaction.state"),
        Some("commit") | Some("rollback")
    )
}

impl QueryCorrelator {
    pub fn new(config: CorrelatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(Vec::new())),
            clock,
            counters: Arc::new(StageCounters::new()),
            workers: WorkerSet::new(),
        }
    }

    fn classify_workload(&self, record: &mut Record) {
        let duration = record.attr_f64("db.query.duration_ms");
        let rows = record.attr("db.query.rows").and_then(|v| v.as_i64());
        if duration.is_none() && rows.is_none() {
            return;
        }
        let rules = self.config.workload_classification;
        let olap = duration.map(|d| d > rules.oltp_max_ms).unwrap_or(false)
            || rows.map(|r| r >= rules.olap_min_rows).unwrap_or(false);
        record.set_attr("workload.kind", if olap { "olap" } else { "oltp" });
    }

    /// Evict the stalest session when the table is full; its buffer moves to
    /// the pending queue so nothing is lost.
    fn evict_if_full(
        &self,
        sessions: &mut HashMap<SessionKey, SessionRow>,
        pending: &mut Vec<Record>,
    ) {
        if sessions.len() < self.config.max_sessions {
            return;
        }
        let stalest = sessions
            .iter()
            .min_by_key(|(_, row)| row.last_seen)
            .map(|(k, _)| k.clone());
        if let Some(key) = stalest {
            if let Some(row) = sessions.remove(&key) {
                debug!(session = %key.session, "session table full, evicting stalest row");
                self.counters.incr("sessions.evicted");
                pending.extend(row.buffered);
            }
        }
    }

    /// Move expired rows' buffers to the pending queue.
    fn expire_idle(
        sessions: &Mutex<HashMap<SessionKey, SessionRow>>,
        pending: &Mutex<Vec<Record>>,
        counters: &StageCounters,
        now: DateTime<Utc>,
        idle_timeout_seconds: u64,
    ) {
        let mut sessions = sessions.lock();
        let cutoff = idle_timeout_seconds as i64;
        let expired: Vec<SessionKey> = sessions
            .iter()
            .filter(|(_, row)| (now - row.last_seen).num_seconds() >= cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        let mut pending = pending.lock();
        for key in expired {
            if let Some(row) = sessions.remove(&key) {
                counters.incr("sessions.expired");
                pending.extend(row.buffered);
            }
        }
    }
}

#[async_trait]
impl Processor for QueryCorrelator {
    fn name(&self) -> &'static str {
        "query_correlator"
    }

    async fn start(&self, shutdown: ShutdownSignal) -> Result<(), PipelineError> {
        let sessions = self.sessions.clone();
        let pending = self.pending.clone();
        let clock = self.clock.clone();
        let counters = self.counters.clone();
        let idle = self.config.idle_timeout_seconds;
        let mut signal = shutdown;
        self.workers.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = signal.cancelled() => break,
                    _ = tick.tick() => {
                        Self::expire_idle(&sessions, &pending, &counters, clock.now(), idle);
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

        // expiry also runs inline so a quiet background loop cannot delay
        // re-emission past the next batch
        Self::expire_idle(
            &self.sessions,
            &self.pending,
            &self.counters,
            now,
            self.config.idle_timeout_seconds,
        );

        let mut out: Vec<Record> = std::mem::take(&mut *self.pending.lock());

        for mut record in batch {
            self.classify_workload(&mut record);

            let Some(key) = SessionKey::of(&record) else {
                out.push(record);
                continue;
            };
            record.set_attr("correlation.session_id", key.session_correlation_id());

            let txn = record.attr_str("db.transaction_id").map(str::to_string);
            let boundary = is_txn_boundary(&record);

            let mut sessions = self.sessions.lock();
            if !sessions.contains_key(&key) {
                let mut pending = self.pending.lock();
                self.evict_if_full(&mut sessions, &mut pending);
                // evicted buffers surface with the next batch
                out.extend(pending.drain(..));
            }
            let row = sessions.entry(key.clone()).or_insert_with(|| SessionRow {
                last_seen: now,
                current_txn: None,
                buffered: Vec::new(),
            });
            row.last_seen = now;

            match txn {
                Some(txn) => {
                    // a different open transaction in the buffer flushes
                    // first, in its own arrival order
                    if row.current_txn.as_deref() != Some(txn.as_str())
                        && !row.buffered.is_empty()
                    {
                        out.append(&mut row.buffered);
                    }
                    row.current_txn = Some(txn.clone());
                    record.set_attr("correlation.txn_id", key.txn_correlation_id(&txn));

                    if boundary {
                        out.append(&mut row.buffered);
                        row.current_txn = None;
                        out.push(record);
                    } else {
                        if row.buffered.len() >= MAX_BUFFERED_PER_SESSION {
                            self.counters.incr("buffers.overflowed");
                            out.append(&mut row.buffered);
                        }
                        row.buffered.push(record);
                    }
                }
                None => out.push(record),
            }
        }

        let buffered: usize = self.sessions.lock().values().map(|r| r.buffered.len()).sum();
        self.counters.set_gauge("sessions.active", self.sessions.lock().len() as u64);
        self.counters.set_gauge("records.buffered", buffered as u64);
        self.counters.record_out(out.len() as u64);
        Batch::new(out)
    }

    async fn shutdown(&self) {
        self.workers.join_all().await;
        // in-flight buffers cannot be emitted any more; account for them
        let mut sessions = self.sessions.lock();
        let orphaned: u64 = sessions.values().map(|r| r.buffered.len() as u64).sum();
        sessions.clear();
        let pending = self.pending.lock().len() as u64;
        self.pending.lock().clear();
        self.counters.drop_records("shutdown_flush", orphaned + pending);
    }

    fn snapshot(&self) -> StageSnapshot {
        self.counters.snapshot(self.name())
    }
}
