use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db_intel_core::{
    Batch, Clock, PipelineError, Record, RecordKind, StageCounters, StageSnapshot,
};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use tracing::warn;

use crate::config::{CheckAction, CheckKind, ErrorMonitorConfig};
use crate::processors::{Processor, ShutdownSignal};

/// Pre-export validation against the sink's ingest limits.
///
/// Each configured check carries its own action; violations are counted per
/// kind, and a sustained violation rate raises a synthetic `nrerror.alert`
/// log record at most once per cool-down window. Alert records ride the
/// outgoing batch, so the monitor never calls back into the chain.
pub struct NrErrorMonitor {
    config: ErrorMonitorConfig,
    checks: HashMap<CheckKind, CheckSettings>,
    alerts: Mutex<AlertState>,
    clock: Arc<dyn Clock>,
    counters: StageCounters,
}

#[derive(Debug, Clone, Copy)]
struct CheckSettings {
    action: CheckAction,
    alert_rate_per_minute: u64,
}

#[derive(Debug, Default)]
struct AlertState {
    minute: i64,
    counts: HashMap<CheckKind, u64>,
    last_alert: HashMap<CheckKind, DateTime<Utc>>,
}

lazy_static! {
    static ref KEY_SYNTAX: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").unwrap();
}

/// Metric unit suffixes; a log record carrying one has its kind and name in
/// disagreement.
const METRIC_SUFFIXES: [&str; 6] = [".count", ".duration", ".bytes", ".total", "_ms", "_total"];

/// Fields the sink's entity synthesis requires per database system.
fn semconv_required(db_system: &str) -> &'static [&'static str] {
    match db_system {
        "postgresql" | "mysql" => &["db.name"],
        _ => &[],
    }
}

enum Verdict {
    Pass,
    Drop,
}

impl NrErrorMonitor {
    pub fn new(config: ErrorMonitorConfig, clock: Arc<dyn Clock>) -> Self {
        let checks = config
            .checks
            .iter()
            .map(|c| {
                (
                    c.kind,
                    CheckSettings {
                        action: c.action,
                        alert_rate_per_minute: c.alert_rate_per_minute,
                    },
                )
            })
            .collect();
        Self {
            config,
            checks,
            alerts: Mutex::new(AlertState::default()),
            clock,
            counters: StageCounters::new(),
        }
    }

    /// Count the violation and decide whether an alert record is due.
    fn register_violation(&self, kind: CheckKind, now: DateTime<Utc>) -> bool {
        self.counters.incr(&format!("violation.{}", kind.as_str()));

        let settings = match self.checks.get(&kind) {
            Some(s) => *s,
            None => return false,
        };
        if settings.alert_rate_per_minute == 0 {
            return false;
        }

        let mut state = self.alerts.lock();
        let minute = now.timestamp() / 60;
        if state.minute != minute {
            state.minute = minute;
            state.counts.clear();
        }
        let count = state.counts.entry(kind).or_insert(0);
        *count += 1;
        if *count < settings.alert_rate_per_minute {
            return false;
        }

        let cooldown = self.config.cooldown_seconds as i64;
        let due = match state.last_alert.get(&kind) {
            Some(last) => (now - *last).num_seconds() >= cooldown,
            None => true,
        };
        if due {
            state.last_alert.insert(kind, now);
        }
        due
    }

    fn apply_check(
        &self,
        record: &mut Record,
        kind: CheckKind,
        now: DateTime<Utc>,
        alerts_due: &mut Vec<CheckKind>,
    ) -> Verdict {
        let Some(settings) = self.checks.get(&kind).copied() else {
            return Verdict::Pass;
        };
        let violated = match kind {
            CheckKind::KeySyntax => record
                .attributes
                .keys()
                .any(|k| !KEY_SYNTAX.is_match(k)),
            CheckKind::ValueLength => record.attributes.values().any(|v| {
                v.as_str()
                    .map(|s| s.len() > self.config.max_value_len)
                    .unwrap_or(false)
            }),
            CheckKind::AttrCount => record.attributes.len() > self.config.max_attr_count,
            CheckKind::UnitSuffix => {
                record.kind == RecordKind::Log
                    && METRIC_SUFFIXES.iter().any(|s| record.name.ends_with(s))
            }
            CheckKind::SemanticConvention => match record.attr_str("db.system") {
                Some(system) => semconv_required(system)
                    .iter()
                    .any(|field| record.attr(field).is_none()),
                None => false,
            },
        };
        if !violated {
            return Verdict::Pass;
        }

        if self.register_violation(kind, now) {
            alerts_due.push(kind);
        }

        match settings.action {
            CheckAction::WarnOnly => {
                warn!(check = kind.as_str(), record = %record.name, "sink limit violation");
                Verdict::Pass
            }
            CheckAction::Drop => Verdict::Drop,
            CheckAction::Truncate => {
                self.truncate(record, kind);
                Verdict::Pass
            }
        }
    }

    fn truncate(&self, record: &mut Record, kind: CheckKind) {
        match kind {
            CheckKind::ValueLength => {
                let max = self.config.max_value_len;
                for value in record.attributes.values_mut() {
                    if let db_intel_core::AttrValue::Str(s) = value {
                        if s.len() > max {
                            let mut cut = max;
                            while cut > 0 && !s.is_char_boundary(cut) {
                                cut -= 1;
                            }
                            s.truncate(cut);
                            self.counters.incr("truncated.values");
                        }
                    }
                }
            }
            CheckKind::AttrCount => {
                // deterministic trim: keep the alphabetically-first keys
                let mut keys: Vec<String> = record.attributes.keys().cloned().collect();
                keys.sort();
                for key in keys.into_iter().skip(self.config.max_attr_count) {
                    record.attributes.remove(&key);
                    self.counters.incr("truncated.attributes");
                }
            }
            CheckKind::KeySyntax => {
                let bad: Vec<String> = record
                    .attributes
                    .keys()
                    .filter(|k| !KEY_SYNTAX.is_match(k))
                    .cloned()
                    .collect();
                for key in bad {
                    record.attributes.remove(&key);
                    self.counters.incr("truncated.attributes");
                }
            }
            // nothing sensible to cut for these
            CheckKind::UnitSuffix | CheckKind::SemanticConvention => {}
        }
    }

    fn alert_record(&self, kind: CheckKind, template: Option<&Record>) -> Record {
        let now = self.clock.now();
        let mut alert = Record::log(
            "nrerror.alert",
            now,
            format!(
                "sink violation rate for '{}' crossed the alert threshold",
                kind.as_str()
            ),
        )
        .with_scope("nr_error_monitor")
        .with_attr("violation.kind", kind.as_str());
        if let Some(t) = template {
            alert.resource = t.resource.clone();
        }
        alert
    }
}

#[async_trait]
impl Processor for NrErrorMonitor {
    fn name(&self) -> &'static str {
        "nr_error_monitor"
    }

    async fn start(&self, _shutdown: ShutdownSignal) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn process(&self, batch: Batch) -> Batch {
        self.counters.batch_in();
        self.counters.record_in(batch.len() as u64);
        let now = self.clock.now();

        const CHECK_ORDER: [CheckKind; 5] = [
            CheckKind::KeySyntax,
            CheckKind::ValueLength,
            CheckKind::AttrCount,
            CheckKind::UnitSuffix,
            CheckKind::SemanticConvention,
        ];

        let mut alerts_due: Vec<CheckKind> = Vec::new();
        let mut out = Vec::with_capacity(batch.len());
        for mut record in batch {
            let mut verdict = Verdict::Pass;
            for kind in CHECK_ORDER {
                if let Verdict::Drop = self.apply_check(&mut record, kind, now, &mut alerts_due) {
                    verdict = Verdict::Drop;
                    self.counters.drop_record(kind.as_str());
                    break;
                }
            }
            if let Verdict::Pass = verdict {
                out.push(record);
            }
        }

        let template = out.first().cloned();
        for kind in alerts_due {
            out.push(self.alert_record(kind, template.as_ref()));
        }

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
    use crate::config::CheckConfig;
    use chrono::TimeZone;
    use db_intel_core::ManualClock;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn config_with(checks: Vec<CheckConfig>) -> ErrorMonitorConfig {
        ErrorMonitorConfig {
            max_value_len: 32,
            max_attr_count: 4,
            checks,
            cooldown_seconds: 300,
        }
    }

    fn check(kind: CheckKind, action: CheckAction, rate: u64) -> CheckConfig {
        CheckConfig {
            kind,
            action,
            alert_rate_per_minute: rate,
        }
    }

    #[tokio::test]
    async fn long_values_are_truncated() {
        let c = clock();
        let m = NrErrorMonitor::new(
            config_with(vec![check(CheckKind::ValueLength, CheckAction::Truncate, 0)]),
            c.clone(),
        );
        let record = Record::metric("m", c.now(), 1.0)
            .with_attr("db.statement", "x".repeat(100));
        let out = m.process(Batch::new(vec![record])).await;
        assert_eq!(out.records[0].attr_str("db.statement").unwrap().len(), 32);
        assert_eq!(
            m.snapshot().counters.get("violation.value_length"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn bad_key_syntax_drops_when_configured() {
        let c = clock();
        let m = NrErrorMonitor::new(
            config_with(vec![check(CheckKind::KeySyntax, CheckAction::Drop, 0)]),
            c.clone(),
        );
        let record = Record::metric("m", c.now(), 1.0).with_attr("9bad key!", "v");
        let out = m.process(Batch::new(vec![record])).await;
        assert!(out.is_empty());
        assert_eq!(m.snapshot().drops.get("key_syntax"), Some(&1));
    }

    #[tokio::test]
    async fn attr_overflow_truncates_deterministically() {
        let c = clock();
        let m = NrErrorMonitor::new(
            config_with(vec![check(CheckKind::AttrCount, CheckAction::Truncate, 0)]),
            c.clone(),
        );
        let mut record = Record::metric("m", c.now(), 1.0);
        for i in 0..8 {
            record.set_attr(format!("attr_{i}"), i as i64);
        }
        let out = m.process(Batch::new(vec![record])).await;
        let kept = &out.records[0].attributes;
        assert_eq!(kept.len(), 4);
        for i in 0..4 {
            assert!(kept.contains_key(&format!("attr_{i}")), "attr_{i} missing");
        }
    }

    #[tokio::test]
    async fn log_with_metric_suffix_is_flagged() {
        let c = clock();
        let m = NrErrorMonitor::new(
            config_with(vec![check(CheckKind::UnitSuffix, CheckAction::WarnOnly, 0)]),
            c.clone(),
        );
        let log = Record::log("postgresql.query.count", c.now(), "body");
        let out = m.process(Batch::new(vec![log])).await;
        assert_eq!(out.len(), 1, "warn-only must pass the record");
        assert_eq!(m.snapshot().counters.get("violation.unit_suffix"), Some(&1));
    }

    #[tokio::test]
    async fn missing_semconv_field_is_flagged() {
        let c = clock();
        let m = NrErrorMonitor::new(
            config_with(vec![check(
                CheckKind::SemanticConvention,
                CheckAction::WarnOnly,
                0,
            )]),
            c.clone(),
        );
        let record = Record::metric("m", c.now(), 1.0).with_attr("db.system", "postgresql");
        m.process(Batch::new(vec![record])).await;
        assert_eq!(
            m.snapshot().counters.get("violation.semantic_convention"),
            Some(&1)
        );

        let ok = Record::metric("m", c.now(), 1.0)
            .with_attr("db.system", "postgresql")
            .with_attr("db.name", "orders");
        m.process(Batch::new(vec![ok])).await;
        assert_eq!(
            m.snapshot().counters.get("violation.semantic_convention"),
            Some(&1),
            "conforming record must not count"
        );
    }

    #[tokio::test]
    async fn alert_emitted_once_per_cooldown() {
        let c = clock();
        let m = NrErrorMonitor::new(
            config_with(vec![check(CheckKind::KeySyntax, CheckAction::WarnOnly, 3)]),
            c.clone(),
        );
        let mk = |c: &ManualClock| Record::metric("m", c.now(), 1.0).with_attr("bad key", "v");

        let out = m
            .process(Batch::new(vec![mk(&c), mk(&c), mk(&c), mk(&c)]))
            .await;
        let alerts: Vec<&Record> = out
            .records
            .iter()
            .filter(|r| r.name == "nrerror.alert")
            .collect();
        assert_eq!(alerts.len(), 1, "exactly one alert for the burst");
        assert_eq!(alerts[0].attr_str("violation.kind"), Some("key_syntax"));
        assert_eq!(alerts[0].kind, RecordKind::Log);

        // still inside the cool-down: more violations, no second alert
        let out = m.process(Batch::new(vec![mk(&c), mk(&c), mk(&c)])).await;
        assert!(!out.records.iter().any(|r| r.name == "nrerror.alert"));

        // past the cool-down the alert can fire again
        c.advance(chrono::Duration::seconds(301));
        let out = m
            .process(Batch::new(vec![mk(&c), mk(&c), mk(&c), mk(&c)]))
            .await;
        assert!(out.records.iter().any(|r| r.name == "nrerror.alert"));
    }

    #[tokio::test]
    async fn unconfigured_checks_do_not_run() {
        let c = clock();
        let m = NrErrorMonitor::new(config_with(Vec::new()), c.clone());
        let record = Record::metric("m", c.now(), 1.0).with_attr("bad key!", "v");
        let out = m.process(Batch::new(vec![record])).await;
        assert_eq!(out.len(), 1);
        assert!(m.snapshot().counters.is_empty());
    }
}
