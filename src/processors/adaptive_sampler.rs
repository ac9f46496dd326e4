use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db_intel_core::{
    Batch, Clock, PipelineError, RandomSource, Record, SharedLru, StageCounters, StageSnapshot,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{SamplerConfig, SamplingRuleConfig};
use crate::fingerprint;
use crate::processors::predicate::Predicate;
use crate::processors::{Processor, ShutdownSignal};

/// Rule-driven per-record sampling with near-duplicate suppression.
///
/// Kept records gain `sampling.rule`, `sampling.rate_applied`, and
/// `sampling.priority`; cost control reads the priority downstream. The
/// output batch is a sub-sequence of the input in original order.
pub struct AdaptiveSampler {
    config: SamplerConfig,
    rules: Vec<CompiledRule>,
    dedupe: Option<SharedLru<u64, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    counters: StageCounters,
}

struct CompiledRule {
    name: String,
    priority: i64,
    predicate: Predicate,
    rate: f64,
    bucket: Option<Mutex<TokenBucket>>,
}

struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    /// Refill then try to take one token; refusal falls the caller back to
    /// the default rate, not to the next rule.
    fn try_take(&mut self, now: DateTime<Utc>) -> bool {
        let elapsed = (now - self.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl AdaptiveSampler {
    pub fn new(
        config: SamplerConfig,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
    ) -> Result<Self, PipelineError> {
        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in &config.rules {
            rules.push(CompiledRule::compile(rule, clock.now())?);
        }
        // first matching rule wins, so evaluation order is priority order
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        let dedupe = if config.dedupe.enabled {
            Some(SharedLru::with_capacity(config.dedupe.cache_size))
        } else {
            None
        };

        Ok(Self {
            config,
            rules,
            dedupe,
            clock,
            random,
            counters: StageCounters::new(),
        })
    }

    /// Identity of a record for dedupe purposes, from the configured
    /// attribute set. Records exposing none of them have no identity and
    /// are never suppressed.
    fn record_fingerprint(&self, record: &Record) -> Option<u64> {
        let parts: Vec<&str> = self
            .config
            .fingerprint_attributes
            .iter()
            .filter_map(|key| record.attr_str(key))
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(fingerprint::fingerprint_parts(parts))
        }
    }

    fn is_duplicate(&self, fp: u64, now: DateTime<Utc>) -> bool {
        let Some(cache) = &self.dedupe else {
            return false;
        };
        let window = self.config.dedupe.window_seconds as i64;
        let duplicate = matches!(
            cache.peek_cloned(&fp),
            Some(last_seen) if (now - last_seen).num_seconds() < window
        );
        if !duplicate {
            cache.put(fp, now);
        }
        duplicate
    }

    /// Decide rule and effective rate for a record.
    fn effective_rate(&self, record: &Record, now: DateTime<Utc>) -> Result<Decision, ()> {
        for rule in &self.rules {
            match rule.predicate.eval(record) {
                Ok(false) => continue,
                Ok(true) => {
                    if let Some(bucket) = &rule.bucket {
                        if !bucket.lock().try_take(now) {
                            return Ok(Decision {
                                rule_name: rule.name.clone(),
                                priority: rule.priority,
                                rate: self.config.default_rate,
                            });
                        }
                    }
                    return Ok(Decision {
                        rule_name: rule.name.clone(),
                        priority: rule.priority,
                        rate: rule.rate,
                    });
                }
                Err(e) => {
                    debug!(rule = %rule.name, error = %e, "sampling predicate evaluation failed");
                    self.counters.incr("sampling.predicate_errors");
                    return Err(());
                }
            }
        }
        Ok(Decision {
            rule_name: "default".to_string(),
            priority: 0,
            rate: self.config.default_rate,
        })
    }

    /// Uniform draw against the rate. Rates of 0 and 1 decide without
    /// consuming entropy so replay under a seeded source stays aligned.
    fn keep(&self, rate: f64) -> Result<bool, PipelineError> {
        if rate >= 1.0 {
            return Ok(true);
        }
        if rate <= 0.0 {
            return Ok(false);
        }
        Ok(self.random.next_unit()? < rate)
    }
}

struct Decision {
    rule_name: String,
    priority: i64,
    rate: f64,
}

impl CompiledRule {
    fn compile(config: &SamplingRuleConfig, now: DateTime<Utc>) -> Result<Self, PipelineError> {
        let predicate = Predicate::parse(&config.predicate).map_err(|e| {
            PipelineError::config(format!(
                "sampling rule '{}': predicate does not parse: {e}",
                config.name
            ))
        })?;
        let bucket = config.token_bucket.map(|b| {
            Mutex::new(TokenBucket {
                capacity: b.capacity,
                refill_per_second: b.refill_per_second,
                tokens: b.capacity,
                last_refill: now,
            })
        });
        Ok(Self {
            name: config.name.clone(),
            priority: config.priority,
            predicate,
            rate: config.rate,
            bucket,
        })
    }
}

#[async_trait]
impl Processor for AdaptiveSampler {
    fn name(&self) -> &'static str {
        "adaptive_sampler"
    }

    async fn start(&self, _shutdown: ShutdownSignal) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn process(&self, batch: Batch) -> Batch {
        self.counters.batch_in();
        self.counters.record_in(batch.len() as u64);
        let now = self.clock.now();

        let mut kept = Vec::with_capacity(batch.len());
        for mut record in batch {
            if let Some(fp) = self.record_fingerprint(&record) {
                if self.is_duplicate(fp, now) {
                    self.counters.drop_record("duplicate");
                    continue;
                }
            }

            let decision = match self.effective_rate(&record, now) {
                Ok(d) => d,
                Err(()) => {
                    self.counters.drop_record("predicate_error");
                    continue;
                }
            };

            match self.keep(decision.rate) {
                Ok(true) => {
                    record.set_attr("sampling.rule", decision.rule_name);
                    record.set_attr("sampling.rate_applied", decision.rate);
                    record.set_attr("sampling.priority", decision.priority);
                    kept.push(record);
                }
                Ok(false) => {
                    self.counters.drop_record("sampled");
                }
                Err(e) => {
                    // fail closed: never degrade to weaker randomness
                    warn!(error = %e, "random source failed, dropping record");
                    self.counters.incr("sampling.rng_failures");
                    self.counters.drop_record("rng_failure");
                }
            }
        }

        self.counters.record_out(kept.len() as u64);
        if let Some(cache) = &self.dedupe {
            self.counters.set_gauge("dedupe.cache_size", cache.len() as u64);
        }
        Batch::new(kept)
    }

    async fn shutdown(&self) {}

    fn snapshot(&self) -> StageSnapshot {
        self.counters.snapshot(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DedupeConfig, TokenBucketConfig};
    use chrono::{Duration, TimeZone};
    use db_intel_core::{FailingRandom, ManualClock, SeededRandom};

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn sampler_with(config: SamplerConfig, clock: Arc<ManualClock>) -> AdaptiveSampler {
        AdaptiveSampler::new(config, clock, Arc::new(SeededRandom::new(7))).unwrap()
    }

    fn query_record(statement: &str, t: DateTime<Utc>) -> Record {
        Record::metric("postgresql.query.duration", t, 1.0).with_attr("db.statement", statement)
    }

    #[tokio::test]
    async fn dedupe_suppresses_within_window() {
        let clock = clock();
        let config = SamplerConfig {
            default_rate: 1.0,
            dedupe: DedupeConfig {
                enabled: true,
                window_seconds: 60,
                cache_size: 100,
            },
            ..SamplerConfig::default()
        };
        let sampler = sampler_with(config, clock.clone());

        let t0 = clock.now();
        let first = sampler
            .process(Batch::new(vec![query_record(
                "SELECT * FROM t WHERE id=1",
                t0,
            )]))
            .await;
        assert_eq!(first.len(), 1);
        assert_eq!(first.records[0].attr_str("sampling.rule"), Some("default"));
        assert_eq!(first.records[0].attr_f64("sampling.rate_applied"), Some(1.0));

        clock.advance(Duration::seconds(10));
        let second = sampler
            .process(Batch::new(vec![query_record(
                "SELECT * FROM t WHERE id=1",
                clock.now(),
            )]))
            .await;
        assert!(second.is_empty());

        let snap = sampler.snapshot();
        assert_eq!(snap.drops.get("duplicate"), Some(&1));
        assert_eq!(snap.gauges.get("dedupe.cache_size"), Some(&1));
    }

    #[tokio::test]
    async fn dedupe_expires_after_window() {
        let clock = clock();
        let sampler = sampler_with(SamplerConfig::default(), clock.clone());

        let out = sampler
            .process(Batch::new(vec![query_record("SELECT 1", clock.now())]))
            .await;
        assert_eq!(out.len(), 1);

        clock.advance(Duration::seconds(61));
        let out = sampler
            .process(Batch::new(vec![query_record("SELECT 1", clock.now())]))
            .await;
        assert_eq!(out.len(), 1, "window elapsed, not a duplicate");
    }

    #[tokio::test]
    async fn literal_variants_are_duplicates() {
        let clock = clock();
        let sampler = sampler_with(SamplerConfig::default(), clock.clone());

        let batch = Batch::new(vec![
            query_record("SELECT * FROM t WHERE id = 1", clock.now()),
            query_record("SELECT * FROM t WHERE id = 2", clock.now()),
        ]);
        let out = sampler.process(batch).await;
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn first_matching_rule_by_priority_wins() {
        let clock = clock();
        let config = SamplerConfig {
            default_rate: 0.0,
            rules: vec![
                SamplingRuleConfig {
                    name: "low".to_string(),
                    priority: 1,
                    predicate: "db.system == 'postgresql'".to_string(),
                    rate: 0.0,
                    token_bucket: None,
                },
                SamplingRuleConfig {
                    name: "high".to_string(),
                    priority: 100,
                    predicate: "db.system == 'postgresql'".to_string(),
                    rate: 1.0,
                    token_bucket: None,
                },
            ],
            dedupe: DedupeConfig {
                enabled: false,
                ..DedupeConfig::default()
            },
            ..SamplerConfig::default()
        };
        let sampler = sampler_with(config, clock.clone());

        let record = Record::metric("m", clock.now(), 1.0).with_attr("db.system", "postgresql");
        let out = sampler.process(Batch::new(vec![record])).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out.records[0].attr_str("sampling.rule"), Some("high"));
        assert_eq!(
            out.records[0].attr("sampling.priority").and_then(|v| v.as_i64()),
            Some(100)
        );
    }

    #[tokio::test]
    async fn empty_token_bucket_falls_back_to_default_rate() {
        let clock = clock();
        let config = SamplerConfig {
            default_rate: 0.0,
            rules: vec![SamplingRuleConfig {
                name: "burst".to_string(),
                priority: 10,
                predicate: "db.system == 'postgresql'".to_string(),
                rate: 1.0,
                token_bucket: Some(TokenBucketConfig {
                    capacity: 2.0,
                    refill_per_second: 0.0,
                }),
            }],
            dedupe: DedupeConfig {
                enabled: false,
                ..DedupeConfig::default()
            },
            ..SamplerConfig::default()
        };
        let sampler = sampler_with(config, clock.clone());

        let mk = || Record::metric("m", clock.now(), 1.0).with_attr("db.system", "postgresql");
        let out = sampler
            .process(Batch::new(vec![mk(), mk(), mk(), mk()]))
            .await;
        // two tokens pass at the rule rate; the rest fall to defaultRate = 0
        assert_eq!(out.len(), 2);
        let snap = sampler.snapshot();
        assert_eq!(snap.drops.get("sampled"), Some(&2));
    }

    #[tokio::test]
    async fn token_bucket_refills_over_time() {
        let clock = clock();
        let config = SamplerConfig {
            default_rate: 0.0,
            rules: vec![SamplingRuleConfig {
                name: "burst".to_string(),
                priority: 10,
                predicate: "db.system == 'postgresql'".to_string(),
                rate: 1.0,
                token_bucket: Some(TokenBucketConfig {
                    capacity: 1.0,
                    refill_per_second: 1.0,
                }),
            }],
            dedupe: DedupeConfig {
                enabled: false,
                ..DedupeConfig::default()
            },
            ..SamplerConfig::default()
        };
        let sampler = sampler_with(config, clock.clone());
        let mk = |c: &ManualClock| {
            Record::metric("m", c.now(), 1.0).with_attr("db.system", "postgresql")
        };

        assert_eq!(
            sampler.process(Batch::new(vec![mk(&clock)])).await.len(),
            1
        );
        assert_eq!(
            sampler.process(Batch::new(vec![mk(&clock)])).await.len(),
            0,
            "bucket exhausted"
        );
        clock.advance(Duration::seconds(2));
        assert_eq!(
            sampler.process(Batch::new(vec![mk(&clock)])).await.len(),
            1,
            "bucket refilled"
        );
    }

    #[tokio::test]
    async fn rng_failure_drops_record_and_counts() {
        let clock = clock();
        let config = SamplerConfig {
            default_rate: 0.5,
            dedupe: DedupeConfig {
                enabled: false,
                ..DedupeConfig::default()
            },
            ..SamplerConfig::default()
        };
        let sampler =
            AdaptiveSampler::new(config, clock.clone(), Arc::new(FailingRandom)).unwrap();

        let out = sampler
            .process(Batch::new(vec![query_record("SELECT 1", clock.now())]))
            .await;
        assert!(out.is_empty());
        let snap = sampler.snapshot();
        assert_eq!(snap.counters.get("sampling.rng_failures"), Some(&1));
        assert_eq!(snap.drops.get("rng_failure"), Some(&1));
    }

    #[tokio::test]
    async fn retention_rate_tracks_configured_probability() {
        let clock = clock();
        let config = SamplerConfig {
            default_rate: 0.3,
            dedupe: DedupeConfig {
                enabled: false,
                ..DedupeConfig::default()
            },
            ..SamplerConfig::default()
        };
        let sampler = sampler_with(config, clock.clone());

        let n = 20_000usize;
        let records: Vec<Record> = (0..n)
            .map(|i| Record::metric(format!("m{i}"), clock.now(), 1.0))
            .collect();
        let out = sampler.process(Batch::new(records)).await;
        let observed = out.len() as f64 / n as f64;
        // ~4 standard deviations of slack around p = 0.3
        assert!(
            (observed - 0.3).abs() < 0.015,
            "observed retention {observed} too far from 0.3"
        );
    }

    #[tokio::test]
    async fn seeded_replay_is_deterministic() {
        let clock_a = clock();
        let config = SamplerConfig {
            default_rate: 0.5,
            dedupe: DedupeConfig {
                enabled: false,
                ..DedupeConfig::default()
            },
            ..SamplerConfig::default()
        };
        let a = AdaptiveSampler::new(config.clone(), clock_a.clone(), Arc::new(SeededRandom::new(99)))
            .unwrap();
        let b = AdaptiveSampler::new(config, clock_a.clone(), Arc::new(SeededRandom::new(99)))
            .unwrap();

        let records: Vec<Record> = (0..256)
            .map(|i| Record::metric(format!("m{i}"), clock_a.now(), 1.0))
            .collect();
        let out_a = a.process(Batch::new(records.clone())).await;
        let out_b = b.process(Batch::new(records)).await;
        let names = |batch: &Batch| -> Vec<String> {
            batch.records.iter().map(|r| r.name.clone()).collect()
        };
        assert_eq!(names(&out_a), names(&out_b));
    }

    #[tokio::test]
    async fn counters_conserve_records() {
        let clock = clock();
        let sampler = sampler_with(
            SamplerConfig {
                default_rate: 0.5,
                ..SamplerConfig::default()
            },
            clock.clone(),
        );
        // 26 distinct shapes so both the duplicate and sampled paths are hit
        let records: Vec<Record> = (0..100)
            .map(|i| {
                let table = (b'a' + (i % 26) as u8) as char;
                query_record(&format!("SELECT * FROM table_{table}"), clock.now())
            })
            .collect();
        let out = sampler.process(Batch::new(records)).await;
        let snap = sampler.snapshot();
        assert_eq!(
            snap.records_in,
            snap.records_out + snap.dropped_total()
        );
        assert_eq!(out.len() as u64, snap.records_out);
    }
}
