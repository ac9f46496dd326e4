use std::sync::Arc;

use db_intel_core::{Batch, Clock, OsRandom, PipelineError, RandomSource, StageSnapshot, SystemClock};
use futures::future::join_all;
use tokio::sync::watch;
use tracing::info;

use crate::config::PipelineConfig;
use crate::processors::{
    AdaptiveSampler, CircuitBreaker, CostControl, NrErrorMonitor, PlanAttributeExtractor,
    Processor, QueryCorrelator, ShutdownSignal, Verification,
};

/// The processor chain in topological order, plus the scrape-outcome hook
/// and the counters the health surface reads.
///
/// Batches are exclusively owned while a stage holds them; `consume` moves
/// the batch through every stage and hands the survivor back to the caller
/// for export.
pub struct Pipeline {
    stages: Vec<Arc<dyn Processor>>,
    breaker: Arc<CircuitBreaker>,
    shutdown_tx: watch::Sender<bool>,
    run_id: uuid::Uuid,
}

impl Pipeline {
    /// Build and start the chain. Configuration problems are fatal; nothing
    /// is spawned unless every section validates.
    pub async fn start(
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
    ) -> Result<Pipeline, PipelineError> {
        config.validate()?;

        let sampler = Arc::new(AdaptiveSampler::new(
            config.adaptive_sampler.clone(),
            clock.clone(),
            random,
        )?);
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker.clone(),
            clock.clone(),
        ));
        let plans = Arc::new(PlanAttributeExtractor::new(
            config.plan_attribute_extractor.clone(),
            clock.clone(),
        ));
        let verification = Arc::new(Verification::new(
            config.verification.clone(),
            clock.clone(),
        ));
        let cost = Arc::new(CostControl::new(config.cost_control.clone(), clock.clone()));
        let monitor = Arc::new(NrErrorMonitor::new(
            config.nr_error_monitor.clone(),
            clock.clone(),
        ));
        let correlator = Arc::new(QueryCorrelator::new(
            config.query_correlator.clone(),
            clock.clone(),
        ));

        let stages: Vec<Arc<dyn Processor>> = vec![
            sampler,
            breaker.clone(),
            plans,
            verification,
            cost,
            monitor,
            correlator,
        ];

        let (shutdown_tx, signal) = ShutdownSignal::new();
        for stage in &stages {
            stage.start(signal.clone()).await?;
            info!(stage = stage.name(), "processor started");
        }

        Ok(Pipeline {
            stages,
            breaker,
            shutdown_tx,
            run_id: uuid::Uuid::new_v4(),
        })
    }

    /// Convenience constructor with the production clock and CSPRNG.
    pub async fn start_with_defaults(config: PipelineConfig) -> Result<Pipeline, PipelineError> {
        Pipeline::start(config, Arc::new(SystemClock), Arc::new(OsRandom)).await
    }

    /// Run one batch through every stage in order. Metric and log batches
    /// share the same chain. Empty batches still visit every stage so that
    /// buffered work (correlator flushes, due alerts) can surface.
    pub async fn consume(&self, mut batch: Batch) -> Batch {
        for stage in &self.stages {
            batch = stage.process(batch).await;
        }
        batch
    }

    pub async fn consume_metrics(&self, batch: Batch) -> Batch {
        self.consume(batch).await
    }

    pub async fn consume_logs(&self, batch: Batch) -> Batch {
        self.consume(batch).await
    }

    /// Receiver-side hook: forwarded to the circuit breaker.
    pub fn report_outcome(
        &self,
        db_system: &str,
        db_name: &str,
        success: bool,
        latency_ms: f64,
        error_class: Option<&str>,
    ) {
        self.breaker
            .report_outcome(db_system, db_name, success, latency_ms, error_class);
    }

    pub fn snapshots(&self) -> Vec<StageSnapshot> {
        self.stages.iter().map(|s| s.snapshot()).collect()
    }

    pub fn circuit_states(&self) -> std::collections::BTreeMap<String, String> {
        self.breaker.circuit_states()
    }

    pub fn run_id(&self) -> uuid::Uuid {
        self.run_id
    }

    /// Signal every background worker and join them; no timer fires after
    /// this returns.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        join_all(self.stages.iter().map(|s| s.shutdown())).await;
        info!("all processors stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use db_intel_core::{ManualClock, Record, SeededRandom};

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        ))
    }

    async fn pipeline(clock: Arc<ManualClock>) -> Pipeline {
        Pipeline::start(
            PipelineConfig::default(),
            clock,
            Arc::new(SeededRandom::new(11)),
        )
        .await
        .unwrap()
    }

    fn query_record(clock: &ManualClock, statement: &str) -> Record {
        Record::metric("postgresql.query.duration", clock.now(), 12.5)
            .with_attr("service.name", "orders-api")
            .with_attr("db.system", "postgresql")
            .with_attr("db.name", "orders")
            .with_attr("db.statement", statement)
    }

    #[tokio::test]
    async fn end_to_end_record_survives_with_annotations() {
        let c = clock();
        let p = pipeline(c.clone()).await;

        let out = p
            .consume(Batch::new(vec![query_record(
                &c,
                "SELECT * FROM orders WHERE id = 7",
            )]))
            .await;
        let record = out
            .records
            .iter()
            .find(|r| r.name == "postgresql.query.duration")
            .expect("record emitted");
        assert_eq!(record.attr_str("sampling.rule"), Some("default"));
        assert_eq!(
            record.attr_str("db.statement"),
            Some("SELECT * FROM orders WHERE id = ?")
        );
        p.shutdown().await;
    }

    #[tokio::test]
    async fn record_time_is_never_mutated() {
        let c = clock();
        let p = pipeline(c.clone()).await;
        let t = c.now();

        let out = p
            .consume(Batch::new(vec![query_record(&c, "SELECT a FROM b")]))
            .await;
        for record in &out.records {
            if record.name == "postgresql.query.duration" {
                assert_eq!(record.time, t);
            }
        }
        p.shutdown().await;
    }

    #[tokio::test]
    async fn empty_batch_stays_empty() {
        let c = clock();
        let p = pipeline(c.clone()).await;
        let out = p.consume(Batch::empty()).await;
        assert!(out.is_empty());
        p.shutdown().await;
    }

    #[tokio::test]
    async fn circuit_gate_integrates_with_report_hook() {
        let c = clock();
        let p = pipeline(c.clone()).await;

        for _ in 0..5 {
            p.report_outcome("postgresql", "orders", false, 5.0, Some("timeout"));
        }
        let out = p
            .consume(Batch::new(vec![query_record(&c, "SELECT 1 FROM t")]))
            .await;
        assert!(
            !out.records.iter().any(|r| r.name == "postgresql.query.duration"),
            "open circuit must gate the record"
        );
        assert_eq!(
            p.circuit_states().get("postgresql/orders").map(String::as_str),
            Some("open")
        );
        p.shutdown().await;
    }

    #[tokio::test]
    async fn records_are_conserved_across_the_chain() {
        let c = clock();
        let p = pipeline(c.clone()).await;

        let records: Vec<Record> = (0..40)
            .map(|i| {
                let table = (b'a' + (i % 26) as u8) as char;
                query_record(&c, &format!("SELECT * FROM tbl_{table} WHERE x = y"))
            })
            .collect();
        p.consume(Batch::new(records)).await;

        for snap in p.snapshots() {
            let buffered = snap.gauges.get("records.buffered").copied().unwrap_or(0);
            assert_eq!(
                snap.records_in,
                snap.records_out
                    .saturating_sub(synthetic_out(&snap))
                    + snap.dropped_total()
                    + buffered,
                "conservation violated in {}",
                snap.stage
            );
        }
        p.shutdown().await;
    }

    /// Stages that synthesize records (cost metrics, alerts) emit more than
    /// they take in; subtract those for the conservation check.
    fn synthetic_out(snap: &StageSnapshot) -> u64 {
        match snap.stage.as_str() {
            // three cost metrics on the first minute roll
            "cost_control" => 3,
            _ => 0,
        }
    }

    #[tokio::test]
    async fn snapshots_cover_every_stage() {
        let c = clock();
        let p = pipeline(c.clone()).await;
        let names: Vec<String> = p.snapshots().into_iter().map(|s| s.stage).collect();
        assert_eq!(
            names,
            vec![
                "adaptive_sampler",
                "circuit_breaker",
                "plan_attribute_extractor",
                "verification",
                "cost_control",
                "nr_error_monitor",
                "query_correlator"
            ]
        );
        p.shutdown().await;
    }

    #[tokio::test]
    async fn double_start_is_refused_on_bad_config() {
        let mut config = PipelineConfig::default();
        config.adaptive_sampler.default_rate = 2.0;
        let result = Pipeline::start(
            config,
            clock(),
            Arc::new(SeededRandom::new(1)),
        )
        .await;
        assert!(result.is_err());
    }
}
