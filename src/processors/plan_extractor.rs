use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db_intel_core::{
    Batch, Clock, PipelineError, Record, RecordValue, SharedLru, StageCounters, StageSnapshot,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

use crate::config::PlanConfig;
use crate::fingerprint;
use crate::processors::{Processor, ShutdownSignal, WorkerSet};
use crate::sanitize;

/// Extracts structured attributes from execution plans, fingerprints the
/// canonical plan tree, flags latency regressions against a per-query
/// baseline, and anonymizes the statement before any downstream stage can
/// read it.
///
/// Extraction is additive: a record that defeats the parser passes through
/// unchanged and the failure is counted.
pub struct PlanAttributeExtractor {
    config: PlanConfig,
    baselines: Arc<SharedLru<u64, Baseline>>,
    clock: Arc<dyn Clock>,
    counters: StageCounters,
    workers: WorkerSet,
}

/// Rolling per-fingerprint history of the last N observations.
#[derive(Debug, Clone)]
struct Baseline {
    latencies_ms: Vec<f64>,
    costs: Vec<f64>,
    window: usize,
    last_updated: DateTime<Utc>,
}

impl Baseline {
    fn new(window: usize, now: DateTime<Utc>) -> Self {
        Self {
            latencies_ms: Vec::new(),
            costs: Vec::new(),
            window,
            last_updated: now,
        }
    }

    fn mean_latency(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        Some(self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64)
    }

    fn p95_latency(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        let mut sorted = self.latencies_ms.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
        Some(sorted[idx.saturating_sub(1).min(sorted.len() - 1)])
    }

    fn mean_cost(&self) -> Option<f64> {
        if self.costs.is_empty() {
            return None;
        }
        Some(self.costs.iter().sum::<f64>() / self.costs.len() as f64)
    }

    fn push(&mut self, latency_ms: Option<f64>, cost: Option<f64>, now: DateTime<Utc>) {
        if let Some(l) = latency_ms {
            if self.latencies_ms.len() == self.window {
                self.latencies_ms.remove(0);
            }
            self.latencies_ms.push(l);
        }
        if let Some(c) = cost {
            if self.costs.len() == self.window {
                self.costs.remove(0);
            }
            self.costs.push(c);
        }
        self.last_updated = now;
    }
}

/// A parsed plan tree, format-independent.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanNode {
    pub node_type: String,
    pub total_cost: f64,
    pub rows: f64,
    pub width: i64,
    pub children: Vec<PlanNode>,
}

impl PlanNode {
    fn depth(&self) -> usize {
        1 + self.children.iter().map(PlanNode::depth).max().unwrap_or(0)
    }

    fn any(&self, pred: &dyn Fn(&PlanNode) -> bool) -> bool {
        pred(self) || self.children.iter().any(|c| c.any(pred))
    }

    /// Cost attributable to the node itself: total cost minus what its
    /// children account for.
    fn self_cost(&self) -> f64 {
        let child_cost: f64 = self.children.iter().map(|c| c.total_cost).sum();
        (self.total_cost - child_cost).max(0.0)
    }

    fn dominant_op(&self) -> &PlanNode {
        let mut best = self;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.self_cost() > best.self_cost() {
                best = node;
            }
            stack.extend(node.children.iter());
        }
        best
    }

    /// Canonical form: node type, cost rounded to an integer, children
    /// sorted by their own canonical strings. Literal-insensitive and
    /// sibling-order-insensitive; stable across restarts.
    fn canonical(&self) -> String {
        let mut children: Vec<String> = self.children.iter().map(PlanNode::canonical).collect();
        children.sort();
        format!(
            "{}({})[{}]",
            self.node_type,
            self.total_cost.round() as i64,
            children.join(",")
        )
    }

    /// Content-addressed identity: SHA-256 of the canonical form, first 16
    /// bytes hex-encoded.
    pub fn signature(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        hex::encode(&digest[..16])
    }
}

/// Extraction deadline carried through parsing; plans are attacker-sized
/// inputs and the walk must stay bounded.
struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    fn new(budget_ms: u64) -> Self {
        Self {
            started: Instant::now(),
            budget: Duration::from_millis(budget_ms),
        }
    }

    fn expired(&self) -> bool {
        self.started.elapsed() >= self.budget
    }
}

#[derive(Debug, PartialEq)]
enum ParseFailure {
    Malformed,
    Timeout,
}

impl PlanAttributeExtractor {
    pub fn new(config: PlanConfig, clock: Arc<dyn Clock>) -> Self {
        let baselines = Arc::new(SharedLru::with_capacity(config.baseline_capacity));
        Self {
            config,
            baselines,
            clock,
            counters: StageCounters::new(),
            workers: WorkerSet::new(),
        }
    }

    /// Plan source: the `plan.json` attribute, the textual `plan.text`
    /// attribute, or a log record's body.
    fn plan_source<'a>(record: &'a Record) -> Option<&'a str> {
        record
            .attr_str("plan.json")
            .or_else(|| record.attr_str("plan.text"))
            .or_else(|| match (&record.value, record.name.as_str()) {
                (RecordValue::Text(body), name) if name.contains("plan") => Some(body.as_str()),
                _ => None,
            })
    }

    fn parse(&self, source: &str, deadline: &Deadline) -> Result<PlanNode, ParseFailure> {
        let trimmed = source.trim_start();
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                return parse_json_plan(&value, deadline);
            }
        }
        parse_text_plan(source, deadline)
    }

    fn apply_plan_attributes(record: &mut Record, plan: &PlanNode) {
        record.set_attr("db.plan.total_cost", plan.total_cost);
        record.set_attr("db.plan.rows", plan.rows);
        record.set_attr("db.plan.width", plan.width);
        record.set_attr("db.plan.dominant_op", plan.dominant_op().node_type.clone());
        record.set_attr("db.plan.depth", plan.depth() as i64);
        record.set_attr("db.plan.has_seq_scan", plan.any(&|n| n.node_type == "Seq Scan"));
        record.set_attr(
            "db.plan.has_nested_loop",
            plan.any(&|n| n.node_type == "Nested Loop"),
        );
        record.set_attr("db.plan.signature", plan.signature());
    }

    /// Severity of the current observation against the baseline mean, then
    /// fold the observation into the baseline. Both steps share the entry's
    /// critical section.
    fn classify_regression(
        &self,
        query_fp: u64,
        latency_ms: Option<f64>,
        cost: Option<f64>,
    ) -> &'static str {
        let thresholds = self.config.regression_thresholds;
        let window = self.config.baseline_window;
        let now = self.clock.now();
        let mut severity = "none";

        self.baselines.update_or_insert_with(
            query_fp,
            || Baseline::new(window, now),
            |baseline| {
                // latency against the latency baseline; plan cost as the
                // fallback signal when no latency was observed
                let ratio = match (latency_ms, baseline.mean_latency()) {
                    (Some(latency), Some(mean)) if mean > 0.0 => Some(latency / mean),
                    _ => match (cost, baseline.mean_cost()) {
                        (Some(cost), Some(mean)) if mean > 0.0 => Some(cost / mean),
                        _ => None,
                    },
                };
                if let Some(ratio) = ratio {
                    severity = if ratio >= thresholds.critical {
                        "critical"
                    } else if ratio >= thresholds.high {
                        "high"
                    } else if ratio >= thresholds.medium {
                        "medium"
                    } else if ratio >= thresholds.low {
                        "low"
                    } else {
                        "none"
                    };
                }
                if severity != "none" {
                    debug!(
                        fingerprint = query_fp,
                        p95_ms = baseline.p95_latency(),
                        "plan regression detected"
                    );
                }
                baseline.push(latency_ms, cost, now);
            },
        );
        severity
    }

    fn anonymize_record(&self, record: &mut Record) {
        if !self.config.anonymize.enabled {
            return;
        }
        for key in &self.config.anonymize.keys {
            if let Some(text) = record.attr_str(key).map(str::to_string) {
                record.set_attr(key.clone(), sanitize::anonymize_statement(&text));
            }
        }
    }
}

fn parse_json_plan(value: &Value, deadline: &Deadline) -> Result<PlanNode, ParseFailure> {
    // EXPLAIN (FORMAT JSON) wraps the tree: [{"Plan": {...}}]
    let root = match value {
        Value::Array(items) => items
            .first()
            .and_then(|v| v.get("Plan"))
            .ok_or(ParseFailure::Malformed)?,
        Value::Object(map) => map.get("Plan").unwrap_or(value),
        _ => return Err(ParseFailure::Malformed),
    };
    parse_json_node(root, deadline)
}

fn parse_json_node(value: &Value, deadline: &Deadline) -> Result<PlanNode, ParseFailure> {
    if deadline.expired() {
        return Err(ParseFailure::Timeout);
    }
    let obj = value.as_object().ok_or(ParseFailure::Malformed)?;
    let node_type = obj
        .get("Node Type")
        .and_then(Value::as_str)
        .ok_or(ParseFailure::Malformed)?
        .to_string();
    let total_cost = obj.get("Total Cost").and_then(Value::as_f64).unwrap_or(0.0);
    let rows = obj.get("Plan Rows").and_then(Value::as_f64).unwrap_or(0.0);
    let width = obj.get("Plan Width").and_then(Value::as_i64).unwrap_or(0);

    let mut children = Vec::new();
    if let Some(Value::Array(subplans)) = obj.get("Plans") {
        for sub in subplans {
            children.push(parse_json_node(sub, deadline)?);
        }
    }

    Ok(PlanNode {
        node_type,
        total_cost,
        rows,
        width,
        children,
    })
}

/// Parse the textual EXPLAIN format: a root line plus `->` children whose
/// nesting is given by indentation.
fn parse_text_plan(text: &str, deadline: &Deadline) -> Result<PlanNode, ParseFailure> {
    // (indent, node) stack; the root carries indent -1
    let mut stack: Vec<(i64, PlanNode)> = Vec::new();

    for line in text.lines() {
        if deadline.expired() {
            return Err(ParseFailure::Timeout);
        }
        let Some((indent, node)) = parse_text_line(line) else {
            continue;
        };

        while let Some((top_indent, _)) = stack.last() {
            if *top_indent >= indent {
                let (_, finished) = stack.pop().expect("non-empty");
                match stack.last_mut() {
                    Some((_, parent)) => parent.children.push(finished),
                    None => return Err(ParseFailure::Malformed),
                }
            } else {
                break;
            }
        }
        stack.push((indent, node));
    }

    while stack.len() > 1 {
        let (_, finished) = stack.pop().expect("len > 1");
        stack
            .last_mut()
            .expect("len >= 1")
            .1
            .children
            .push(finished);
    }

    stack
        .pop()
        .map(|(_, node)| node)
        .ok_or(ParseFailure::Malformed)
}

/// One plan line: `[->] Node Type  (cost=0.00..35.50 rows=10 width=4)`.
fn parse_text_line(line: &str) -> Option<(i64, PlanNode)> {
    let cost_pos = line.find("(cost=")?;
    let head = &line[..cost_pos];
    let (indent, name_part) = match head.find("->") {
        Some(arrow) => (arrow as i64, &head[arrow + 2..]),
        None => (-1, head),
    };
    let node_type = name_part.trim();
    if node_type.is_empty() {
        return None;
    }
    // strip trailing qualifiers like "using idx on t"
    let node_type = node_type
        .split(" on ")
        .next()
        .unwrap_or(node_type)
        .split(" using ")
        .next()
        .unwrap_or(node_type)
        .trim()
        .to_string();

    let tail = &line[cost_pos..];
    let total_cost = field_after(tail, "..").and_then(|s| s.parse::<f64>().ok())?;
    let rows = field_after(tail, "rows=")
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);
    let width = field_after(tail, "width=")
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);

    Some((
        indent,
        PlanNode {
            node_type,
            total_cost,
            rows,
            width,
            children: Vec::new(),
        },
    ))
}

fn field_after<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    let start = text.find(marker)? + marker.len();
    let rest = &text[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());
    let field = &rest[..end];
    // "0.00..35.50" leaves a trailing dot-free cost
    Some(field.trim_end_matches('.'))
}

#[async_trait]
impl Processor for PlanAttributeExtractor {
    fn name(&self) -> &'static str {
        "plan_attribute_extractor"
    }

    async fn start(&self, shutdown: ShutdownSignal) -> Result<(), PipelineError> {
        let baselines = self.baselines.clone();
        let clock = self.clock.clone();
        let mut signal = shutdown;
        // compaction: baselines silent for an hour are dropped
        self.workers.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = signal.cancelled() => break,
                    _ = tick.tick() => {
                        let cutoff = clock.now() - chrono::Duration::hours(1);
                        baselines.retain(|_, b| b.last_updated >= cutoff);
                    }
                }
            }
        }));
        Ok(())
    }

    async fn process(&self, batch: Batch) -> Batch {
        self.counters.batch_in();
        self.counters.record_in(batch.len() as u64);

        let mut out = Vec::with_capacity(batch.len());
        for mut record in batch {
            if let Some(source) = Self::plan_source(&record).map(str::to_string) {
                let deadline = Deadline::new(self.config.extract_timeout_ms);
                match self.parse(&source, &deadline) {
                    Ok(plan) => Self::apply_plan_attributes(&mut record, &plan),
                    Err(ParseFailure::Timeout) => {
                        self.counters.incr("plan.timeouts");
                    }
                    Err(ParseFailure::Malformed) => {
                        debug!(record = %record.name, "plan extraction failed");
                        self.counters.incr("plan.parse_errors");
                    }
                }
            }

            if let Some(statement) = record.attr_str("db.statement") {
                let query_fp = fingerprint::fingerprint64(statement);
                let latency = record.attr_f64("db.query.duration_ms");
                let cost = record.attr_f64("db.plan.total_cost");
                let severity = self.classify_regression(query_fp, latency, cost);
                if latency.is_some() {
                    record.set_attr("db.plan.regression.severity", severity);
                }
            }

            // downstream stages must never see raw literals
            self.anonymize_record(&mut record);
            out.push(record);
        }

        self.counters.record_out(out.len() as u64);
        self.counters
            .set_gauge("baselines.size", self.baselines.len() as u64);
        Batch::new(out)
    }

    async fn shutdown(&self) {
        self.workers.join_all().await;
    }

    fn snapshot(&self) -> StageSnapshot {
        self.counters.snapshot(self.name())
    }
}
