use std::path::Path;

use db_intel_core::{AttrType, PipelineError};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::processors::predicate::Predicate;
use crate::sanitize::PiiAction;

/// Configuration for the whole processor chain, nested under processor
/// names. Passed by value into each processor at start; no process-wide
/// singletons.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PipelineConfig {
    pub adaptive_sampler: SamplerConfig,
    pub circuit_breaker: BreakerConfig,
    pub plan_attribute_extractor: PlanConfig,
    pub verification: VerificationConfig,
    pub cost_control: CostConfig,
    pub nr_error_monitor: ErrorMonitorConfig,
    pub query_correlator: CorrelatorConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SamplerConfig {
    pub default_rate: f64,
    pub rules: Vec<SamplingRuleConfig>,
    pub dedupe: DedupeConfig,
    pub mode: SamplerMode,
    /// Attributes contributing to the dedupe identity of a record.
    pub fingerprint_attributes: Vec<String>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            default_rate: 1.0,
            rules: Vec::new(),
            dedupe: DedupeConfig::default(),
            mode: SamplerMode::InMemory,
            fingerprint_attributes: vec!["db.statement".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerMode {
    InMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SamplingRuleConfig {
    pub name: String,
    pub priority: i64,
    pub predicate: String,
    pub rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for SamplingRuleConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            priority: 0,
            predicate: String::new(),
            rate: 1.0,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucketConfig {
    pub capacity: f64,
    pub refill_per_second: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DedupeConfig {
    pub enabled: bool,
    pub window_seconds: u64,
    pub cache_size: usize,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_seconds: 60,
            cache_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: u64,
    pub max_open_timeout_ms: u64,
    pub backoff_factor: f64,
    pub latency_ceiling_ms: f64,
    pub latency_breach_window: u32,
    pub ewma_alpha: f64,
    pub count_unknown_as_failure: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout_ms: 30_000,
            max_open_timeout_ms: 300_000,
            backoff_factor: 2.0,
            latency_ceiling_ms: 5_000.0,
            latency_breach_window: 3,
            ewma_alpha: 0.2,
            count_unknown_as_failure: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlanConfig {
    pub extract_timeout_ms: u64,
    pub baseline_window: usize,
    pub baseline_capacity: usize,
    pub regression_thresholds: RegressionThresholds,
    pub anonymize: AnonymizeConfig,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            extract_timeout_ms: 50,
            baseline_window: 20,
            baseline_capacity: 4_096,
            regression_thresholds: RegressionThresholds::default(),
            anonymize: AnonymizeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegressionThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RegressionThresholds {
    fn default() -> Self {
        Self {
            low: 1.5,
            medium: 2.0,
            high: 5.0,
            critical: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnonymizeConfig {
    pub enabled: bool,
    pub keys: Vec<String>,
}

impl Default for AnonymizeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keys: vec!["db.statement".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VerificationConfig {
    pub required_attributes: Vec<RequiredAttribute>,
    pub pii_actions: PiiActionsConfig,
    /// String attributes scanned for PII. `log.body` addresses a log
    /// record's textual body.
    pub scan_keys: Vec<String>,
    pub max_cardinality: usize,
    pub cardinality_window_seconds: u64,
    pub auto_tune: AutoTuneConfig,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            required_attributes: vec![
                RequiredAttribute {
                    key: "service.name".to_string(),
                    r#type: AttrType::String,
                },
                RequiredAttribute {
                    key: "db.system".to_string(),
                    r#type: AttrType::String,
                },
            ],
            pii_actions: PiiActionsConfig::default(),
            scan_keys: vec!["db.statement".to_string(), "log.body".to_string()],
            max_cardinality: 1_000,
            cardinality_window_seconds: 300,
            auto_tune: AutoTuneConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredAttribute {
    pub key: String,
    #[serde(default = "default_attr_type")]
    pub r#type: AttrType,
}

fn default_attr_type() -> AttrType {
    AttrType::String
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PiiActionsConfig {
    pub email: PiiAction,
    pub ssn: PiiAction,
    pub credit_card_luhn: PiiAction,
    pub phone_us: PiiAction,
    pub ipv4: PiiAction,
    pub apikey_heuristic: PiiAction,
}

impl Default for PiiActionsConfig {
    fn default() -> Self {
        Self {
            email: PiiAction::Redact,
            ssn: PiiAction::Redact,
            credit_card_luhn: PiiAction::Hash,
            phone_us: PiiAction::Redact,
            ipv4: PiiAction::Redact,
            apikey_heuristic: PiiAction::DropAttribute,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoTuneConfig {
    pub enabled: bool,
    pub warmup_seconds: u64,
}

impl Default for AutoTuneConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            warmup_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CostConfig {
    pub monthly_budget_usd: f64,
    pub pricing_tier: PricingTier,
    pub window_minutes: usize,
    pub always_keep: Vec<String>,
    /// Throttle regime drops records whose sampling priority sits below
    /// this floor.
    pub throttle_priority_floor: i64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            monthly_budget_usd: 100.0,
            pricing_tier: PricingTier::Standard,
            window_minutes: 60,
            always_keep: Vec::new(),
            throttle_priority_floor: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PricingTier {
    #[serde(rename = "standard")]
    Standard,
    #[serde(rename = "dataPlus")]
    DataPlus,
}

impl PricingTier {
    pub fn usd_per_gb(&self) -> f64 {
        match self {
            PricingTier::Standard => 0.35,
            PricingTier::DataPlus => 0.55,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorMonitorConfig {
    pub max_value_len: usize,
    pub max_attr_count: usize,
    pub checks: Vec<CheckConfig>,
    pub cooldown_seconds: u64,
}

impl Default for ErrorMonitorConfig {
    fn default() -> Self {
        Self {
            max_value_len: 4_096,
            max_attr_count: 64,
            checks: vec![
                CheckConfig {
                    kind: CheckKind::ValueLength,
                    action: CheckAction::Truncate,
                    alert_rate_per_minute: 100,
                },
                CheckConfig {
                    kind: CheckKind::AttrCount,
                    action: CheckAction::Truncate,
                    alert_rate_per_minute: 100,
                },
                CheckConfig {
                    kind: CheckKind::KeySyntax,
                    action: CheckAction::Drop,
                    alert_rate_per_minute: 10,
                },
                CheckConfig {
                    kind: CheckKind::UnitSuffix,
                    action: CheckAction::WarnOnly,
                    alert_rate_per_minute: 100,
                },
                CheckConfig {
                    kind: CheckKind::SemanticConvention,
                    action: CheckAction::WarnOnly,
                    alert_rate_per_minute: 100,
                },
            ],
            cooldown_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckConfig {
    pub kind: CheckKind,
    pub action: CheckAction,
    pub alert_rate_per_minute: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    ValueLength,
    AttrCount,
    KeySyntax,
    UnitSuffix,
    SemanticConvention,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::ValueLength => "value_length",
            CheckKind::AttrCount => "attr_count",
            CheckKind::KeySyntax => "key_syntax",
            CheckKind::UnitSuffix => "unit_suffix",
            CheckKind::SemanticConvention => "semantic_convention",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckAction {
    Drop,
    Truncate,
    WarnOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CorrelatorConfig {
    pub idle_timeout_seconds: u64,
    pub max_sessions: usize,
    pub workload_classification: WorkloadClassification,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 300,
            max_sessions: 10_000,
            workload_classification: WorkloadClassification::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkloadClassification {
    pub oltp_max_ms: f64,
    pub olap_min_rows: i64,
}

impl Default for WorkloadClassification {
    fn default() -> Self {
        Self {
            oltp_max_ms: 100.0,
            olap_min_rows: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0:13133".to_string(),
        }
    }
}

lazy_static! {
    static ref ENV_PATTERN: Regex =
        Regex::new(r"\$\{env:([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap();
}

/// Substitute `${env:NAME:-default}` references. The legacy `${NAME:default}`
/// syntax is not recognized and passes through untouched. A reference to an
/// unset variable without a default is a configuration error.
pub fn substitute_env(raw: &str) -> Result<String, PipelineError> {
    let mut missing: Option<String> = None;
    let substituted = ENV_PATTERN.replace_all(raw, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            },
        }
    });
    if let Some(name) = missing {
        return Err(PipelineError::config(format!(
            "environment variable '{name}' is not set and has no default"
        )));
    }
    Ok(substituted.into_owned())
}

impl PipelineConfig {
    /// Load from a TOML file, applying environment substitution first.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PipelineError::config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, PipelineError> {
        let substituted = substitute_env(raw)?;
        let cfg: PipelineConfig =
            toml::from_str(&substituted).map_err(|e| PipelineError::config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Start-time validation; any failure refuses the pipeline.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let s = &self.adaptive_sampler;
        if !(0.0..=1.0).contains(&s.default_rate) {
            return Err(PipelineError::config(
                "adaptive_sampler.defaultRate must be within [0, 1]",
            ));
        }
        if s.dedupe.enabled && s.dedupe.cache_size == 0 {
            return Err(PipelineError::config(
                "adaptive_sampler.dedupe.cacheSize must be greater than 0",
            ));
        }
        for rule in &s.rules {
            if rule.name.is_empty() {
                return Err(PipelineError::config("sampling rule requires a name"));
            }
            if !(0.0..=1.0).contains(&rule.rate) {
                return Err(PipelineError::config(format!(
                    "sampling rule '{}': rate must be within [0, 1]",
                    rule.name
                )));
            }
            if let Some(bucket) = &rule.token_bucket {
                if bucket.capacity <= 0.0 || bucket.refill_per_second < 0.0 {
                    return Err(PipelineError::config(format!(
                        "sampling rule '{}': invalid token bucket",
                        rule.name
                    )));
                }
            }
            Predicate::parse(&rule.predicate).map_err(|e| {
                PipelineError::config(format!(
                    "sampling rule '{}': predicate does not parse: {e}",
                    rule.name
                ))
            })?;
        }

        let b = &self.circuit_breaker;
        if b.failure_threshold == 0 || b.success_threshold == 0 {
            return Err(PipelineError::config(
                "circuit_breaker thresholds must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&b.ewma_alpha) {
            return Err(PipelineError::config(
                "circuit_breaker.ewmaAlpha must be within [0, 1]",
            ));
        }
        if b.backoff_factor < 1.0 {
            return Err(PipelineError::config(
                "circuit_breaker.backoffFactor must be at least 1",
            ));
        }
        if b.max_open_timeout_ms < b.open_timeout_ms {
            return Err(PipelineError::config(
                "circuit_breaker.maxOpenTimeoutMs must be at least openTimeoutMs",
            ));
        }

        let p = &self.plan_attribute_extractor;
        if p.baseline_window == 0 || p.baseline_capacity == 0 {
            return Err(PipelineError::config(
                "plan_attribute_extractor baseline settings must be greater than 0",
            ));
        }
        let t = &p.regression_thresholds;
        if !(t.low < t.medium && t.medium < t.high && t.high < t.critical) {
            return Err(PipelineError::config(
                "plan_attribute_extractor.regressionThresholds must be strictly increasing",
            ));
        }

        let v = &self.verification;
        if v.max_cardinality == 0 {
            return Err(PipelineError::config(
                "verification.maxCardinality must be greater than 0",
            ));
        }

        let c = &self.cost_control;
        if c.monthly_budget_usd <= 0.0 {
            return Err(PipelineError::config(
                "cost_control.monthlyBudgetUsd must be greater than 0",
            ));
        }
        if c.window_minutes == 0 {
            return Err(PipelineError::config(
                "cost_control.windowMinutes must be greater than 0",
            ));
        }

        let m = &self.nr_error_monitor;
        if m.max_value_len == 0 || m.max_attr_count == 0 {
            return Err(PipelineError::config(
                "nr_error_monitor limits must be greater than 0",
            ));
        }

        let q = &self.query_correlator;
        if q.idle_timeout_seconds == 0 || q.max_sessions == 0 {
            return Err(PipelineError::config(
                "query_correlator.idleTimeoutSeconds and maxSessions must be greater than 0",
            ));
        }

        Ok(())
    }
}
