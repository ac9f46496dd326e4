use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Typed attribute value carried by records and resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view; integers widen to f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(i) => Some(*i as f64),
            AttrValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Str(_) => "string",
            AttrValue::Int(_) => "int",
            AttrValue::Float(_) => "float",
            AttrValue::Bool(_) => "bool",
        }
    }

    /// Rendered form, used for cardinality accounting and size estimation.
    pub fn render(&self) -> String {
        match self {
            AttrValue::Str(s) => s.clone(),
            AttrValue::Int(i) => i.to_string(),
            AttrValue::Float(f) => f.to_string(),
            AttrValue::Bool(b) => b.to_string(),
        }
    }

    /// Approximate encoded footprint in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            AttrValue::Str(s) => s.len(),
            AttrValue::Int(_) | AttrValue::Float(_) => 8,
            AttrValue::Bool(_) => 1,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Str(s)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}

impl From<f64> for AttrValue {
    fn from(f: f64) -> Self {
        AttrValue::Float(f)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

/// Declared attribute type, used by schema validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrType {
    String,
    Int,
    Float,
    Bool,
}

impl AttrType {
    pub fn matches(&self, value: &AttrValue) -> bool {
        matches!(
            (self, value),
            (AttrType::String, AttrValue::Str(_))
                | (AttrType::Int, AttrValue::Int(_))
                | (AttrType::Float, AttrValue::Float(_))
                | (AttrType::Float, AttrValue::Int(_))
                | (AttrType::Bool, AttrValue::Bool(_))
        )
    }
}

/// Origin identity shared by every record of a batch: service, host,
/// database system, database name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub attributes: HashMap<String, AttrValue>,
}

impl Resource {
    pub fn new(attributes: HashMap<String, AttrValue>) -> Self {
        Self { attributes }
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    MetricPoint,
    Log,
}

/// Numeric body for metric points, textual body for logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordValue {
    Number(f64),
    Text(String),
}

impl RecordValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            RecordValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            RecordValue::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            RecordValue::Number(_) => 8,
            RecordValue::Text(t) => t.len(),
        }
    }
}

/// The atomic unit of telemetry flowing through the chain.
///
/// A record is exclusively owned by the stage currently holding it; emitting
/// a batch transfers ownership downstream. The resource back-reference is a
/// shared lookup, never ownership.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub kind: RecordKind,
    pub resource: Arc<Resource>,
    pub scope: Arc<str>,
    pub name: String,
    pub time: DateTime<Utc>,
    pub attributes: HashMap<String, AttrValue>,
    pub value: RecordValue,
}

impl Record {
    pub fn metric(name: impl Into<String>, time: DateTime<Utc>, value: f64) -> Self {
        Self {
            kind: RecordKind::MetricPoint,
            resource: Arc::new(Resource::default()),
            scope: Arc::from(""),
            name: name.into(),
            time,
            attributes: HashMap::new(),
            value: RecordValue::Number(value),
        }
    }

    pub fn log(name: impl Into<String>, time: DateTime<Utc>, body: impl Into<String>) -> Self {
        Self {
            kind: RecordKind::Log,
            resource: Arc::new(Resource::default()),
            scope: Arc::from(""),
            name: name.into(),
            time,
            attributes: HashMap::new(),
            value: RecordValue::Text(body.into()),
        }
    }

    pub fn with_resource(mut self, resource: Arc<Resource>) -> Self {
        self.resource = resource;
        self
    }

    pub fn with_scope(mut self, scope: impl AsRef<str>) -> Self {
        self.scope = Arc::from(scope.as_ref());
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Attribute lookup, falling back to the resource.
    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key).or_else(|| self.resource.get(key))
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attr(key).and_then(AttrValue::as_str)
    }

    pub fn attr_f64(&self, key: &str) -> Option<f64> {
        self.attr(key).and_then(AttrValue::as_f64)
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Approximate serialized footprint, used by cost accounting.
    pub fn encoded_len(&self) -> usize {
        const PER_RECORD_OVERHEAD: usize = 16;
        let attrs: usize = self
            .attributes
            .iter()
            .map(|(k, v)| k.len() + v.encoded_len())
            .sum();
        PER_RECORD_OVERHEAD + self.name.len() + 8 + self.value.encoded_len() + attrs
    }
}

/// Ordered sequence of records handed between processors. Order within a
/// batch is preserved end-to-end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub records: Vec<Record>,
}

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn empty() -> Self {
        Self { records: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl IntoIterator for Batch {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}
