use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// Event
// ============================================================================

/// Field holding the event timestamp, used by `%{+FORMAT}` references
pub const TIMESTAMP_FIELD: &str = "@timestamp";

/// One structured record handed to the engine by the pipeline.
///
/// Field order is preserved exactly as supplied. The engine never mutates an
/// event; mapping and encoding always produce new values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event {
    fields: Map<String, Value>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Build an event from a JSON value. Returns `None` unless the value is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolve a field reference against this event.
    ///
    /// A plain name (`host`) looks up a top-level field, including names that
    /// contain dots. A bracketed path (`[user][name]`) walks nested mappings;
    /// numeric segments index into sequences.
    pub fn get_field(&self, reference: &str) -> Option<&Value> {
        let reference = reference.trim();
        if !reference.starts_with('[') {
            return self.fields.get(reference);
        }

        let segments = parse_field_path(reference)?;
        let (first, rest) = segments.split_first()?;
        let mut current = self.fields.get(*first)?;
        for segment in rest {
            current = match current {
                Value::Object(map) => map.get(*segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Event timestamp from the `@timestamp` field, if present and RFC 3339
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.fields
            .get(TIMESTAMP_FIELD)
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }
}

impl From<Map<String, Value>> for Event {
    fn from(fields: Map<String, Value>) -> Self {
        Self::from_map(fields)
    }
}

fn parse_field_path(reference: &str) -> Option<Vec<&str>> {
    let inner = reference.strip_prefix('[')?.strip_suffix(']')?;
    let segments: Vec<&str> = inner.split("][").collect();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segments)
}

// ============================================================================
// Configuration Enums
// ============================================================================

/// HTTP verbs the output can be configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Put,
    Post,
    Patch,
    Delete,
    Get,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Put => "PUT",
            HttpMethod::Post => "POST",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the request body is built from an event or batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyFormat {
    /// One JSON object per event
    #[default]
    Json,
    /// The whole batch as a single JSON array
    JsonBatch,
    /// URL-encoded top-level fields
    Form,
    /// A rendered message template, sent verbatim
    Message,
}

impl BodyFormat {
    /// Content type used when none is configured
    pub fn default_content_type(&self) -> Option<&'static str> {
        match self {
            BodyFormat::Json | BodyFormat::JsonBatch => Some("application/json"),
            BodyFormat::Form => Some("application/x-www-form-urlencoded"),
            BodyFormat::Message => None,
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, BodyFormat::JsonBatch)
    }
}

impl fmt::Display for BodyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BodyFormat::Json => "json",
            BodyFormat::JsonBatch => "json_batch",
            BodyFormat::Form => "form",
            BodyFormat::Message => "message",
        };
        f.write_str(name)
    }
}

/// Template tree describing the shape of a mapped payload.
///
/// String leaves are templates rendered against the event; any other scalar
/// is emitted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MappingTemplate {
    Text(String),
    List(Vec<MappingTemplate>),
    Map(IndexMap<String, MappingTemplate>),
    Literal(Value),
}

// ============================================================================
// Delivery Outcomes
// ============================================================================

/// What went wrong on a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDetail {
    /// The endpoint answered with a non-success status
    Status { code: u16 },
    /// The transport raised before a response was available
    Transport { message: String },
    /// The request body could not be built; nothing was sent
    Encode { message: String },
}

impl FailureDetail {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FailureDetail::Status { code } => Some(*code),
            FailureDetail::Transport { .. } | FailureDetail::Encode { .. } => None,
        }
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureDetail::Status { code } => write!(f, "HTTP {}", code),
            FailureDetail::Transport { message } => write!(f, "transport error: {}", message),
            FailureDetail::Encode { message } => write!(f, "encode error: {}", message),
        }
    }
}

/// Classification of a single delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 2xx response
    Success { status: u16 },
    /// Non-2xx status configured as ignorable; treated as success
    Ignorable { status: u16 },
    /// Transient failure - resubmit
    Retryable(FailureDetail),
    /// Permanent failure - drop the event after logging
    Terminal(FailureDetail),
}

impl Outcome {
    /// True for outcomes that end the retry loop without a failure report
    pub fn is_delivered(&self) -> bool {
        matches!(self, Outcome::Success { .. } | Outcome::Ignorable { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Outcome::Retryable(_))
    }

    pub fn failure(&self) -> Option<&FailureDetail> {
        match self {
            Outcome::Retryable(detail) | Outcome::Terminal(detail) => Some(detail),
            Outcome::Success { .. } | Outcome::Ignorable { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Outcome::Success { status } | Outcome::Ignorable { status } => Some(*status),
            Outcome::Retryable(detail) | Outcome::Terminal(detail) => detail.status_code(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success { status } => write!(f, "success ({})", status),
            Outcome::Ignorable { status } => write!(f, "ignored ({})", status),
            Outcome::Retryable(detail) => write!(f, "retryable: {}", detail),
            Outcome::Terminal(detail) => write!(f, "terminal: {}", detail),
        }
    }
}

// ============================================================================
// Metric Names
// ============================================================================

pub mod metric_names {
    pub const ATTEMPTS: &str = "hc_delivery_attempts_total";
    pub const SUCCESS: &str = "hc_delivery_success_total";
    pub const RETRIES: &str = "hc_delivery_retries_total";
    pub const FAILURES: &str = "hc_delivery_failures_total";
    pub const ABANDONED: &str = "hc_delivery_abandoned_total";
    pub const IN_FLIGHT: &str = "hc_delivery_in_flight";
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Event must be a JSON object, got {0}")]
    NotAnObject(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Parse one JSON document into an event
pub fn parse_event(raw: &str) -> Result<Event, EventError> {
    let value: Value = serde_json::from_str(raw)?;
    match value {
        Value::Object(fields) => Ok(Event::from_map(fields)),
        other => Err(EventError::NotAnObject(json_kind(&other).to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
