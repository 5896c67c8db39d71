//! Telemetry record model.
//!
//! Every record carries a ULID (globally unique and sortable by creation
//! time), the owning project, a timestamp, and kind-specific payload fields.
//! Records are built once by the ingest layer and never mutated afterwards;
//! the queue stores a serialized copy.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

/// Telemetry record kind.
///
/// The tag doubles as the stream suffix and the fan-out channel suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKind {
    /// Business events.
    #[serde(rename = "event")]
    Event,
    /// Application log lines.
    #[serde(rename = "app")]
    AppLog,
    /// HTTP request logs.
    #[serde(rename = "request")]
    RequestLog,
    /// Metric samples and trace spans.
    #[serde(rename = "metric")]
    Metric,
}

impl RecordKind {
    /// All kinds, in processor start order.
    pub const ALL: [Self; 4] = [Self::Event, Self::AppLog, Self::RequestLog, Self::Metric];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::AppLog => "app",
            Self::RequestLog => "request",
            Self::Metric => "metric",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event" => Ok(Self::Event),
            "app" => Ok(Self::AppLog),
            "request" => Ok(Self::RequestLog),
            "metric" => Ok(Self::Metric),
            other => Err(format!("unknown record kind: {other}")),
        }
    }
}

/// Capability shared by the four record kinds.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind tag of this record type.
    const KIND: RecordKind;

    fn id(&self) -> Ulid;

    fn project_id(&self) -> &str;

    fn timestamp(&self) -> DateTime<Utc>;
}

macro_rules! impl_record {
    ($ty:ty, $kind:expr) => {
        impl Record for $ty {
            const KIND: RecordKind = $kind;

            fn id(&self) -> Ulid {
                self.id
            }

            fn project_id(&self) -> &str {
                &self.project_id
            }

            fn timestamp(&self) -> DateTime<Utc> {
                self.timestamp
            }
        }
    };
}

/// A named business event with free-form properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Ulid,
    pub project_id: String,
    pub name: String,
    /// End-user identifier the event is attributed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distinct_id: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(project_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Ulid::new(),
            project_id: project_id.into(),
            name: name.into(),
            distinct_id: None,
            properties: Map::new(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_distinct_id(mut self, distinct_id: impl Into<String>) -> Self {
        self.distinct_id = Some(distinct_id.into());
        self
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl_record!(Event, RecordKind::Event);

/// Severity of an application log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

/// An application log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppLog {
    pub id: Ulid,
    pub project_id: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// Trace this line was emitted under, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AppLog {
    pub fn new(project_id: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Ulid::new(),
            project_id: project_id.into(),
            level,
            message: message.into(),
            logger: None,
            attributes: Map::new(),
            trace_id: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_logger(mut self, logger: impl Into<String>) -> Self {
        self.logger = Some(logger.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl_record!(AppLog, RecordKind::AppLog);

/// One served HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: Ulid,
    pub project_id: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub duration_ms: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RequestLog {
    pub fn new(
        project_id: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        status_code: u16,
        duration_ms: u32,
    ) -> Self {
        Self {
            id: Ulid::new(),
            project_id: project_id.into(),
            method: method.into(),
            path: path.into(),
            status_code,
            duration_ms,
            client_ip: None,
            user_agent: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl_record!(RequestLog, RecordKind::RequestLog);

/// A metric sample, or a trace span when the span fields are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: Ulid,
    pub project_id: String,
    pub name: String,
    #[serde(serialize_with = "serialize_finite")]
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Metric {
    pub fn new(project_id: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        Self {
            id: Ulid::new(),
            project_id: project_id.into(),
            name: name.into(),
            value,
            unit: None,
            tags: BTreeMap::new(),
            trace_id: None,
            span_id: None,
            parent_span_id: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Mark this sample as a trace span.
    #[must_use]
    pub fn with_span(
        mut self,
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        parent_span_id: Option<String>,
    ) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self.parent_span_id = parent_span_id;
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub const fn is_span(&self) -> bool {
        self.span_id.is_some()
    }
}

impl_record!(Metric, RecordKind::Metric);

/// JSON has no NaN or infinity, so encode those as an error instead of `null`.
#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_finite<S: serde::Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() {
        serializer.serialize_f64(*value)
    } else {
        Err(serde::ser::Error::custom(format!(
            "metric value must be finite, got {value}"
        )))
    }
}
