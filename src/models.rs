use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
}

/// Method filter of an instance: either any method or one exact method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MethodFilter {
    #[default]
    Any,
    Exact(String),
}

impl MethodFilter {
    pub fn allows(&self, method: &str) -> bool {
        match self {
            MethodFilter::Any => true,
            MethodFilter::Exact(expected) => expected.eq_ignore_ascii_case(method),
        }
    }
}

impl FromStr for MethodFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed == "*" || trimmed.eq_ignore_ascii_case("any") {
            return Ok(MethodFilter::Any);
        }
        if !trimmed.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(format!("invalid method {trimmed:?}"));
        }
        Ok(MethodFilter::Exact(trimmed.to_ascii_uppercase()))
    }
}

impl fmt::Display for MethodFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodFilter::Any => f.write_str("ANY"),
            MethodFilter::Exact(method) => f.write_str(method),
        }
    }
}

impl Serialize for MethodFilter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MethodFilter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One candidate response of a mock, optionally gated by a condition script.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseVariant {
    pub id: String,
    pub order: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_script: Option<String>,
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

fn default_status_code() -> u16 {
    200
}

impl ResponseVariant {
    /// The script to evaluate, or `None` for an unconditional default.
    pub fn condition(&self) -> Option<&str> {
        self.condition_script
            .as_deref()
            .filter(|script| !script.trim().is_empty())
    }
}

/// Node-level mock configuration as persisted by the host.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MockConfig {
    #[serde(default)]
    pub protocol: Protocol,
    pub port: u16,
    pub path_pattern: String,
    #[serde(default)]
    pub method: MethodFilter,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub variants: Vec<ResponseVariant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Side-effect free view of one instance returned by the control surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub node_id: String,
    pub instance_id: Uuid,
    pub state: InstanceState,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub method: String,
    pub url: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl RequestSummary {
    pub fn contains(&self, keyword: &str) -> bool {
        self.method.contains(keyword)
            || self.url.contains(keyword)
            || self.query.contains(keyword)
            || self.body.as_deref().is_some_and(|b| b.contains(keyword))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: u64,
    pub instance_id: Uuid,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub request: RequestSummary,
    pub matched_variant_id: Option<String>,
    pub console_output: Vec<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub status: u16,
    pub duration_ms: u64,
}

/// A `LogEntry` before the pipeline assigns its id.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub instance_id: Uuid,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub request: RequestSummary,
    pub matched_variant_id: Option<String>,
    pub console_output: Vec<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub status: u16,
    pub duration_ms: u64,
}

impl LogRecord {
    pub(crate) fn into_entry(self, id: u64) -> LogEntry {
        LogEntry {
            id,
            instance_id: self.instance_id,
            node_id: self.node_id,
            timestamp: self.timestamp,
            request: self.request,
            matched_variant_id: self.matched_variant_id,
            console_output: self.console_output,
            error_kind: self.error_kind,
            error_message: self.error_message,
            status: self.status,
            duration_ms: self.duration_ms,
        }
    }
}
