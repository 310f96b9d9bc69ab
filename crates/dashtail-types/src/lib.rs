//! Shared types for dashtail
//!
//! This crate contains the wire and data structures used across the dashtail crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Target Types
// ============================================================================

/// What a live tail follows: a query against one datasource
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TailTarget {
    pub datasource_id: String,
    pub query: String,
}

impl TailTarget {
    pub fn new(datasource_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            datasource_id: datasource_id.into(),
            query: query.into(),
        }
    }

    /// Query text with surrounding whitespace removed
    pub fn trimmed_query(&self) -> &str {
        self.query.trim()
    }
}

// ============================================================================
// Request / Response Types
// ============================================================================

/// Body of one stream attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub query: String,

    /// Resume point, unix seconds. Zero lets the backend pick "now - 5s".
    #[serde(default, skip_serializing_if = "is_zero")]
    pub start: i64,

    /// Upper bound on the backend's backfill per (re)connect
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub limit: usize,
}

/// Body of a one-shot log query
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub signal: String,
    pub start: i64,
    pub end: i64,
    pub step: i64,
    pub limit: usize,
}

impl QueryRequest {
    /// Log query covering `[end - lookback_secs, end]`
    pub fn logs(query: impl Into<String>, end: i64, lookback_secs: i64, limit: usize) -> Self {
        Self {
            query: query.into(),
            signal: "logs".to_string(),
            start: end - lookback_secs,
            end,
            step: 0,
            limit,
        }
    }
}

/// Unified query result returned by the backend
#[derive(Clone, Debug, Default, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub data: Option<QueryData>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct QueryData {
    #[serde(default, rename = "resultType")]
    pub result_type: String,
    #[serde(default)]
    pub logs: Vec<LogRecord>,
}

impl QueryResult {
    pub fn is_error(&self) -> bool {
        self.status == "error"
    }

    /// Take the log rows out of the result
    pub fn into_logs(self) -> Vec<LogRecord> {
        self.data.map(|d| d.logs).unwrap_or_default()
    }
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

// ============================================================================
// Stream Types
// ============================================================================

/// Default event name for frames without an `event:` line
pub const DEFAULT_EVENT_NAME: &str = "message";

/// One decoded frame of the event stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamFrame {
    pub event_name: String,
    pub payload: String,
}

/// Connection state of a live tail
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Whether a session is running in this state
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// Log severity level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    Unknown,
}

impl LogLevel {
    /// Parse log level from common formats
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "trace" | "trc" | "trce" => Self::Trace,
            "debug" | "dbg" | "debg" => Self::Debug,
            "info" | "inf" | "information" => Self::Info,
            "warn" | "warning" | "wrn" => Self::Warn,
            "error" | "err" | "erro" => Self::Error,
            "fatal" | "panic" | "critical" | "crit" | "ftl" => Self::Fatal,
            _ => Self::Unknown,
        }
    }

    /// Short display string (3 chars)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRC",
            Self::Debug => "DBG",
            Self::Info => "INF",
            Self::Warn => "WRN",
            Self::Error => "ERR",
            Self::Fatal => "FTL",
            Self::Unknown => "???",
        }
    }
}

/// A single log line as delivered by the backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// RFC3339 timestamp as sent by the backend
    pub timestamp: String,

    pub line: String,

    #[serde(default)]
    pub level: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl LogRecord {
    pub fn new(timestamp: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            line: line.into(),
            level: String::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Identity used for deduplication
    pub fn key(&self) -> RecordKey {
        RecordKey::of(self)
    }

    /// Parsed timestamp, if the string is valid RFC3339
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.timestamp.trim())
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Timestamp floored to whole unix seconds
    pub fn unix_seconds(&self) -> Option<i64> {
        self.parsed_timestamp().map(|ts| ts.timestamp())
    }

    /// Normalized severity
    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_str(&self.level)
    }
}

/// Dedup identity of a record: timestamp, sorted labels and line
///
/// Only ever used for set membership.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn of(record: &LogRecord) -> Self {
        // BTreeMap iterates in key order, so the label part is already sorted
        let labels = serde_json::to_string(&record.labels).unwrap_or_default();
        Self(format!("{}|{}|{}", record.timestamp, labels, record.line))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
