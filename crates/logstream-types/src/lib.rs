//! Shared types for logstream
//!
//! This crate contains the inbound envelope shapes, log levels, and the
//! connection state reported by a stream session.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod decode;

pub use decode::{DecodeError, Frame};

// ============================================================================
// Log Types
// ============================================================================

/// Log severity level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
    Fatal,
}

impl LogLevel {
    /// All levels, least severe first
    pub const ALL: [LogLevel; 6] = [
        Self::Debug,
        Self::Info,
        Self::Warn,
        Self::Error,
        Self::Critical,
        Self::Fatal,
    ];

    /// Wire name of the level
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
            Self::Fatal => "FATAL",
        }
    }

    /// Short display string (3 chars)
    pub fn short(&self) -> &'static str {
        match self {
            Self::Debug => "DBG",
            Self::Info => "INF",
            Self::Warn => "WRN",
            Self::Error => "ERR",
            Self::Critical => "CRT",
            Self::Fatal => "FTL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not a known log level
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level '{0}'")]
pub struct UnknownLevel(pub String);

impl FromStr for LogLevel {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            "FATAL" => Ok(Self::Fatal),
            _ => Err(UnknownLevel(s.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A single pushed log record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Unique per delivery
    pub id: String,

    pub organization_id: String,

    pub timestamp: DateTime<Utc>,

    pub level: LogLevel,

    pub message: String,

    /// Source identifier (service, host, ...)
    pub source: String,

    /// Anomaly score in [0, 1], if the backend scored this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly_score: Option<f64>,
}

impl LogEvent {
    /// Create a new log event stamped with the current time
    pub fn new(
        id: impl Into<String>,
        level: LogLevel,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            organization_id: String::new(),
            timestamp: Utc::now(),
            level,
            message: message.into(),
            source: source.into(),
            anomaly_score: None,
        }
    }
}

// ============================================================================
// Alert and Anomaly Types
// ============================================================================

/// An alert raised by the backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub id: String,
    pub organization_id: String,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An anomaly detection result, forwarded without interpretation
#[derive(Clone, Debug, PartialEq)]
pub struct AnomalyEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Raw payload as received
    pub payload: Value,
}

// ============================================================================
// Envelopes
// ============================================================================

/// Named event kinds crossing the fan-out bus
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    LogNew,
    AlertNew,
    AnomalyDetected,
    ConnectionState,
    RateSample,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LogNew => "log:new",
            Self::AlertNew => "alert:new",
            Self::AnomalyDetected => "anomaly:detected",
            Self::ConnectionState => "connection:state",
            Self::RateSample => "rate:sample",
        }
    }

    /// Parse a wire event name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "log:new" => Some(Self::LogNew),
            "alert:new" => Some(Self::AlertNew),
            "anomaly:detected" => Some(Self::AnomalyDetected),
            "connection:state" => Some(Self::ConnectionState),
            "rate:sample" => Some(Self::RateSample),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One discrete pushed record
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEnvelope {
    Log(LogEvent),
    Alert(AlertEvent),
    Anomaly(AnomalyEvent),
}

impl StreamEnvelope {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Log(_) => EventKind::LogNew,
            Self::Alert(_) => EventKind::AlertNew,
            Self::Anomaly(_) => EventKind::AnomalyDetected,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Log(e) => &e.id,
            Self::Alert(e) => &e.id,
            Self::Anomaly(e) => &e.id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Log(e) => e.timestamp,
            Self::Alert(e) => e.timestamp,
            Self::Anomaly(e) => e.timestamp,
        }
    }
}

// ============================================================================
// Connection State
// ============================================================================

/// Lifecycle state of a stream session
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed { reason: String },
}

impl ConnectionState {
    /// Short display label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether a retry can be requested from this state
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Reconnecting { .. } | Self::Failed { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}
