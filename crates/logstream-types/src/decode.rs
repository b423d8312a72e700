use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AlertEvent, AnomalyEvent, EventKind, LogEvent, StreamEnvelope};

/// Errors produced while turning a frame into an envelope
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Frame(#[source] serde_json::Error),

    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("anomaly score {0} is outside [0, 1]")]
    AnomalyScoreOutOfRange(f64),
}

/// A named message as carried by a transport
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "event")]
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Frame carrying a log event
    pub fn log(event: &LogEvent) -> Self {
        Self::new(
            EventKind::LogNew.as_str(),
            serde_json::to_value(event).unwrap_or(Value::Null),
        )
    }

    /// Frame carrying an alert event
    pub fn alert(event: &AlertEvent) -> Self {
        Self::new(
            EventKind::AlertNew.as_str(),
            serde_json::to_value(event).unwrap_or(Value::Null),
        )
    }

    /// Parse a JSON text frame (`{"event": ..., "data": ...}`)
    pub fn from_json(text: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(text).map_err(DecodeError::Frame)
    }

    pub fn to_json(&self) -> String {
        // A Frame is a string plus a Value, which always serializes
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode the frame into an envelope
    ///
    /// Returns `Ok(None)` for event names that do not carry an envelope.
    pub fn into_envelope(self) -> Result<Option<StreamEnvelope>, DecodeError> {
        let Some(kind) = EventKind::from_name(&self.name) else {
            return Ok(None);
        };

        let envelope = match kind {
            EventKind::LogNew => {
                let event: LogEvent = serde_json::from_value(self.data)
                    .map_err(|source| DecodeError::Payload { kind, source })?;
                if let Some(score) = event.anomaly_score {
                    if !(0.0..=1.0).contains(&score) {
                        return Err(DecodeError::AnomalyScoreOutOfRange(score));
                    }
                }
                StreamEnvelope::Log(event)
            }
            EventKind::AlertNew => {
                let event: AlertEvent = serde_json::from_value(self.data)
                    .map_err(|source| DecodeError::Payload { kind, source })?;
                StreamEnvelope::Alert(event)
            }
            EventKind::AnomalyDetected => StreamEnvelope::Anomaly(anomaly_from_payload(self.data)),
            EventKind::ConnectionState | EventKind::RateSample => return Ok(None),
        };

        Ok(Some(envelope))
    }
}

/// Wrap an opaque anomaly payload, borrowing id and timestamp when present
fn anomaly_from_payload(payload: Value) -> AnomalyEvent {
    let id = payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let timestamp = payload
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    AnomalyEvent {
        id,
        timestamp,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogLevel;
    use serde_json::json;

    #[test]
    fn test_decode_log_frame() {
        let text = r#"{"event":"log:new","data":{"id":"l1","organizationId":"org","timestamp":"2024-01-15T10:30:00Z","level":"error","message":"disk full","source":"db-1","anomalyScore":0.8}}"#;
        let frame = Frame::from_json(text).unwrap();
        let Some(StreamEnvelope::Log(event)) = frame.into_envelope().unwrap() else {
            panic!("expected a log envelope");
        };
        assert_eq!(event.level, LogLevel::Error);
        assert_eq!(event.source, "db-1");
        assert_eq!(event.anomaly_score, Some(0.8));
    }

    #[test]
    fn test_decode_rejects_out_of_range_score() {
        let frame = Frame::new(
            "log:new",
            json!({
                "id": "l1", "organizationId": "org", "timestamp": "2024-01-15T10:30:00Z",
                "level": "INFO", "message": "m", "source": "s", "anomalyScore": 1.5
            }),
        );
        assert!(matches!(
            frame.into_envelope(),
            Err(DecodeError::AnomalyScoreOutOfRange(_))
        ));
    }

    #[test]
    fn test_decode_alert_frame() {
        let frame = Frame::new(
            "alert:new",
            json!({
                "id": "a1", "organizationId": "org", "type": "threshold",
                "severity": "high", "message": "error rate", "timestamp": "2024-01-15T10:30:00Z"
            }),
        );
        let Some(StreamEnvelope::Alert(alert)) = frame.into_envelope().unwrap() else {
            panic!("expected an alert envelope");
        };
        assert_eq!(alert.alert_type, "threshold");
        assert_eq!(alert.source, None);
    }

    #[test]
    fn test_decode_anomaly_keeps_payload() {
        let payload = json!({"id": "x9", "timestamp": "2024-01-15T10:30:00Z", "score": 3});
        let frame = Frame::new("anomaly:detected", payload.clone());
        let Some(StreamEnvelope::Anomaly(anomaly)) = frame.into_envelope().unwrap() else {
            panic!("expected an anomaly envelope");
        };
        assert_eq!(anomaly.id, "x9");
        assert_eq!(anomaly.payload, payload);

        let frame = Frame::new("anomaly:detected", json!({"score": 3}));
        let Some(StreamEnvelope::Anomaly(anomaly)) = frame.into_envelope().unwrap() else {
            panic!("expected an anomaly envelope");
        };
        assert!(!anomaly.id.is_empty());
    }

    #[test]
    fn test_unknown_frame_is_ignored() {
        let frame = Frame::new("metrics:tick", Value::Null);
        assert!(frame.into_envelope().unwrap().is_none());
    }

    #[test]
    fn test_malformed_payload() {
        let frame = Frame::new("log:new", json!({"id": 1}));
        assert!(matches!(
            frame.into_envelope(),
            Err(DecodeError::Payload { kind: EventKind::LogNew, .. })
        ));
    }
}
