//! Synthetic log server for `--demo`
//!
//! Serves the loopback side of a [`MemoryTransport`], emitting a random log
//! event per tick and honoring pause/resume from the client.

use std::time::Duration;

use chrono::Utc;
use rand::{Rng, rng};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::debug;

use logstream_transport::{ControlMessage, MemoryPeer, MemoryTransport};
use logstream_types::{AlertEvent, Frame, LogEvent, LogLevel};

/// Token the demo server accepts
pub const TOKEN: &str = "demo";

const SOURCES: [&str; 5] = [
    "api-gateway",
    "auth-service",
    "billing",
    "db-primary",
    "scheduler",
];

/// Relative frequency of each level, same order as `LogLevel::ALL`
const LEVEL_WEIGHTS: [u32; 6] = [15, 55, 15, 10, 3, 2];

pub fn transport() -> MemoryTransport {
    let transport = MemoryTransport::new();
    transport.require_token(TOKEN);
    transport
}

/// Serve every client that connects to `transport`
pub fn spawn(transport: MemoryTransport, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut seq = 0u64;
        while let Some(peer) = transport.accept().await {
            debug!("demo client connected");
            seq = serve(peer, period, seq).await;
            debug!("demo client went away");
        }
    })
}

async fn serve(mut peer: MemoryPeer, period: Duration, mut seq: u64) -> u64 {
    let mut paused = false;
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            control = peer.next_control() => match control {
                Some(ControlMessage::Pause) => paused = true,
                Some(ControlMessage::Resume) => paused = false,
                None => return seq,
            },
            _ = ticker.tick(), if !paused => {
                seq += 1;
                for frame in frames_for(seq) {
                    if !peer.emit(frame) {
                        return seq;
                    }
                }
            }
        }
    }
}

/// Frames for one tick: the log event, plus an alert for FATAL and an
/// anomaly report for high scores
fn frames_for(seq: u64) -> Vec<Frame> {
    let event = random_event(seq);
    let mut frames = vec![Frame::log(&event)];

    if event.level == LogLevel::Fatal {
        frames.push(Frame::alert(&AlertEvent {
            id: format!("alert-{seq}"),
            organization_id: event.organization_id.clone(),
            alert_type: "fatal-log".to_string(),
            severity: "critical".to_string(),
            message: event.message.clone(),
            source: Some(event.source.clone()),
            timestamp: event.timestamp,
        }));
    }

    if let Some(score) = event.anomaly_score.filter(|s| *s >= 0.85) {
        frames.push(Frame::new(
            "anomaly:detected",
            json!({
                "id": format!("anomaly-{seq}"),
                "timestamp": Utc::now().to_rfc3339(),
                "logId": event.id,
                "source": event.source,
                "score": score,
            }),
        ));
    }

    frames
}

fn random_event(seq: u64) -> LogEvent {
    let mut rng = rng();
    let level = pick_level(rng.random_range(0..LEVEL_WEIGHTS.iter().sum::<u32>()));
    let source = SOURCES[rng.random_range(0..SOURCES.len())];

    let mut event = LogEvent::new(format!("demo-{seq}"), level, source, message_for(level, seq));
    event.organization_id = "demo-org".to_string();
    event.anomaly_score = Some(anomaly_score(level, rng.random::<f64>()));
    event
}

/// Map a roll in `0..sum(LEVEL_WEIGHTS)` to a level
fn pick_level(mut roll: u32) -> LogLevel {
    for (level, weight) in LogLevel::ALL.into_iter().zip(LEVEL_WEIGHTS) {
        if roll < weight {
            return level;
        }
        roll -= weight;
    }
    LogLevel::Info
}

/// Heuristic score by severity; `unit` is uniform in [0, 1)
fn anomaly_score(level: LogLevel, unit: f64) -> f64 {
    let (low, high) = match level {
        LogLevel::Fatal => (0.9, 1.0),
        LogLevel::Error => (0.7, 0.9),
        LogLevel::Warn => (0.3, 0.6),
        _ => (0.0, 0.2),
    };
    low + (high - low) * unit.clamp(0.0, 1.0)
}

fn message_for(level: LogLevel, seq: u64) -> String {
    match level {
        LogLevel::Debug => format!("cache lookup #{seq} took 2ms"),
        LogLevel::Info => format!("request #{seq} served in 41ms"),
        LogLevel::Warn => format!("slow query #{seq}: 1200ms over budget"),
        LogLevel::Error => format!("request #{seq} failed: upstream timeout"),
        LogLevel::Critical => format!("connection pool exhausted at request #{seq}"),
        LogLevel::Fatal => format!("worker crashed handling request #{seq}"),
    }
}
