//! Terminal rendering of bus events

use std::io::{IsTerminal, Write};
use std::sync::{Arc, Weak};

use chrono::Local;
use tracing::debug;

use logstream_core::{
    BusEvent, ConnectionState, EventKind, FilterSpec, LevelFilter, LogEvent, Notification,
    Notifier, SessionStats, StreamSession, callback,
};

const HIGHLIGHT_START: &str = "\x1b[1;33m";
const HIGHLIGHT_END: &str = "\x1b[0m";

/// Print matching logs, alerts and anomalies to stdout and state changes to stderr
///
/// Holds only a weak handle so the bus does not keep the session alive.
pub fn install(session: &Arc<StreamSession>) {
    let color = std::io::stdout().is_terminal();
    let bus = session.bus();

    let weak: Weak<StreamSession> = Arc::downgrade(session);
    bus.subscribe(
        EventKind::LogNew,
        &callback(move |event| {
            let (BusEvent::Log(log), Some(session)) = (event, weak.upgrade()) else {
                return Ok(());
            };
            if !session.matches(log) {
                return Ok(());
            }
            let ranges = if color {
                session.highlights(&log.message)
            } else {
                Vec::new()
            };
            print_line(&format_line(log, &ranges))
        }),
    );

    bus.subscribe(
        EventKind::AlertNew,
        &callback(|event| {
            let BusEvent::Alert(alert) = event else {
                return Ok(());
            };
            print_line(&format!(
                "!! ALERT [{}] {}: {}",
                alert.severity, alert.alert_type, alert.message
            ))
        }),
    );

    bus.subscribe(
        EventKind::AnomalyDetected,
        &callback(|event| {
            let BusEvent::Anomaly(anomaly) = event else {
                return Ok(());
            };
            print_line(&format!("?? ANOMALY {} {}", anomaly.id, anomaly.payload))
        }),
    );

    bus.subscribe(
        EventKind::ConnectionState,
        &callback(|event| {
            if let BusEvent::State(change) = event {
                eprintln!("[{}]", change.state);
            }
            Ok(())
        }),
    );
}

fn print_line(line: &str) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    Ok(())
}

/// `HH:MM:SS.mmm LVL source | message`, with an anomaly suffix when scored
pub fn format_line(event: &LogEvent, highlights: &[(usize, usize)]) -> String {
    let time = event.timestamp.with_timezone(&Local).format("%H:%M:%S%.3f");
    let mut line = format!(
        "{} {} {:>12} | {}",
        time,
        event.level.short(),
        event.source,
        highlight(&event.message, highlights)
    );
    if let Some(score) = event.anomaly_score {
        line.push_str(&format!("  (anomaly {score:.2})"));
    }
    line
}

/// Wrap each `[start, end)` byte range of `text` in ANSI bold yellow
pub fn highlight(text: &str, ranges: &[(usize, usize)]) -> String {
    let mut out = String::with_capacity(text.len() + ranges.len() * 12);
    let mut last = 0;
    for &(start, end) in ranges {
        if start < last
            || start > end
            || end > text.len()
            || !text.is_char_boundary(start)
            || !text.is_char_boundary(end)
        {
            continue;
        }
        out.push_str(&text[last..start]);
        out.push_str(HIGHLIGHT_START);
        out.push_str(&text[start..end]);
        out.push_str(HIGHLIGHT_END);
        last = end;
    }
    out.push_str(&text[last..]);
    out
}

pub fn format_stats(state: &ConnectionState, stats: &SessionStats) -> String {
    let counts = &stats.level_counts;
    format!(
        "{state} | {} logs/s | {}/{} buffered | {} received | {} dropped while paused | \
         DBG {} INF {} WRN {} ERR {} CRT {} FTL {}",
        stats.rate,
        stats.buffered,
        stats.capacity,
        stats.total_received,
        stats.dropped_while_paused,
        counts.debug,
        counts.info,
        counts.warn,
        counts.error,
        counts.critical,
        counts.fatal,
    )
}

pub fn describe_filter(spec: &FilterSpec) -> String {
    let mut parts = Vec::new();
    if let Some(text) = &spec.text {
        parts.push(format!("text='{text}'"));
    }
    if spec.level != LevelFilter::All {
        parts.push(format!("level={}", spec.level));
    }
    if let Some(source) = &spec.source {
        parts.push(format!("source={source}"));
    }
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join(" ")
    }
}

/// Rings the terminal bell and echoes the notification to stderr
pub struct BellNotifier;

impl Notifier for BellNotifier {
    fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        let mut stderr = std::io::stderr().lock();
        if notification.volume > 0.0 {
            write!(stderr, "\x07")?;
        }
        writeln!(stderr, "** {}: {}", notification.title, notification.message)?;
        debug!(title = %notification.title, "notification delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logstream_core::{LevelCounts, LogLevel};

    #[test]
    fn test_highlight_wraps_ranges() {
        let out = highlight("upstream timeout, timeout again", &[(9, 16), (18, 25)]);
        assert_eq!(
            out,
            "upstream \x1b[1;33mtimeout\x1b[0m, \x1b[1;33mtimeout\x1b[0m again"
        );
        assert_eq!(highlight("plain", &[]), "plain");
    }

    #[test]
    fn test_highlight_skips_bad_ranges() {
        assert_eq!(highlight("abc", &[(1, 9)]), "abc");
    }

    #[test]
    fn test_format_line() {
        let mut event = LogEvent::new("1", LogLevel::Error, "billing", "charge failed");
        event.anomaly_score = Some(0.812);
        let line = format_line(&event, &[]);

        assert!(line.contains(" ERR "));
        assert!(line.contains("billing | charge failed"));
        assert!(line.ends_with("(anomaly 0.81)"));
    }

    #[test]
    fn test_describe_filter() {
        assert_eq!(describe_filter(&FilterSpec::new()), "none");
        let spec = FilterSpec::new()
            .with_text("timeout")
            .with_level(LevelFilter::Only(LogLevel::Warn))
            .with_source("api");
        assert_eq!(describe_filter(&spec), "text='timeout' level=WARN source=api");
    }

    #[test]
    fn test_format_stats() {
        let stats = SessionStats {
            total_received: 12,
            dropped_while_paused: 3,
            buffered: 10,
            capacity: 500,
            level_counts: LevelCounts {
                info: 9,
                error: 1,
                ..Default::default()
            },
            rate: 4,
        };
        let line = format_stats(&ConnectionState::Connected, &stats);
        assert!(line.starts_with("connected | 4 logs/s | 10/500 buffered"));
        assert!(line.contains("INF 9"));
    }
}
