use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use logstream_types::{EventKind, LogLevel};

use crate::bus::{BusEvent, Callback, EventBus, callback};
use crate::config::ConfigError;

/// Sound and toast settings for the alert hook
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotificationConfig {
    pub enabled: bool,

    /// Playback volume in [0, 1]
    pub volume: f32,

    /// Log levels that trigger a notification
    pub levels: Vec<LogLevel>,

    /// Also notify on backend alerts
    pub alerts: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            volume: 0.5,
            levels: vec![LogLevel::Fatal],
            alerts: false,
        }
    }
}

impl NotificationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.volume.is_finite() || !(0.0..=1.0).contains(&self.volume) {
            return Err(ConfigError::invalid(
                "notifications.volume",
                format!("{} is outside [0, 1]", self.volume),
            ));
        }
        Ok(())
    }
}

/// What a notifier is asked to present
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    /// Level of the triggering log event, if any
    pub level: Option<LogLevel>,
    pub volume: f32,
}

/// Downstream sink for notifications (sound, toast, bell, ...)
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Bus subscriber turning severe log events and alerts into notifications
pub struct AlertHook {
    bus: EventBus,
    on_log: Callback,
    on_alert: Callback,
}

impl AlertHook {
    /// Validate `config` and subscribe to `bus`
    pub fn install(
        bus: &EventBus,
        config: NotificationConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);

        let on_log = {
            let config = Arc::clone(&config);
            let notifier = Arc::clone(&notifier);
            callback(move |event| {
                let BusEvent::Log(log) = event else {
                    return Ok(());
                };
                if !config.levels.contains(&log.level) {
                    return Ok(());
                }
                notifier.notify(&Notification {
                    title: format!("{} from {}", log.level, log.source),
                    message: log.message.clone(),
                    level: Some(log.level),
                    volume: config.volume,
                })
            })
        };

        let on_alert = {
            let config = Arc::clone(&config);
            callback(move |event| {
                let BusEvent::Alert(alert) = event else {
                    return Ok(());
                };
                notifier.notify(&Notification {
                    title: format!("{} alert: {}", alert.severity, alert.alert_type),
                    message: alert.message.clone(),
                    level: None,
                    volume: config.volume,
                })
            })
        };

        if config.enabled {
            bus.subscribe(EventKind::LogNew, &on_log);
            if config.alerts {
                bus.subscribe(EventKind::AlertNew, &on_alert);
            }
        } else {
            debug!("notifications disabled, alert hook not subscribed");
        }

        Ok(Self {
            bus: bus.clone(),
            on_log,
            on_alert,
        })
    }

    pub fn uninstall(&self) {
        self.bus.unsubscribe(EventKind::LogNew, &self.on_log);
        self.bus.unsubscribe(EventKind::AlertNew, &self.on_alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use logstream_types::{AlertEvent, LogEvent};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Notification>>,
    }

    impl Notifier for Recorder {
        fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
            self.seen.lock().push(notification.clone());
            Ok(())
        }
    }

    fn log(level: LogLevel) -> BusEvent {
        BusEvent::Log(Arc::new(LogEvent::new("1", level, "db", "disk gone")))
    }

    fn alert() -> BusEvent {
        BusEvent::Alert(Arc::new(AlertEvent {
            id: "a1".into(),
            organization_id: "org".into(),
            alert_type: "error-rate".into(),
            severity: "high".into(),
            message: "too many errors".into(),
            source: None,
            timestamp: Utc::now(),
        }))
    }

    #[test]
    fn test_notifies_on_configured_levels_only() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let _hook = AlertHook::install(&bus, NotificationConfig::default(), recorder.clone()).unwrap();

        bus.publish(&log(LogLevel::Error));
        bus.publish(&log(LogLevel::Fatal));
        bus.publish(&alert());

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].level, Some(LogLevel::Fatal));
        assert_eq!(seen[0].volume, 0.5);
    }

    #[test]
    fn test_alerts_when_enabled() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let config = NotificationConfig {
            alerts: true,
            ..Default::default()
        };
        let _hook = AlertHook::install(&bus, config, recorder.clone()).unwrap();

        bus.publish(&alert());
        assert_eq!(recorder.seen.lock()[0].title, "high alert: error-rate");
    }

    #[test]
    fn test_disabled_and_uninstalled_hooks_are_silent() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let config = NotificationConfig {
            enabled: false,
            ..Default::default()
        };
        let _hook = AlertHook::install(&bus, config, recorder.clone()).unwrap();
        bus.publish(&log(LogLevel::Fatal));
        assert!(recorder.seen.lock().is_empty());

        let hook = AlertHook::install(&bus, NotificationConfig::default(), recorder.clone()).unwrap();
        hook.uninstall();
        bus.publish(&log(LogLevel::Fatal));
        assert!(recorder.seen.lock().is_empty());
    }

    #[test]
    fn test_rejects_invalid_volume() {
        let bus = EventBus::new();
        let config = NotificationConfig {
            volume: -0.1,
            ..Default::default()
        };
        assert!(AlertHook::install(&bus, config, Arc::new(Recorder::default())).is_err());
    }
}
