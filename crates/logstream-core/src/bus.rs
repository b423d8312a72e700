use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};

use logstream_types::{AlertEvent, AnomalyEvent, ConnectionState, EventKind, LogEvent, StreamEnvelope};

use crate::rate::RateSample;

/// Subscriber callback; identity is the `Arc` allocation
pub type Callback = Arc<dyn Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a bus callback
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A connection state transition as seen by subscribers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateChange {
    pub state: ConnectionState,

    /// Transport error behind a `Reconnecting` or `Failed` state
    pub reason: Option<String>,
}

/// Events delivered through the bus
#[derive(Clone, Debug)]
pub enum BusEvent {
    Log(Arc<LogEvent>),
    Alert(Arc<AlertEvent>),
    Anomaly(Arc<AnomalyEvent>),
    State(StateChange),
    Rate(RateSample),
}

impl BusEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Log(_) => EventKind::LogNew,
            Self::Alert(_) => EventKind::AlertNew,
            Self::Anomaly(_) => EventKind::AnomalyDetected,
            Self::State(_) => EventKind::ConnectionState,
            Self::Rate(_) => EventKind::RateSample,
        }
    }
}

impl From<StreamEnvelope> for BusEvent {
    fn from(envelope: StreamEnvelope) -> Self {
        match envelope {
            StreamEnvelope::Log(e) => Self::Log(Arc::new(e)),
            StreamEnvelope::Alert(e) => Self::Alert(Arc::new(e)),
            StreamEnvelope::Anomaly(e) => Self::Anomaly(Arc::new(e)),
        }
    }
}

/// A subscriber failed while handling an event
#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("subscriber #{index} for {kind} failed: {reason}")]
    Failed {
        kind: EventKind,
        index: usize,
        reason: String,
    },

    #[error("subscriber #{index} for {kind} panicked: {message}")]
    Panicked {
        kind: EventKind,
        index: usize,
        message: String,
    },
}

/// In-process publish/subscribe registry
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    subscribers: RwLock<HashMap<EventKind, Vec<Callback>>>,

    /// Bumped by `clear` so a running cascade stops
    epoch: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `kind`; registering the same callback twice is a no-op
    pub fn subscribe(&self, kind: EventKind, callback: &Callback) {
        let mut subscribers = self.inner.subscribers.write();
        let list = subscribers.entry(kind).or_default();
        if list.iter().any(|c| Arc::ptr_eq(c, callback)) {
            return;
        }
        list.push(Arc::clone(callback));
    }

    /// Remove a registration; unknown callbacks are ignored
    pub fn unsubscribe(&self, kind: EventKind, callback: &Callback) {
        let mut subscribers = self.inner.subscribers.write();
        if let Some(list) = subscribers.get_mut(&kind) {
            list.retain(|c| !Arc::ptr_eq(c, callback));
            if list.is_empty() {
                subscribers.remove(&kind);
            }
        }
    }

    /// Deliver `event` to every subscriber of its kind, in registration order
    ///
    /// Subscriber failures are logged and never stop delivery. Returns the
    /// number of subscribers that handled the event successfully.
    pub fn publish(&self, event: &BusEvent) -> usize {
        let kind = event.kind();
        let epoch = self.inner.epoch.load(Ordering::SeqCst);

        // Snapshot so callbacks may (un)subscribe without deadlocking
        let subscribers: Vec<Callback> = match self.inner.subscribers.read().get(&kind) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for (index, callback) in subscribers.iter().enumerate() {
            if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                debug!(%kind, "bus cleared mid-publish, stopping delivery");
                break;
            }

            let error = match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(e)) => SubscriberError::Failed {
                    kind,
                    index,
                    reason: format!("{e:#}"),
                },
                Err(payload) => SubscriberError::Panicked {
                    kind,
                    index,
                    message: panic_message(payload.as_ref()),
                },
            };
            warn!(error = %error, "subscriber error isolated");
        }

        delivered
    }

    /// Number of subscribers registered for `kind`
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .subscribers
            .read()
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Drop every registration
    pub fn clear(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.write().clear();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
