//! Client-side core of a live log stream
//!
//! Frames from a [`Transport`](logstream_transport::Transport) are decoded
//! and fanned out through an [`EventBus`]; the session keeps a bounded
//! [`LogBuffer`] for display, a [`RateEstimator`] for throughput, and the
//! live filter applied to both.

pub mod buffer;
pub mod bus;
pub mod config;
pub mod filter;
pub mod notify;
pub mod rate;
pub mod session;

pub use buffer::{DEFAULT_CAPACITY, LevelCounts, LogBuffer};
pub use bus::{BusEvent, Callback, EventBus, StateChange, SubscriberError, callback};
pub use config::{BufferConfig, ConfigError, RateConfig, ReconnectConfig, StreamConfig};
pub use filter::{CompiledFilter, FilterSpec, FilteredView, LevelFilter, distinct_sources};
pub use notify::{AlertHook, Notification, NotificationConfig, Notifier};
pub use rate::{RateEstimator, RateSample};
pub use session::{SessionError, SessionStats, StreamSession};

pub use logstream_types::{
    AlertEvent, AnomalyEvent, ConnectionState, EventKind, LogEvent, LogLevel, StreamEnvelope,
};
