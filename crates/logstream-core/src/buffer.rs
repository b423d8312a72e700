use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use logstream_types::{LogEvent, LogLevel};

/// Default number of events kept for display
pub const DEFAULT_CAPACITY: usize = 500;

/// Lock-free counters for each log level
#[derive(Default)]
struct AtomicLevelCounts {
    debug: AtomicUsize,
    info: AtomicUsize,
    warn: AtomicUsize,
    error: AtomicUsize,
    critical: AtomicUsize,
    fatal: AtomicUsize,
}

impl AtomicLevelCounts {
    fn slot(&self, level: LogLevel) -> &AtomicUsize {
        match level {
            LogLevel::Debug => &self.debug,
            LogLevel::Info => &self.info,
            LogLevel::Warn => &self.warn,
            LogLevel::Error => &self.error,
            LogLevel::Critical => &self.critical,
            LogLevel::Fatal => &self.fatal,
        }
    }

    fn increment(&self, level: LogLevel) {
        self.slot(level).fetch_add(1, Ordering::Relaxed);
    }

    fn decrement(&self, level: LogLevel) {
        self.slot(level).fetch_sub(1, Ordering::Relaxed);
    }

    fn to_counts(&self) -> LevelCounts {
        LevelCounts {
            debug: self.debug.load(Ordering::Relaxed),
            info: self.info.load(Ordering::Relaxed),
            warn: self.warn.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
            critical: self.critical.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for level in LogLevel::ALL {
            self.slot(level).store(0, Ordering::Relaxed);
        }
    }
}

/// Fixed-capacity ring buffer of the most recent log events
///
/// Cloning yields another handle to the same storage.
#[derive(Clone)]
pub struct LogBuffer {
    /// Internal storage - events are shared with snapshots, never copied
    entries: Arc<RwLock<VecDeque<Arc<LogEvent>>>>,

    /// Maximum capacity
    capacity: usize,

    /// Events pushed since creation or the last clear, evicted ones included
    total_received: Arc<AtomicU64>,

    /// Level counts of the events currently held
    level_counts: Arc<AtomicLevelCounts>,
}

impl LogBuffer {
    /// Create a new log buffer with the given capacity (at least 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
            total_received: Arc::new(AtomicU64::new(0)),
            level_counts: Arc::new(AtomicLevelCounts::default()),
        }
    }

    /// Append an event, evicting the oldest ones past capacity
    pub fn push(&self, event: impl Into<Arc<LogEvent>>) {
        let event = event.into();
        self.total_received.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.entries.write();
        while entries.len() >= self.capacity {
            match entries.pop_front() {
                Some(evicted) => self.level_counts.decrement(evicted.level),
                None => break,
            }
        }
        self.level_counts.increment(event.level);
        entries.push_back(event);
    }

    /// Current contents in arrival order
    pub fn snapshot(&self) -> Vec<Arc<LogEvent>> {
        self.entries.read().iter().cloned().collect()
    }

    /// Get the last N entries
    pub fn tail(&self, n: usize) -> Vec<Arc<LogEvent>> {
        let entries = self.entries.read();
        let start = entries.len().saturating_sub(n);
        entries.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total events pushed, including evicted ones
    pub fn total_received(&self) -> u64 {
        self.total_received.load(Ordering::Relaxed)
    }

    /// Get entry count per log level for the buffered events
    pub fn level_counts(&self) -> LevelCounts {
        // Hold the read lock so counts match the contents
        let _entries = self.entries.read();
        self.level_counts.to_counts()
    }

    /// Clear all entries and derived counters
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        entries.clear();
        self.total_received.store(0, Ordering::SeqCst);
        self.level_counts.reset();
    }
}

/// Counts per log level
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LevelCounts {
    pub debug: usize,
    pub info: usize,
    pub warn: usize,
    pub error: usize,
    pub critical: usize,
    pub fatal: usize,
}

impl LevelCounts {
    pub fn get(&self, level: LogLevel) -> usize {
        match level {
            LogLevel::Debug => self.debug,
            LogLevel::Info => self.info,
            LogLevel::Warn => self.warn,
            LogLevel::Error => self.error,
            LogLevel::Critical => self.critical,
            LogLevel::Fatal => self.fatal,
        }
    }

    pub fn total(&self) -> usize {
        self.debug + self.info + self.warn + self.error + self.critical + self.fatal
    }
}
