//! Connection session manager
//!
//! A [`StreamSession`] owns one transport connection at a time and the
//! buffer, bus and rate estimator fed by it. Reconnection runs in a driver
//! task; callers observe it through `connection:state` bus events.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use logstream_transport::{Connection, ControlMessage, Transport, TransportError};
use logstream_types::{ConnectionState, EventKind, Frame, LogEvent, StreamEnvelope};

use crate::buffer::{LevelCounts, LogBuffer};
use crate::bus::{BusEvent, EventBus, StateChange, callback};
use crate::config::{ConfigError, ReconnectConfig, StreamConfig};
use crate::filter::{CompiledFilter, FilterSpec, FilteredView};
use crate::rate::RateEstimator;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("session is already active ({0})")]
    AlreadyActive(ConnectionState),

    #[error("session was disconnected before the connection was established")]
    Cancelled,

    #[error("invalid filter: {0}")]
    Filter(#[from] regex::Error),
}

/// Point-in-time counters for a status line
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub total_received: u64,
    pub dropped_while_paused: u64,
    pub buffered: usize,
    pub capacity: usize,
    pub level_counts: LevelCounts,
    pub rate: u64,
}

/// Requests from the session handle to its driver task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    Pause,
    Resume,
    RetryNow,
}

/// State shared between the session handle and its tasks
struct Shared {
    state: RwLock<ConnectionState>,
    last_error: RwLock<Option<String>>,
    paused: AtomicBool,
    dropped_while_paused: AtomicU64,
    bus: EventBus,
    buffer: LogBuffer,
    rate: RateEstimator,
    filter: RwLock<CompiledFilter>,

    /// Held for every publish cascade; `disconnect` takes it to fence them off
    delivery: ReentrantMutex<()>,
}

impl Shared {
    fn transition(&self, state: ConnectionState, reason: Option<String>) {
        {
            let mut current = self.state.write();
            if *current == state {
                return;
            }
            *current = state.clone();
        }
        if let Some(reason) = &reason {
            *self.last_error.write() = Some(reason.clone());
        }

        match &reason {
            Some(reason) => info!(state = %state, %reason, "connection state changed"),
            None => info!(state = %state, "connection state changed"),
        }
        self.bus.publish(&BusEvent::State(StateChange { state, reason }));
    }

    /// Register the buffer and rate estimator as log subscribers
    fn install_internal_subscribers(&self) {
        let buffer = self.buffer.clone();
        let to_buffer = callback(move |event| {
            if let BusEvent::Log(log) = event {
                buffer.push(Arc::clone(log));
            }
            Ok(())
        });

        let rate = self.rate.clone();
        let to_rate = callback(move |event| {
            if let BusEvent::Log(_) = event {
                rate.record();
            }
            Ok(())
        });

        self.bus.subscribe(EventKind::LogNew, &to_buffer);
        self.bus.subscribe(EventKind::LogNew, &to_rate);
    }
}

/// Handles of one connect..disconnect run
struct Run {
    cancel: CancellationToken,
    controls: mpsc::UnboundedSender<Control>,
    driver: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

/// A live log stream session
pub struct StreamSession {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    config: StreamConfig,
    run: Mutex<Option<Run>>,
}

impl StreamSession {
    /// Create a disconnected session; rejects out-of-range settings
    pub fn new(transport: Arc<dyn Transport>, config: StreamConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let shared = Arc::new(Shared {
            state: RwLock::new(ConnectionState::Disconnected),
            last_error: RwLock::new(None),
            paused: AtomicBool::new(false),
            dropped_while_paused: AtomicU64::new(0),
            bus: EventBus::new(),
            buffer: LogBuffer::new(config.buffer.capacity),
            rate: RateEstimator::new(),
            filter: RwLock::new(CompiledFilter::default()),
            delivery: ReentrantMutex::new(()),
        });

        Ok(Self {
            shared,
            transport,
            config,
            run: Mutex::new(None),
        })
    }

    /// Connect with a bearer token
    ///
    /// Resolves once the first connection is established. Later drops and
    /// reconnections are reported as `connection:state` events only.
    pub async fn connect(&self, token: &str) -> Result<(), SessionError> {
        if token.trim().is_empty() {
            return Err(SessionError::Auth("no token supplied".into()));
        }

        let ready = {
            let mut run = self.run.lock();
            if run.is_some() {
                return Err(SessionError::AlreadyActive(self.state()));
            }

            self.shared.install_internal_subscribers();
            self.shared.rate.reset();

            let cancel = CancellationToken::new();
            let (controls_tx, controls_rx) = mpsc::unbounded_channel();
            let (ready_tx, ready_rx) = oneshot::channel();

            info!(endpoint = %self.transport.endpoint(), "starting log stream session");
            let driver = Driver {
                shared: Arc::clone(&self.shared),
                transport: Arc::clone(&self.transport),
                token: token.to_string(),
                policy: self.config.reconnect.clone(),
                cancel: cancel.clone(),
                controls: controls_rx,
                ready: Some(ready_tx),
            };
            let driver = tokio::spawn(driver.run());
            let ticker = tokio::spawn(run_ticker(
                Arc::clone(&self.shared),
                cancel.clone(),
                self.config.rate.interval(),
            ));

            *run = Some(Run {
                cancel,
                controls: controls_tx,
                driver,
                ticker,
            });
            ready_rx
        };

        ready.await.unwrap_or(Err(SessionError::Cancelled))
    }

    /// Tear the session down; safe to call repeatedly
    ///
    /// Once this returns no further events reach the buffer or subscribers.
    pub fn disconnect(&self) {
        let run = self.run.lock().take();
        if let Some(run) = &run {
            run.cancel.cancel();
            run.driver.abort();
            run.ticker.abort();
        }

        // Waits out a cascade running on another thread
        let _delivery = self.shared.delivery.lock();
        self.shared.transition(ConnectionState::Disconnected, None);
        self.shared.bus.clear();
        self.shared.buffer.clear();
        self.shared.rate.reset();
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.dropped_while_paused.store(0, Ordering::SeqCst);
        *self.shared.last_error.write() = None;

        if run.is_some() {
            info!("log stream session disconnected");
        }
    }

    /// Drop inbound log events locally and ask the server to hold off
    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            debug!("stream paused");
            self.send_control(Control::Pause);
        }
    }

    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            debug!("stream resumed");
            self.send_control(Control::Resume);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Start a fresh connection cycle from `Failed` or `Reconnecting`
    ///
    /// Returns false when the current state does not allow a retry.
    pub fn retry_now(&self) -> bool {
        if !self.state().is_retryable() {
            return false;
        }
        self.send_control(Control::RetryNow)
    }

    fn send_control(&self, control: Control) -> bool {
        match self.run.lock().as_ref() {
            Some(run) => run.controls.send(control).is_ok(),
            None => false,
        }
    }

    /// Empty the buffer and reset its counters
    pub fn clear(&self) {
        self.shared.buffer.clear();
        self.shared.dropped_while_paused.store(0, Ordering::SeqCst);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.read().clone()
    }

    /// Reason of the most recent `Reconnecting` or `Failed` transition
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.read().clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    pub fn snapshot(&self) -> Vec<Arc<LogEvent>> {
        self.shared.buffer.snapshot()
    }

    /// Last computed events per second
    pub fn rate(&self) -> u64 {
        self.shared.rate.current()
    }

    pub fn set_filter(&self, spec: FilterSpec) -> Result<(), SessionError> {
        let compiled = CompiledFilter::new(&spec)?;
        *self.shared.filter.write() = compiled;
        Ok(())
    }

    pub fn filter(&self) -> FilterSpec {
        self.shared.filter.read().spec().clone()
    }

    /// Buffer contents under the current filter, with available sources
    pub fn filtered(&self) -> FilteredView {
        let snapshot = self.shared.buffer.snapshot();
        let filter = self.shared.filter.read().clone();
        FilteredView::compute(&snapshot, &filter)
    }

    /// Whether `event` passes the current filter
    pub fn matches(&self, event: &LogEvent) -> bool {
        self.shared.filter.read().matches(event)
    }

    /// Match ranges of the current text filter within `text`
    pub fn highlights(&self, text: &str) -> Vec<(usize, usize)> {
        self.shared.filter.read().find_matches(text)
    }

    pub fn stats(&self) -> SessionStats {
        let buffer = &self.shared.buffer;
        SessionStats {
            total_received: buffer.total_received(),
            dropped_while_paused: self.shared.dropped_while_paused.load(Ordering::SeqCst),
            buffered: buffer.len(),
            capacity: buffer.capacity(),
            level_counts: buffer.level_counts(),
            rate: self.shared.rate.current(),
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().take() {
            run.cancel.cancel();
            run.driver.abort();
            run.ticker.abort();
        }
    }
}

/// Why the pump stopped
enum PumpExit {
    Cancelled,
    Dropped(String),
}

/// How a wait between attempts ended
enum Wake {
    Elapsed,
    Retry,
    Cancelled,
}

/// Connection loop of one session run
struct Driver {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    token: String,
    policy: ReconnectConfig,
    cancel: CancellationToken,
    controls: mpsc::UnboundedReceiver<Control>,
    ready: Option<oneshot::Sender<Result<(), SessionError>>>,
}

impl Driver {
    async fn run(mut self) {
        if !self.transition(ConnectionState::Connecting, None) {
            return;
        }

        let mut attempt: u32 = 0;
        loop {
            let timeout = self.policy.handshake_timeout();
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = tokio::time::timeout(timeout, self.transport.connect(&self.token)) => {
                    result.unwrap_or_else(|_| {
                        Err(TransportError::Handshake(format!(
                            "no answer within {}ms",
                            timeout.as_millis()
                        )))
                    })
                }
            };

            let failure = match result {
                Ok(connection) => {
                    attempt = 0;
                    if !self.transition(ConnectionState::Connected, None) {
                        return;
                    }
                    self.resolve(Ok(()));

                    match self.pump(connection).await {
                        PumpExit::Cancelled => return,
                        PumpExit::Dropped(reason) => {
                            warn!(%reason, "log stream connection dropped");
                            Failure::Dropped(reason)
                        }
                    }
                }
                Err(error) if error.is_permanent() => Failure::Rejected(error),
                Err(error) => {
                    warn!(%error, attempt = attempt + 1, "log stream handshake failed");
                    Failure::Handshake(error)
                }
            };

            let wake = match failure {
                Failure::Rejected(error) => {
                    let reason = error.to_string();
                    self.fail(reason, Failure::Rejected(error).into_error())
                        .await
                }
                failure => {
                    attempt += 1;
                    let reason = failure.reason();
                    if !self.policy.enabled || attempt > self.policy.max_attempts {
                        self.fail(reason, failure.into_error()).await
                    } else {
                        let state = ConnectionState::Reconnecting { attempt };
                        if !self.transition(state, Some(reason)) {
                            return;
                        }
                        self.backoff(self.policy.delay_for(attempt)).await
                    }
                }
            };

            match wake {
                Wake::Cancelled => return,
                Wake::Elapsed => {}
                Wake::Retry => {
                    attempt = 0;
                    if !self.transition(ConnectionState::Connecting, None) {
                        return;
                    }
                }
            }
        }
    }

    /// Enter `Failed`, settle a pending `connect`, and wait for a retry
    async fn fail(&mut self, reason: String, error: SessionError) -> Wake {
        if !self.transition(ConnectionState::Failed { reason: reason.clone() }, Some(reason)) {
            return Wake::Cancelled;
        }
        self.resolve(Err(error));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Wake::Cancelled,
                control = self.controls.recv() => match control {
                    Some(Control::RetryNow) => return Wake::Retry,
                    Some(_) => {}
                    None => return Wake::Cancelled,
                },
            }
        }
    }

    /// Sleep before the next attempt, cut short by `retry_now`
    async fn backoff(&mut self, delay: Duration) -> Wake {
        debug!(?delay, "waiting before reconnect");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Wake::Cancelled,
                _ = &mut sleep => return Wake::Elapsed,
                control = self.controls.recv() => match control {
                    Some(Control::RetryNow) => return Wake::Retry,
                    // Pause state is re-sent once connected
                    Some(_) => {}
                    None => return Wake::Cancelled,
                },
            }
        }
    }

    /// Forward frames to the bus until the connection ends
    async fn pump(&mut self, mut connection: Box<dyn Connection>) -> PumpExit {
        if self.shared.paused.load(Ordering::SeqCst) {
            send_upstream(connection.as_mut(), ControlMessage::Pause).await;
        }

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return PumpExit::Cancelled,

                control = self.controls.recv() => match control {
                    Some(Control::Pause) => {
                        send_upstream(connection.as_mut(), ControlMessage::Pause).await;
                    }
                    Some(Control::Resume) => {
                        send_upstream(connection.as_mut(), ControlMessage::Resume).await;
                    }
                    Some(Control::RetryNow) => debug!("already connected, ignoring retry"),
                    None => return PumpExit::Cancelled,
                },

                frame = connection.recv() => match frame {
                    Ok(Some(frame)) => self.deliver(frame),
                    Ok(None) => return PumpExit::Dropped("connection closed by server".into()),
                    Err(error) => return PumpExit::Dropped(error.to_string()),
                },
            }
        }
    }

    fn deliver(&self, frame: Frame) {
        let name = frame.name.clone();
        let envelope = match frame.into_envelope() {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                debug!(event = %name, "ignoring frame");
                return;
            }
            Err(error) => {
                warn!(event = %name, %error, "dropping malformed frame");
                return;
            }
        };

        if matches!(envelope, StreamEnvelope::Log(_)) && self.shared.paused.load(Ordering::SeqCst) {
            self.shared.dropped_while_paused.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let _delivery = self.shared.delivery.lock();
        if self.cancel.is_cancelled() {
            return;
        }
        self.shared.bus.publish(&BusEvent::from(envelope));
    }

    /// Publish a transition unless the run was cancelled
    fn transition(&self, state: ConnectionState, reason: Option<String>) -> bool {
        let _delivery = self.shared.delivery.lock();
        if self.cancel.is_cancelled() {
            return false;
        }
        self.shared.transition(state, reason);
        true
    }

    fn resolve(&mut self, result: Result<(), SessionError>) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(result);
        }
    }
}

/// A failed connection cycle
enum Failure {
    /// Retrying cannot help (bad credentials or endpoint)
    Rejected(TransportError),
    Handshake(TransportError),
    Dropped(String),
}

impl Failure {
    fn reason(&self) -> String {
        match self {
            Self::Rejected(error) | Self::Handshake(error) => error.to_string(),
            Self::Dropped(reason) => reason.clone(),
        }
    }

    fn into_error(self) -> SessionError {
        match self {
            Self::Rejected(error) if error.is_auth() => SessionError::Auth(error.to_string()),
            Self::Rejected(error) | Self::Handshake(error) => SessionError::Transport(error),
            Self::Dropped(reason) => SessionError::Transport(TransportError::Closed(reason)),
        }
    }
}

async fn send_upstream(connection: &mut dyn Connection, message: ControlMessage) {
    if let Err(error) = connection.send(message).await {
        warn!(control = message.as_str(), %error, "failed to send control message");
    }
}

/// Publish a rate sample every `period` until cancelled
async fn run_ticker(shared: Arc<Shared>, cancel: CancellationToken, period: Duration) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let sample = shared.rate.sample();
                let _delivery = shared.delivery.lock();
                if cancel.is_cancelled() {
                    break;
                }
                shared.bus.publish(&BusEvent::Rate(sample));
            }
        }
    }
}
