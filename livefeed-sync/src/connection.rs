//! Subscription lifecycle and reconnect policy.
//!
//! ```text
//! Disconnected ─► Connecting ─┬─► Open ──(stream error / end)──┐
//!                      ▲      └──(connect failure)─────────────┤
//!                      │                                       ▼
//!                      └──────── reconnect deadline ◄──────── Error
//! ```
//!
//! A single task drives the connection: it reads events, feeds them through
//! the [`Pipeline`], and sleeps until the reconnect deadline after a failure.
//! Only one deadline exists at a time; scheduling a new one replaces it. The
//! loop ends only when [`ConnectionHandle::shutdown`] is called.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::{watch, RwLock};
use tokio::time::{self, Instant};

use crate::config::SyncConfig;
use crate::error::{ConfigError, SyncError};
use crate::listener::ListenerRegistry;
use crate::pipeline::{Outcome, Pipeline};
use crate::replica::Replica;
use crate::sse::SseEvent;
use crate::transport::{EventSource, EventStream, HttpEventSource, TransportError};

/// Subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Error,
}

/// Single-slot reconnect deadline.
#[derive(Debug, Default)]
pub struct ReconnectTimer {
    deadline: Option<Instant>,
}

impl ReconnectTimer {
    /// Set the deadline, replacing any pending one. Returns whether one was
    /// replaced.
    pub fn schedule(&mut self, at: Instant) -> bool {
        self.deadline.replace(at).is_some()
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_scheduled(&self) -> bool {
        self.deadline.is_some()
    }
}

struct Shared {
    state: RwLock<ConnectionState>,
    sessions: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Observes and stops a running [`ConnectionManager`].
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Sessions opened so far.
    pub fn sessions(&self) -> u64 {
        self.shared.sessions.load(Ordering::SeqCst)
    }

    /// Ask the connection loop to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shared.shutdown.borrow()
    }
}

/// Owns the upstream subscription.
pub struct ConnectionManager<S> {
    endpoint: String,
    reconnect_delay: Duration,
    sweep_period: Duration,
    source: S,
    pipeline: Pipeline,
    timer: ReconnectTimer,
    shared: Arc<Shared>,
}

impl ConnectionManager<HttpEventSource> {
    /// Manager over the HTTP event-stream transport.
    pub fn http(
        config: SyncConfig,
        replica: Replica,
        listeners: ListenerRegistry,
    ) -> Result<Self, SyncError> {
        config.resolved_endpoint()?;
        let source = HttpEventSource::new(config.connect_timeout)?;
        Ok(Self::new(config, source, replica, listeners)?)
    }
}

impl<S: EventSource> ConnectionManager<S> {
    /// Validate `config` and build a manager. Nothing connects until
    /// [`run`](Self::run).
    pub fn new(
        config: SyncConfig,
        source: S,
        replica: Replica,
        listeners: ListenerRegistry,
    ) -> Result<Self, ConfigError> {
        let endpoint = config.resolved_endpoint()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            endpoint,
            reconnect_delay: config.reconnect_delay,
            sweep_period: config.assembly.max_age.max(Duration::from_secs(1)),
            source,
            pipeline: Pipeline::new(replica, listeners, config.assembly),
            timer: ReconnectTimer::default(),
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                sessions: AtomicU64::new(0),
                shutdown,
            }),
        })
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: self.shared.clone(),
        }
    }

    /// The resolved endpoint, negotiation flags included.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn replica(&self) -> &Replica {
        self.pipeline.replica()
    }

    /// Connect, process events and reconnect until shut down.
    pub async fn run(mut self) {
        let mut shutdown = self.shared.shutdown.subscribe();
        log::info!("[sync] subscribing to {}", self.endpoint);

        'session: loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting).await;
            let connected = tokio::select! {
                result = self.source.connect(&self.endpoint) => result,
                _ = wait_for_shutdown(&mut shutdown) => break 'session,
            };

            match connected {
                Ok(events) => {
                    self.on_open().await;
                    match self.pump(events, &mut shutdown).await {
                        Some(err) => self.on_error(err).await,
                        None => break 'session,
                    }
                }
                Err(err) => self.on_error(err).await,
            }

            if let Some(deadline) = self.timer.deadline() {
                tokio::select! {
                    _ = time::sleep_until(deadline) => self.timer.cancel(),
                    _ = wait_for_shutdown(&mut shutdown) => break 'session,
                }
            }
        }

        self.timer.cancel();
        self.set_state(ConnectionState::Disconnected).await;
        log::info!("[sync] connection loop stopped");
    }

    /// Read events until the stream fails or ends (`Some`) or shutdown is
    /// requested (`None`).
    async fn pump(
        &mut self,
        mut events: EventStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<TransportError> {
        let mut sweep = time::interval_at(Instant::now() + self.sweep_period, self.sweep_period);
        loop {
            tokio::select! {
                next = events.next() => match next {
                    Some(Ok(event)) => self.dispatch(event),
                    Some(Err(err)) => return Some(err),
                    None => return Some(TransportError::Closed),
                },
                _ = sweep.tick() => {
                    self.pipeline.sweep();
                }
                _ = wait_for_shutdown(shutdown) => return None,
            }
        }
    }

    fn dispatch(&mut self, event: SseEvent) {
        if let Some(retry) = event.retry {
            log::debug!("[sync] upstream retry hint {retry}ms ignored");
        }
        match self.pipeline.handle_event(event) {
            Ok(Outcome::Applied(report)) if report.failed > 0 => {
                log::warn!(
                    "[sync] delta applied, {} of {} listener(s) failed",
                    report.failed,
                    report.failed + report.delivered
                );
            }
            Ok(_) => {}
            Err(err) => log::warn!("[sync] message dropped: {err}"),
        }
    }

    async fn on_open(&mut self) {
        self.timer.cancel();
        self.pipeline.begin_session();
        let session = self.shared.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ConnectionState::Open).await;
        log::info!("[sync] session {session} open: {}", self.endpoint);
    }

    async fn on_error(&mut self, err: TransportError) {
        let previous = self.state().await;
        self.set_state(ConnectionState::Error).await;
        log::warn!(
            "[sync] connection error: state={previous:?} at={} endpoint={} error={err}",
            Utc::now().to_rfc3339(),
            self.endpoint
        );

        if self.timer.schedule(Instant::now() + self.reconnect_delay) {
            log::debug!("[sync] pending reconnect replaced");
        }
        log::info!("[sync] reconnecting in {:?}", self.reconnect_delay);
    }

    async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.shared.state.write().await = state;
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::Delta;
    use async_trait::async_trait;
    use futures_util::stream;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// One scripted `connect` outcome.
    enum Session {
        Refused,
        /// Yield these items, then stay open
        Open(Vec<Result<SseEvent, TransportError>>),
        /// Yield these items, then end the stream
        Ends(Vec<Result<SseEvent, TransportError>>),
    }

    #[derive(Clone, Default)]
    struct ScriptedSource {
        script: Arc<Mutex<VecDeque<Session>>>,
        connects: Arc<AtomicUsize>,
        endpoints: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedSource {
        fn new(sessions: Vec<Session>) -> Self {
            Self {
                script: Arc::new(Mutex::new(sessions.into())),
                ..Self::default()
            }
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn connect(&self, endpoint: &str) -> Result<EventStream, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.endpoints.lock().push(endpoint.to_string());
            let next = self.script.lock().pop_front();
            match next {
                Some(Session::Refused) => Err(TransportError::Connect("refused".into())),
                Some(Session::Open(items)) => Ok(stream::iter(items).chain(stream::pending()).boxed()),
                Some(Session::Ends(items)) => Ok(stream::iter(items).boxed()),
                None => Ok(stream::pending().boxed()),
            }
        }
    }

    fn message(value: serde_json::Value) -> Result<SseEvent, TransportError> {
        Ok(SseEvent::message(value.to_string()))
    }

    fn config(delay_ms: u64) -> SyncConfig {
        SyncConfig {
            reconnect_delay: Duration::from_millis(delay_ms),
            ..SyncConfig::new("http://feed.test/events")
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        time::timeout(Duration::from_secs(5), async {
            while !check() {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_timer_single_deadline() {
        let mut timer = ReconnectTimer::default();
        let now = Instant::now();

        assert!(!timer.schedule(now + Duration::from_secs(5)));
        assert!(timer.schedule(now + Duration::from_secs(1)));
        assert_eq!(timer.deadline(), Some(now + Duration::from_secs(1)));

        timer.cancel();
        assert!(!timer.is_scheduled());
    }

    #[test]
    fn test_missing_endpoint_never_connects() {
        let source = ScriptedSource::default();
        let result = ConnectionManager::new(
            SyncConfig::default(),
            source.clone(),
            Replica::new(),
            ListenerRegistry::new(),
        );

        assert!(matches!(result, Err(ConfigError::MissingEndpoint)));
        assert_eq!(source.connects(), 0);
    }

    #[test]
    fn test_http_rejects_invalid_endpoint() {
        let result = ConnectionManager::http(
            SyncConfig::new("feed.test/events"),
            Replica::new(),
            ListenerRegistry::new(),
        );
        assert!(matches!(
            result,
            Err(SyncError::Config(ConfigError::InvalidEndpoint { .. }))
        ));
    }

    #[tokio::test]
    async fn test_negotiated_endpoint_used() {
        let source = ScriptedSource::new(vec![]);
        let manager =
            ConnectionManager::new(config(10), source.clone(), Replica::new(), ListenerRegistry::new())
                .unwrap();
        let handle = manager.handle();
        let task = tokio::spawn(manager.run());

        eventually(|| source.connects() == 1).await;
        handle.shutdown();
        task.await.unwrap();

        assert_eq!(
            source.endpoints.lock()[0],
            "http://feed.test/events?accept-b64-gzip=true&accept-sse-chunks=true"
        );
    }

    #[tokio::test]
    async fn test_reconnect_resets_replica() {
        let source = ScriptedSource::new(vec![
            Session::Open(vec![
                message(json!({"A": {"1": {"a": 1}}})),
                Err(TransportError::Stream("connection reset".into())),
            ]),
            Session::Open(vec![message(json!({"B": {"1": {"b": 2}}}))]),
        ]);
        let replica = Replica::new();
        let manager =
            ConnectionManager::new(config(10), source.clone(), replica.clone(), ListenerRegistry::new())
                .unwrap();
        let handle = manager.handle();
        let task = tokio::spawn(manager.run());

        eventually(|| handle.sessions() == 2 && replica.collection("B").is_some()).await;

        assert_eq!(replica.snapshot(), json!({"B": {"1": {"b": 2}}}));
        assert_eq!(handle.state().await, ConnectionState::Open);

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(handle.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stream_end_reconnects() {
        let source = ScriptedSource::new(vec![
            Session::Ends(vec![message(json!({"A": {}}))]),
            Session::Open(vec![]),
        ]);
        let manager =
            ConnectionManager::new(config(10), source.clone(), Replica::new(), ListenerRegistry::new())
                .unwrap();
        let handle = manager.handle();
        let task = tokio::spawn(manager.run());

        eventually(|| handle.sessions() == 2).await;

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(source.connects(), 2);
    }

    #[tokio::test]
    async fn test_connect_failures_retry() {
        let source = ScriptedSource::new(vec![Session::Refused, Session::Refused]);
        let manager =
            ConnectionManager::new(config(10), source.clone(), Replica::new(), ListenerRegistry::new())
                .unwrap();
        let handle = manager.handle();
        let task = tokio::spawn(manager.run());

        eventually(|| handle.sessions() == 1).await;

        assert_eq!(source.connects(), 3);
        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff() {
        let source = ScriptedSource::new(vec![Session::Refused]);
        let manager = ConnectionManager::new(
            config(3_600_000),
            source.clone(),
            Replica::new(),
            ListenerRegistry::new(),
        )
        .unwrap();
        let handle = manager.handle();
        let task = tokio::spawn(manager.run());

        eventually(|| source.connects() == 1).await;
        handle.shutdown();

        time::timeout(Duration::from_secs(5), task)
            .await
            .expect("run did not stop")
            .unwrap();
        assert!(handle.is_shutdown());
        assert_eq!(handle.sessions(), 0);
    }

    #[tokio::test]
    async fn test_bad_message_does_not_drop_session() {
        let source = ScriptedSource::new(vec![Session::Open(vec![
            Ok(SseEvent::message("BASE64/GZIP:not-base64!")),
            Ok(SseEvent::message("[1, 2]")),
            message(json!({"C": {"1": {}}})),
        ])]);
        let replica = Replica::new();
        let listeners = ListenerRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        listeners.register("counter", move |_: &Delta, _: &Replica| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let manager =
            ConnectionManager::new(config(10), source.clone(), replica.clone(), listeners).unwrap();
        let handle = manager.handle();
        let task = tokio::spawn(manager.run());

        eventually(|| seen.load(Ordering::SeqCst) == 1).await;

        assert_eq!(replica.snapshot(), json!({"C": {"1": {}}}));
        assert_eq!(source.connects(), 1);
        handle.shutdown();
        task.await.unwrap();
    }
}
