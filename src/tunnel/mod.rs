//! Tunnel Engine Adapter
//!
//! Owns the single optional tunnel session and drives it through
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`, with `Failed`
//! reachable from `Starting` and `Running` and left again by `start` or `stop`.
//!
//! The session sits behind one async mutex which is only held while a
//! transition is applied or the engine is launched, never while waiting for
//! readiness or teardown. Every transition
//! publishes an immutable [`StatusSnapshot`] so status reads never observe a
//! half-applied transition.
//!
//! A handle dropped by a failed start or a crash is shut down in the
//! background. Until that shutdown ends (or the teardown timeout passes)
//! `start` does not launch a new engine and `stop` does not report `Stopped`.

use crate::config::EngineConfig;
use crate::error::{Result, VpnError};
use crate::protocol::OutboundConfig;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, MutexGuard, Notify};

pub mod process;

pub use process::ProcessEngine;

/// Lifecycle events reported by the engine, possibly from any thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Ready,
    Error(String),
    Stopped,
    Crashed(String),
}

/// Sender half handed to the engine at launch
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Deliver an event; events for a session nobody listens to are dropped
    pub fn emit(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            debug!("Engine event dropped, session no longer listening");
        }
    }

    pub fn ready(&self) {
        self.emit(EngineEvent::Ready);
    }

    pub fn error(&self, reason: impl Into<String>) {
        self.emit(EngineEvent::Error(reason.into()));
    }

    pub fn stopped(&self) {
        self.emit(EngineEvent::Stopped);
    }

    pub fn crashed(&self, reason: impl Into<String>) {
        self.emit(EngineEvent::Crashed(reason.into()));
    }
}

/// A running engine instance
pub trait EngineHandle: Send + 'static {
    /// Stop the instance; may block, callers bound it with a timeout
    fn shutdown(&mut self) -> Result<()>;
}

/// The underlying tunneling engine
pub trait Engine: Send + Sync {
    /// Hand a validated outbound to the engine without waiting for readiness.
    /// Readiness and failures are reported through `events`.
    fn launch(&self, config: &OutboundConfig, events: EventSink) -> Result<Box<dyn EngineHandle>>;
}

/// Tunnel session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl TunnelState {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelState::Stopped => "stopped",
            TunnelState::Starting => "starting",
            TunnelState::Running => "running",
            TunnelState::Stopping => "stopping",
            TunnelState::Failed => "failed",
        }
    }
}

/// Point-in-time view of the session
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: TunnelState,
    /// Active outbound; absent only when stopped
    pub config: Option<OutboundConfig>,
    /// Diagnostic message (failure reason, forced teardown note)
    pub message: Option<String>,
    /// Set when the probe could not read the live session in time
    pub stale: bool,
    pub captured_at: DateTime<Utc>,
}

/// Timeouts bounding every blocking adapter operation
#[derive(Debug, Clone, Copy)]
pub struct AdapterTimeouts {
    pub startup: Duration,
    pub teardown: Duration,
    pub status_probe: Duration,
}

impl From<&EngineConfig> for AdapterTimeouts {
    fn from(config: &EngineConfig) -> Self {
        Self {
            startup: config.startup_timeout(),
            teardown: config.teardown_timeout(),
            status_probe: config.status_probe(),
        }
    }
}

impl Default for AdapterTimeouts {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

struct Session {
    state: TunnelState,
    config: Option<OutboundConfig>,
    handle: Option<Box<dyn EngineHandle>>,
    message: Option<String>,
    /// Bumped on every start; events from older starts are ignored
    generation: u64,
    cancel: Option<Arc<Notify>>,
    draining: Option<Draining>,
}

/// Background shutdown of a handle released outside `stop`
struct Draining {
    generation: u64,
    done: watch::Receiver<bool>,
}

impl Draining {
    fn is_done(&self) -> bool {
        *self.done.borrow()
    }
}

impl Session {
    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state,
            config: self.config.clone(),
            message: self.message.clone(),
            stale: false,
            captured_at: Utc::now(),
        }
    }

    fn owns(&self, generation: u64, state: TunnelState) -> bool {
        self.generation == generation && self.state == state
    }

    /// Record that the handle of the current session is being shut down
    fn begin_drain(&mut self) -> watch::Sender<bool> {
        let (done_tx, done_rx) = watch::channel(false);
        self.draining = Some(Draining {
            generation: self.generation,
            done: done_rx,
        });
        done_tx
    }
}

struct Shared {
    session: Mutex<Session>,
    published: RwLock<Arc<StatusSnapshot>>,
    timeouts: AdapterTimeouts,
}

impl Shared {
    fn publish(&self, session: &Session) {
        let snapshot = Arc::new(session.snapshot());
        *self.published.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    fn last_published(&self) -> Arc<StatusSnapshot> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

enum Teardown {
    Clean,
    EngineError(String),
    TimedOut,
}

enum StartOutcome {
    Event(Option<EngineEvent>),
    Cancelled,
    TimedOut,
}

/// Adapter owning one tunnel session over an [`Engine`]
pub struct TunnelAdapter {
    engine: Arc<dyn Engine>,
    shared: Arc<Shared>,
}

impl TunnelAdapter {
    pub fn new(engine: Arc<dyn Engine>, timeouts: AdapterTimeouts) -> Self {
        let session = Session {
            state: TunnelState::Stopped,
            config: None,
            handle: None,
            message: None,
            generation: 0,
            cancel: None,
            draining: None,
        };
        let published = RwLock::new(Arc::new(session.snapshot()));

        Self {
            engine,
            shared: Arc::new(Shared {
                session: Mutex::new(session),
                published,
                timeouts,
            }),
        }
    }

    pub fn timeouts(&self) -> AdapterTimeouts {
        self.shared.timeouts
    }

    /// Start a tunnel for `config` and wait until the engine is ready.
    ///
    /// # Errors
    /// `AlreadyRunning` unless the session is stopped or failed,
    /// `StartTimeout` / `Engine` when the engine does not come up, and
    /// `InvalidTransition` when a concurrent `stop` cancelled this start.
    pub async fn start(&self, config: OutboundConfig) -> Result<()> {
        let (tx, mut events) = mpsc::unbounded_channel();
        let cancel = Arc::new(Notify::new());
        let tag = config.tag().to_string();

        let generation = {
            let mut session = self.settled_session().await;
            if !matches!(session.state, TunnelState::Stopped | TunnelState::Failed) {
                return Err(VpnError::AlreadyRunning);
            }

            // The handle is registered under the lock so a concurrent stop
            // always finds it. Launching writes files and spawns processes,
            // so it runs on the blocking pool.
            let launched = {
                let engine = self.engine.clone();
                let outbound = config.clone();
                let sink = EventSink::new(tx);
                tokio::task::spawn_blocking(move || engine.launch(&outbound, sink))
                    .await
                    .unwrap_or_else(|e| Err(VpnError::Engine(format!("engine launch aborted: {e}"))))
            };
            let handle = match launched {
                Ok(handle) => handle,
                Err(e) => {
                    error!("Engine refused outbound '{tag}': {e}");
                    session.state = TunnelState::Failed;
                    session.config = Some(config);
                    session.message = Some(e.to_string());
                    self.shared.publish(&session);
                    return Err(e);
                }
            };

            session.generation += 1;
            session.state = TunnelState::Starting;
            session.config = Some(config);
            session.handle = Some(handle);
            session.message = None;
            session.cancel = Some(cancel.clone());
            self.shared.publish(&session);
            session.generation
        };
        info!("Starting tunnel '{tag}' (session {generation})");

        let startup = self.shared.timeouts.startup;
        let outcome = tokio::select! {
            event = events.recv() => StartOutcome::Event(event),
            _ = cancel.notified() => StartOutcome::Cancelled,
            _ = tokio::time::sleep(startup) => StartOutcome::TimedOut,
        };

        let mut session = self.shared.session.lock().await;
        if !session.owns(generation, TunnelState::Starting) {
            return Err(VpnError::InvalidTransition(format!(
                "start of '{tag}' was cancelled by a concurrent stop"
            )));
        }

        let failure = match outcome {
            StartOutcome::Event(Some(EngineEvent::Ready)) => {
                session.state = TunnelState::Running;
                session.cancel = None;
                self.shared.publish(&session);
                drop(session);

                info!("Tunnel '{tag}' is running");
                tokio::spawn(monitor(self.shared.clone(), generation, events));
                return Ok(());
            }
            StartOutcome::Event(Some(EngineEvent::Error(reason)))
            | StartOutcome::Event(Some(EngineEvent::Crashed(reason))) => VpnError::Engine(reason),
            StartOutcome::Event(Some(EngineEvent::Stopped)) | StartOutcome::Event(None) => {
                VpnError::Engine("engine exited before becoming ready".to_string())
            }
            StartOutcome::TimedOut => VpnError::StartTimeout(startup),
            StartOutcome::Cancelled => {
                return Err(VpnError::InvalidTransition(format!(
                    "start of '{tag}' was cancelled by a concurrent stop"
                )))
            }
        };

        error!("Tunnel '{tag}' failed to start: {failure}");
        session.state = TunnelState::Failed;
        session.message = Some(failure.to_string());
        session.cancel = None;
        let handle = session.handle.take();
        let drained = handle.as_ref().map(|_| session.begin_drain());
        self.shared.publish(&session);
        drop(session);

        if let (Some(handle), Some(drained)) = (handle, drained) {
            release(handle, self.shared.timeouts.teardown).await;
            let _ = drained.send(true);
        }
        Err(failure)
    }

    /// Stop the session, releasing the engine handle.
    ///
    /// Idempotent on a stopped session. Teardown is bounded by the teardown
    /// timeout; past it the session is forced to `Stopped` and the handle is
    /// abandoned.
    pub async fn stop(&self) -> Result<()> {
        let handle = {
            let mut session = self.settled_session().await;
            match session.state {
                TunnelState::Stopped => return Ok(()),
                TunnelState::Stopping => {
                    return Err(VpnError::InvalidTransition(
                        "a stop is already in progress".to_string(),
                    ))
                }
                _ => {}
            }

            info!("Stopping tunnel from state {}", session.state.as_str());
            session.state = TunnelState::Stopping;
            if let Some(cancel) = session.cancel.take() {
                cancel.notify_one();
            }
            self.shared.publish(&session);
            session.handle.take()
        };

        let teardown = match handle {
            Some(handle) => release(handle, self.shared.timeouts.teardown).await,
            None => Teardown::Clean,
        };

        let mut session = self.shared.session.lock().await;
        session.state = TunnelState::Stopped;
        session.config = None;
        session.message = match teardown {
            Teardown::Clean => None,
            Teardown::EngineError(reason) => Some(format!("engine teardown error: {reason}")),
            Teardown::TimedOut => Some(format!(
                "teardown exceeded {:?}; session forced to stopped",
                self.shared.timeouts.teardown
            )),
        };
        self.shared.publish(&session);
        info!("Tunnel stopped");
        Ok(())
    }

    /// Read the session state, waiting at most the probe budget.
    ///
    /// Falls back to the last published snapshot marked `stale` when a
    /// transition holds the session for longer than the probe.
    pub async fn status(&self) -> StatusSnapshot {
        match tokio::time::timeout(self.shared.timeouts.status_probe, self.shared.session.lock())
            .await
        {
            Ok(session) => session.snapshot(),
            Err(_) => {
                debug!("Status probe timed out, serving last published snapshot");
                StatusSnapshot {
                    stale: true,
                    ..(*self.shared.last_published()).clone()
                }
            }
        }
    }

    /// Last snapshot published by a transition, without touching the session
    pub fn last_snapshot(&self) -> Arc<StatusSnapshot> {
        self.shared.last_published()
    }

    /// Lock the session once no released handle is still shutting down
    async fn settled_session(&self) -> MutexGuard<'_, Session> {
        loop {
            let mut session = self.shared.session.lock().await;
            let (generation, mut done) = match &session.draining {
                Some(draining) if !draining.is_done() => {
                    (draining.generation, draining.done.clone())
                }
                _ => {
                    session.draining = None;
                    return session;
                }
            };
            drop(session);

            let limit = self.shared.timeouts.teardown;
            debug!("Waiting for the engine of session {generation} to shut down");
            let finished = async {
                loop {
                    let drained = *done.borrow_and_update();
                    if drained || done.changed().await.is_err() {
                        break;
                    }
                }
            };
            let timed_out = tokio::time::timeout(limit, finished).await.is_err();
            if timed_out {
                error!("Engine of session {generation} still shutting down after {limit:?}, abandoning it");
            }

            let mut session = self.shared.session.lock().await;
            if session
                .draining
                .as_ref()
                .is_some_and(|draining| draining.generation == generation)
            {
                session.draining = None;
            }
        }
    }
}

/// Watch a running session for asynchronous engine failure
async fn monitor(
    shared: Arc<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) {
    let reason = loop {
        match events.recv().await {
            Some(EngineEvent::Ready) => continue,
            Some(EngineEvent::Error(reason)) | Some(EngineEvent::Crashed(reason)) => break reason,
            Some(EngineEvent::Stopped) => break "engine exited unexpectedly".to_string(),
            None => break "engine event channel closed".to_string(),
        }
    };

    let (handle, drained) = {
        let mut session = shared.session.lock().await;
        if !session.owns(generation, TunnelState::Running) {
            debug!("Ignoring engine event for session {generation}: {reason}");
            return;
        }
        error!("Engine crashed while running: {reason}");
        session.state = TunnelState::Failed;
        session.message = Some(reason);
        let handle = session.handle.take();
        let drained = handle.as_ref().map(|_| session.begin_drain());
        shared.publish(&session);
        (handle, drained)
    };

    if let (Some(handle), Some(drained)) = (handle, drained) {
        release(handle, shared.timeouts.teardown).await;
        let _ = drained.send(true);
    }
}

/// Shut a handle down on its own thread, waiting at most `limit`
async fn release(handle: Box<dyn EngineHandle>, limit: Duration) -> Teardown {
    let (done_tx, done_rx) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name("rbox-teardown".to_string())
        .spawn(move || {
            let mut handle = handle;
            let _ = done_tx.send(handle.shutdown());
        });
    if let Err(e) = spawned {
        error!("Could not spawn teardown thread, engine handle leaked: {e}");
        return Teardown::EngineError(e.to_string());
    }

    match tokio::time::timeout(limit, done_rx).await {
        Ok(Ok(Ok(()))) => Teardown::Clean,
        Ok(Ok(Err(e))) => {
            warn!("Engine reported an error during teardown, handle released anyway: {e}");
            Teardown::EngineError(e.to_string())
        }
        Ok(Err(_)) => {
            warn!("Teardown thread ended without reporting, handle released");
            Teardown::EngineError("teardown aborted".to_string())
        }
        Err(_) => {
            error!("Inconsistent engine state: teardown exceeded {limit:?}, discarding stale handle");
            Teardown::TimedOut
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::builder::{self, ShadowsocksParams};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Clone)]
    enum Script {
        ReadyAfter(Duration),
        ErrorAfter(Duration, &'static str),
        Silent,
        RefuseLaunch,
    }

    struct ScriptedEngine {
        script: std::sync::Mutex<Script>,
        shutdown_delay: Duration,
        launches: AtomicUsize,
        alive: Arc<AtomicUsize>,
        max_alive: Arc<AtomicUsize>,
        last_sink: std::sync::Mutex<Option<EventSink>>,
    }

    impl ScriptedEngine {
        fn new(script: Script) -> Arc<Self> {
            Self::with_shutdown_delay(script, Duration::ZERO)
        }

        fn with_shutdown_delay(script: Script, shutdown_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script),
                shutdown_delay,
                launches: AtomicUsize::new(0),
                alive: Arc::new(AtomicUsize::new(0)),
                max_alive: Arc::new(AtomicUsize::new(0)),
                last_sink: std::sync::Mutex::new(None),
            })
        }

        fn set_script(&self, script: Script) {
            *self.script.lock().unwrap() = script;
        }

        fn alive(&self) -> usize {
            self.alive.load(Ordering::SeqCst)
        }
    }

    struct ScriptedHandle {
        alive: Arc<AtomicUsize>,
        shutdown_delay: Duration,
        sink: EventSink,
    }

    impl EngineHandle for ScriptedHandle {
        fn shutdown(&mut self) -> Result<()> {
            std::thread::sleep(self.shutdown_delay);
            self.alive.fetch_sub(1, Ordering::SeqCst);
            self.sink.stopped();
            Ok(())
        }
    }

    impl Engine for ScriptedEngine {
        fn launch(
            &self,
            _config: &OutboundConfig,
            events: EventSink,
        ) -> Result<Box<dyn EngineHandle>> {
            let script = self.script.lock().unwrap().clone();
            if let Script::RefuseLaunch = script {
                return Err(VpnError::Engine("binary missing".to_string()));
            }

            self.launches.fetch_add(1, Ordering::SeqCst);
            let now_alive = self.alive.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_alive.fetch_max(now_alive, Ordering::SeqCst);
            *self.last_sink.lock().unwrap() = Some(events.clone());

            let sink = events.clone();
            match script {
                Script::ReadyAfter(delay) => {
                    std::thread::spawn(move || {
                        std::thread::sleep(delay);
                        sink.ready();
                    });
                }
                Script::ErrorAfter(delay, reason) => {
                    std::thread::spawn(move || {
                        std::thread::sleep(delay);
                        sink.error(reason);
                    });
                }
                Script::Silent | Script::RefuseLaunch => {}
            }

            Ok(Box::new(ScriptedHandle {
                alive: self.alive.clone(),
                shutdown_delay: self.shutdown_delay,
                sink: events,
            }))
        }
    }

    fn timeouts() -> AdapterTimeouts {
        AdapterTimeouts {
            startup: Duration::from_millis(500),
            teardown: Duration::from_millis(200),
            status_probe: Duration::from_millis(20),
        }
    }

    fn outbound(tag: &str) -> OutboundConfig {
        builder::shadowsocks(&ShadowsocksParams {
            server: "1.2.3.4",
            port: "8388",
            method: "aes-256-gcm",
            password: "pw",
            tag,
        })
        .unwrap()
    }

    fn adapter(engine: &Arc<ScriptedEngine>) -> Arc<TunnelAdapter> {
        Arc::new(TunnelAdapter::new(engine.clone(), timeouts()))
    }

    fn assert_consistent(snapshot: &StatusSnapshot) {
        assert_eq!(
            snapshot.state == TunnelState::Stopped,
            snapshot.config.is_none(),
            "inconsistent snapshot: {snapshot:?}"
        );
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let engine = ScriptedEngine::new(Script::ReadyAfter(Duration::from_millis(10)));
        let adapter = adapter(&engine);

        adapter.start(outbound("node1")).await.unwrap();
        let status = adapter.status().await;
        assert_eq!(status.state, TunnelState::Running);
        assert_eq!(status.config.as_ref().map(OutboundConfig::tag), Some("node1"));
        assert!(!status.stale);

        adapter.stop().await.unwrap();
        let status = adapter.status().await;
        assert_eq!(status.state, TunnelState::Stopped);
        assert!(status.config.is_none());
        assert!(status.message.is_none());
        assert_eq!(engine.alive(), 0);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_idempotent() {
        let engine = ScriptedEngine::new(Script::Silent);
        let adapter = adapter(&engine);

        adapter.stop().await.unwrap();
        adapter.stop().await.unwrap();
        assert_eq!(adapter.status().await.state, TunnelState::Stopped);
        assert_eq!(engine.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_starts_yield_one_session() {
        let engine = ScriptedEngine::new(Script::ReadyAfter(Duration::from_millis(20)));
        let adapter = adapter(&engine);

        let (a, b) = tokio::join!(
            adapter.start(outbound("first")),
            adapter.start(outbound("second"))
        );

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(VpnError::AlreadyRunning)))
                .count(),
            1
        );
        assert_eq!(adapter.status().await.state, TunnelState::Running);
        assert_eq!(engine.launches.load(Ordering::SeqCst), 1);

        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_while_running_is_rejected() {
        let engine = ScriptedEngine::new(Script::ReadyAfter(Duration::ZERO));
        let adapter = adapter(&engine);

        adapter.start(outbound("a")).await.unwrap();
        let err = adapter.start(outbound("b")).await.unwrap_err();
        assert!(matches!(err, VpnError::AlreadyRunning));
        assert_eq!(
            adapter.status().await.config.as_ref().map(OutboundConfig::tag),
            Some("a")
        );
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_timeout_forces_stopped() {
        let engine = ScriptedEngine::with_shutdown_delay(
            Script::ReadyAfter(Duration::ZERO),
            Duration::from_secs(2),
        );
        let adapter = adapter(&engine);
        adapter.start(outbound("slow")).await.unwrap();

        let began = Instant::now();
        adapter.stop().await.unwrap();
        let elapsed = began.elapsed();

        assert!(elapsed < timeouts().teardown + Duration::from_millis(300));
        let status = adapter.status().await;
        assert_eq!(status.state, TunnelState::Stopped);
        assert!(status.message.unwrap().contains("forced"));
    }

    #[tokio::test]
    async fn test_startup_timeout_marks_failed() {
        let engine = ScriptedEngine::new(Script::Silent);
        let adapter = adapter(&engine);

        let err = adapter.start(outbound("mute")).await.unwrap_err();
        assert_eq!(err.kind(), "start_timeout");

        let status = adapter.status().await;
        assert_eq!(status.state, TunnelState::Failed);
        assert_consistent(&status);
        assert_eq!(engine.alive(), 0);
    }

    #[tokio::test]
    async fn test_failed_is_recoverable() {
        let engine =
            ScriptedEngine::new(Script::ErrorAfter(Duration::from_millis(5), "bad handshake"));
        let adapter = adapter(&engine);

        let err = adapter.start(outbound("x")).await.unwrap_err();
        assert!(matches!(err, VpnError::Engine(ref r) if r == "bad handshake"));
        assert_eq!(adapter.status().await.state, TunnelState::Failed);

        engine.set_script(Script::ReadyAfter(Duration::ZERO));
        adapter.start(outbound("x")).await.unwrap();
        assert_eq!(adapter.status().await.state, TunnelState::Running);

        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_refusal_fails_session() {
        let engine = ScriptedEngine::new(Script::RefuseLaunch);
        let adapter = adapter(&engine);

        let err = adapter.start(outbound("x")).await.unwrap_err();
        assert_eq!(err.kind(), "engine_error");
        assert_eq!(adapter.status().await.state, TunnelState::Failed);

        adapter.stop().await.unwrap();
        assert_eq!(adapter.status().await.state, TunnelState::Stopped);
    }

    #[tokio::test]
    async fn test_crash_while_running_is_reported() {
        let engine = ScriptedEngine::new(Script::ReadyAfter(Duration::ZERO));
        let adapter = adapter(&engine);
        adapter.start(outbound("fragile")).await.unwrap();

        let sink = engine.last_sink.lock().unwrap().clone().unwrap();
        std::thread::spawn(move || sink.crashed("segfault in engine"));

        let deadline = Instant::now() + Duration::from_secs(1);
        let status = loop {
            let status = adapter.status().await;
            if status.state == TunnelState::Failed || Instant::now() > deadline {
                break status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(status.state, TunnelState::Failed);
        assert_eq!(status.message.as_deref(), Some("segfault in engine"));
        assert_consistent(&status);

        adapter.stop().await.unwrap();
        assert_eq!(engine.alive(), 0);
    }

    async fn wait_for_state(adapter: &TunnelAdapter, state: TunnelState) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while adapter.status().await.state != state {
            assert!(Instant::now() < deadline, "never reached {state:?}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_waits_for_failed_start_teardown() {
        let engine =
            ScriptedEngine::with_shutdown_delay(Script::Silent, Duration::from_millis(150));
        let adapter = adapter(&engine);

        let first = {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.start(outbound("mute")).await })
        };
        wait_for_state(&adapter, TunnelState::Failed).await;

        engine.set_script(Script::ReadyAfter(Duration::ZERO));
        adapter.start(outbound("retry")).await.unwrap();
        assert_eq!(engine.max_alive.load(Ordering::SeqCst), 1);
        assert_eq!(engine.alive(), 1);

        let err = first.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "start_timeout");
        adapter.stop().await.unwrap();
        assert_eq!(engine.alive(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_crashed_engine_is_gone_before_stop_or_restart() {
        let engine = ScriptedEngine::with_shutdown_delay(
            Script::ReadyAfter(Duration::ZERO),
            Duration::from_millis(150),
        );
        let adapter = adapter(&engine);

        adapter.start(outbound("a")).await.unwrap();
        let sink = engine.last_sink.lock().unwrap().clone().unwrap();
        sink.crashed("killed");
        wait_for_state(&adapter, TunnelState::Failed).await;

        adapter.stop().await.unwrap();
        assert_eq!(engine.alive(), 0);
        assert_eq!(adapter.status().await.state, TunnelState::Stopped);

        adapter.start(outbound("b")).await.unwrap();
        let sink = engine.last_sink.lock().unwrap().clone().unwrap();
        sink.crashed("killed again");
        wait_for_state(&adapter, TunnelState::Failed).await;

        adapter.start(outbound("c")).await.unwrap();
        assert_eq!(engine.max_alive.load(Ordering::SeqCst), 1);
        assert_eq!(engine.alive(), 1);
        adapter.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_cancels_inflight_start() {
        let engine = ScriptedEngine::new(Script::ReadyAfter(Duration::from_millis(300)));
        let adapter = adapter(&engine);

        let starting = {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.start(outbound("late")).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        adapter.stop().await.unwrap();
        let result = starting.await.unwrap();
        assert!(matches!(result, Err(VpnError::InvalidTransition(_))));
        assert_eq!(adapter.status().await.state, TunnelState::Stopped);
        assert_eq!(engine.alive(), 0);
        assert_eq!(engine.max_alive.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_during_start_is_never_torn() {
        let engine = ScriptedEngine::new(Script::ReadyAfter(Duration::from_millis(60)));
        let adapter = adapter(&engine);

        let starting = {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.start(outbound("watched")).await })
        };

        let mut seen_running = false;
        for _ in 0..50 {
            let snapshot = adapter.status().await;
            assert_consistent(&snapshot);
            if snapshot.state == TunnelState::Running {
                assert_eq!(snapshot.config.as_ref().unwrap().tag(), "watched");
                seen_running = true;
            }
            tokio::time::sleep(Duration::from_millis(3)).await;
        }

        starting.await.unwrap().unwrap();
        assert!(seen_running || adapter.status().await.state == TunnelState::Running);
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_probe_timeout_returns_stale_snapshot() {
        let engine = ScriptedEngine::new(Script::ReadyAfter(Duration::ZERO));
        let adapter = adapter(&engine);
        adapter.start(outbound("held")).await.unwrap();

        let guard = adapter.shared.session.lock().await;
        let snapshot = adapter.status().await;
        drop(guard);

        assert!(snapshot.stale);
        assert_eq!(snapshot.state, TunnelState::Running);
        assert_eq!(snapshot.config.as_ref().unwrap().tag(), "held");

        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_stop_loses_with_invalid_transition() {
        let engine = ScriptedEngine::with_shutdown_delay(
            Script::ReadyAfter(Duration::ZERO),
            Duration::from_millis(100),
        );
        let adapter = adapter(&engine);
        adapter.start(outbound("x")).await.unwrap();

        let (a, b) = tokio::join!(adapter.stop(), adapter.stop());
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(VpnError::InvalidTransition(_)))));
        assert_eq!(adapter.status().await.state, TunnelState::Stopped);
    }
}
