//! The per-server connection state machine.
//!
//! ```text
//!   Idle ──connect──▶ Connecting ──ok──▶ Connected
//!    ▲                  │   │              │   │
//!    │          failure │   │ disconnect   │   │ drop
//!    │                  ▼   ▼              ▼   ▼
//!    └──────── Disconnected ◀── Disconnecting ◀─ disconnect
//! ```
//!
//! Status, the user-disconnect flag, the reconnect counter and the session
//! handle live in one state struct behind one lock so they always move
//! together. The lock is never held across session I/O or listener calls.
//!
//! Every connect attempt gets a token and every created session a
//! generation. Continuations carry them and are dropped when they no longer
//! match, so a late result from an aborted attempt can't clobber a newer one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::channels::{ChannelListListener, ChannelMembership, join_list};
use crate::config::ServerConfig;
use crate::error::{ConnectionError, is_certificate_rejection};
use crate::history::SentHistory;
use crate::listeners::{ListenerId, Listeners};
use crate::policy::{ReconnectPolicy, reconnect_permitted};
use crate::prefs::{NetworkMonitor, Preferences};
use crate::scheduler::Scheduler;
use crate::session::{MessageSink, MessageSinkProvider, Session, SessionEvent, SessionEvents, SessionFactory, SessionSetup};

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Never connected.
    Idle,
    Connecting,
    Connected,
    /// Tearing down at the user's request.
    Disconnecting,
    Disconnected,
}

impl ConnectionStatus {
    /// Idle or Disconnected: a connect may start from here.
    pub fn is_resting(self) -> bool {
        matches!(self, Self::Idle | Self::Disconnected)
    }

    /// Whether the state machine may move from `self` to `next`.
    ///
    /// Disconnected may be re-entered (a disconnect on a resting
    /// connection); every other edge changes state. Nothing returns to Idle.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Idle | Disconnected, Connecting)
                | (Idle | Disconnected, Disconnected)
                | (Connecting, Connected | Disconnecting | Disconnected)
                | (Connected, Disconnecting | Disconnected)
                | (Disconnecting, Disconnected)
        )
    }
}

/// Notified whenever a connection's status or flags change.
pub trait InfoListener: Send + Sync {
    fn connection_info_changed(&self, connection: &Connection);
}

/// Hooks the owning registry receives from each connection.
pub trait ConnectionObserver: Send + Sync {
    fn info_changed(&self, connection: &Connection);
    fn channels_changed(&self, connection: &Connection, channels: &[String]);
    fn fully_disconnected(&self, connection: &Connection);
}

/// Collaborators a connection needs. Cheap to clone; share one per process.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub sessions: Arc<dyn SessionFactory>,
    pub sinks: Arc<dyn MessageSinkProvider>,
    pub scheduler: Arc<dyn Scheduler>,
    pub policy: Arc<dyn ReconnectPolicy>,
    pub prefs: Arc<dyn Preferences>,
    pub network: Arc<dyn NetworkMonitor>,
    /// Client name and version handed to sessions.
    pub client_version: String,
}

struct ActiveSession {
    handle: Arc<dyn Session>,
    generation: u64,
    /// Its message sink was closed; the session must not be reused.
    released: bool,
}

struct State {
    status: ConnectionStatus,
    user_disconnect: bool,
    /// -1 until the first failure or success.
    reconnect_attempt: i32,
    attempt: u64,
    next_generation: u64,
    session: Option<ActiveSession>,
    sink: Option<Arc<dyn MessageSink>>,
}

impl State {
    fn set_status(&mut self, next: ConnectionStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.status,
            next
        );
        self.status = next;
    }

    fn live_session(&self) -> Option<(Arc<dyn Session>, u64)> {
        self.session
            .as_ref()
            .filter(|s| !s.released)
            .map(|s| (Arc::clone(&s.handle), s.generation))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.generation == generation)
    }

    /// Move to Disconnected and detach the sink for closing.
    fn release(&mut self) -> Option<Arc<dyn MessageSink>> {
        self.set_status(ConnectionStatus::Disconnected);
        if let Some(session) = self.session.as_mut() {
            session.released = true;
        }
        self.sink.take()
    }

    /// Apply a lost link: finalize a pending teardown, or settle and decide
    /// whether to retry.
    fn settle_after_drop(&mut self) -> AfterDrop {
        if self.status == ConnectionStatus::Disconnecting {
            return AfterDrop::Finalize(self.release());
        }
        self.set_status(ConnectionStatus::Disconnected);
        if self.user_disconnect {
            return AfterDrop::Stay;
        }
        let attempt = self.reconnect_attempt.max(0);
        self.reconnect_attempt = attempt + 1;
        AfterDrop::Retry(attempt as u32)
    }
}

enum AfterDrop {
    Finalize(Option<Arc<dyn MessageSink>>),
    Stay,
    Retry(u32),
}

enum Teardown {
    Abort(Arc<dyn Session>, u64),
    Quit(Arc<dyn Session>, u64),
    InProgress,
    Finished(Option<Arc<dyn MessageSink>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectTrigger {
    Caller,
    ReconnectTimer,
}

/// One configured server and everything known about its link.
pub struct Connection {
    config: ServerConfig,
    me: Weak<Connection>,
    state: Mutex<State>,
    channels: ChannelMembership,
    history: Mutex<SentHistory>,
    expanded_in_drawer: AtomicBool,
    info_listeners: Listeners<dyn InfoListener>,
    observer: Option<Weak<dyn ConnectionObserver>>,
    deps: ConnectionDeps,
}

impl Connection {
    /// A standalone connection with no registry attached.
    pub fn new(config: ServerConfig, initial_channels: Vec<String>, deps: ConnectionDeps) -> Arc<Self> {
        Self::build(config, initial_channels, deps, None)
    }

    pub(crate) fn with_observer(
        config: ServerConfig,
        initial_channels: Vec<String>,
        deps: ConnectionDeps,
        observer: Weak<dyn ConnectionObserver>,
    ) -> Arc<Self> {
        Self::build(config, initial_channels, deps, Some(observer))
    }

    fn build(
        config: ServerConfig,
        initial_channels: Vec<String>,
        deps: ConnectionDeps,
        observer: Option<Weak<dyn ConnectionObserver>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            me: me.clone(),
            state: Mutex::new(State {
                status: ConnectionStatus::Idle,
                user_disconnect: false,
                reconnect_attempt: -1,
                attempt: 0,
                next_generation: 0,
                session: None,
                sink: None,
            }),
            channels: ChannelMembership::new(initial_channels),
            history: Mutex::new(SentHistory::default()),
            expanded_in_drawer: AtomicBool::new(true),
            info_listeners: Listeners::new(),
            observer,
            deps,
        })
    }

    // ── Lifecycle ──

    /// Start connecting. Returns immediately; the outcome shows up as status
    /// changes.
    ///
    /// No-op while already connected or connecting. Calling this while a
    /// disconnect is still in progress is a caller bug and fails with
    /// [`ConnectionError::DisconnectInProgress`].
    pub fn connect(&self) -> Result<(), ConnectionError> {
        self.begin_connect(ConnectTrigger::Caller)
    }

    fn begin_connect(&self, trigger: ConnectTrigger) -> Result<(), ConnectionError> {
        let (attempt, reusable) = {
            let mut state = self.state.lock();
            let status = state.status;
            match status {
                ConnectionStatus::Disconnecting => return Err(ConnectionError::DisconnectInProgress(self.id())),
                ConnectionStatus::Connected | ConnectionStatus::Connecting => return Ok(()),
                ConnectionStatus::Idle | ConnectionStatus::Disconnected => {}
            }
            if trigger == ConnectTrigger::ReconnectTimer && state.user_disconnect {
                tracing::debug!(connection = %self.id(), "Reconnect skipped, user disconnected");
                return Ok(());
            }
            state.set_status(ConnectionStatus::Connecting);
            state.user_disconnect = false;
            state.attempt += 1;
            let reusable = state
                .live_session()
                .filter(|(session, _)| session.kind() == self.deps.sessions.kind())
                .map(|(session, _)| session);
            (state.attempt, reusable)
        };
        self.notify_info_changed();
        tracing::info!(connection = %self.id(), server = %self.config.address, "Connecting...");

        let session = match reusable {
            Some(session) => session,
            None => match self.open_session(attempt) {
                Ok(Some(session)) => session,
                Ok(None) => return Ok(()),
                Err(e) => {
                    tracing::warn!(connection = %self.id(), error = %e, "Failed to create session");
                    self.connect_failed(attempt, e);
                    return Ok(());
                }
            },
        };

        let rejoin = self.channels.get();
        let me = self.me.clone();
        self.deps.scheduler.spawn(Box::pin(async move {
            let result = session.connect().await;
            let Some(this) = me.upgrade() else { return };
            match result {
                Ok(()) => this.connect_succeeded(attempt, session, rejoin),
                Err(e) => this.connect_failed(attempt, e),
            }
        }));
        Ok(())
    }

    /// Create a fresh session with its own message sink and event pump.
    ///
    /// Returns `Ok(None)` if the attempt was cancelled while the session was
    /// being built.
    fn open_session(&self, attempt: u64) -> anyhow::Result<Option<Arc<dyn Session>>> {
        let sink = match self.deps.sinks.open(self.id()) {
            Ok(sink) => Some(sink),
            Err(e) => {
                tracing::warn!(connection = %self.id(), error = %e, "Message log unavailable");
                None
            }
        };
        let setup = SessionSetup {
            connection_id: self.id(),
            server: self.config.clone(),
            sink: sink.clone(),
            client_version: self.deps.client_version.clone(),
        };
        let (session, events) = match self.deps.sessions.create(setup) {
            Ok(created) => created,
            Err(e) => {
                if let Some(sink) = sink {
                    sink.close();
                }
                return Err(e);
            }
        };

        let installed = {
            let mut state = self.state.lock();
            if state.attempt == attempt && state.status == ConnectionStatus::Connecting {
                state.next_generation += 1;
                let generation = state.next_generation;
                let stale_sink = std::mem::replace(&mut state.sink, sink);
                state.session = Some(ActiveSession {
                    handle: Arc::clone(&session),
                    generation,
                    released: false,
                });
                Ok((generation, stale_sink))
            } else {
                Err(sink)
            }
        };
        match installed {
            Ok((generation, stale_sink)) => {
                if let Some(stale) = stale_sink {
                    stale.close();
                }
                self.spawn_event_pump(generation, events);
                Ok(Some(session))
            }
            Err(unused_sink) => {
                tracing::debug!(connection = %self.id(), "Connect cancelled before session was installed");
                if let Some(sink) = unused_sink {
                    sink.close();
                }
                Ok(None)
            }
        }
    }

    fn connect_succeeded(&self, attempt: u64, session: Arc<dyn Session>, rejoin: Vec<String>) {
        let accepted = {
            let mut state = self.state.lock();
            if state.attempt == attempt && state.status == ConnectionStatus::Connecting {
                state.set_status(ConnectionStatus::Connected);
                state.reconnect_attempt = 0;
                Ok(())
            } else {
                Err(state.status)
            }
        };
        if let Err(status) = accepted {
            tracing::debug!(connection = %self.id(), ?status, "Discarding stale connect completion");
            if status != ConnectionStatus::Disconnecting {
                // Nobody else owns this link any more.
                self.deps.scheduler.spawn(Box::pin(async move {
                    session.disconnect(true).await;
                }));
            }
            return;
        }
        tracing::info!(connection = %self.id(), "Connected");
        self.notify_info_changed();

        let channels = join_list(&self.config.autojoin, &rejoin, self.config.rejoin_channels);
        if channels.is_empty() {
            return;
        }
        let id = self.id();
        self.deps.scheduler.spawn(Box::pin(async move {
            if let Err(e) = session.join_channels(channels).await {
                tracing::warn!(connection = %id, error = %e, "Failed to request channel joins");
            }
        }));
    }

    fn connect_failed(&self, attempt: u64, error: anyhow::Error) {
        let next = {
            let mut state = self.state.lock();
            if state.attempt != attempt {
                tracing::debug!(connection = %self.id(), error = %error, "Discarding stale connect failure");
                return;
            }
            let status = state.status;
            match status {
                ConnectionStatus::Connecting | ConnectionStatus::Disconnecting => {}
                _ => {
                    tracing::debug!(connection = %self.id(), error = %error, "Connect failure after teardown ignored");
                    return;
                }
            }
            if is_certificate_rejection(&error) {
                tracing::debug!(connection = %self.id(), "User rejected the certificate");
                state.user_disconnect = true;
            }
            state.settle_after_drop()
        };
        tracing::warn!(connection = %self.id(), error = %error, "Connect failed");
        self.apply_after_drop(next);
    }

    /// Disconnect at the user's request. Suppresses auto-reconnect until the
    /// next explicit [`connect`](Self::connect).
    pub fn disconnect(&self) {
        let teardown = {
            let mut state = self.state.lock();
            state.user_disconnect = true;
            let status = state.status;
            match status {
                ConnectionStatus::Connecting => {
                    state.set_status(ConnectionStatus::Disconnecting);
                    match state.live_session() {
                        Some((session, generation)) => Teardown::Abort(session, generation),
                        None => Teardown::Finished(state.release()),
                    }
                }
                ConnectionStatus::Connected => {
                    state.set_status(ConnectionStatus::Disconnecting);
                    match state.live_session() {
                        Some((session, generation)) => Teardown::Quit(session, generation),
                        None => Teardown::Finished(state.release()),
                    }
                }
                ConnectionStatus::Disconnecting => Teardown::InProgress,
                ConnectionStatus::Idle | ConnectionStatus::Disconnected => Teardown::Finished(state.release()),
            }
        };

        let me = self.me.clone();
        match teardown {
            Teardown::Abort(session, generation) => {
                tracing::info!(connection = %self.id(), "Aborting connect");
                self.notify_info_changed();
                self.deps.scheduler.spawn(Box::pin(async move {
                    session.disconnect(true).await;
                    if let Some(this) = me.upgrade() {
                        this.finish_teardown(generation);
                    }
                }));
            }
            Teardown::Quit(session, generation) => {
                tracing::info!(connection = %self.id(), "Disconnecting");
                self.notify_info_changed();
                let message = self.deps.prefs.quit_message();
                let id = self.id();
                self.deps.scheduler.spawn(Box::pin(async move {
                    if let Err(e) = session.quit(message).await {
                        tracing::debug!(connection = %id, error = %e, "Quit failed, closing anyway");
                    }
                    session.disconnect(true).await;
                    if let Some(this) = me.upgrade() {
                        this.finish_teardown(generation);
                    }
                }));
            }
            Teardown::InProgress => {
                tracing::debug!(connection = %self.id(), "Disconnect already in progress");
            }
            Teardown::Finished(sink) => self.complete_finalize(sink),
        }
    }

    /// The session was closed on our request.
    fn finish_teardown(&self, generation: u64) {
        let sink = {
            let mut state = self.state.lock();
            if state.status != ConnectionStatus::Disconnecting || !state.is_current(generation) {
                return;
            }
            state.release()
        };
        self.complete_finalize(sink);
    }

    fn session_dropped(&self, generation: u64, reason: String) {
        let next = {
            let mut state = self.state.lock();
            if !state.is_current(generation) {
                return;
            }
            let status = state.status;
            match status {
                ConnectionStatus::Connected | ConnectionStatus::Disconnecting => state.settle_after_drop(),
                status => {
                    tracing::debug!(connection = %self.id(), ?status, "Ignoring drop outside an established link");
                    return;
                }
            }
        };
        tracing::info!(connection = %self.id(), %reason, "Connection lost");
        self.apply_after_drop(next);
    }

    fn apply_after_drop(&self, next: AfterDrop) {
        match next {
            AfterDrop::Finalize(sink) => self.complete_finalize(sink),
            AfterDrop::Stay => self.notify_info_changed(),
            AfterDrop::Retry(attempt) => {
                self.notify_info_changed();
                self.schedule_reconnect(attempt);
            }
        }
    }

    fn schedule_reconnect(&self, attempt: u32) {
        let Some(delay) = self.deps.policy.next_delay(attempt) else {
            tracing::info!(connection = %self.id(), attempt, "Not reconnecting");
            return;
        };
        tracing::info!(
            connection = %self.id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Queuing reconnect"
        );
        let me = self.me.clone();
        self.deps.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(this) = me.upgrade() {
                    this.reconnect_timer_fired();
                }
            }),
        );
    }

    fn reconnect_timer_fired(&self) {
        if !reconnect_permitted(self.deps.prefs.as_ref(), self.deps.network.as_ref()) {
            tracing::info!(connection = %self.id(), "Reconnect no longer permitted");
            return;
        }
        if let Err(e) = self.begin_connect(ConnectTrigger::ReconnectTimer) {
            tracing::warn!(connection = %self.id(), error = %e, "Reconnect skipped");
        }
    }

    fn complete_finalize(&self, sink: Option<Arc<dyn MessageSink>>) {
        if let Some(sink) = sink {
            sink.close();
        }
        tracing::info!(connection = %self.id(), "Fully disconnected");
        self.notify_info_changed();
        if let Some(observer) = self.observer() {
            observer.fully_disconnected(self);
        }
    }

    fn spawn_event_pump(&self, generation: u64, mut events: SessionEvents) {
        let me = self.me.clone();
        self.deps.scheduler.spawn(Box::pin(async move {
            while let Some(event) = events.recv().await {
                let Some(this) = me.upgrade() else { break };
                this.handle_session_event(generation, event);
            }
        }));
    }

    fn handle_session_event(&self, generation: u64, event: SessionEvent) {
        if !self.state.lock().is_current(generation) {
            tracing::debug!(connection = %self.id(), ?event, "Discarding event from replaced session");
            return;
        }
        match event {
            SessionEvent::ChannelsChanged(channels) => self.set_channels(channels),
            SessionEvent::Dropped { reason } => self.session_dropped(generation, reason),
        }
    }

    // ── Channels ──

    pub fn channels(&self) -> Vec<String> {
        self.channels.get()
    }

    /// Replace the channel snapshot and notify the registry and every
    /// subscriber, even if nothing changed.
    pub fn set_channels(&self, channels: Vec<String>) {
        self.channels.replace(channels.clone());
        if let Some(observer) = self.observer() {
            observer.channels_changed(self, &channels);
        }
        self.channels.notify(self, &channels);
    }

    pub fn subscribe_channels(&self, listener: Arc<dyn ChannelListListener>) -> ListenerId {
        self.channels.subscribe(listener)
    }

    pub fn unsubscribe_channels(&self, id: ListenerId) -> bool {
        self.channels.unsubscribe(id)
    }

    // ── Info ──

    pub fn subscribe_info(&self, listener: Arc<dyn InfoListener>) -> ListenerId {
        self.info_listeners.subscribe(listener)
    }

    pub fn unsubscribe_info(&self, id: ListenerId) -> bool {
        self.info_listeners.unsubscribe(id)
    }

    fn notify_info_changed(&self) {
        self.info_listeners.notify(|l| l.connection_info_changed(self));
        if let Some(observer) = self.observer() {
            observer.info_changed(self);
        }
    }

    fn observer(&self) -> Option<Arc<dyn ConnectionObserver>> {
        self.observer.as_ref().and_then(Weak::upgrade)
    }

    // ── Accessors ──

    pub fn id(&self) -> Uuid {
        self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.status() == ConnectionStatus::Connecting
    }

    pub fn is_disconnecting(&self) -> bool {
        self.status() == ConnectionStatus::Disconnecting
    }

    /// The user asked to disconnect (or rejected the certificate) since the
    /// last connect.
    pub fn user_disconnect_requested(&self) -> bool {
        self.state.lock().user_disconnect
    }

    /// -1 before the first outcome, 0 after a successful connect.
    pub fn reconnect_attempt(&self) -> i32 {
        self.state.lock().reconnect_attempt
    }

    /// The current session, if one was ever created.
    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.state.lock().session.as_ref().map(|s| Arc::clone(&s.handle))
    }

    pub fn user_nick(&self) -> Option<String> {
        self.session().and_then(|s| s.nick())
    }

    pub fn is_expanded_in_drawer(&self) -> bool {
        self.expanded_in_drawer.load(Ordering::Acquire)
    }

    pub fn set_expanded_in_drawer(&self, expanded: bool) {
        self.expanded_in_drawer.store(expanded, Ordering::Release);
    }

    /// Send `text` to `target` on the live session and remember it in the
    /// sent history.
    pub async fn send_message(&self, target: &str, text: &str) -> anyhow::Result<()> {
        let session = {
            let state = self.state.lock();
            if state.status != ConnectionStatus::Connected {
                anyhow::bail!("{} is not connected", self.config.name);
            }
            state.live_session().map(|(session, _)| session)
        };
        let Some(session) = session else {
            anyhow::bail!("{} has no session", self.config.name);
        };
        session.send_message(target.to_string(), text.to_string()).await?;
        self.add_sent_message(text);
        Ok(())
    }

    /// Sent messages, oldest first.
    pub fn sent_history(&self) -> Vec<String> {
        self.history.lock().to_vec()
    }

    pub fn add_sent_message(&self, message: impl Into<String>) {
        self.history.lock().push(message);
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let (status, user_disconnect, reconnect_attempt) = {
            let state = self.state.lock();
            (state.status, state.user_disconnect, state.reconnect_attempt)
        };
        ConnectionSnapshot {
            id: self.id(),
            name: self.config.name.clone(),
            server: self.config.address.clone(),
            status,
            nick: self.user_nick(),
            channels: self.channels(),
            user_disconnect,
            reconnect_attempt,
            expanded_in_drawer: self.is_expanded_in_drawer(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(sink) = self.state.get_mut().sink.take() {
            sink.close();
        }
    }
}

/// Point-in-time view of a connection for UI bridges.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: Uuid,
    pub name: String,
    pub server: String,
    pub status: ConnectionStatus,
    pub nick: Option<String>,
    pub channels: Vec<String>,
    pub user_disconnect: bool,
    pub reconnect_attempt: i32,
    pub expanded_in_drawer: bool,
}

impl ConnectionSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
