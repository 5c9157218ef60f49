//! Test doubles: scripted sessions, a hand-cranked scheduler, recording
//! policy and sinks.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use chatlink_core::config::Settings;
use chatlink_core::prefs::{FixedNetwork, NetworkType, SharedSettings};
use chatlink_core::session::{BoxFuture, LoggedMessage, SESSION_EVENT_BUFFER, SessionEvents};
use chatlink_core::{
    CertificateRejected, ConnectionDeps, MessageSink, MessageSinkProvider, ReconnectPolicy, Scheduler, Session,
    SessionEvent, SessionFactory, SessionSetup,
};

/// How the next `connect` call on any fake session resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectScript {
    Succeed,
    Fail,
    RejectCertificate,
    /// Block until the session is disconnected, then fail.
    Hang,
}

type Script = Arc<Mutex<VecDeque<ConnectScript>>>;

pub struct FakeSession {
    script: Script,
    events: mpsc::Sender<SessionEvent>,
    aborted: Notify,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub quits: Mutex<Vec<String>>,
    pub joins: Mutex<Vec<Vec<String>>>,
    pub sent: Mutex<Vec<(String, String)>>,
    pub setup: SessionSetup,
}

impl FakeSession {
    /// Push an event as if it came off the wire.
    pub async fn emit(&self, event: SessionEvent) {
        self.events.send(event).await.unwrap();
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn joined(&self) -> Vec<Vec<String>> {
        self.joins.lock().clone()
    }
}

impl Session for FakeSession {
    fn kind(&self) -> &'static str {
        "fake"
    }

    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let script = self.script.lock().pop_front().unwrap_or(ConnectScript::Succeed);
            match script {
                ConnectScript::Succeed => Ok(()),
                ConnectScript::Fail => Err(anyhow!("connection refused")),
                ConnectScript::RejectCertificate => {
                    Err(anyhow::Error::new(CertificateRejected).context("TLS handshake failed"))
                }
                ConnectScript::Hang => {
                    self.aborted.notified().await;
                    Err(anyhow!("connect aborted"))
                }
            }
        })
    }

    fn disconnect(&self, _abrupt: bool) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.aborted.notify_one();
        })
    }

    fn quit(&self, message: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.quits.lock().push(message);
            Ok(())
        })
    }

    fn join_channels(&self, channels: Vec<String>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.joins.lock().push(channels);
            Ok(())
        })
    }

    fn send_message(&self, target: String, text: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.sent.lock().push((target, text));
            Ok(())
        })
    }

    fn nick(&self) -> Option<String> {
        Some(self.setup.server.nick.clone())
    }
}

#[derive(Default)]
pub struct FakeSessionFactory {
    script: Script,
    fail_create: AtomicBool,
    created: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeSessionFactory {
    pub fn script(&self, outcomes: &[ConnectScript]) {
        self.script.lock().extend(outcomes.iter().copied());
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<FakeSession>> {
        self.created.lock().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn last(&self) -> Arc<FakeSession> {
        self.created.lock().last().cloned().expect("no session created")
    }
}

impl SessionFactory for FakeSessionFactory {
    fn kind(&self) -> &'static str {
        "fake"
    }

    fn create(&self, setup: SessionSetup) -> Result<(Arc<dyn Session>, SessionEvents)> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(anyhow!("no route to host"));
        }
        let (events, rx) = mpsc::channel(SESSION_EVENT_BUFFER);
        let session = Arc::new(FakeSession {
            script: Arc::clone(&self.script),
            events,
            aborted: Notify::new(),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            quits: Mutex::new(Vec::new()),
            joins: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            setup,
        });
        self.created.lock().push(Arc::clone(&session));
        Ok((session, rx))
    }
}

/// Spawns continuations on tokio but holds timers until the test fires them.
#[derive(Default)]
pub struct ManualScheduler {
    timers: Mutex<VecDeque<(Duration, Box<dyn FnOnce() + Send>)>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ManualScheduler {
    /// Await every spawned task that has finished and fail if any panicked.
    /// Tasks still running (event pumps) are kept.
    pub async fn assert_no_panics(&self) {
        let finished: Vec<_> = {
            let mut tasks = self.tasks.lock();
            let (done, running): (Vec<_>, Vec<_>) = std::mem::take(&mut *tasks).into_iter().partition(|t| t.is_finished());
            *tasks = running;
            done
        };
        for task in finished {
            if let Err(e) = task.await {
                panic!("spawned task failed: {e}");
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.timers.lock().iter().map(|(d, _)| *d).collect()
    }

    /// Run the oldest pending timer. Returns false if none was pending.
    pub fn fire_next(&self) -> bool {
        let next = self.timers.lock().pop_front();
        match next {
            Some((_, task)) => {
                task();
                true
            }
            None => false,
        }
    }
}

impl Scheduler for ManualScheduler {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        self.tasks.lock().push(tokio::spawn(task));
    }

    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) {
        self.timers.lock().push_back((delay, task));
    }
}

/// One-second delays, giving up at `limit` if set. Records every query.
#[derive(Default)]
pub struct RecordingPolicy {
    limit: Option<u32>,
    attempts: Mutex<Vec<u32>>,
}

impl RecordingPolicy {
    pub fn with_limit(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().clone()
    }
}

impl ReconnectPolicy for RecordingPolicy {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self.attempts.lock().push(attempt);
        match self.limit {
            Some(limit) if attempt >= limit => None,
            _ => Some(Duration::from_secs(1)),
        }
    }
}

#[derive(Default)]
pub struct CountingSink {
    pub records: Mutex<Vec<LoggedMessage>>,
    pub closes: AtomicUsize,
}

impl CountingSink {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl MessageSink for CountingSink {
    fn record(&self, message: &LoggedMessage) -> Result<()> {
        self.records.lock().push(message.clone());
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct CountingSinkProvider {
    opened: Mutex<Vec<Arc<CountingSink>>>,
}

impl CountingSinkProvider {
    pub fn opened(&self) -> Vec<Arc<CountingSink>> {
        self.opened.lock().clone()
    }
}

impl MessageSinkProvider for CountingSinkProvider {
    fn open(&self, _connection_id: Uuid) -> Result<Arc<dyn MessageSink>> {
        let sink = Arc::new(CountingSink::default());
        self.opened.lock().push(Arc::clone(&sink));
        Ok(sink)
    }
}

pub struct Harness {
    pub factory: Arc<FakeSessionFactory>,
    pub scheduler: Arc<ManualScheduler>,
    pub policy: Arc<RecordingPolicy>,
    pub sinks: Arc<CountingSinkProvider>,
    pub settings: Arc<SharedSettings>,
    pub network: Arc<FixedNetwork>,
    pub deps: ConnectionDeps,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(RecordingPolicy::default(), Settings::default(), NetworkType::Wifi)
    }

    pub fn with_policy(policy: RecordingPolicy) -> Self {
        Self::build(policy, Settings::default(), NetworkType::Wifi)
    }

    pub fn build(policy: RecordingPolicy, settings: Settings, network: NetworkType) -> Self {
        let factory = Arc::new(FakeSessionFactory::default());
        let scheduler = Arc::new(ManualScheduler::default());
        let policy = Arc::new(policy);
        let sinks = Arc::new(CountingSinkProvider::default());
        let settings = Arc::new(SharedSettings::new(settings));
        let network = Arc::new(FixedNetwork(network));
        let deps = ConnectionDeps {
            sessions: factory.clone(),
            sinks: sinks.clone(),
            scheduler: scheduler.clone(),
            policy: policy.clone(),
            prefs: settings.clone(),
            network: network.clone(),
            client_version: "chatlink-test 0.0.0".to_string(),
        };
        Self {
            factory,
            scheduler,
            policy,
            sinks,
            settings,
            network,
            deps,
        }
    }
}

/// Poll `cond` until it holds, letting spawned tasks run in between.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

/// Let every task that is ready run to its next await point.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
