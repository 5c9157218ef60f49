//! Interfaces to the protocol layer and the message log.
//!
//! A [`Session`] is one network connection handle. The core never looks at
//! wire traffic: it opens sessions through a [`SessionFactory`], awaits their
//! connect/quit/disconnect futures, and consumes the [`SessionEvent`] stream
//! handed back alongside each session.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ServerConfig;

/// Boxed, sendable future returned by session operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Events a session pushes to its owning connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The server-reported set of joined channels changed.
    ChannelsChanged(Vec<String>),
    /// An established link closed without being asked to.
    Dropped { reason: String },
}

/// Receiving half of a session's event stream.
pub type SessionEvents = mpsc::Receiver<SessionEvent>;

/// Capacity of the event channel factories should create.
pub const SESSION_EVENT_BUFFER: usize = 256;

/// One protocol session.
///
/// `connect` may be called again on the same session after it dropped. A
/// failed or aborted connect resolves its future with an error; it must not
/// also emit [`SessionEvent::Dropped`].
pub trait Session: Send + Sync {
    /// Implementation tag. A session is only reused by a factory of the same kind.
    fn kind(&self) -> &'static str;

    /// Establish the link and complete registration.
    fn connect(&self) -> BoxFuture<'_, Result<()>>;

    /// Close the link. `abrupt` skips any goodbye traffic.
    fn disconnect(&self, abrupt: bool) -> BoxFuture<'_, ()>;

    /// Send a graceful quit. Resolves once the message is written.
    fn quit(&self, message: String) -> BoxFuture<'_, Result<()>>;

    /// Request the given channels. Completion only means the request was sent.
    fn join_channels(&self, channels: Vec<String>) -> BoxFuture<'_, Result<()>>;

    /// Send a message to a channel or nick.
    fn send_message(&self, target: String, text: String) -> BoxFuture<'_, Result<()>>;

    /// Nickname the server currently knows us by.
    fn nick(&self) -> Option<String>;
}

/// Everything a factory needs to build a session for one connection.
#[derive(Clone)]
pub struct SessionSetup {
    pub connection_id: Uuid,
    pub server: ServerConfig,
    /// Where the session records traffic. Owned by the connection.
    pub sink: Option<Arc<dyn MessageSink>>,
    /// Client name and version, used to tag outgoing replies.
    pub client_version: String,
}

/// Builds sessions of one kind.
pub trait SessionFactory: Send + Sync {
    fn kind(&self) -> &'static str;

    fn create(&self, setup: SessionSetup) -> Result<(Arc<dyn Session>, SessionEvents)>;
}

/// A message as written to the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedMessage {
    pub target: String,
    pub from: String,
    pub text: String,
    pub timestamp_ms: i64,
    pub notice: bool,
}

/// Persistent store for one session's traffic.
pub trait MessageSink: Send + Sync {
    fn record(&self, message: &LoggedMessage) -> Result<()>;

    /// Timestamp of the newest message recorded for `target`. Sinks that
    /// can't answer return `None`, which disables playback filtering.
    fn last_timestamp(&self, _target: &str) -> Result<Option<i64>> {
        Ok(None)
    }

    /// Release the underlying resource. Called once, when the connection is
    /// fully disconnected.
    fn close(&self);
}

/// Opens the message sink for a connection.
pub trait MessageSinkProvider: Send + Sync {
    fn open(&self, connection_id: Uuid) -> Result<Arc<dyn MessageSink>>;
}

/// Provider for setups without a message log.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMessageLog;

struct DiscardSink;

impl MessageSink for DiscardSink {
    fn record(&self, _message: &LoggedMessage) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}
}

impl MessageSinkProvider for NoMessageLog {
    fn open(&self, _connection_id: Uuid) -> Result<Arc<dyn MessageSink>> {
        Ok(Arc::new(DiscardSink))
    }
}
