//! [`Session`] implementation over a live IRC link.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow, bail};
use chatlink_core::session::{BoxFuture, LoggedMessage, SESSION_EVENT_BUFFER, SessionEvents};
use chatlink_core::{MessageSink, ServerConfig, Session, SessionEvent, SessionFactory, SessionSetup};
use parking_lot::Mutex;
use tokio::io::BufReader;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::link::{Command, LinkContext, run_link};
use crate::transport::establish_connection;

pub const SESSION_KIND: &str = "irc";

const COMMAND_BUFFER: usize = 64;

/// Creates [`IrcSession`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct IrcSessionFactory;

impl SessionFactory for IrcSessionFactory {
    fn kind(&self) -> &'static str {
        SESSION_KIND
    }

    fn create(&self, setup: SessionSetup) -> Result<(Arc<dyn Session>, SessionEvents)> {
        let (events, rx) = mpsc::channel(SESSION_EVENT_BUFFER);
        let session = IrcSession::new(setup, events);
        Ok((Arc::new(session), rx))
    }
}

struct Link {
    commands: mpsc::Sender<Command>,
    stopping: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// One IRC server session. Reconnectable: each `connect` opens a new link.
pub struct IrcSession {
    connection_id: Uuid,
    server: ServerConfig,
    client_version: String,
    sink: Option<Arc<dyn MessageSink>>,
    events: mpsc::Sender<SessionEvent>,
    nick: Arc<Mutex<Option<String>>>,
    link: Mutex<Option<Link>>,
    abort: Notify,
}

impl IrcSession {
    fn new(setup: SessionSetup, events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            connection_id: setup.connection_id,
            server: setup.server,
            client_version: setup.client_version,
            sink: setup.sink,
            events,
            nick: Arc::new(Mutex::new(None)),
            link: Mutex::new(None),
            abort: Notify::new(),
        }
    }

    async fn open_link(&self) -> Result<()> {
        let stream = establish_connection(&self.server).await?;
        let (reader, writer) = tokio::io::split(stream);

        let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (registered_tx, registered_rx) = oneshot::channel();
        let stopping = Arc::new(AtomicBool::new(false));
        let ctx = LinkContext {
            server: self.server.clone(),
            client_version: self.client_version.clone(),
            sink: self.sink.clone(),
            events: self.events.clone(),
            nick: Arc::clone(&self.nick),
            stopping: Arc::clone(&stopping),
        };
        let task = tokio::spawn(run_link(BufReader::new(reader), writer, ctx, registered_tx, commands_rx));

        let previous = self.link.lock().replace(Link {
            commands,
            stopping,
            task,
        });
        if let Some(previous) = previous {
            previous.stopping.store(true, Ordering::Release);
            previous.task.abort();
        }

        let nick = registered_rx
            .await
            .map_err(|_| anyhow!("link task ended before registration"))??;
        tracing::debug!(connection = %self.connection_id, %nick, "Session registered");
        Ok(())
    }

    /// Queue a raw line, optionally waiting until it has been written.
    async fn send_line(&self, line: String, wait: bool) -> Result<()> {
        let commands = match self.link.lock().as_ref() {
            Some(link) => link.commands.clone(),
            None => bail!("not connected"),
        };
        let (written, done) = if wait {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        commands
            .send(Command { line, written })
            .await
            .map_err(|_| anyhow!("link closed"))?;
        if let Some(done) = done {
            done.await.map_err(|_| anyhow!("link closed before the line was written"))?;
        }
        Ok(())
    }
}

impl Session for IrcSession {
    fn kind(&self) -> &'static str {
        SESSION_KIND
    }

    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let aborted = self.abort.notified();
            tokio::select! {
                result = self.open_link() => result,
                _ = aborted => Err(anyhow!("connect to {} aborted", self.server.address)),
            }
        })
    }

    fn disconnect(&self, abrupt: bool) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.abort.notify_waiters();
            let Some(link) = self.link.lock().take() else {
                return;
            };
            link.stopping.store(true, Ordering::Release);
            if !abrupt {
                let _ = link
                    .commands
                    .send(Command {
                        line: "QUIT".to_string(),
                        written: None,
                    })
                    .await;
            }
            // Closing the command channel ends the loop once queued lines are out.
            drop(link.commands);
            if abrupt {
                link.task.abort();
            }
            let _ = link.task.await;
            tracing::debug!(connection = %self.connection_id, "Link closed");
        })
    }

    fn quit(&self, message: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.send_line(format!("QUIT :{message}"), true).await })
    }

    fn join_channels(&self, channels: Vec<String>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            for channel in channels {
                self.send_line(format!("JOIN {channel}"), false).await?;
            }
            Ok(())
        })
    }

    fn send_message(&self, target: String, text: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.send_line(format!("PRIVMSG {target} :{text}"), true).await?;
            let from = self.nick().unwrap_or_else(|| self.server.nick.clone());
            if let Some(sink) = &self.sink
                && let Err(e) = sink.record(&LoggedMessage {
                    target,
                    from,
                    text,
                    timestamp_ms: chrono::Utc::now().timestamp_millis(),
                    notice: false,
                })
            {
                tracing::warn!(connection = %self.connection_id, error = %e, "Failed to record sent message");
            }
            Ok(())
        })
    }

    fn nick(&self) -> Option<String> {
        self.nick.lock().clone()
    }
}

impl Drop for IrcSession {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.stopping.store(true, Ordering::Release);
            link.task.abort();
        }
    }
}
