//! The read/write loop for one live IRC link.
//!
//! Registers (PASS, CAP/SASL PLAIN, NICK/USER), answers PINGs, keeps the
//! joined-channel set and pushes it to the owning connection, and records
//! PRIVMSG/NOTICE traffic into the message sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow, bail};
use base64::Engine;
use chatlink_core::session::LoggedMessage;
use chatlink_core::{MessageSink, ServerConfig, SessionEvent};
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::message::{Message, ctcp_body, is_channel};

const MAX_NICK_TRIES: u32 = 5;
const PING_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_secs(60);
const PING_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(120);

/// Outgoing work queued by the session.
pub(crate) struct Command {
    pub line: String,
    /// Resolved once the line is written.
    pub written: Option<oneshot::Sender<()>>,
}

/// Everything the loop shares with its session.
pub(crate) struct LinkContext {
    pub server: ServerConfig,
    pub client_version: String,
    pub sink: Option<Arc<dyn MessageSink>>,
    pub events: mpsc::Sender<SessionEvent>,
    pub nick: Arc<Mutex<Option<String>>>,
    /// Set by the session before it closes the link on purpose.
    pub stopping: Arc<AtomicBool>,
}

#[derive(Default)]
struct LinkState {
    registered: bool,
    nick_tries: u32,
    sasl_in_progress: bool,
    channels: Vec<String>,
}

/// Drive the link until it closes.
///
/// `registered` resolves with our nick once the server sends 001, or with the
/// reason the link closed before that. After registration an unexpected
/// close is reported as [`SessionEvent::Dropped`].
pub(crate) async fn run_link<R, W>(
    mut reader: R,
    mut writer: W,
    ctx: LinkContext,
    registered: oneshot::Sender<Result<String>>,
    mut commands: mpsc::Receiver<Command>,
) where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut registered = Some(registered);
    let mut state = LinkState::default();
    let outcome = drive(&mut reader, &mut writer, &ctx, &mut state, &mut registered, &mut commands).await;
    let reason = match outcome {
        Ok(reason) => reason,
        Err(e) => e.to_string(),
    };

    if let Some(tx) = registered.take() {
        let _ = tx.send(Err(anyhow!("link closed during registration: {reason}")));
        return;
    }
    if ctx.stopping.load(Ordering::Acquire) {
        tracing::debug!(server = %ctx.server.address, %reason, "Link closed on request");
        return;
    }
    tracing::info!(server = %ctx.server.address, %reason, "Link dropped");
    let _ = ctx.events.send(SessionEvent::Dropped { reason }).await;
}

/// Returns the reason the link ended.
async fn drive<R, W>(
    reader: &mut R,
    writer: &mut W,
    ctx: &LinkContext,
    state: &mut LinkState,
    registered: &mut Option<oneshot::Sender<Result<String>>>,
    commands: &mut mpsc::Receiver<Command>,
) -> Result<String>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let server = &ctx.server;
    if let Some(password) = &server.password {
        send(writer, &format!("PASS {password}")).await?;
    }
    if server.sasl.is_some() {
        send(writer, "CAP LS 302").await?;
        state.sasl_in_progress = true;
    }
    send(writer, &format!("NICK {}", server.nick)).await?;
    let user = server.user.as_deref().unwrap_or(&server.nick);
    let realname = server.realname.as_deref().unwrap_or(&server.nick);
    send(writer, &format!("USER {user} 0 * :{realname}")).await?;

    // `next_line` keeps a partial line buffered across cancelled polls.
    let mut lines = reader.lines();
    let mut last_activity = tokio::time::Instant::now();
    let mut ping = tokio::time::interval_at(last_activity + PING_INTERVAL, PING_INTERVAL);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok("EOF".to_string());
                };
                last_activity = tokio::time::Instant::now();
                if let Some(msg) = Message::parse(&line)
                    && let Some(reason) = handle_line(writer, ctx, state, registered, msg).await?
                {
                    return Ok(reason);
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    return Ok("session closed".to_string());
                };
                send(writer, &command.line).await?;
                if let Some(written) = command.written {
                    let _ = written.send(());
                }
            }
            _ = ping.tick() => {
                if last_activity.elapsed() > PING_TIMEOUT {
                    return Ok("ping timeout".to_string());
                }
                send(writer, "PING :keepalive").await?;
            }
        }
    }
}

/// Returns `Some(reason)` when the line ends the link.
async fn handle_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    ctx: &LinkContext,
    state: &mut LinkState,
    registered: &mut Option<oneshot::Sender<Result<String>>>,
    msg: Message,
) -> Result<Option<String>> {
    let server = &ctx.server;
    match msg.command.as_str() {
        "PING" => {
            let token = msg.param(0).unwrap_or("");
            send(writer, &format!("PONG :{token}")).await?;
        }
        // ERR_NICKNAMEINUSE
        "433" if !state.registered => {
            state.nick_tries += 1;
            if state.nick_tries > MAX_NICK_TRIES {
                bail!("nick {} is in use", server.nick);
            }
            let alt = format!("{}{}", server.nick, state.nick_tries);
            tracing::debug!(nick = %alt, "Nick in use, retrying");
            send(writer, &format!("NICK {alt}")).await?;
        }
        "CAP" => {
            let sub = msg.param(1).unwrap_or("");
            let caps = msg.params.last().map(String::as_str).unwrap_or("");
            match sub {
                "LS" if state.sasl_in_progress => {
                    if caps.split_whitespace().any(|c| c == "sasl" || c.starts_with("sasl=")) {
                        send(writer, "CAP REQ :sasl").await?;
                    } else {
                        tracing::warn!("Server does not offer SASL");
                        state.sasl_in_progress = false;
                        send(writer, "CAP END").await?;
                    }
                }
                "ACK" if caps.split_whitespace().any(|c| c == "sasl") => {
                    send(writer, "AUTHENTICATE PLAIN").await?;
                }
                "NAK" => {
                    state.sasl_in_progress = false;
                    send(writer, "CAP END").await?;
                }
                _ => {}
            }
        }
        "AUTHENTICATE" if msg.param(0) == Some("+") => {
            if let Some(sasl) = &server.sasl {
                let payload = format!("{0}\0{0}\0{1}", sasl.username, sasl.password);
                let encoded = base64::engine::general_purpose::STANDARD.encode(payload.as_bytes());
                send(writer, &format!("AUTHENTICATE {encoded}")).await?;
            }
        }
        // RPL_SASLSUCCESS
        "903" => {
            state.sasl_in_progress = false;
            send(writer, "CAP END").await?;
        }
        // ERR_SASLFAIL, ERR_SASLTOOLONG, ERR_SASLABORTED, ERR_SASLALREADY
        "904" | "905" | "906" | "907" => {
            let reason = msg.params.last().cloned().unwrap_or_default();
            tracing::warn!(%reason, "SASL authentication failed");
            state.sasl_in_progress = false;
            send(writer, "CAP END").await?;
        }
        // RPL_WELCOME
        "001" => {
            let nick = msg.param(0).unwrap_or(&server.nick).to_string();
            *ctx.nick.lock() = Some(nick.clone());
            state.registered = true;
            tracing::info!(server = %server.address, %nick, "Registered");
            if let Some(tx) = registered.take() {
                let _ = tx.send(Ok(nick));
            }
        }
        "NICK" => {
            if is_self(ctx, &msg)
                && let Some(new) = msg.param(0)
            {
                *ctx.nick.lock() = Some(new.to_string());
            }
        }
        "JOIN" => {
            if is_self(ctx, &msg)
                && let Some(channel) = msg.param(0)
                && !state.channels.iter().any(|c| c.eq_ignore_ascii_case(channel))
            {
                state.channels.push(channel.to_string());
                publish_channels(ctx, state).await;
            }
        }
        "PART" => {
            if is_self(ctx, &msg)
                && let Some(channel) = msg.param(0)
            {
                leave(ctx, state, channel).await;
            }
        }
        "KICK" => {
            let kicked_self = msg.param(1).is_some_and(|n| is_current_nick(ctx, n));
            if kicked_self && let Some(channel) = msg.param(0) {
                leave(ctx, state, channel).await;
            }
        }
        "PRIVMSG" | "NOTICE" => handle_message(writer, ctx, &msg).await?,
        "ERROR" => {
            let reason = msg.params.last().cloned().unwrap_or_else(|| "server error".to_string());
            return Ok(Some(reason));
        }
        _ => {}
    }
    Ok(None)
}

async fn handle_message<W: AsyncWrite + Unpin>(writer: &mut W, ctx: &LinkContext, msg: &Message) -> Result<()> {
    let (Some(target), Some(text)) = (msg.param(0), msg.param(1)) else {
        return Ok(());
    };
    let from = msg.source_nick().unwrap_or("");
    let notice = msg.command == "NOTICE";

    if !from.is_empty() && ctx.server.is_ignored(from) {
        tracing::trace!(%from, "Ignoring message");
        return Ok(());
    }

    if let Some(ctcp) = ctcp_body(text) {
        if !notice && ctcp.eq_ignore_ascii_case("VERSION") && !from.is_empty() {
            send(writer, &format!("NOTICE {from} :\x01VERSION {}\x01", ctx.client_version)).await?;
        }
        if !ctcp.starts_with("ACTION") {
            return Ok(());
        }
    }

    // Private messages are logged under the other party's nick.
    let target = if is_channel(target) || from.is_empty() { target } else { from };
    let server_time = msg
        .tag("time")
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.timestamp_millis());
    if let Some(ts) = server_time
        && is_playback(ctx, target, ts)
    {
        tracing::trace!(%target, ts, "Skipping replayed message");
        return Ok(());
    }
    let timestamp_ms = server_time.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    record(
        ctx,
        LoggedMessage {
            target: target.to_string(),
            from: from.to_string(),
            text: text.to_string(),
            timestamp_ms,
            notice,
        },
    );
    Ok(())
}

/// A bouncer (ZNC and friends) replays its buffer on every connect. Anything
/// stamped at or before the newest logged message for the target is already
/// in the log.
fn is_playback(ctx: &LinkContext, target: &str, ts: i64) -> bool {
    let Some(sink) = &ctx.sink else { return false };
    match sink.last_timestamp(target) {
        Ok(Some(last)) => ts <= last,
        Ok(None) => false,
        Err(e) => {
            tracing::debug!(error = %e, "Can't read last logged timestamp");
            false
        }
    }
}

/// Record one message, logging instead of failing the link on error.
fn record(ctx: &LinkContext, message: LoggedMessage) {
    if let Some(sink) = &ctx.sink
        && let Err(e) = sink.record(&message)
    {
        tracing::warn!(error = %e, "Failed to record message");
    }
}

async fn leave(ctx: &LinkContext, state: &mut LinkState, channel: &str) {
    let before = state.channels.len();
    state.channels.retain(|c| !c.eq_ignore_ascii_case(channel));
    if state.channels.len() != before {
        publish_channels(ctx, state).await;
    }
}

async fn publish_channels(ctx: &LinkContext, state: &LinkState) {
    let _ = ctx
        .events
        .send(SessionEvent::ChannelsChanged(state.channels.clone()))
        .await;
}

fn is_self(ctx: &LinkContext, msg: &Message) -> bool {
    msg.source_nick().is_some_and(|n| is_current_nick(ctx, n))
}

fn is_current_nick(ctx: &LinkContext, nick: &str) -> bool {
    ctx.nick
        .lock()
        .as_deref()
        .is_some_and(|current| current.eq_ignore_ascii_case(nick))
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(format!("{line}\r\n").as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
